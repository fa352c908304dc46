pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod local_db;
pub mod mqtt;
pub mod row;
pub mod window;
