pub mod accrual;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod poller;
pub mod reading;
pub mod registers;
pub mod retry;
pub mod sink;
pub mod source;
pub mod validation;
