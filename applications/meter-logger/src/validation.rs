use crate::config::ValidationConfig;
use crate::reading::Reading;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} is not a finite number")]
    NotFinite { field: &'static str },
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

fn within(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { field });
    }
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Check a reading against physical plausibility bounds.
pub fn validate(bounds: &ValidationConfig, r: &Reading) -> Result<(), ValidationError> {
    within("voltage_v", r.voltage_v, bounds.min_voltage_v, bounds.max_voltage_v)?;
    within(
        "active_power_w",
        r.active_power_w,
        bounds.min_active_power_w,
        bounds.max_active_power_w,
    )?;
    within("current_a", r.current_a, 0.0, bounds.max_current_a)?;
    within("power_factor", r.power_factor, -1.0, 1.0)?;
    within(
        "frequency_hz",
        r.frequency_hz,
        bounds.min_frequency_hz,
        bounds.max_frequency_hz,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading() -> Reading {
        Reading {
            timestamp: Utc::now(),
            meter_id: "1".into(),
            voltage_v: 230.0,
            current_a: 2.0,
            active_power_w: 450.0,
            power_factor: 0.95,
            frequency_hz: 50.0,
            energy_register_kwh: None,
        }
    }

    #[test]
    fn test_plausible_reading_passes() {
        assert_eq!(validate(&ValidationConfig::default(), &reading()), Ok(()));
    }

    #[test]
    fn test_negative_voltage_rejected() {
        let r = Reading { voltage_v: -5.0, ..reading() };
        let err = validate(&ValidationConfig::default(), &r).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "voltage_v", .. }));
    }

    #[test]
    fn test_power_spike_above_ceiling_rejected() {
        let r = Reading { active_power_w: 1.0e6, ..reading() };
        assert!(validate(&ValidationConfig::default(), &r).is_err());
    }

    #[test]
    fn test_nan_power_rejected() {
        let r = Reading { active_power_w: f64::NAN, ..reading() };
        assert_eq!(
            validate(&ValidationConfig::default(), &r),
            Err(ValidationError::NotFinite { field: "active_power_w" })
        );
    }

    #[test]
    fn test_negative_power_allowed_when_configured() {
        let bounds = ValidationConfig {
            min_active_power_w: -5000.0,
            ..ValidationConfig::default()
        };
        let r = Reading { active_power_w: -1200.0, ..reading() };
        assert!(validate(&bounds, &r).is_ok());
        assert!(validate(&ValidationConfig::default(), &r).is_err());
    }

    #[test]
    fn test_power_factor_beyond_unity_rejected() {
        let r = Reading { power_factor: 1.3, ..reading() };
        assert!(validate(&ValidationConfig::default(), &r).is_err());
    }
}
