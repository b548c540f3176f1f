use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration. Every section and field has a default, so a
/// partial `meter.toml` only needs to name what it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub readings: ReadingLimits,
    pub ocr: OcrSettings,
    pub verification: VerificationSettings,
}

/// Range and format bounds for single readings and (start, end) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingLimits {
    pub min_reading: Decimal,
    pub max_reading: Decimal,
    pub max_decimal_places: u32,
    pub min_consumption: Decimal,
    pub max_consumption: Decimal,
}

impl Default for ReadingLimits {
    fn default() -> Self {
        Self {
            min_reading: Decimal::from(10),
            max_reading: Decimal::from(999_999),
            max_decimal_places: 3,
            min_consumption: Decimal::new(1, 1),
            max_consumption: Decimal::from(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Minimum aggregate confidence (0–100) for an attempt to be accepted.
    pub min_confidence: f64,
    /// Confidence at or above which a reading is reported as a clear read.
    pub good_confidence: f64,
    /// Deadline for the whole preprocessing ladder of one submission.
    pub submission_timeout_secs: u64,
    pub vision_endpoint: String,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            min_confidence: 60.0,
            good_confidence: 85.0,
            submission_timeout_secs: 30,
            vision_endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
        }
    }
}

impl OcrSettings {
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub max_attempts: u32,
    pub state_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            state_ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

/// Upper bound for `state_ttl_secs` (one year).
pub const MAX_STATE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

impl VerificationSettings {
    /// Saturates at [`MAX_STATE_TTL_SECS`] for settings that skipped
    /// [`MeterConfig::validate`].
    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_ttl_secs.min(MAX_STATE_TTL_SECS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl MeterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MeterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.readings;
        if r.min_reading <= Decimal::ZERO || r.min_reading >= r.max_reading {
            return Err(ConfigError::Invalid(format!(
                "reading range [{}, {}] is empty or non-positive",
                r.min_reading, r.max_reading
            )));
        }
        if r.min_consumption <= Decimal::ZERO || r.min_consumption >= r.max_consumption {
            return Err(ConfigError::Invalid(format!(
                "consumption range [{}, {}] is empty or non-positive",
                r.min_consumption, r.max_consumption
            )));
        }

        let o = &self.ocr;
        if !(0.0..=100.0).contains(&o.min_confidence) || !(0.0..=100.0).contains(&o.good_confidence) {
            return Err(ConfigError::Invalid("confidence thresholds must be within 0–100".into()));
        }
        if o.good_confidence < o.min_confidence {
            return Err(ConfigError::Invalid(
                "good_confidence must not be below min_confidence".into(),
            ));
        }
        if o.submission_timeout_secs == 0 {
            return Err(ConfigError::Invalid("submission_timeout_secs must be positive".into()));
        }

        if self.verification.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        let ttl = self.verification.state_ttl_secs;
        if ttl == 0 || ttl > MAX_STATE_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "state_ttl_secs must be between 1 and {MAX_STATE_TTL_SECS}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MeterConfig::default();
        assert_eq!(c.readings.min_reading, Decimal::from(10));
        assert_eq!(c.readings.max_reading, Decimal::from(999_999));
        assert_eq!(c.readings.max_decimal_places, 3);
        assert_eq!(c.readings.min_consumption, Decimal::new(1, 1));
        assert_eq!(c.readings.max_consumption, Decimal::from(200));
        assert_eq!(c.ocr.min_confidence, 60.0);
        assert_eq!(c.ocr.good_confidence, 85.0);
        assert_eq!(c.ocr.submission_timeout(), Duration::from_secs(30));
        assert_eq!(c.verification.max_attempts, 3);
        assert_eq!(c.verification.state_ttl(), chrono::Duration::minutes(30));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c = MeterConfig::from_toml_str(
            r#"
            [verification]
            max_attempts = 5

            [readings]
            max_consumption = 150
            "#,
        )
        .unwrap();
        assert_eq!(c.verification.max_attempts, 5);
        assert_eq!(c.verification.state_ttl_secs, 1800);
        assert_eq!(c.readings.max_consumption, Decimal::from(150));
        assert_eq!(c.readings.min_reading, Decimal::from(10));
        assert_eq!(c.ocr.min_confidence, 60.0);
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(MeterConfig::from_toml_str("").unwrap(), MeterConfig::default());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = MeterConfig::from_toml_str(
            r#"
            [ocr]
            min_confidence = 90.0
            good_confidence = 80.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = MeterConfig::from_toml_str("[verification]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_out_of_range_state_ttl() {
        for ttl in ["0", "9223372036854775807", "31536001"] {
            let err = MeterConfig::from_toml_str(&format!("[verification]\nstate_ttl_secs = {ttl}\n"))
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "ttl {ttl}");
        }
        let c = MeterConfig::from_toml_str("[verification]\nstate_ttl_secs = 31536000\n").unwrap();
        assert_eq!(c.verification.state_ttl(), chrono::Duration::days(365));
    }

    #[test]
    fn unvalidated_huge_ttl_saturates() {
        let settings = VerificationSettings { state_ttl_secs: u64::MAX, ..Default::default() };
        assert_eq!(settings.state_ttl(), chrono::Duration::seconds(MAX_STATE_TTL_SECS as i64));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = MeterConfig::from_toml_str("[ocr\nmin_confidence = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.toml");
        std::fs::write(&path, "[ocr]\nsubmission_timeout_secs = 10\n").unwrap();
        let c = MeterConfig::load(&path).unwrap();
        assert_eq!(c.ocr.submission_timeout(), Duration::from_secs(10));
    }
}
