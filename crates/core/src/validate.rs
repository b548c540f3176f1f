use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::ReadingLimits;
use crate::kwh::Kwh;

/// Fraction of charger output assumed to reach the battery.
const CONVERSION_EFFICIENCY: Decimal = Decimal::from_parts(95, 0, 0, false, 2);
/// Consumption may exceed the theoretical maximum by this factor before it is rejected.
const THEORETICAL_MAX_TOLERANCE: Decimal = Decimal::from_parts(115, 0, 0, false, 2);
const BATTERY_CAPACITY_TOLERANCE: Decimal = Decimal::from_parts(105, 0, 0, false, 2);
/// Average power within 2% of the rated power is flagged as saturated.
const SATURATION_RATIO: Decimal = Decimal::from_parts(98, 0, 0, false, 2);
const LOW_EFFICIENCY: Decimal = Decimal::from_parts(60, 0, 0, false, 2);
/// Rate-based checks are skipped below this many minutes of charging.
const MIN_CONTEXT_MINUTES: Decimal = Decimal::ONE;
const MINUTES_PER_HOUR: Decimal = Decimal::from_parts(60, 0, 0, false, 0);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Reading must be a finite number")]
    NotFinite,
    #[error("Reading must be a positive number")]
    NotPositive,
    #[error("Could not read '{0}' as a number")]
    Unparseable(String),
    #[error("Reading {value} is below the minimum of {min} kWh")]
    BelowMinimum { value: Decimal, min: Decimal },
    #[error("Reading {value} exceeds the maximum of {max} kWh")]
    AboveMaximum { value: Decimal, max: Decimal },
    #[error("Reading {value} has {places} decimal places, at most {max} are allowed")]
    TooManyDecimals { value: Decimal, places: u32, max: u32 },
    #[error("Invalid start reading: {0}")]
    InvalidStart(Box<ValidationError>),
    #[error("Invalid end reading: {0}")]
    InvalidEnd(Box<ValidationError>),
    #[error("End reading ({end}) must be greater than start reading ({start})")]
    EndNotAfterStart { start: Decimal, end: Decimal },
    #[error("Consumption of {consumption} kWh is too low, the minimum is {min} kWh")]
    ConsumptionTooLow { consumption: Decimal, min: Decimal },
    #[error("Consumption of {consumption} kWh is too high, the maximum is {max} kWh")]
    ConsumptionTooHigh { consumption: Decimal, max: Decimal },
    #[error(
        "Consumption of {consumption} kWh exceeds what a {power_kw} kW charger can deliver \
         in {minutes} minutes (at most {limit} kWh)"
    )]
    ExceedsChargerCapability { consumption: Decimal, power_kw: Decimal, minutes: Decimal, limit: Decimal },
    #[error("Consumption of {consumption} kWh exceeds the battery capacity of {capacity} kWh")]
    ExceedsBatteryCapacity { consumption: Decimal, capacity: Decimal },
}

/// Non-fatal observations about a plausible but unusual consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsumptionWarning {
    /// Average power sits at the charger's rating for the whole session.
    SaturatedPower { average_kw: Decimal, rated_kw: Decimal },
    /// Less than 60% of the nominal energy arrived; possibly an interrupted charge.
    LowEfficiency { percent: Decimal },
}

impl fmt::Display for ConsumptionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumptionWarning::SaturatedPower { average_kw, rated_kw } => write!(
                f,
                "Average power {} kW is at the charger's rated {} kW",
                average_kw.round_dp(2).normalize(),
                rated_kw.normalize()
            ),
            ConsumptionWarning::LowEfficiency { percent } => write!(
                f,
                "Only {}% of the charger's nominal output was delivered; the charge may have been interrupted",
                percent.round_dp(1).normalize()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<ValidationError>,
    pub warnings: Vec<ConsumptionWarning>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self { valid: true, error: None, warnings: vec![] }
    }

    pub fn with_warnings(warnings: Vec<ConsumptionWarning>) -> Self {
        Self { valid: true, error: None, warnings }
    }

    pub fn invalid(error: ValidationError) -> Self {
        Self { valid: false, error: Some(error), warnings: vec![] }
    }

    pub fn into_result(self) -> Result<Vec<ConsumptionWarning>, ValidationError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.warnings),
        }
    }
}

/// Physical context of a charging session used to sanity-check consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeContext {
    pub duration_minutes: Decimal,
    pub charger_power_kw: Decimal,
    pub battery_capacity_kwh: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadingValidator {
    limits: ReadingLimits,
}

impl ReadingValidator {
    pub fn new(limits: ReadingLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ReadingLimits {
        &self.limits
    }

    pub fn validate_reading(&self, value: Kwh) -> ValidationOutcome {
        match self.check_reading(value) {
            Ok(()) => ValidationOutcome::ok(),
            Err(e) => ValidationOutcome::invalid(e),
        }
    }

    pub fn check_reading(&self, value: Kwh) -> Result<(), ValidationError> {
        let v = value.value();
        if !value.is_positive() {
            return Err(ValidationError::NotPositive);
        }
        if v < self.limits.min_reading {
            return Err(ValidationError::BelowMinimum { value: v, min: self.limits.min_reading });
        }
        if v > self.limits.max_reading {
            return Err(ValidationError::AboveMaximum { value: v, max: self.limits.max_reading });
        }
        let places = value.decimal_places();
        if places > self.limits.max_decimal_places {
            return Err(ValidationError::TooManyDecimals {
                value: v,
                places,
                max: self.limits.max_decimal_places,
            });
        }
        Ok(())
    }

    /// Entry point for readings that arrive as floating point (e.g. from a
    /// JSON payload). Uses the shortest round-trip representation so `0.1`
    /// is checked as one decimal place.
    pub fn validate_f64(&self, value: f64) -> ValidationOutcome {
        if !value.is_finite() {
            return ValidationOutcome::invalid(ValidationError::NotFinite);
        }
        if value <= 0.0 {
            return ValidationOutcome::invalid(ValidationError::NotPositive);
        }
        match Decimal::from_str(&value.to_string()) {
            Ok(d) => self.validate_reading(Kwh::new(d)),
            // Only magnitudes far outside any meter range fail to convert.
            Err(_) if value > 1.0 => ValidationOutcome::invalid(ValidationError::AboveMaximum {
                value: Decimal::MAX,
                max: self.limits.max_reading,
            }),
            Err(_) => ValidationOutcome::invalid(ValidationError::BelowMinimum {
                value: Decimal::ZERO,
                min: self.limits.min_reading,
            }),
        }
    }

    /// Parse a typed reading: optional trailing `kWh`, `,` accepted as the
    /// decimal separator. Anything else that is not a plain decimal fails.
    pub fn parse_manual_reading(&self, text: &str) -> Result<Kwh, ValidationError> {
        let trimmed = text.trim();
        let lowered = trimmed.to_ascii_lowercase();
        let without_unit = lowered.strip_suffix("kwh").unwrap_or(&lowered).trim_end();
        let candidate = without_unit.replace(',', ".");

        let well_formed = !candidate.is_empty()
            && candidate.chars().all(|c| c.is_ascii_digit() || c == '.')
            && candidate.chars().filter(|c| *c == '.').count() <= 1
            && candidate.chars().any(|c| c.is_ascii_digit());
        if !well_formed {
            if candidate.starts_with('-') {
                return Err(ValidationError::NotPositive);
            }
            return Err(ValidationError::Unparseable(trimmed.to_string()));
        }

        let value = Kwh::from_str(&candidate)
            .map_err(|_| ValidationError::Unparseable(trimmed.to_string()))?;
        self.check_reading(value)?;
        Ok(value)
    }

    /// Consumption between two readings, rounded to 2 decimal places.
    pub fn calculate_consumption(&self, start: Kwh, end: Kwh) -> Result<Kwh, ValidationError> {
        self.check_reading(start)
            .map_err(|e| ValidationError::InvalidStart(Box::new(e)))?;
        self.check_reading(end)
            .map_err(|e| ValidationError::InvalidEnd(Box::new(e)))?;

        if end <= start {
            return Err(ValidationError::EndNotAfterStart { start: start.value(), end: end.value() });
        }

        let consumption = (end - start).value();
        if consumption < self.limits.min_consumption {
            return Err(ValidationError::ConsumptionTooLow {
                consumption,
                min: self.limits.min_consumption,
            });
        }
        if consumption > self.limits.max_consumption {
            return Err(ValidationError::ConsumptionTooHigh {
                consumption,
                max: self.limits.max_consumption,
            });
        }
        Ok(Kwh::new(consumption).round_dp(2))
    }

    /// Check a consumption against what the charger and battery could have
    /// delivered. Sessions shorter than one minute skip every rate check.
    pub fn validate_consumption_with_context(
        &self,
        consumption: Kwh,
        context: &ChargeContext,
    ) -> ValidationOutcome {
        let minutes = context.duration_minutes;
        let power = context.charger_power_kw;
        if minutes < MIN_CONTEXT_MINUTES || power <= Decimal::ZERO {
            return ValidationOutcome::ok();
        }

        let energy = consumption.value();
        let hours = minutes / MINUTES_PER_HOUR;
        let nominal = hours * power;
        let theoretical_max = nominal * CONVERSION_EFFICIENCY;
        let limit = theoretical_max * THEORETICAL_MAX_TOLERANCE;

        if energy > limit {
            return ValidationOutcome::invalid(ValidationError::ExceedsChargerCapability {
                consumption: energy,
                power_kw: power,
                minutes,
                limit: limit.round_dp(2),
            });
        }
        if let Some(capacity) = context.battery_capacity_kwh {
            if capacity > Decimal::ZERO && energy > capacity * BATTERY_CAPACITY_TOLERANCE {
                return ValidationOutcome::invalid(ValidationError::ExceedsBatteryCapacity {
                    consumption: energy,
                    capacity,
                });
            }
        }

        let mut warnings = Vec::new();
        let average_kw = energy / hours;
        if average_kw >= power * SATURATION_RATIO {
            warnings.push(ConsumptionWarning::SaturatedPower { average_kw, rated_kw: power });
        }
        let efficiency = energy / nominal;
        if efficiency < LOW_EFFICIENCY {
            warnings.push(ConsumptionWarning::LowEfficiency { percent: efficiency * Decimal::ONE_HUNDRED });
        }
        ValidationOutcome::with_warnings(warnings)
    }
}
