pub mod config;
pub mod kwh;
pub mod session;
pub mod validate;

pub use config::{ConfigError, MeterConfig, OcrSettings, ReadingLimits, VerificationSettings};
pub use kwh::Kwh;
pub use session::{
    ChargingSession, InMemorySessionStore, MeterReading, Provider, ReadingKind, SessionStore,
    StoreError,
};
pub use validate::{
    ChargeContext, ConsumptionWarning, ReadingValidator, ValidationError, ValidationOutcome,
};
