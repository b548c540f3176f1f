use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::kwh::Kwh;

/// Which boundary of a charging session a reading belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    Start,
    End,
}

impl std::fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadingKind::Start => write!(f, "start"),
            ReadingKind::End => write!(f, "end"),
        }
    }
}

impl std::str::FromStr for ReadingKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ReadingKind::Start),
            "end" => Ok(ReadingKind::End),
            other => Err(format!("Unknown reading kind: '{other}'")),
        }
    }
}

/// How a reading was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Vision,
    Manual,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Vision => write!(f, "vision"),
            Provider::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vision" => Ok(Provider::Vision),
            "manual" => Ok(Provider::Manual),
            other => Err(format!("Unknown reading provider: '{other}'")),
        }
    }
}

/// A confirmed meter reading as persisted on the charging session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub value: Kwh,
    pub provider: Provider,
    /// OCR confidence (0–100); absent for manual entries.
    pub confidence: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// The slice of a charging session this workflow reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    pub id: String,
    pub charger_power_kw: Option<Decimal>,
    pub battery_capacity_kwh: Option<Decimal>,
    pub start_reading: Option<MeterReading>,
    pub end_reading: Option<MeterReading>,
    pub consumption: Option<Kwh>,
}

impl ChargingSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            charger_power_kw: None,
            battery_capacity_kwh: None,
            start_reading: None,
            end_reading: None,
            consumption: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Charging session not found: {0}")]
    SessionNotFound(String),
    #[error("Session store error: {0}")]
    Backend(String),
}

/// Persistence seam for charging sessions. The verification workflow reads
/// the start reading back from here when an end reading is confirmed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn session(&self, session_id: &str) -> Result<Option<ChargingSession>, StoreError>;

    async fn record_start_reading(
        &self,
        session_id: &str,
        reading: &MeterReading,
    ) -> Result<(), StoreError>;

    async fn record_end_reading(
        &self,
        session_id: &str,
        reading: &MeterReading,
        consumption: Kwh,
    ) -> Result<(), StoreError>;
}

/// Process-local store, used in tests and when no database is configured.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, ChargingSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: ChargingSession) {
        self.lock().insert(session.id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<ChargingSession> {
        self.lock().get(session_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChargingSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn session(&self, session_id: &str) -> Result<Option<ChargingSession>, StoreError> {
        Ok(self.get(session_id))
    }

    async fn record_start_reading(
        &self,
        session_id: &str,
        reading: &MeterReading,
    ) -> Result<(), StoreError> {
        let mut sessions = self.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ChargingSession::new(session_id));
        session.start_reading = Some(reading.clone());
        Ok(())
    }

    async fn record_end_reading(
        &self,
        session_id: &str,
        reading: &MeterReading,
        consumption: Kwh,
    ) -> Result<(), StoreError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        session.end_reading = Some(reading.clone());
        session.consumption = Some(consumption);
        Ok(())
    }
}
