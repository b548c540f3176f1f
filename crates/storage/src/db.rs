use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meter_core::{ChargingSession, Kwh, MeterReading, SessionStore, StoreError};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    // Decimals are stored as TEXT so kWh values round-trip exactly.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS charging_sessions (
            id TEXT PRIMARY KEY,
            charger_power_kw TEXT,
            battery_capacity_kwh TEXT,
            start_kwh TEXT,
            start_provider TEXT,
            start_confidence REAL,
            start_recorded_at TEXT,
            end_kwh TEXT,
            end_provider TEXT,
            end_confidence REAL,
            end_recorded_at TEXT,
            consumption_kwh TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create a session or update its charger details. Readings are left alone.
pub async fn upsert_session(pool: &DbPool, session: &ChargingSession) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO charging_sessions (id, charger_power_kw, battery_capacity_kwh)
        VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            charger_power_kw = excluded.charger_power_kw,
            battery_capacity_kwh = excluded.battery_capacity_kwh,
            updated_at = datetime('now')
        "#,
    )
    .bind(&session.id)
    .bind(session.charger_power_kw.map(|d| d.to_string()))
    .bind(session.battery_capacity_kwh.map(|d| d.to_string()))
    .execute(pool)
    .await?;
    Ok(())
}

type SessionRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
);

pub async fn get_session(pool: &DbPool, id: &str) -> Result<Option<ChargingSession>, sqlx::Error> {
    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT id, charger_power_kw, battery_capacity_kwh, \
                start_kwh, start_provider, start_confidence, start_recorded_at, \
                end_kwh, end_provider, end_confidence, end_recorded_at, consumption_kwh \
         FROM charging_sessions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<ChargingSession, sqlx::Error> {
        Ok(ChargingSession {
            id: r.0,
            charger_power_kw: r.1.as_deref().map(parse_decimal).transpose()?,
            battery_capacity_kwh: r.2.as_deref().map(parse_decimal).transpose()?,
            start_reading: parse_reading(r.3, r.4, r.5, r.6)?,
            end_reading: parse_reading(r.7, r.8, r.9, r.10)?,
            consumption: r.11.as_deref().map(parse_decimal).transpose()?.map(Kwh::new),
        })
    })
    .transpose()
}

/// Store the start reading, creating the session row if needed.
pub async fn record_start_reading(
    pool: &DbPool,
    id: &str,
    reading: &MeterReading,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO charging_sessions (id, start_kwh, start_provider, start_confidence, start_recorded_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            start_kwh = excluded.start_kwh,
            start_provider = excluded.start_provider,
            start_confidence = excluded.start_confidence,
            start_recorded_at = excluded.start_recorded_at,
            updated_at = datetime('now')
        "#,
    )
    .bind(id)
    .bind(reading.value.value().to_string())
    .bind(reading.provider.to_string())
    .bind(reading.confidence)
    .bind(reading.recorded_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Store the end reading and consumption. Returns false when the session
/// does not exist.
pub async fn record_end_reading(
    pool: &DbPool,
    id: &str,
    reading: &MeterReading,
    consumption: Kwh,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE charging_sessions SET end_kwh = ?, end_provider = ?, end_confidence = ?, \
         end_recorded_at = ?, consumption_kwh = ?, updated_at = datetime('now') WHERE id = ?",
    )
    .bind(reading.value.value().to_string())
    .bind(reading.provider.to_string())
    .bind(reading.confidence)
    .bind(reading.recorded_at.to_rfc3339())
    .bind(consumption.value().to_string())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn parse_decimal(s: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str(s).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_reading(
    value: Option<String>,
    provider: Option<String>,
    confidence: Option<f64>,
    recorded_at: Option<String>,
) -> Result<Option<MeterReading>, sqlx::Error> {
    let (Some(value), Some(provider), Some(recorded_at)) = (value, provider, recorded_at) else {
        return Ok(None);
    };
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
        .with_timezone(&Utc);
    Ok(Some(MeterReading {
        value: Kwh::new(parse_decimal(&value)?),
        provider: provider.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        confidence,
        recorded_at,
    }))
}

/// [`SessionStore`] backed by the `charging_sessions` table.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn session(&self, session_id: &str) -> Result<Option<ChargingSession>, StoreError> {
        get_session(&self.pool, session_id).await.map_err(backend)
    }

    async fn record_start_reading(
        &self,
        session_id: &str,
        reading: &MeterReading,
    ) -> Result<(), StoreError> {
        record_start_reading(&self.pool, session_id, reading)
            .await
            .map_err(backend)
    }

    async fn record_end_reading(
        &self,
        session_id: &str,
        reading: &MeterReading,
        consumption: Kwh,
    ) -> Result<(), StoreError> {
        match record_end_reading(&self.pool, session_id, reading, consumption).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StoreError::SessionNotFound(session_id.to_string())),
            Err(e) => Err(backend(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_core::Provider;
    use tempfile::TempDir;

    async fn temp_db() -> (TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("meter.db")).await.unwrap();
        (dir, pool)
    }

    fn reading(value: &str, provider: Provider, confidence: Option<f64>) -> MeterReading {
        MeterReading {
            value: value.parse().unwrap(),
            provider,
            confidence,
            recorded_at: DateTime::parse_from_rfc3339("2026-03-01T10:15:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let (_dir, pool) = temp_db().await;
        assert!(get_session(&pool, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.db");
        let pool = create_db(&path).await.unwrap();
        upsert_session(&pool, &ChargingSession::new("s1")).await.unwrap();
        pool.close().await;

        let pool = create_db(&path).await.unwrap();
        assert!(get_session(&pool, "s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn session_round_trips_exact_decimals() {
        let (_dir, pool) = temp_db().await;
        let mut session = ChargingSession::new("s1");
        session.charger_power_kw = Some(Decimal::from_str("7.4").unwrap());
        session.battery_capacity_kwh = Some(Decimal::from_str("64.0").unwrap());
        upsert_session(&pool, &session).await.unwrap();

        let start = reading("1245.815", Provider::Vision, Some(91.5));
        record_start_reading(&pool, "s1", &start).await.unwrap();
        let end = reading("1264.3", Provider::Manual, None);
        let stored = record_end_reading(&pool, "s1", &end, "18.49".parse().unwrap())
            .await
            .unwrap();
        assert!(stored);

        let loaded = get_session(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(loaded.charger_power_kw, session.charger_power_kw);
        assert_eq!(loaded.start_reading, Some(start));
        assert_eq!(loaded.end_reading, Some(end));
        assert_eq!(loaded.consumption.unwrap().value().to_string(), "18.49");
    }

    #[tokio::test]
    async fn upsert_keeps_existing_readings() {
        let (_dir, pool) = temp_db().await;
        let start = reading("1000", Provider::Vision, Some(80.0));
        record_start_reading(&pool, "s1", &start).await.unwrap();

        let mut session = ChargingSession::new("s1");
        session.charger_power_kw = Some(Decimal::from(50));
        upsert_session(&pool, &session).await.unwrap();

        let loaded = get_session(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(loaded.start_reading, Some(start));
        assert_eq!(loaded.charger_power_kw, Some(Decimal::from(50)));
    }

    #[tokio::test]
    async fn store_end_reading_requires_session() {
        let (_dir, pool) = temp_db().await;
        let store = SqliteSessionStore::new(pool);
        let err = store
            .record_end_reading("ghost", &reading("1100", Provider::Manual, None), "100".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn store_start_reading_creates_session() {
        let (_dir, pool) = temp_db().await;
        let store = SqliteSessionStore::new(pool);
        let start = reading("1000.5", Provider::Vision, Some(88.0));
        store.record_start_reading("s9", &start).await.unwrap();
        let session = store.session("s9").await.unwrap().unwrap();
        assert_eq!(session.start_reading, Some(start));
        assert!(session.end_reading.is_none());
        assert!(session.consumption.is_none());
    }
}
