//! Vessel store: merge-preserving identity upserts and append-only
//! position observations.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

use crate::errors::IngestError;
use crate::models::{Eta, Mmsi, PositionObservation, StoredVessel, VesselIdentity};

/// Attempts per statement before a transient contention error is
/// surfaced for the frame.
const CONTENTION_RETRIES: u32 = 3;
const CONTENTION_DELAY: Duration = Duration::from_millis(50);

/// Database handle shared by all sessions.
///
/// The upsert statement is the only merge point in the system: SQLite
/// serializes conflicting writes to the same MMSI row, so two sessions
/// learning about the same vessel cannot interleave a partial update.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the store and ensure the schema exists.
    pub async fn from_url(url: &str) -> Result<Self, IngestError> {
        info!("Opening vessel store at {}", url);
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| IngestError::DatabaseConnectionError(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| IngestError::DatabaseConnectionError(e.to_string()))?;

        let db = Self { pool };
        db.create_tables_indices().await?;
        Ok(db)
    }

    /// Access the underlying pool, for collaborators running read queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables `vessels` and `positions` with their indices.
    async fn create_tables_indices(&self) -> Result<(), IngestError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vessels (
                mmsi INTEGER PRIMARY KEY,
                name TEXT,
                vessel_type INTEGER,
                length INTEGER,
                beam INTEGER,
                imo INTEGER,
                call_sign TEXT,
                flag TEXT,
                destination TEXT,
                eta INTEGER,
                draught REAL,
                nav_status INTEGER,
                company TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mmsi INTEGER NOT NULL,
                time INTEGER NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                sog REAL,
                cog REAL,
                heading INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_positions_mmsi_time
             ON positions(mmsi, time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or merge one identity record.
    ///
    /// Merge is write-once-preserving: an incoming non-null value wins,
    /// an incoming null leaves the stored value alone. The `company`
    /// enrichment column is never named here, so a frame can never erase
    /// what the enrichment collaborator wrote. `updated_at` is always
    /// refreshed.
    pub async fn upsert_identity(&self, identity: &VesselIdentity) -> Result<(), IngestError> {
        self.with_contention_retry(|| async {
            sqlx::query(
                "INSERT INTO vessels (
                    mmsi, name, vessel_type, length, beam, imo, call_sign,
                    flag, destination, eta, draught, nav_status, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(mmsi) DO UPDATE SET
                    name = COALESCE(excluded.name, name),
                    vessel_type = COALESCE(excluded.vessel_type, vessel_type),
                    length = COALESCE(excluded.length, length),
                    beam = COALESCE(excluded.beam, beam),
                    imo = COALESCE(excluded.imo, imo),
                    call_sign = COALESCE(excluded.call_sign, call_sign),
                    flag = COALESCE(excluded.flag, flag),
                    destination = COALESCE(excluded.destination, destination),
                    eta = COALESCE(excluded.eta, eta),
                    draught = COALESCE(excluded.draught, draught),
                    nav_status = COALESCE(excluded.nav_status, nav_status),
                    updated_at = excluded.updated_at",
            )
            .bind(identity.mmsi.value())
            .bind(&identity.name)
            .bind(identity.vessel_type)
            .bind(identity.length)
            .bind(identity.beam)
            .bind(identity.imo)
            .bind(&identity.call_sign)
            .bind(&identity.flag)
            .bind(&identity.destination)
            .bind(identity.eta.map(|e| e.to_bits()))
            .bind(identity.draught)
            .bind(identity.nav_status)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Append one position observation. Pure insert, no merge.
    pub async fn append_position(&self, position: &PositionObservation) -> Result<(), IngestError> {
        self.with_contention_retry(|| async {
            sqlx::query(
                "INSERT INTO positions (mmsi, time, lat, lon, sog, cog, heading)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(position.mmsi.value())
            .bind(position.time)
            .bind(position.lat)
            .bind(position.lon)
            .bind(position.sog)
            .bind(position.cog)
            .bind(position.heading)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Fetch one stored vessel, if known.
    pub async fn vessel(&self, mmsi: Mmsi) -> Result<Option<StoredVessel>, IngestError> {
        let row: Option<VesselRow> = sqlx::query_as(
            "SELECT mmsi, name, vessel_type, length, beam, imo, call_sign,
                    flag, destination, eta, draught, nav_status, company, updated_at
             FROM vessels WHERE mmsi = ?1",
        )
        .bind(mmsi.value())
        .fetch_optional(&self.pool)
        .await?;

        row.map(VesselRow::into_stored).transpose()
    }

    /// Most recent observations for one vessel, newest first.
    pub async fn recent_positions(
        &self,
        mmsi: Mmsi,
        limit: u32,
    ) -> Result<Vec<PositionObservation>, IngestError> {
        let rows: Vec<PositionRow> = sqlx::query_as(
            "SELECT mmsi, time, lat, lon, sog, cog, heading
             FROM positions WHERE mmsi = ?1
             ORDER BY time DESC LIMIT ?2",
        )
        .bind(mmsi.value())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PositionRow::into_observation).collect()
    }

    /// The full set of vessels currently known to the store; the pool
    /// manager partitions this set across sessions.
    pub async fn tracked_vessels(&self) -> Result<std::collections::BTreeSet<Mmsi>, IngestError> {
        let rows: Vec<(u32,)> = sqlx::query_as("SELECT mmsi FROM vessels")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|(m,)| Mmsi::try_from(m)).collect()
    }

    /// Enrichment-completeness counters for the statistics snapshot.
    pub async fn summary(&self) -> Result<StoreSummary, IngestError> {
        let vessels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vessels")
            .fetch_one(&self.pool)
            .await?;
        let with_length: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vessels WHERE length IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let with_company: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vessels WHERE company IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreSummary {
            vessels: vessels as u64,
            with_length: with_length as u64,
            with_company: with_company as u64,
        })
    }

    /// Run one statement, retrying briefly on lock contention.
    ///
    /// Exhausted retries drop the frame, never the session.
    async fn with_contention_retry<F, Fut>(&self, op: F) -> Result<(), IngestError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) => {
                    attempt += 1;
                    if attempt >= CONTENTION_RETRIES {
                        return Err(IngestError::StorageContention {
                            attempts: attempt,
                            origin: e,
                        });
                    }
                    warn!(attempt, "storage contention, retrying: {}", e);
                    tokio::time::sleep(CONTENTION_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED class errors are worth a short retry.
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Counters read by the statistics reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSummary {
    pub vessels: u64,
    pub with_length: u64,
    pub with_company: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct VesselRow {
    mmsi: u32,
    name: Option<String>,
    vessel_type: Option<u8>,
    length: Option<u16>,
    beam: Option<u16>,
    imo: Option<u32>,
    call_sign: Option<String>,
    flag: Option<String>,
    destination: Option<String>,
    eta: Option<u32>,
    draught: Option<f32>,
    nav_status: Option<u8>,
    company: Option<String>,
    updated_at: DateTime<Utc>,
}

impl VesselRow {
    fn into_stored(self) -> Result<StoredVessel, IngestError> {
        Ok(StoredVessel {
            identity: VesselIdentity {
                mmsi: Mmsi::try_from(self.mmsi)?,
                name: self.name,
                vessel_type: self.vessel_type,
                length: self.length,
                beam: self.beam,
                imo: self.imo,
                call_sign: self.call_sign,
                flag: self.flag,
                destination: self.destination,
                eta: self.eta.map(Eta::from_bits),
                draught: self.draught,
                nav_status: self.nav_status,
                company: self.company,
            },
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PositionRow {
    mmsi: u32,
    time: i64,
    lat: f64,
    lon: f64,
    sog: Option<f32>,
    cog: Option<f32>,
    heading: Option<u16>,
}

impl PositionRow {
    fn into_observation(self) -> Result<PositionObservation, IngestError> {
        Ok(PositionObservation {
            mmsi: Mmsi::try_from(self.mmsi)?,
            time: self.time,
            lat: self.lat,
            lon: self.lon,
            sog: self.sog,
            cog: self.cog,
            heading: self.heading,
        })
    }
}
