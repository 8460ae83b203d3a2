// crates/challengectl-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Durable Store
// Description: `DurableStore` implementation backed by SQLite WAL.
// Purpose: Persist challenges, runners, transmissions, enrollment tokens,
//          and admin sessions; every read-modify-write operation executes
//          inside a single immediate-write transaction.
// Dependencies: challengectl-core, rand, rusqlite, serde_json, thiserror
// ============================================================================

//! ## Overview
//! One writer connection, guarded by a [`std::sync::Mutex`], issues every
//! mutating statement inside
//! `Connection::transaction_with_behavior(TransactionBehavior::Immediate)` —
//! the store's exclusive write-lock reservation begins at `BEGIN IMMEDIATE`,
//! so two concurrent callers can never interleave writes to the same row. A
//! second, read-only connection serves `list_*`/`get_*`/`dashboard_stats`
//! without ever contending with the writer.
//!
//! All blocking `rusqlite` calls run on `tokio::task::spawn_blocking`; no
//! mutex guard is ever held across an `.await` point.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use challengectl_core::Challenge;
use challengectl_core::ChallengeConfig;
use challengectl_core::ChallengeConfigUpsert;
use challengectl_core::ChallengeId;
use challengectl_core::ChallengeStatus;
use challengectl_core::DashboardStats;
use challengectl_core::Device;
use challengectl_core::DeviceId;
use challengectl_core::DisableOutcome;
use challengectl_core::DurableStore;
use challengectl_core::EnrollOutcome;
use challengectl_core::EnrollmentToken;
use challengectl_core::EnrollmentTokenRecord;
use challengectl_core::FrequencyRange;
use challengectl_core::MintEnrollmentTokenInput;
use challengectl_core::ReportCompleteInput;
use challengectl_core::ReportCompleteOutcome;
use challengectl_core::Runner;
use challengectl_core::RunnerId;
use challengectl_core::RunnerRegistration;
use challengectl_core::RunnerStatus;
use challengectl_core::SignoutOutcome;
use challengectl_core::StoreError;
use challengectl_core::Timestamp;
use challengectl_core::Transmission;
use challengectl_core::TransmissionId;
use challengectl_core::TransmissionStatus;
use rand::Rng;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Schema version this binary understands. Migrations are additive only.
const SCHEMA_VERSION: i64 = 1;
/// Busy timeout applied to both connections.
const BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Internal error type the SQLite layer raises before mapping to [`StoreError`].
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Underlying `rusqlite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Schema version stored on disk is newer than this binary supports.
    #[error("schema version mismatch")]
    VersionMismatch,
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::VersionMismatch => Self::VersionMismatch,
            SqliteStoreError::Sqlite(rusqlite::Error::SqliteFailure(inner, _))
                if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::Capacity
            }
            SqliteStoreError::Sqlite(err) => Self::TransientIo(err.to_string()),
        }
    }
}

fn map_sqlite(err: rusqlite::Error) -> StoreError {
    SqliteStoreError::from(err).into()
}

// ============================================================================
// SECTION: SqliteDurableStore
// ============================================================================

/// A [`DurableStore`] backed by a single SQLite database file.
pub struct SqliteDurableStore {
    write_conn: Arc<Mutex<Connection>>,
    read_conn: Arc<Mutex<Connection>>,
    assignment_ttl_ms: i64,
}

impl SqliteDurableStore {
    /// Opens (creating and migrating if necessary) a store at `path`.
    ///
    /// `assignment_ttl_ms` bounds how long an assignment stays reserved
    /// before a sweep reclaims it, applied to every
    /// `assign_one` call this store instance serves.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened, configured,
    /// or migrated.
    pub async fn open(path: impl Into<PathBuf>, assignment_ttl_ms: i64) -> Result<Self, StoreError> {
        let path = path.into();
        let assignment_ttl_ms = assignment_ttl_ms;
        tokio::task::spawn_blocking(move || Self::open_blocking(&path, assignment_ttl_ms))
            .await
            .map_err(|err| StoreError::TransientIo(err.to_string()))?
    }

    fn open_blocking(path: &Path, assignment_ttl_ms: i64) -> Result<Self, StoreError> {
        let mut write_conn = Connection::open(path).map_err(map_sqlite)?;
        configure_connection(&write_conn).map_err(map_sqlite)?;
        write_conn.execute_batch("PRAGMA journal_mode = WAL;").map_err(map_sqlite)?;
        initialize_schema(&mut write_conn).map_err(Into::<StoreError>::into)?;

        let read_conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .map_err(map_sqlite)?;
        configure_connection(&read_conn).map_err(map_sqlite)?;

        Ok(Self { write_conn: Arc::new(Mutex::new(write_conn)), read_conn: Arc::new(Mutex::new(read_conn)), assignment_ttl_ms })
    }

    /// Runs `body` against the writer connection inside a single
    /// `BEGIN IMMEDIATE` transaction, on a blocking thread.
    async fn write<F, T>(&self, body: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.write_conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate).map_err(map_sqlite)?;
            let result = body(&tx)?;
            tx.commit().map_err(map_sqlite)?;
            Ok(result)
        })
        .await
        .map_err(|err| StoreError::TransientIo(err.to_string()))?
    }

    /// Runs `body` against the read-only connection, on a blocking thread.
    async fn read<F, T>(&self, body: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.read_conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            body(&guard)
        })
        .await
        .map_err(|err| StoreError::TransientIo(err.to_string()))?
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn initialize_schema(conn: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS runners (
            id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL,
            ip TEXT NOT NULL,
            mac TEXT NOT NULL,
            machine_id TEXT NOT NULL,
            status TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            last_heartbeat INTEGER NOT NULL,
            devices_json TEXT NOT NULL,
            api_key_hash TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS challenges (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            config_json TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            status TEXT NOT NULL,
            assigned_to TEXT,
            assigned_at INTEGER,
            assignment_expires INTEGER,
            assigned_frequency_hz INTEGER,
            last_tx_time INTEGER,
            next_tx_time INTEGER,
            transmission_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS transmissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            challenge_id TEXT NOT NULL,
            runner_id TEXT NOT NULL,
            device_id TEXT,
            frequency_hz INTEGER,
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_transmissions_challenge ON transmissions(challenge_id);
        CREATE TABLE IF NOT EXISTS enrollment_tokens (
            token TEXT PRIMARY KEY,
            runner_name TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            used INTEGER NOT NULL,
            used_by_runner_id TEXT,
            re_enrollment_for TEXT
        );
        CREATE TABLE IF NOT EXISTS admin_sessions (
            token TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        ",
    )?;

    let stored_version: Option<i64> = tx.query_row("SELECT value FROM store_meta WHERE key = 'schema_version'", [], |row| row.get::<_, String>(0))
        .optional()?
        .map(|value| value.parse().unwrap_or(0));

    match stored_version {
        None => {
            tx.execute("INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)", params![SCHEMA_VERSION.to_string()])?;
        }
        Some(version) if version > SCHEMA_VERSION => return Err(SqliteStoreError::VersionMismatch),
        Some(_) => {}
    }
    tx.commit()?;
    Ok(())
}

// ============================================================================
// SECTION: Row Conversions
// ============================================================================

fn challenge_from_row(row: &Row<'_>) -> rusqlite::Result<Challenge> {
    let config_json: String = row.get("config_json")?;
    let config: ChallengeConfig = serde_json::from_str(&config_json)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err)))?;
    let status_str: String = row.get("status")?;
    let status = parse_status(&status_str)?;
    Ok(Challenge {
        id: ChallengeId::new(row.get::<_, String>("id")?),
        name: row.get("name")?,
        config,
        enabled: row.get::<_, i64>("enabled")? != 0,
        priority: row.get("priority")?,
        status,
        assigned_to: row.get::<_, Option<String>>("assigned_to")?.map(RunnerId::new),
        assigned_at: row.get::<_, Option<i64>>("assigned_at")?.map(Timestamp::from_millis),
        assignment_expires: row.get::<_, Option<i64>>("assignment_expires")?.map(Timestamp::from_millis),
        assigned_frequency_hz: row.get::<_, Option<i64>>("assigned_frequency_hz")?.map(|hz| hz as u64),
        last_tx_time: row.get::<_, Option<i64>>("last_tx_time")?.map(Timestamp::from_millis),
        next_tx_time: row.get::<_, Option<i64>>("next_tx_time")?.map(Timestamp::from_millis),
        transmission_count: row.get::<_, i64>("transmission_count")? as u64,
    })
}

fn parse_status(raw: &str) -> rusqlite::Result<ChallengeStatus> {
    match raw {
        "disabled" => Ok(ChallengeStatus::Disabled),
        "queued" => Ok(ChallengeStatus::Queued),
        "assigned" => Ok(ChallengeStatus::Assigned),
        "waiting" => Ok(ChallengeStatus::Waiting),
        other => Err(rusqlite::Error::InvalidColumnType(0, other.to_owned(), rusqlite::types::Type::Text)),
    }
}

fn runner_from_row(row: &Row<'_>) -> rusqlite::Result<Runner> {
    let devices_json: String = row.get("devices_json")?;
    let devices: Vec<Device> = serde_json::from_str(&devices_json)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err)))?;
    let status_str: String = row.get("status")?;
    Ok(Runner {
        id: RunnerId::new(row.get::<_, String>("id")?),
        hostname: row.get("hostname")?,
        ip: row.get("ip")?,
        mac: row.get("mac")?,
        machine_id: row.get("machine_id")?,
        status: parse_runner_status(&status_str)?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        last_heartbeat: Timestamp::from_millis(row.get("last_heartbeat")?),
        devices,
        api_key_hash: row.get("api_key_hash")?,
    })
}

fn parse_runner_status(raw: &str) -> rusqlite::Result<RunnerStatus> {
    match raw {
        "online" => Ok(RunnerStatus::Online),
        "offline" => Ok(RunnerStatus::Offline),
        "busy" => Ok(RunnerStatus::Busy),
        other => Err(rusqlite::Error::InvalidColumnType(0, other.to_owned(), rusqlite::types::Type::Text)),
    }
}

fn transmission_from_row(row: &Row<'_>) -> rusqlite::Result<Transmission> {
    let status_str: String = row.get("status")?;
    Ok(Transmission {
        id: TransmissionId(row.get("id")?),
        challenge_id: ChallengeId::new(row.get::<_, String>("challenge_id")?),
        runner_id: RunnerId::new(row.get::<_, String>("runner_id")?),
        device_id: row.get::<_, Option<String>>("device_id")?.map(DeviceId::new),
        frequency_hz: row.get::<_, Option<i64>>("frequency_hz")?.map(|hz| hz as u64),
        started_at: Timestamp::from_millis(row.get("started_at")?),
        completed_at: Timestamp::from_millis(row.get("completed_at")?),
        status: if status_str == "success" { TransmissionStatus::Success } else { TransmissionStatus::Failure },
        error_message: row.get("error_message")?,
    })
}

// ============================================================================
// SECTION: Frequency intersection helper
// ============================================================================

/// Computes every pairwise intersection between `challenge_ranges` and
/// `freq_caps`, returning them flattened. Empty iff the challenge's
/// frequency spec shares no point with the runner's capabilities.
fn intersections(challenge_ranges: &[FrequencyRange], freq_caps: &[FrequencyRange]) -> Vec<FrequencyRange> {
    let mut out = Vec::new();
    for challenge_range in challenge_ranges {
        for cap in freq_caps {
            if let Some(overlap) = challenge_range.intersect(*cap) {
                out.push(overlap);
            }
        }
    }
    out
}

/// Picks a uniformly random Hz value from the union of `ranges` (which may
/// overlap), weighting each range by its width. `ranges` must be non-empty.
fn pick_frequency(ranges: &[FrequencyRange]) -> u64 {
    let total_width: u128 = ranges.iter().map(|range| u128::from(range.high_hz - range.low_hz) + 1).sum();
    let mut offset = rand::thread_rng().gen_range(0..total_width.max(1));
    for range in ranges {
        let width = u128::from(range.high_hz - range.low_hz) + 1;
        if offset < width {
            return range.low_hz + u64::try_from(offset).unwrap_or(0);
        }
        offset -= width;
    }
    ranges[0].low_hz
}

// ============================================================================
// SECTION: DurableStore impl
// ============================================================================

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn register_runner(&self, registration: RunnerRegistration) -> Result<Runner, StoreError> {
        let now = Timestamp::now().as_millis();
        self.write(move |tx| {
            let devices_json = serde_json::to_string(&registration.devices).map_err(|err| StoreError::TransientIo(err.to_string()))?;
            let existing_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM runners WHERE mac = ?1 AND machine_id = ?2",
                    params![registration.mac, registration.machine_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqlite)?;
            let runner_id = existing_id.unwrap_or_else(|| uuid_like());
            tx.execute(
                "INSERT INTO runners (id, hostname, ip, mac, machine_id, status, enabled, last_heartbeat, devices_json, api_key_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'online', 1, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    hostname = excluded.hostname,
                    ip = excluded.ip,
                    status = 'online',
                    last_heartbeat = excluded.last_heartbeat,
                    devices_json = excluded.devices_json,
                    api_key_hash = excluded.api_key_hash",
                params![runner_id, registration.hostname, registration.ip, registration.mac, registration.machine_id, now, devices_json, registration.api_key_hash],
            )
            .map_err(map_sqlite)?;
            let mut stmt = tx.prepare("SELECT * FROM runners WHERE id = ?1").map_err(map_sqlite)?;
            stmt.query_row(params![runner_id], runner_from_row).map_err(map_sqlite)
        })
        .await
    }

    async fn heartbeat(&self, runner_id: &RunnerId) -> Result<(), StoreError> {
        let now = Timestamp::now().as_millis();
        let runner_id = runner_id.clone();
        self.write(move |tx| {
            let changed = tx
                .execute(
                    "UPDATE runners SET last_heartbeat = ?1, status = CASE WHEN status = 'offline' THEN 'online' ELSE status END WHERE id = ?2",
                    params![now, runner_id.as_str()],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn signout(&self, runner_id: &RunnerId) -> Result<SignoutOutcome, StoreError> {
        let now = Timestamp::now().as_millis();
        let runner_id = runner_id.clone();
        self.write(move |tx| {
            let assigned_challenge: Option<String> = tx
                .query_row("SELECT id FROM challenges WHERE assigned_to = ?1", params![runner_id.as_str()], |row| row.get(0))
                .optional()
                .map_err(map_sqlite)?;
            let cleared_assignment = if let Some(challenge_id) = &assigned_challenge {
                tx.execute(
                    "INSERT INTO transmissions (challenge_id, runner_id, device_id, frequency_hz, started_at, completed_at, status, error_message)
                     SELECT id, ?1, NULL, assigned_frequency_hz, assigned_at, ?2, 'failure', 'shutdown' FROM challenges WHERE id = ?3",
                    params![runner_id.as_str(), now, challenge_id],
                )
                .map_err(map_sqlite)?;
                let transmission_id = tx.last_insert_rowid();
                let mut tstmt = tx.prepare("SELECT * FROM transmissions WHERE id = ?1").map_err(map_sqlite)?;
                let transmission = tstmt.query_row(params![transmission_id], transmission_from_row).map_err(map_sqlite)?;
                tx.execute(
                    "UPDATE challenges SET status = 'waiting', assigned_to = NULL, assigned_at = NULL, assignment_expires = NULL,
                        assigned_frequency_hz = NULL, next_tx_time = ?1 WHERE id = ?2",
                    params![now, challenge_id],
                )
                .map_err(map_sqlite)?;
                Some((transmission, ChallengeId::new(challenge_id.clone())))
            } else {
                None
            };
            let changed = tx.execute("UPDATE runners SET status = 'offline' WHERE id = ?1", params![runner_id.as_str()]).map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(SignoutOutcome { cleared_assignment })
        })
        .await
    }

    async fn assign_one(&self, runner_id: &RunnerId, freq_caps: &[FrequencyRange]) -> Result<Option<Challenge>, StoreError> {
        let now = Timestamp::now().as_millis();
        let ttl_ms = self.assignment_ttl_ms;
        let runner_id = runner_id.clone();
        let freq_caps = freq_caps.to_vec();
        self.write(move |tx| {
            // Precondition (spec.md §4.4): runner must be enabled and online/busy.
            // An enabled-but-offline runner (stale-runner swept after a missed
            // heartbeat) must not be handed work until it heartbeats again.
            let mut rstmt = tx.prepare("SELECT * FROM runners WHERE id = ?1").map_err(map_sqlite)?;
            let runner = rstmt.query_row(params![runner_id.as_str()], runner_from_row).optional().map_err(map_sqlite)?;
            drop(rstmt);
            let Some(runner) = runner else {
                return Err(StoreError::NotFound);
            };
            if !runner.enabled || !matches!(runner.status, RunnerStatus::Online | RunnerStatus::Busy) {
                return Ok(None);
            }

            // Step 1: lazy delay expiry.
            tx.execute("UPDATE challenges SET status = 'queued' WHERE status = 'waiting' AND next_tx_time <= ?1", params![now]).map_err(map_sqlite)?;

            // Step 2: candidate selection, highest priority first, stable by id.
            let mut stmt = tx
                .prepare("SELECT * FROM challenges WHERE enabled = 1 AND status = 'queued' ORDER BY priority DESC, id ASC")
                .map_err(map_sqlite)?;
            let candidates = stmt
                .query_map([], challenge_from_row)
                .map_err(map_sqlite)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sqlite)?;
            drop(stmt);

            let mut best: Option<(Challenge, Vec<FrequencyRange>)> = None;
            for candidate in candidates {
                let overlap = intersections(&candidate.config.frequency_spec.ranges(), &freq_caps);
                if overlap.is_empty() {
                    continue;
                }
                match &best {
                    Some((chosen, _)) if chosen.priority >= candidate.priority => {}
                    _ => best = Some((candidate, overlap)),
                }
                // Once we've captured the first (highest-priority) match we
                // still need to consider ties at that same priority for the
                // random tie-break, handled in the tie-break pass below.
            }

            let Some((top, _)) = &best else {
                return Ok(None);
            };
            let top_priority = top.priority;
            let ties: Vec<(Challenge, Vec<FrequencyRange>)> = {
                let mut stmt = tx
                    .prepare("SELECT * FROM challenges WHERE enabled = 1 AND status = 'queued' AND priority = ?1 ORDER BY id ASC")
                    .map_err(map_sqlite)?;
                let rows = stmt.query_map(params![top_priority], challenge_from_row).map_err(map_sqlite)?.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)?;
                rows.into_iter()
                    .filter_map(|candidate| {
                        let overlap = intersections(&candidate.config.frequency_spec.ranges(), &freq_caps);
                        if overlap.is_empty() { None } else { Some((candidate, overlap)) }
                    })
                    .collect()
            };
            let index = rand::thread_rng().gen_range(0..ties.len());
            let (chosen, overlap) = &ties[index];
            let chosen_frequency = pick_frequency(overlap);

            let assignment_expires = now + ttl_ms;
            tx.execute(
                "UPDATE challenges SET status = 'assigned', assigned_to = ?1, assigned_at = ?2, assignment_expires = ?3, assigned_frequency_hz = ?4
                 WHERE id = ?5",
                params![runner_id.as_str(), now, assignment_expires, chosen_frequency as i64, chosen.id.as_str()],
            )
            .map_err(map_sqlite)?;
            tx.execute("UPDATE runners SET status = 'busy' WHERE id = ?1", params![runner_id.as_str()]).map_err(map_sqlite)?;

            let mut stmt = tx.prepare("SELECT * FROM challenges WHERE id = ?1").map_err(map_sqlite)?;
            let updated = stmt.query_row(params![chosen.id.as_str()], challenge_from_row).map_err(map_sqlite)?;
            Ok(Some(updated))
        })
        .await
    }

    async fn report_complete(&self, input: ReportCompleteInput) -> Result<ReportCompleteOutcome, StoreError> {
        let now = Timestamp::now().as_millis();
        self.write(move |tx| {
            let mut stmt = tx.prepare("SELECT * FROM challenges WHERE id = ?1").map_err(map_sqlite)?;
            let challenge = stmt.query_row(params![input.challenge_id.as_str()], challenge_from_row).optional().map_err(map_sqlite)?;
            drop(stmt);
            let Some(challenge) = challenge else {
                return Err(StoreError::NotFound);
            };

            let is_current = challenge.status == ChallengeStatus::Assigned && challenge.assigned_to.as_ref() == Some(&input.runner_id);
            let started_at = challenge.assigned_at.map(Timestamp::as_millis).unwrap_or(now);
            let status_str = if matches!(input.outcome, TransmissionStatus::Success) { "success" } else { "failure" };

            tx.execute(
                "INSERT INTO transmissions (challenge_id, runner_id, device_id, frequency_hz, started_at, completed_at, status, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    input.challenge_id.as_str(),
                    input.runner_id.as_str(),
                    input.device_id.as_ref().map(DeviceId::as_str),
                    input.frequency_hz.map(|hz| hz as i64),
                    started_at,
                    now,
                    status_str,
                    input.error_message,
                ],
            )
            .map_err(map_sqlite)?;
            let transmission_id = tx.last_insert_rowid();
            let mut tstmt = tx.prepare("SELECT * FROM transmissions WHERE id = ?1").map_err(map_sqlite)?;
            let transmission = tstmt.query_row(params![transmission_id], transmission_from_row).map_err(map_sqlite)?;

            if !is_current {
                return Ok(ReportCompleteOutcome::StaleAssignment(transmission));
            }

            let delay_ms = if challenge.config.delay_max_ms > challenge.config.delay_min_ms {
                rand::thread_rng().gen_range(challenge.config.delay_min_ms..=challenge.config.delay_max_ms)
            } else {
                challenge.config.delay_min_ms
            };
            let next_tx_time = now + delay_ms as i64;
            tx.execute(
                "UPDATE challenges SET status = 'waiting', assigned_to = NULL, assigned_at = NULL, assignment_expires = NULL,
                    assigned_frequency_hz = NULL, last_tx_time = ?1, next_tx_time = ?2, transmission_count = transmission_count + 1
                 WHERE id = ?3",
                params![now, next_tx_time, input.challenge_id.as_str()],
            )
            .map_err(map_sqlite)?;
            tx.execute(
                "UPDATE runners SET status = 'online' WHERE id = ?1 AND status = 'busy'",
                params![input.runner_id.as_str()],
            )
            .map_err(map_sqlite)?;

            Ok(ReportCompleteOutcome::Recorded(transmission))
        })
        .await
    }

    async fn trigger(&self, challenge_id: &ChallengeId) -> Result<(), StoreError> {
        let now = Timestamp::now().as_millis();
        let challenge_id = challenge_id.clone();
        self.write(move |tx| {
            let changed = tx
                .execute(
                    "UPDATE challenges SET next_tx_time = ?1, status = CASE WHEN status = 'waiting' THEN 'queued' ELSE status END WHERE id = ?2",
                    params![now, challenge_id.as_str()],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn enable(&self, challenge_id: &ChallengeId) -> Result<(), StoreError> {
        let challenge_id = challenge_id.clone();
        self.write(move |tx| {
            let changed = tx
                .execute(
                    "UPDATE challenges SET enabled = 1, status = CASE WHEN status = 'disabled' THEN 'queued' ELSE status END WHERE id = ?1",
                    params![challenge_id.as_str()],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn disable(&self, challenge_id: &ChallengeId) -> Result<DisableOutcome, StoreError> {
        let challenge_id = challenge_id.clone();
        self.write(move |tx| {
            let disowned: Option<String> = tx
                .query_row("SELECT assigned_to FROM challenges WHERE id = ?1 AND status = 'assigned'", params![challenge_id.as_str()], |row| row.get(0))
                .optional()
                .map_err(map_sqlite)?;
            let changed = tx
                .execute(
                    "UPDATE challenges SET enabled = 0, status = 'disabled', assigned_to = NULL, assigned_at = NULL,
                        assignment_expires = NULL, assigned_frequency_hz = NULL WHERE id = ?1",
                    params![challenge_id.as_str()],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(DisableOutcome { disowned_runner: disowned.map(RunnerId::new) })
        })
        .await
    }

    async fn reload(&self, upserts: Vec<ChallengeConfigUpsert>) -> Result<(), StoreError> {
        self.write(move |tx| {
            for upsert in upserts {
                let config_json = serde_json::to_string(&upsert.config).map_err(|err| StoreError::TransientIo(err.to_string()))?;
                let existing: Option<String> = tx
                    .query_row("SELECT id FROM challenges WHERE name = ?1", params![upsert.name], |row| row.get(0))
                    .optional()
                    .map_err(map_sqlite)?;
                match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE challenges SET config_json = ?1, priority = ?2, enabled = ?3 WHERE id = ?4",
                            params![config_json, upsert.config.priority, upsert.config.enabled, id],
                        )
                        .map_err(map_sqlite)?;
                    }
                    None => {
                        let id = uuid_like();
                        let initial_status = if upsert.config.enabled { "queued" } else { "disabled" };
                        tx.execute(
                            "INSERT INTO challenges (id, name, config_json, enabled, priority, status, transmission_count)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                            params![id, upsert.name, config_json, upsert.config.enabled, upsert.config.priority, initial_status],
                        )
                        .map_err(map_sqlite)?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn enroll(&self, token: &EnrollmentToken, runner_name: &str, mac: &str, machine_id: &str, api_key_hash: &str) -> Result<EnrollOutcome, StoreError> {
        let now = Timestamp::now().as_millis();
        let token = token.clone();
        let runner_name = runner_name.to_owned();
        let mac = mac.to_owned();
        let machine_id = machine_id.to_owned();
        let api_key_hash = api_key_hash.to_owned();
        self.write(move |tx| {
            let changed = tx
                .execute(
                    "UPDATE enrollment_tokens SET used = 1 WHERE token = ?1 AND used = 0 AND expires_at > ?2",
                    params![token.as_str(), now],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::Conflict("enrollment token already used, unknown, or expired".to_owned()));
            }
            let runner_id = uuid_like();
            let empty_devices = "[]".to_owned();
            tx.execute(
                "INSERT INTO runners (id, hostname, ip, mac, machine_id, status, enabled, last_heartbeat, devices_json, api_key_hash)
                 VALUES (?1, ?2, '', ?3, ?4, 'online', 1, ?5, ?6, ?7)",
                params![runner_id, runner_name, mac, machine_id, now, empty_devices, api_key_hash],
            )
            .map_err(map_sqlite)?;
            tx.execute("UPDATE enrollment_tokens SET used_by_runner_id = ?1 WHERE token = ?2", params![runner_id, token.as_str()]).map_err(map_sqlite)?;
            Ok(EnrollOutcome { runner_id: RunnerId::new(runner_id), api_key_plaintext: String::new() })
        })
        .await
    }

    async fn mint_enrollment_token(&self, input: MintEnrollmentTokenInput) -> Result<EnrollmentTokenRecord, StoreError> {
        let now = Timestamp::now().as_millis();
        self.write(move |tx| {
            let token = uuid_like();
            let expires_at = now + input.ttl_ms;
            tx.execute(
                "INSERT INTO enrollment_tokens (token, runner_name, created_by, created_at, expires_at, used, used_by_runner_id, re_enrollment_for)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)",
                params![token, input.runner_name, input.created_by, now, expires_at, input.re_enrollment_for.as_ref().map(RunnerId::as_str)],
            )
            .map_err(map_sqlite)?;
            Ok(EnrollmentTokenRecord {
                token: EnrollmentToken::new(token),
                runner_name: input.runner_name,
                created_by: input.created_by,
                created_at: Timestamp::from_millis(now),
                expires_at: Timestamp::from_millis(expires_at),
                used: false,
                used_by_runner_id: None,
                re_enrollment_for: input.re_enrollment_for,
            })
        })
        .await
    }

    async fn create_admin_session(&self, user: &str, ttl_ms: i64) -> Result<String, StoreError> {
        let now = Timestamp::now().as_millis();
        let user = user.to_owned();
        self.write(move |tx| {
            let token = uuid_like();
            tx.execute("INSERT INTO admin_sessions (token, username, expires_at) VALUES (?1, ?2, ?3)", params![token, user, now + ttl_ms]).map_err(map_sqlite)?;
            Ok(token)
        })
        .await
    }

    async fn validate_admin_session(&self, token: &str) -> Result<Option<String>, StoreError> {
        let now = Timestamp::now().as_millis();
        let token = token.to_owned();
        self.read(move |conn| {
            conn.query_row(
                "SELECT username FROM admin_sessions WHERE token = ?1 AND expires_at > ?2",
                params![token, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite)
        })
        .await
    }

    async fn get_challenge(&self, challenge_id: &ChallengeId) -> Result<Challenge, StoreError> {
        let challenge_id = challenge_id.clone();
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM challenges WHERE id = ?1").map_err(map_sqlite)?;
            stmt.query_row(params![challenge_id.as_str()], challenge_from_row).optional().map_err(map_sqlite)?.ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM challenges ORDER BY name ASC").map_err(map_sqlite)?;
            let rows = stmt.query_map([], challenge_from_row).map_err(map_sqlite)?.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)?;
            Ok(rows)
        })
        .await
    }

    async fn get_runner(&self, runner_id: &RunnerId) -> Result<Runner, StoreError> {
        let runner_id = runner_id.clone();
        self.read(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM runners WHERE id = ?1").map_err(map_sqlite)?;
            stmt.query_row(params![runner_id.as_str()], runner_from_row).optional().map_err(map_sqlite)?.ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM runners ORDER BY hostname ASC").map_err(map_sqlite)?;
            let rows = stmt.query_map([], runner_from_row).map_err(map_sqlite)?.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)?;
            Ok(rows)
        })
        .await
    }

    async fn list_enabled_runners(&self) -> Result<Vec<Runner>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM runners WHERE enabled = 1").map_err(map_sqlite)?;
            let rows = stmt.query_map([], runner_from_row).map_err(map_sqlite)?.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)?;
            Ok(rows)
        })
        .await
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        self.read(|conn| {
            let mut stats = DashboardStats::default();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM challenges GROUP BY status").map_err(map_sqlite)?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))).map_err(map_sqlite)?;
            for row in rows {
                let (status, count) = row.map_err(map_sqlite)?;
                match status.as_str() {
                    "disabled" => stats.challenges_disabled = count,
                    "queued" => stats.challenges_queued = count,
                    "assigned" => stats.challenges_assigned = count,
                    "waiting" => stats.challenges_waiting = count,
                    _ => {}
                }
            }
            let mut rstmt = conn.prepare("SELECT status, COUNT(*) FROM runners GROUP BY status").map_err(map_sqlite)?;
            let rrows = rstmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))).map_err(map_sqlite)?;
            for row in rrows {
                let (status, count) = row.map_err(map_sqlite)?;
                match status.as_str() {
                    "online" => stats.runners_online = count,
                    "busy" => stats.runners_busy = count,
                    "offline" => stats.runners_offline = count,
                    _ => {}
                }
            }
            stats.total_transmissions = conn.query_row("SELECT COUNT(*) FROM transmissions", [], |row| row.get::<_, i64>(0)).map_err(map_sqlite)? as u64;

            let mut nstmt = conn.prepare("SELECT name, config_json FROM challenges").map_err(map_sqlite)?;
            let names = nstmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(map_sqlite)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sqlite)?;
            for (name, config_json) in names {
                if let Ok(config) = serde_json::from_str::<ChallengeConfig>(&config_json) {
                    if config.public_view {
                        stats.public_challenge_names.push(name);
                    }
                }
            }
            Ok(stats)
        })
        .await
    }

    async fn sweep_stale_runners(&self, heartbeat_timeout_ms: i64) -> Result<Vec<RunnerId>, StoreError> {
        let now = Timestamp::now().as_millis();
        self.write(move |tx| {
            let mut stmt = tx
                .prepare("SELECT id FROM runners WHERE status IN ('online', 'busy') AND last_heartbeat < ?1")
                .map_err(map_sqlite)?;
            let stale: Vec<String> = stmt.query_map(params![now - heartbeat_timeout_ms], |row| row.get(0)).map_err(map_sqlite)?.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)?;
            drop(stmt);
            for id in &stale {
                tx.execute("UPDATE runners SET status = 'offline' WHERE id = ?1", params![id]).map_err(map_sqlite)?;
            }
            Ok(stale.into_iter().map(RunnerId::new).collect())
        })
        .await
    }

    async fn sweep_stale_assignments(&self) -> Result<Vec<(Transmission, RunnerId)>, StoreError> {
        let now = Timestamp::now().as_millis();
        self.write(move |tx| {
            let mut stmt = tx
                .prepare("SELECT * FROM challenges WHERE status = 'assigned' AND assignment_expires < ?1")
                .map_err(map_sqlite)?;
            let expired = stmt.query_map(params![now], challenge_from_row).map_err(map_sqlite)?.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)?;
            drop(stmt);

            let mut out = Vec::with_capacity(expired.len());
            for challenge in expired {
                let runner_id = challenge.assigned_to.clone().ok_or_else(|| StoreError::FatalCorruption("assigned challenge missing assigned_to".to_owned()))?;
                tx.execute(
                    "INSERT INTO transmissions (challenge_id, runner_id, device_id, frequency_hz, started_at, completed_at, status, error_message)
                     VALUES (?1, ?2, NULL, ?3, ?4, ?5, 'failure', 'timeout')",
                    params![challenge.id.as_str(), runner_id.as_str(), challenge.assigned_frequency_hz.map(|hz| hz as i64), challenge.assigned_at.map(Timestamp::as_millis).unwrap_or(now), now],
                )
                .map_err(map_sqlite)?;
                let transmission_id = tx.last_insert_rowid();
                let mut tstmt = tx.prepare("SELECT * FROM transmissions WHERE id = ?1").map_err(map_sqlite)?;
                let transmission = tstmt.query_row(params![transmission_id], transmission_from_row).map_err(map_sqlite)?;
                tx.execute(
                    "UPDATE challenges SET status = 'waiting', assigned_to = NULL, assigned_at = NULL, assignment_expires = NULL,
                        assigned_frequency_hz = NULL, next_tx_time = ?1 WHERE id = ?2",
                    params![now, challenge.id.as_str()],
                )
                .map_err(map_sqlite)?;
                out.push((transmission, runner_id));
            }
            Ok(out)
        })
        .await
    }

    async fn sweep_expired_tokens(&self) -> Result<u64, StoreError> {
        let now = Timestamp::now().as_millis();
        self.write(move |tx| {
            let tokens = tx.execute("DELETE FROM enrollment_tokens WHERE expires_at < ?1", params![now]).map_err(map_sqlite)?;
            let sessions = tx.execute("DELETE FROM admin_sessions WHERE expires_at < ?1", params![now]).map_err(map_sqlite)?;
            Ok((tokens + sessions) as u64)
        })
        .await
    }
}

/// Generates a random, URL-safe opaque identifier. Not a RFC-4122 UUID, but
/// sufficient entropy for ids and tokens that are never parsed for structure.
fn uuid_like() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use super::*;
    use challengectl_core::ChallengeConfigUpsert;
    use challengectl_core::FrequencySpec;

    async fn open_test_store() -> (SqliteDurableStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.sqlite3");
        let store = SqliteDurableStore::open(path, 300_000).await.expect("open store");
        (store, dir)
    }

    fn sample_config(priority: i64, hz: u64) -> ChallengeConfig {
        ChallengeConfig {
            modulation: "cw".to_owned(),
            frequency_spec: FrequencySpec::SingleHz { hz },
            files: vec![],
            delay_min_ms: 1_000,
            delay_max_ms: 1_000,
            priority,
            enabled: true,
            public_view: false,
        }
    }

    #[tokio::test]
    async fn assign_one_returns_the_only_eligible_challenge() {
        let (store, _dir) = open_test_store().await;
        store.reload(vec![ChallengeConfigUpsert { name: "c1".to_owned(), config: sample_config(1, 146_550_000) }]).await.unwrap();
        let runner = store
            .register_runner(RunnerRegistration {
                hostname: "r1".to_owned(),
                ip: "10.0.0.1".to_owned(),
                mac: "aa:bb".to_owned(),
                machine_id: "m1".to_owned(),
                devices: vec![Device { id: DeviceId::new("d1"), name: "hackrf".to_owned(), model: "HackRF".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
                api_key_hash: "hash".to_owned(),
            })
            .await
            .unwrap();

        let assigned = store.assign_one(&runner.id, &runner.capability_union()).await.unwrap().expect("assignment");
        assert_eq!(assigned.status, ChallengeStatus::Assigned);
        assert_eq!(assigned.assigned_to, Some(runner.id.clone()));
        assert_eq!(assigned.assigned_frequency_hz, Some(146_550_000));

        let second = store.assign_one(&runner.id, &runner.capability_union()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn assign_one_refuses_offline_runner() {
        let (store, _dir) = open_test_store().await;
        store.reload(vec![ChallengeConfigUpsert { name: "c1b".to_owned(), config: sample_config(1, 146_550_000) }]).await.unwrap();
        let runner = store
            .register_runner(RunnerRegistration {
                hostname: "r1".to_owned(),
                ip: "10.0.0.1".to_owned(),
                mac: "aa:bb".to_owned(),
                machine_id: "m1".to_owned(),
                devices: vec![Device { id: DeviceId::new("d1"), name: "hackrf".to_owned(), model: "HackRF".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
                api_key_hash: "hash".to_owned(),
            })
            .await
            .unwrap();
        store.signout(&runner.id).await.unwrap();

        let assigned = store.assign_one(&runner.id, &runner.capability_union()).await.unwrap();
        assert!(assigned.is_none(), "an offline runner must never be handed work or flipped to busy");

        let refetched = store.get_runner(&runner.id).await.unwrap();
        assert_eq!(refetched.status, RunnerStatus::Offline, "assign_one must not resurrect an offline runner to busy");
    }

    #[tokio::test]
    async fn assign_one_skips_challenges_outside_frequency_caps() {
        let (store, _dir) = open_test_store().await;
        store.reload(vec![ChallengeConfigUpsert { name: "c2".to_owned(), config: sample_config(1, 433_000_000) }]).await.unwrap();
        let runner = store
            .register_runner(RunnerRegistration {
                hostname: "r1".to_owned(),
                ip: "10.0.0.1".to_owned(),
                mac: "aa:bb".to_owned(),
                machine_id: "m1".to_owned(),
                devices: vec![Device { id: DeviceId::new("d1"), name: "hackrf".to_owned(), model: "HackRF".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
                api_key_hash: "hash".to_owned(),
            })
            .await
            .unwrap();
        let assigned = store.assign_one(&runner.id, &runner.capability_union()).await.unwrap();
        assert!(assigned.is_none());
    }

    #[tokio::test]
    async fn report_complete_after_expiry_is_stale_assignment() {
        let (store, _dir) = open_test_store().await;
        store.reload(vec![ChallengeConfigUpsert { name: "c3".to_owned(), config: sample_config(1, 146_550_000) }]).await.unwrap();
        let runner = store
            .register_runner(RunnerRegistration {
                hostname: "r1".to_owned(),
                ip: "10.0.0.1".to_owned(),
                mac: "aa:bb".to_owned(),
                machine_id: "m1".to_owned(),
                devices: vec![Device { id: DeviceId::new("d1"), name: "hackrf".to_owned(), model: "HackRF".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
                api_key_hash: "hash".to_owned(),
            })
            .await
            .unwrap();
        let assigned = store.assign_one(&runner.id, &runner.capability_union()).await.unwrap().unwrap();

        let expired = store.sweep_stale_assignments().await.unwrap();
        assert_eq!(expired.len(), 0, "assignment TTL has not elapsed yet");

        let outcome = store
            .report_complete(ReportCompleteInput {
                runner_id: runner.id.clone(),
                challenge_id: assigned.id.clone(),
                device_id: Some(DeviceId::new("d1")),
                frequency_hz: Some(146_550_000),
                outcome: TransmissionStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, ReportCompleteOutcome::Recorded(_)));

        let stale_outcome = store
            .report_complete(ReportCompleteInput {
                runner_id: runner.id,
                challenge_id: assigned.id,
                device_id: None,
                frequency_hz: None,
                outcome: TransmissionStatus::Failure,
                error_message: Some("late".to_owned()),
            })
            .await
            .unwrap();
        assert!(matches!(stale_outcome, ReportCompleteOutcome::StaleAssignment(_)));
    }

    #[tokio::test]
    async fn enrollment_token_is_single_use() {
        let (store, _dir) = open_test_store().await;
        let token = store
            .mint_enrollment_token(MintEnrollmentTokenInput { runner_name: "r2".to_owned(), created_by: "admin".to_owned(), ttl_ms: 60_000, re_enrollment_for: None })
            .await
            .unwrap();

        let first = store.enroll(&token.token, "r2", "aa:cc", "m2", "hash").await;
        assert!(first.is_ok());
        let second = store.enroll(&token.token, "r2", "aa:cc", "m2", "hash").await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }
}
