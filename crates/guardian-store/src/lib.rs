//! Guardian-Log persistent store.
//!
//! A single embedded SQLite file with one table per named partition
//! (`baselines`, `processed_queries`, `whois_cache`, `anomalies`,
//! `analyses`). Values are stored as JSON text; the table itself only
//! carries the columns needed for lookup and ordering.

use std::fs::File;
use std::path::Path;

use chrono::Utc;
use fs2::FileExt;
use guardian_core::{
    error::GuardianError, Analysis, Anomaly, AnomalyStatus, Baseline, Classification, StoreStats,
    WhoisRecord,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::info;

type SqlitePool = Pool<SqliteConnectionManager>;

/// Persistent store. Holds an advisory lock on `<path>.lock` for its
/// lifetime so a second `Store::open` against the same path fails instead
/// of silently sharing state.
pub struct Store {
    pool: SqlitePool,
    _lock: Option<File>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, GuardianError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let lock = if path == ":memory:" {
            None
        } else {
            let lock_path = format!("{path}.lock");
            let file = File::create(&lock_path)
                .map_err(|e| GuardianError::IOError(format!("opening lock file: {e}")))?;
            file.try_lock_exclusive().map_err(|_| {
                GuardianError::IOError(format!("store at {path} is already open"))
            })?;
            Some(file)
        };

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(if path == ":memory:" { 1 } else { 8 })
            .build(manager)
            .map_err(GuardianError::from)?;

        let store = Self { pool, _lock: lock };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS baselines (
                client_id TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_queries (
                fingerprint TEXT PRIMARY KEY,
                marked_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS whois_cache (
                domain TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS anomalies (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                status TEXT NOT NULL,
                classification TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_anomalies_status ON anomalies(status);

            CREATE TABLE IF NOT EXISTS analyses (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                analyzed_at TEXT NOT NULL,
                client_id TEXT NOT NULL,
                value TEXT NOT NULL
            );
            "#,
        )?;
        info!("store schema initialized");
        Ok(())
    }

    // -- baselines -----------------------------------------------------

    pub fn baseline_contains(&self, client_id: &str, domain: &str) -> Result<bool, GuardianError> {
        match self.baseline_get(client_id)? {
            Some(b) => Ok(b.contains(domain)),
            None => Ok(false),
        }
    }

    fn baseline_get(&self, client_id: &str) -> Result<Option<Baseline>, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM baselines WHERE client_id = ?1",
                params![client_id],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v).map_err(|e| {
                GuardianError::IOError(format!("corrupt baseline row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Idempotent; creates the baseline if absent, otherwise adds the
    /// domain (if new) and refreshes `client_display_name`/`last_updated`.
    pub fn baseline_add(
        &self,
        client_id: &str,
        client_display_name: &str,
        domain: &str,
    ) -> Result<(), GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let mut baseline = self.baseline_get(client_id)?.unwrap_or_else(|| Baseline {
            client_id: client_id.to_string(),
            client_display_name: client_display_name.to_string(),
            domains: Vec::new(),
            last_updated: Utc::now(),
        });

        baseline.client_display_name = client_display_name.to_string();
        if !baseline.contains(domain) {
            baseline.domains.push(domain.to_string());
        }
        baseline.last_updated = Utc::now();

        let serialized = serde_json::to_string(&baseline)
            .map_err(|e| GuardianError::IOError(format!("serializing baseline: {e}")))?;
        conn.execute(
            "INSERT INTO baselines (client_id, value) VALUES (?1, ?2)
             ON CONFLICT(client_id) DO UPDATE SET value = excluded.value",
            params![client_id, serialized],
        )?;
        Ok(())
    }

    pub fn baselines_all(&self) -> Result<Vec<Baseline>, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let mut stmt = conn.prepare("SELECT value FROM baselines")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|v| {
                serde_json::from_str(&v)
                    .map_err(|e| GuardianError::IOError(format!("corrupt baseline row: {e}")))
            })
            .collect()
    }

    // -- processed queries (dedup) --------------------------------------

    pub fn query_seen(&self, fingerprint: &str) -> Result<bool, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let mut stmt = conn.prepare("SELECT 1 FROM processed_queries WHERE fingerprint = ?1")?;
        Ok(stmt.exists(params![fingerprint])?)
    }

    /// Idempotent.
    pub fn query_mark(&self, fingerprint: &str) -> Result<(), GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        conn.execute(
            "INSERT OR IGNORE INTO processed_queries (fingerprint, marked_at) VALUES (?1, ?2)",
            params![fingerprint, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Not wired to any timer; see DESIGN.md's decision on the source's
    /// on-demand-only garbage collection.
    pub fn processed_queries_prune(&self, older_than: chrono::DateTime<Utc>) -> Result<usize, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let deleted = conn.execute(
            "DELETE FROM processed_queries WHERE marked_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    // -- whois cache -----------------------------------------------------

    pub fn whois_get(&self, domain: &str) -> Result<Option<WhoisRecord>, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM whois_cache WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v).map_err(|e| {
                GuardianError::IOError(format!("corrupt whois row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn whois_put(&self, record: &WhoisRecord) -> Result<(), GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let serialized = serde_json::to_string(record)
            .map_err(|e| GuardianError::IOError(format!("serializing whois record: {e}")))?;
        conn.execute(
            "INSERT INTO whois_cache (domain, value) VALUES (?1, ?2)
             ON CONFLICT(domain) DO UPDATE SET value = excluded.value",
            params![record.domain, serialized],
        )?;
        Ok(())
    }

    // -- analyses (append-only) ------------------------------------------

    pub fn analysis_append(&self, analysis: &Analysis) -> Result<(), GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let serialized = serde_json::to_string(analysis)
            .map_err(|e| GuardianError::IOError(format!("serializing analysis: {e}")))?;
        conn.execute(
            "INSERT INTO analyses (analyzed_at, client_id, value) VALUES (?1, ?2, ?3)",
            params![
                analysis.analyzed_at.to_rfc3339(),
                analysis.client_id,
                serialized
            ],
        )?;
        Ok(())
    }

    // -- anomalies --------------------------------------------------------

    /// Upserts by `id`. A new anomaly is assigned `status = pending`; an
    /// anomaly that already exists keeps its stored status, since `put` is
    /// how a (re-)analysis result is recorded, not how status transitions
    /// happen (that's `anomaly_set_status`). Without this, a same-id
    /// collision on an already-approved or -blocked anomaly would silently
    /// revert it to pending.
    pub fn anomaly_put(&self, mut anomaly: Anomaly) -> Result<(), GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        anomaly.status = match self.anomaly_get(&anomaly.id)? {
            Some(existing) => existing.status,
            None => AnomalyStatus::Pending,
        };
        let status = status_str(anomaly.status);
        let classification = classification_str(anomaly.classification);
        let serialized = serde_json::to_string(&anomaly)
            .map_err(|e| GuardianError::IOError(format!("serializing anomaly: {e}")))?;
        conn.execute(
            "INSERT INTO anomalies (id, client_id, status, classification, value)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 classification = excluded.classification,
                 value = excluded.value",
            params![
                anomaly.id,
                anomaly.client_id,
                status,
                classification,
                serialized
            ],
        )?;
        Ok(())
    }

    pub fn anomaly_get(&self, id: &str) -> Result<Option<Anomaly>, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM anomalies WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v).map_err(|e| {
                GuardianError::IOError(format!("corrupt anomaly row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn anomalies_list(
        &self,
        status_filter: Option<AnomalyStatus>,
    ) -> Result<Vec<Anomaly>, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;
        let values: Vec<String> = match status_filter {
            Some(status) => {
                let mut stmt =
                    conn.prepare("SELECT value FROM anomalies WHERE status = ?1")?;
                stmt.query_map(params![status_str(status)], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT value FROM anomalies")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            }
        };

        values
            .into_iter()
            .map(|v| {
                serde_json::from_str(&v)
                    .map_err(|e| GuardianError::IOError(format!("corrupt anomaly row: {e}")))
            })
            .collect()
    }

    pub fn anomaly_set_status(
        &self,
        id: &str,
        status: AnomalyStatus,
    ) -> Result<(), GuardianError> {
        let mut anomaly = self
            .anomaly_get(id)?
            .ok_or_else(|| GuardianError::NotFound(format!("anomaly {id}")))?;
        anomaly.status = status;

        let conn = self.pool.get().map_err(GuardianError::from)?;
        let serialized = serde_json::to_string(&anomaly)
            .map_err(|e| GuardianError::IOError(format!("serializing anomaly: {e}")))?;
        conn.execute(
            "UPDATE anomalies SET status = ?1, value = ?2 WHERE id = ?3",
            params![status_str(status), serialized, id],
        )?;
        Ok(())
    }

    // -- stats ------------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats, GuardianError> {
        let conn = self.pool.get().map_err(GuardianError::from)?;

        let unique_clients: i64 =
            conn.query_row("SELECT COUNT(*) FROM baselines", [], |r| r.get(0))?;
        let total_queries: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_queries", [], |r| r.get(0))?;
        let total_anomalies: i64 =
            conn.query_row("SELECT COUNT(*) FROM anomalies", [], |r| r.get(0))?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomalies WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        let approved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomalies WHERE status = 'approved'",
            [],
            |r| r.get(0),
        )?;
        let blocked: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomalies WHERE status = 'blocked'",
            [],
            |r| r.get(0),
        )?;
        let malicious: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomalies WHERE classification = 'malicious'",
            [],
            |r| r.get(0),
        )?;
        let suspicious: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomalies WHERE classification = 'suspicious'",
            [],
            |r| r.get(0),
        )?;
        let total_analyses: i64 =
            conn.query_row("SELECT COUNT(*) FROM analyses", [], |r| r.get(0))?;

        Ok(StoreStats {
            unique_clients: unique_clients as u64,
            total_queries: total_queries as u64,
            total_anomalies: total_anomalies as u64,
            pending: pending as u64,
            approved: approved as u64,
            blocked: blocked as u64,
            malicious: malicious as u64,
            suspicious: suspicious as u64,
            total_analyses: total_analyses as u64,
        })
    }
}

fn status_str(status: AnomalyStatus) -> &'static str {
    match status {
        AnomalyStatus::Pending => "pending",
        AnomalyStatus::Approved => "approved",
        AnomalyStatus::Blocked => "blocked",
    }
}

fn classification_str(classification: Classification) -> &'static str {
    match classification {
        Classification::Safe => "safe",
        Classification::Suspicious => "suspicious",
        Classification::Malicious => "malicious",
    }
}

trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_core::SuggestedAction;

    fn sample_anomaly(id: &str, classification: Classification) -> Anomaly {
        Anomaly {
            id: id.to_string(),
            client_id: "iot-plug".to_string(),
            client_display_name: "iot-plug".to_string(),
            domain: "telemetry.example.org".to_string(),
            query_type: "A".to_string(),
            classification,
            risk_score: 9,
            explanation: "C2 beaconing pattern".to_string(),
            suggested_action: SuggestedAction::Block,
            detected_at: Utc::now(),
            status: AnomalyStatus::Pending,
        }
    }

    #[test]
    fn baseline_add_is_idempotent_and_monotonic() {
        let store = Store::open(":memory:").unwrap();
        store.baseline_add("iot-plug", "IoT Plug", "a.com").unwrap();
        store.baseline_add("iot-plug", "IoT Plug", "a.com").unwrap();
        store.baseline_add("iot-plug", "IoT Plug", "b.com").unwrap();

        let baseline = store.baselines_all().unwrap().remove(0);
        assert_eq!(baseline.domains.len(), 2);
        assert!(store.baseline_contains("iot-plug", "a.com").unwrap());
        assert!(store.baseline_contains("iot-plug", "b.com").unwrap());
    }

    #[test]
    fn query_mark_dedups() {
        let store = Store::open(":memory:").unwrap();
        assert!(!store.query_seen("fp-1").unwrap());
        store.query_mark("fp-1").unwrap();
        store.query_mark("fp-1").unwrap();
        assert!(store.query_seen("fp-1").unwrap());
    }

    #[test]
    fn anomaly_put_assigns_pending_on_first_insert() {
        let store = Store::open(":memory:").unwrap();
        store
            .anomaly_put(sample_anomaly("a1", Classification::Malicious))
            .unwrap();
        let stored = store.anomaly_get("a1").unwrap().unwrap();
        assert!(matches!(stored.status, AnomalyStatus::Pending));
    }

    #[test]
    fn anomaly_set_status_not_found() {
        let store = Store::open(":memory:").unwrap();
        let result = store.anomaly_set_status("missing", AnomalyStatus::Approved);
        assert!(matches!(result, Err(GuardianError::NotFound(_))));
    }

    #[test]
    fn anomaly_set_status_is_idempotent() {
        let store = Store::open(":memory:").unwrap();
        store
            .anomaly_put(sample_anomaly("a1", Classification::Malicious))
            .unwrap();
        store
            .anomaly_set_status("a1", AnomalyStatus::Approved)
            .unwrap();
        store
            .anomaly_set_status("a1", AnomalyStatus::Approved)
            .unwrap();
        let stored = store.anomaly_get("a1").unwrap().unwrap();
        assert!(matches!(stored.status, AnomalyStatus::Approved));
    }

    #[test]
    fn anomaly_put_on_an_approved_anomaly_does_not_revert_its_status() {
        let store = Store::open(":memory:").unwrap();
        store
            .anomaly_put(sample_anomaly("a1", Classification::Malicious))
            .unwrap();
        store
            .anomaly_set_status("a1", AnomalyStatus::Approved)
            .unwrap();

        // Simulates a same-id re-analysis landing after the anomaly was
        // already approved; the caller always builds this with status
        // pending, as the dispatcher does.
        store
            .anomaly_put(sample_anomaly("a1", Classification::Malicious))
            .unwrap();

        let stored = store.anomaly_get("a1").unwrap().unwrap();
        assert!(matches!(stored.status, AnomalyStatus::Approved));
        let listed = store.anomalies_list(Some(AnomalyStatus::Approved)).unwrap();
        assert_eq!(listed.len(), 1);
        let listed_pending = store.anomalies_list(Some(AnomalyStatus::Pending)).unwrap();
        assert!(listed_pending.is_empty());
    }

    #[test]
    fn stats_reflect_classification_and_status_breakdown() {
        let store = Store::open(":memory:").unwrap();
        store
            .anomaly_put(sample_anomaly("a1", Classification::Malicious))
            .unwrap();
        store
            .anomaly_put(sample_anomaly("a2", Classification::Suspicious))
            .unwrap();
        store.anomaly_set_status("a2", AnomalyStatus::Blocked).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_anomalies, 2);
        assert_eq!(stats.malicious, 1);
        assert_eq!(stats.suspicious, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.blocked, 1);
    }

    #[test]
    fn opening_same_path_twice_fails_second_opener() {
        let dir = std::env::temp_dir().join(format!(
            "guardian-store-test-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("guardian.db");
        let path = path.to_str().unwrap();

        let _first = Store::open(path).unwrap();
        let second = Store::open(path);
        assert!(matches!(second, Err(GuardianError::IOError(_))));
    }
}
