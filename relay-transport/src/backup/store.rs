//! Durable local stores behind a single port interface
//!
//! Two interchangeable implementations of the same `DurablePort`: a bounded
//! flat JSON-lines log and a SQLite-indexed store. The backup pool tries
//! them in priority order so a serialization/versioning problem in one
//! store never strands messages.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::warn;

use relay_core::{Envelope, RelayError, RelayResult};

/// Uniform get/put/flush surface over a durable local store
pub trait DurablePort: Send + Sync {
    fn name(&self) -> &str;

    /// Persist one envelope; `INSERT OR REPLACE` semantics by envelope id
    fn put(&self, envelope: &Envelope) -> RelayResult<()>;

    /// Read up to `limit` persisted envelopes in timestamp order
    fn get(&self, limit: usize) -> RelayResult<Vec<Envelope>>;

    /// Force pending writes to disk; doubles as the writability probe
    fn flush(&self) -> RelayResult<()>;
}

// ============================================================================
// Flat JSON-lines log
// ============================================================================

/// Bounded append-only log, one JSON envelope per line
pub struct FlatLogPort {
    path: PathBuf,
    max_entries: usize,
    entry_count: Mutex<usize>,
}

impl FlatLogPort {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> RelayResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelayError::storage(format!("create log directory: {e}")))?;
        }
        let entry_count = match fs::read_to_string(&path) {
            Ok(contents) => contents.lines().filter(|l| !l.is_empty()).count(),
            Err(_) => 0,
        };
        Ok(Self {
            path,
            max_entries: max_entries.max(1),
            entry_count: Mutex::new(entry_count),
        })
    }

    fn read_entries(&self) -> Vec<Envelope> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        contents
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| match Envelope::from_json(line) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    // Versioning drift in old entries is skipped, not fatal
                    warn!("[Backup Log] skipping unreadable entry: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Rewrite the log keeping only the newest `max_entries` lines
    fn compact(&self, count: &mut usize) -> RelayResult<()> {
        let entries = self.read_entries();
        let keep = entries.len().saturating_sub(self.max_entries);
        let mut out = String::new();
        for envelope in &entries[keep..] {
            out.push_str(&envelope.to_json());
            out.push('\n');
        }
        fs::write(&self.path, out).map_err(|e| RelayError::storage(format!("compact log: {e}")))?;
        *count = entries.len() - keep;
        Ok(())
    }
}

impl DurablePort for FlatLogPort {
    fn name(&self) -> &str {
        "flat-log"
    }

    fn put(&self, envelope: &Envelope) -> RelayResult<()> {
        let mut count = self
            .entry_count
            .lock()
            .map_err(|_| RelayError::storage("log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RelayError::storage(format!("open log: {e}")))?;
        writeln!(file, "{}", envelope.to_json())
            .map_err(|e| RelayError::storage(format!("append log: {e}")))?;
        *count += 1;
        if *count > self.max_entries {
            self.compact(&mut count)?;
        }
        Ok(())
    }

    fn get(&self, limit: usize) -> RelayResult<Vec<Envelope>> {
        let mut entries = self.read_entries();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    fn flush(&self) -> RelayResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RelayError::storage(format!("open log: {e}")))?;
        file.sync_all()
            .map_err(|e| RelayError::storage(format!("sync log: {e}")))
    }
}

// ============================================================================
// SQLite-indexed store
// ============================================================================

/// Indexed durable store using SQLite
pub struct SqlitePort {
    conn: Mutex<Connection>,
}

impl SqlitePort {
    /// Open (or create) the store at the given path
    pub fn new<P: AsRef<Path>>(db_path: P) -> RelayResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelayError::storage(format!("create database directory: {e}")))?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| RelayError::storage(format!("open database: {e}")))?;
        let port = Self {
            conn: Mutex::new(conn),
        };
        port.init_schema()?;
        Ok(port)
    }

    /// In-memory store (useful for testing)
    pub fn new_in_memory() -> RelayResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RelayError::storage(format!("open database: {e}")))?;
        let port = Self {
            conn: Mutex::new(conn),
        };
        port.init_schema()?;
        Ok(port)
    }

    fn init_schema(&self) -> RelayResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| RelayError::storage("database lock poisoned"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS envelopes (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                body TEXT NOT NULL,
                stored_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_envelopes_timestamp
            ON envelopes(timestamp_ms);
            "#,
        )
        .map_err(|e| RelayError::storage(format!("init schema: {e}")))?;
        Ok(())
    }
}

impl DurablePort for SqlitePort {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn put(&self, envelope: &Envelope) -> RelayResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| RelayError::storage("database lock poisoned"))?;
        let kind = serde_json::to_string(&envelope.kind)
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO envelopes (id, kind, timestamp_ms, body)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![envelope.id, kind, envelope.timestamp_ms, envelope.to_json()],
        )
        .map_err(|e| RelayError::storage(format!("insert envelope: {e}")))?;
        Ok(())
    }

    fn get(&self, limit: usize) -> RelayResult<Vec<Envelope>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| RelayError::storage("database lock poisoned"))?;
        let mut stmt = conn
            .prepare(
                "SELECT body FROM envelopes ORDER BY timestamp_ms ASC, id ASC LIMIT ?1",
            )
            .map_err(|e| RelayError::storage(format!("prepare query: {e}")))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| RelayError::storage(format!("query envelopes: {e}")))?;

        let mut envelopes = Vec::new();
        for body in rows {
            let body = body.map_err(|e| RelayError::storage(format!("read row: {e}")))?;
            match Envelope::from_json(&body) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => warn!("[Backup DB] skipping unreadable row: {}", e),
            }
        }
        Ok(envelopes)
    }

    fn flush(&self) -> RelayResult<()> {
        // Writability probe: sqlite commits synchronously on execute
        let conn = self
            .conn
            .lock()
            .map_err(|_| RelayError::storage("database lock poisoned"))?;
        conn.execute_batch("PRAGMA user_version;")
            .map_err(|e| RelayError::storage(format!("flush: {e}")))
    }
}
