//! Durable storage for the gallery and the event log.
//!
//! `Persistence` is the seam: `SqliteStore` for deployments, `InMemoryStore` for tests and
//! dry runs. Both take `&self` and serialize writers internally, so one store is shared by
//! the gallery (identity writes) and the event log (event appends) behind an `Arc`.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

use crate::chain::{hash_entry, verify_links, ChainLink, GENESIS_HASH};
use crate::gallery::{Category, Identity, IdentityId, NewIdentity};
use crate::{now_ms, open_db_connection, DetectionEvent, EventId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// Worth retrying: database busy or locked.
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Fatal(String),
}

impl PersistenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Transient(_))
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                PersistenceError::Transient(e.to_string())
            }
            _ => PersistenceError::Fatal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Fatal(format!("serialization: {}", e))
    }
}

/// Bounded retry for transient storage failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op`, retrying transient failures. Fatal failures return at once.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < attempts => {
                    log::warn!(
                        "{}: attempt {}/{} failed: {}; retrying",
                        what,
                        attempt,
                        attempts,
                        e
                    );
                    std::thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Keyset position in newest-first history: rows strictly older than this come next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventCursor {
    pub created_at: u64,
    pub id: EventId,
}

impl EventCursor {
    pub fn after(event: &DetectionEvent) -> Self {
        Self {
            created_at: event.created_at,
            id: event.id,
        }
    }

    fn admits(&self, event: &DetectionEvent) -> bool {
        (event.created_at, event.id) < (self.created_at, self.id)
    }
}

pub trait Persistence: Send + Sync {
    /// All stored identities, ascending id.
    fn load_gallery(&self) -> Result<Vec<Identity>, PersistenceError>;

    /// Create an identity, or overwrite `identity.replaces`. Returns the stored id.
    fn save_identity(&self, identity: &NewIdentity) -> Result<IdentityId, PersistenceError>;

    /// Remove an identity. `Ok(false)` when no such id is stored.
    fn delete_identity(&self, id: IdentityId) -> Result<bool, PersistenceError>;

    /// Append a resolved event. `Ok(false)` when the id is already stored.
    fn append_event(&self, event: &DetectionEvent) -> Result<bool, PersistenceError>;

    /// Up to `limit` events, newest first, strictly older than `before`.
    fn events_page(
        &self,
        before: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<DetectionEvent>, PersistenceError>;

    /// Highest stored event id, 0 when empty.
    fn max_event_id(&self) -> Result<EventId, PersistenceError>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_millis(250))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS identities (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              display_name TEXT NOT NULL,
              category TEXT NOT NULL,
              embedding_json TEXT NOT NULL,
              photo_reference TEXT,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection_events (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id INTEGER NOT NULL UNIQUE,
              frame_id INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              resolution TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_created ON detection_events(created_at, id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Fatal("sqlite connection lock poisoned".to_string()))
    }

    /// Recompute the event hash chain in insertion order. Returns the number of entries.
    pub fn verify_chain(&self) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, prev_hash, entry_hash, payload_json FROM detection_events ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut links = Vec::new();
        for row in rows {
            let (id, prev, entry, payload) = row?;
            links.push(ChainLink {
                event_id: from_sql_int(id),
                prev_hash: hash32(&prev, "prev_hash")?,
                entry_hash: hash32(&entry, "entry_hash")?,
                payload: payload.into_bytes(),
            });
        }
        verify_links(links)
    }

    fn last_entry_hash(conn: &Connection) -> Result<[u8; 32], PersistenceError> {
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT entry_hash FROM detection_events ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => hash32(&bytes, "entry_hash")
                .map_err(|e| PersistenceError::Fatal(e.to_string())),
            None => Ok(GENESIS_HASH),
        }
    }
}

fn hash32(bytes: &[u8], column: &str) -> anyhow::Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| anyhow::anyhow!("corrupt event log: {} size {}", column, bytes.len()))
}

fn to_sql_int(value: u64, what: &str) -> Result<i64, PersistenceError> {
    i64::try_from(value)
        .map_err(|_| PersistenceError::Fatal(format!("{} {} exceeds i64 range", what, value)))
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn decode_events(payloads: Vec<String>) -> Result<Vec<DetectionEvent>, PersistenceError> {
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(PersistenceError::from))
        .collect()
}

impl Persistence for SqliteStore {
    fn load_gallery(&self) -> Result<Vec<Identity>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, category, embedding_json, photo_reference FROM identities ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        let mut identities = Vec::new();
        for row in rows {
            let (id, display_name, category, embedding_json, photo_reference) = row?;
            let category = category.parse::<Category>().map_err(|e| {
                PersistenceError::Fatal(format!("identity {}: {}", id, e))
            })?;
            identities.push(Identity {
                id: from_sql_int(id),
                display_name,
                embedding: serde_json::from_str(&embedding_json)?,
                category,
                photo_reference,
            });
        }
        Ok(identities)
    }

    fn save_identity(&self, identity: &NewIdentity) -> Result<IdentityId, PersistenceError> {
        let conn = self.lock()?;
        let embedding_json = serde_json::to_string(&identity.embedding)?;
        let now = to_sql_int(now_ms(), "timestamp")?;
        match identity.replaces {
            Some(id) => {
                let changed = conn.execute(
                    r#"
                    UPDATE identities
                    SET display_name = ?1, category = ?2, embedding_json = ?3,
                        photo_reference = ?4, updated_at = ?5
                    WHERE id = ?6
                    "#,
                    params![
                        identity.display_name,
                        identity.category.as_str(),
                        embedding_json,
                        identity.photo_reference,
                        now,
                        to_sql_int(id, "identity id")?
                    ],
                )?;
                if changed == 0 {
                    return Err(PersistenceError::Fatal(format!(
                        "identity {} not found",
                        id
                    )));
                }
                Ok(id)
            }
            None => {
                conn.execute(
                    r#"
                    INSERT INTO identities(display_name, category, embedding_json, photo_reference, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                    "#,
                    params![
                        identity.display_name,
                        identity.category.as_str(),
                        embedding_json,
                        identity.photo_reference,
                        now
                    ],
                )?;
                Ok(from_sql_int(conn.last_insert_rowid()))
            }
        }
    }

    fn delete_identity(&self, id: IdentityId) -> Result<bool, PersistenceError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM identities WHERE id = ?1",
            params![to_sql_int(id, "identity id")?],
        )?;
        Ok(removed > 0)
    }

    fn append_event(&self, event: &DetectionEvent) -> Result<bool, PersistenceError> {
        let conn = self.lock()?;
        let id = to_sql_int(event.id, "event id")?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM detection_events WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(false);
        }

        let prev_hash = Self::last_entry_hash(&conn)?;
        let payload_json = serde_json::to_string(event)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO detection_events(id, frame_id, created_at, resolution, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                id,
                to_sql_int(event.frame_id, "frame id")?,
                to_sql_int(event.created_at, "created_at")?,
                event.resolution.as_str(),
                payload_json,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )?;
        Ok(inserted == 1)
    }

    fn events_page(
        &self,
        before: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<DetectionEvent>, PersistenceError> {
        let conn = self.lock()?;
        let limit = to_sql_int(limit as u64, "page size")?;
        let payloads = match before {
            None => {
                let mut stmt = conn.prepare(
                    "SELECT payload_json FROM detection_events ORDER BY created_at DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
                let payloads = rows.collect::<Result<Vec<_>, _>>()?;
                payloads
            }
            Some(cursor) => {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT payload_json FROM detection_events
                    WHERE created_at < ?1 OR (created_at = ?1 AND id < ?2)
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?3
                    "#,
                )?;
                let rows = stmt.query_map(
                    params![
                        to_sql_int(cursor.created_at, "cursor")?,
                        to_sql_int(cursor.id, "cursor")?,
                        limit
                    ],
                    |row| row.get::<_, String>(0),
                )?;
                let payloads = rows.collect::<Result<Vec<_>, _>>()?;
                payloads
            }
        };
        decode_events(payloads)
    }

    fn max_event_id(&self) -> Result<EventId, PersistenceError> {
        let conn = self.lock()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM detection_events",
            [],
            |row| row.get(0),
        )?;
        Ok(from_sql_int(max))
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryState {
    identities: BTreeMap<IdentityId, Identity>,
    next_identity_id: IdentityId,
    events: Vec<DetectionEvent>,
    event_ids: HashSet<EventId>,
    failing_writes: u32,
}

impl InMemoryState {
    fn take_injected_failure(&mut self) -> Result<(), PersistenceError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(PersistenceError::Transient("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// Process-local store with the same semantics as `SqliteStore`.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with identities, keeping their ids.
    pub fn with_identities(identities: Vec<Identity>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            for identity in identities {
                state.next_identity_id = state.next_identity_id.max(identity.id);
                state.identities.insert(identity.id, identity);
            }
        }
        store
    }

    /// Make the next `count` writes fail transiently.
    pub fn inject_transient_failures(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_writes = count;
        }
    }

    /// Stored events in insertion order.
    pub fn recorded_events(&self) -> Vec<DetectionEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>, PersistenceError> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::Fatal("in-memory store lock poisoned".to_string()))
    }
}

impl Persistence for InMemoryStore {
    fn load_gallery(&self) -> Result<Vec<Identity>, PersistenceError> {
        Ok(self.lock()?.identities.values().cloned().collect())
    }

    fn save_identity(&self, identity: &NewIdentity) -> Result<IdentityId, PersistenceError> {
        let mut state = self.lock()?;
        state.take_injected_failure()?;
        let id = match identity.replaces {
            Some(id) if state.identities.contains_key(&id) => id,
            Some(id) => {
                return Err(PersistenceError::Fatal(format!(
                    "identity {} not found",
                    id
                )))
            }
            None => {
                state.next_identity_id += 1;
                state.next_identity_id
            }
        };
        state.identities.insert(id, identity.clone().into_identity(id));
        Ok(id)
    }

    fn delete_identity(&self, id: IdentityId) -> Result<bool, PersistenceError> {
        let mut state = self.lock()?;
        state.take_injected_failure()?;
        Ok(state.identities.remove(&id).is_some())
    }

    fn append_event(&self, event: &DetectionEvent) -> Result<bool, PersistenceError> {
        let mut state = self.lock()?;
        if state.event_ids.contains(&event.id) {
            return Ok(false);
        }
        state.take_injected_failure()?;
        state.event_ids.insert(event.id);
        state.events.push(event.clone());
        Ok(true)
    }

    fn events_page(
        &self,
        before: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<DetectionEvent>, PersistenceError> {
        let state = self.lock()?;
        let mut events: Vec<&DetectionEvent> = state
            .events
            .iter()
            .filter(|e| before.map_or(true, |cursor| cursor.admits(e)))
            .collect();
        events.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(events.into_iter().take(limit).cloned().collect())
    }

    fn max_event_id(&self) -> Result<EventId, PersistenceError> {
        Ok(self.lock()?.event_ids.iter().copied().max().unwrap_or(0))
    }
}
