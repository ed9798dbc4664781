//! SQLite-backed [`Persistence`].
//!
//! Each [`WriteBatch`] runs inside one SQL transaction: edge deletes, note
//! upserts, edge upserts, then one `graph_log` audit row per touched note.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use crate::error::PersistenceError;
use crate::graph::persistence::{PersistedGraph, Persistence, WriteBatch};
use crate::graph::types::{AtomicNote, Edge, NoteId, NoteStatus, Relation};

pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Wrap an already-initialized connection (schema + migrations applied).
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open (or create) a database file via [`crate::db::open_database`].
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::open_database(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::open_memory_database()?))
    }

    /// Run `f` against the underlying connection (inspection and tests).
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, PersistenceError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        Ok(f(&conn)?)
    }
}

impl Persistence for SqlitePersistence {
    fn load(&self) -> Result<PersistedGraph, PersistenceError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;

        let notes: Vec<AtomicNote> = {
            let mut stmt = conn.prepare(
                "SELECT id, content, layer, status, relevance, last_decayed_at, \
                 below_threshold_since, next_review_at, created_at, last_accessed_at, \
                 source_ref, embedding, needs_relink, is_root, version \
                 FROM notes ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], RawNote::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(RawNote::into_note)
                .collect::<Result<Vec<_>, _>>()?
        };

        let edges: Vec<Edge> = {
            let mut stmt = conn.prepare(
                "SELECT from_id, to_id, relation, weight, created_at FROM edges \
                 ORDER BY from_id, to_id, relation",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(from, to, relation, weight, created_at)| {
                    let key = format!("edge:{from}->{to}:{relation}");
                    let relation: Relation = relation
                        .parse()
                        .map_err(|reason| PersistenceError::CorruptRecord {
                            key: key.clone(),
                            reason,
                        })?;
                    Ok(Edge {
                        from: NoteId::from(from),
                        to: NoteId::from(to),
                        relation,
                        weight,
                        created_at: parse_time(&key, &created_at)?,
                    })
                })
                .collect::<Result<Vec<_>, PersistenceError>>()?
        };

        tracing::debug!(notes = notes.len(), edges = edges.len(), "loaded graph from sqlite");
        Ok(PersistedGraph { notes, edges })
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        let tx = conn.transaction()?;

        for key in &batch.delete_edges {
            tx.execute(
                "DELETE FROM edges WHERE from_id = ?1 AND to_id = ?2 AND relation = ?3",
                params![key.from.as_str(), key.to.as_str(), key.relation.as_str()],
            )?;
        }

        for note in &batch.put_notes {
            upsert_note(&tx, note)?;
        }

        for edge in &batch.put_edges {
            tx.execute(
                "INSERT INTO edges (from_id, to_id, relation, weight, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(from_id, to_id, relation) DO UPDATE SET weight = excluded.weight",
                params![
                    edge.from.as_str(),
                    edge.to.as_str(),
                    edge.relation.as_str(),
                    edge.weight,
                    edge.created_at.to_rfc3339(),
                ],
            )?;
        }

        // One audit row per touched note.
        let mut touched: BTreeSet<&NoteId> = batch.put_notes.iter().map(|n| &n.id).collect();
        for edge in &batch.put_edges {
            touched.insert(&edge.from);
        }
        for key in &batch.delete_edges {
            touched.insert(&key.from);
        }
        let now = Utc::now().to_rfc3339();
        for note_id in touched {
            let details = serde_json::json!({
                "notes": batch.put_notes.len(),
                "edges_added": batch.put_edges.len(),
                "edges_removed": batch.delete_edges.len(),
            });
            tx.execute(
                "INSERT INTO graph_log (operation, note_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![batch.kind.as_str(), note_id.as_str(), details.to_string(), now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn upsert_note(conn: &Connection, note: &AtomicNote) -> rusqlite::Result<()> {
    let embedding_blob = note.embedding.as_deref().map(embedding_to_bytes);
    conn.execute(
        "INSERT INTO notes (id, content, layer, status, relevance, last_decayed_at, \
         below_threshold_since, next_review_at, created_at, last_accessed_at, source_ref, \
         embedding, needs_relink, is_root, version) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
         ON CONFLICT(id) DO UPDATE SET \
           content = excluded.content, layer = excluded.layer, status = excluded.status, \
           relevance = excluded.relevance, last_decayed_at = excluded.last_decayed_at, \
           below_threshold_since = excluded.below_threshold_since, \
           next_review_at = excluded.next_review_at, last_accessed_at = excluded.last_accessed_at, \
           source_ref = excluded.source_ref, embedding = excluded.embedding, \
           needs_relink = excluded.needs_relink, is_root = excluded.is_root, \
           version = excluded.version",
        params![
            note.id.as_str(),
            note.content,
            note.layer as i64,
            note.status.as_str(),
            note.relevance,
            note.last_decayed_at.to_rfc3339(),
            note.below_threshold_since.map(|t| t.to_rfc3339()),
            note.next_review_at.to_rfc3339(),
            note.created_at.to_rfc3339(),
            note.last_accessed_at.to_rfc3339(),
            note.source_ref,
            embedding_blob,
            note.needs_relink,
            note.is_root,
            note.version as i64,
        ],
    )?;
    Ok(())
}

/// Column values as read, before parsing timestamps and enums.
struct RawNote {
    id: String,
    content: String,
    layer: i64,
    status: String,
    /// NULL when a non-finite value was written; SQLite stores NaN as NULL.
    relevance: Option<f64>,
    last_decayed_at: String,
    below_threshold_since: Option<String>,
    next_review_at: String,
    created_at: String,
    last_accessed_at: String,
    source_ref: Option<String>,
    embedding: Option<Vec<u8>>,
    needs_relink: bool,
    is_root: bool,
    version: i64,
}

impl RawNote {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            layer: row.get(2)?,
            status: row.get(3)?,
            relevance: row.get(4)?,
            last_decayed_at: row.get(5)?,
            below_threshold_since: row.get(6)?,
            next_review_at: row.get(7)?,
            created_at: row.get(8)?,
            last_accessed_at: row.get(9)?,
            source_ref: row.get(10)?,
            embedding: row.get(11)?,
            needs_relink: row.get(12)?,
            is_root: row.get(13)?,
            version: row.get(14)?,
        })
    }

    fn into_note(self) -> Result<AtomicNote, PersistenceError> {
        let key = format!("note:{}", self.id);
        let status: NoteStatus = self
            .status
            .parse()
            .map_err(|reason| PersistenceError::CorruptRecord {
                key: key.clone(),
                reason,
            })?;
        let below_threshold_since = self
            .below_threshold_since
            .as_deref()
            .map(|t| parse_time(&key, t))
            .transpose()?;
        Ok(AtomicNote {
            last_decayed_at: parse_time(&key, &self.last_decayed_at)?,
            next_review_at: parse_time(&key, &self.next_review_at)?,
            created_at: parse_time(&key, &self.created_at)?,
            last_accessed_at: parse_time(&key, &self.last_accessed_at)?,
            below_threshold_since,
            id: NoteId::from(self.id),
            content: self.content,
            layer: self.layer.max(0) as u32,
            status,
            // Unreadable relevance loads as NaN so the store quarantines the note.
            relevance: self.relevance.unwrap_or(f64::NAN),
            source_ref: self.source_ref,
            embedding: self.embedding.as_deref().map(bytes_to_embedding),
            needs_relink: self.needs_relink,
            is_root: self.is_root,
            version: self.version.max(0) as u64,
        })
    }
}

fn parse_time(key: &str, value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::CorruptRecord {
            key: key.to_string(),
            reason: format!("bad timestamp {value:?}: {e}"),
        })
}

/// Encode an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert raw bytes back to f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
