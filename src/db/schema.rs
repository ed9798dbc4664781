//! Version-1 DDL: `notes`, `edges`, the `graph_log` audit trail and the
//! `graph_meta` key/value table. Later changes go through
//! [`migrations`](super::migrations), never through this file.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS notes (
    id                    TEXT PRIMARY KEY,
    content               TEXT NOT NULL,
    layer                 INTEGER NOT NULL DEFAULT 0 CHECK (layer >= 0),
    status                TEXT NOT NULL DEFAULT 'active'
                          CHECK (status IN ('active', 'archived', 'failed')),
    relevance             REAL DEFAULT 1.0
                          CHECK (relevance IS NULL OR relevance BETWEEN 0.0 AND 1.0),
    last_decayed_at       TEXT NOT NULL,
    below_threshold_since TEXT,
    next_review_at        TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    last_accessed_at      TEXT NOT NULL,
    source_ref            TEXT,
    embedding             BLOB,
    needs_relink          INTEGER NOT NULL DEFAULT 0,
    is_root               INTEGER NOT NULL DEFAULT 0,
    version               INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_notes_status_layer ON notes(status, layer);

CREATE TABLE IF NOT EXISTS edges (
    from_id    TEXT NOT NULL REFERENCES notes(id),
    to_id      TEXT NOT NULL REFERENCES notes(id),
    relation   TEXT NOT NULL CHECK (relation IN
               ('elaborates', 'supports', 'contradicts', 'derived_from', 'temporal_follows')),
    weight     REAL NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id, relation)
);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id);

CREATE TABLE IF NOT EXISTS graph_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    operation  TEXT NOT NULL CHECK (operation IN
               ('ingest', 'link', 'access', 'decay', 'archive', 'summarize', 'rewire', 'relink', 'update')),
    note_id    TEXT NOT NULL,
    details    TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS graph_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO graph_meta (key, value) VALUES ('schema_version', '1');
"#;

/// Create the version-1 tables when absent. Safe to call on every open.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
