//! Forward-only schema migrations.
//!
//! The stored version lives in `graph_meta` under [`VERSION_KEY`]. Each entry
//! of [`MIGRATIONS`] lifts the schema by exactly one version and runs in its own
//! SQL transaction together with the version bump.

use rusqlite::{params, Connection, OptionalExtension};

pub const VERSION_KEY: &str = "schema_version";

struct Migration {
    to: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        to: 2,
        name: "review queue index",
        sql: "CREATE INDEX IF NOT EXISTS idx_notes_next_review \
              ON notes(status, next_review_at)",
    },
    Migration {
        to: 3,
        name: "audit log lookup by note",
        sql: "CREATE INDEX IF NOT EXISTS idx_graph_log_note \
              ON graph_log(note_id, created_at)",
    },
];

/// Version a fully migrated database reports.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Stored schema version; a missing or unparsable value reads as 0.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM graph_meta WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
}

pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let start = schema_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.to > start).collect();
    if pending.is_empty() {
        tracing::debug!(schema_version = start, "schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(to = migration.to, name = migration.name, "applying migration");
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO graph_meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![VERSION_KEY, migration.to.to_string()],
        )?;
        tx.commit()?;
    }
    Ok(())
}
