//! Database schema migrations.
//!
//! Applies the initial schema: conversations, their messages, and the
//! schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use quire_core::error::QuireError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), QuireError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| QuireError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version = current_version(conn)?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64, QuireError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| QuireError::Storage(format!("Failed to query migration version: {}", e)))
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), QuireError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY NOT NULL,
            title           TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_updated
            ON conversations (updated_at DESC);

        -- ordinal is the append position within the conversation.
        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY NOT NULL,
            conversation_id     TEXT NOT NULL,
            ordinal             INTEGER NOT NULL,
            role                TEXT NOT NULL
                                CHECK (role IN ('user', 'assistant')),
            content             TEXT NOT NULL DEFAULT '',
            reasoning_content   TEXT,
            attachments         TEXT NOT NULL DEFAULT '[]',
            timestamp           INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
            UNIQUE (conversation_id, ordinal)
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| QuireError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
