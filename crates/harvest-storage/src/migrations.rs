//! Database schema migrations.
//!
//! Applies the initial schema: the message table, the detection table, the
//! run history tables, and the schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use harvest_core::error::HarvestError;

/// Run all pending database migrations.
///
/// Currently implements the initial schema (version 1). Future migrations
/// can be added by checking the current version and applying incremental changes.
pub fn run_migrations(conn: &Connection) -> Result<(), HarvestError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| HarvestError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| HarvestError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), HarvestError> {
    conn.execute_batch(
        "
        -- One row per distinct message identifier.
        CREATE TABLE IF NOT EXISTS messages (
            identifier      TEXT PRIMARY KEY NOT NULL
                            CHECK (length(identifier) > 0),
            channel         TEXT NOT NULL
                            CHECK (length(channel) > 0),
            payload         TEXT NOT NULL
                            CHECK (json_valid(payload)),
            partition_date  TEXT,
            captured_at     INTEGER,
            ingested_at     INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages (channel, captured_at DESC);

        CREATE INDEX IF NOT EXISTS idx_messages_partition
            ON messages (partition_date);

        -- Append-only object detections.
        CREATE TABLE IF NOT EXISTS detections (
            detection_id        INTEGER PRIMARY KEY AUTOINCREMENT,
            message_identifier  TEXT NOT NULL,
            channel             TEXT NOT NULL,
            object_class        TEXT NOT NULL
                                CHECK (length(object_class) > 0),
            confidence          REAL NOT NULL
                                CHECK (confidence >= 0.0 AND confidence <= 1.0),
            detected_at         INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_detections_message
            ON detections (message_identifier);

        CREATE INDEX IF NOT EXISTS idx_detections_class
            ON detections (object_class);

        -- Orchestrator run history.
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id              TEXT PRIMARY KEY NOT NULL,
            status          TEXT NOT NULL
                            CHECK (status IN ('running', 'completed', 'aborted')),
            started_at      INTEGER NOT NULL,
            ended_at        INTEGER,
            failed_stage    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pipeline_runs_started
            ON pipeline_runs (started_at DESC);

        CREATE TABLE IF NOT EXISTS stage_runs (
            id              TEXT PRIMARY KEY NOT NULL,
            pipeline_run_id TEXT NOT NULL,
            stage_name      TEXT NOT NULL
                            CHECK (stage_name IN ('scrape', 'load', 'transform', 'enrich')),
            status          TEXT NOT NULL
                            CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
            started_at      INTEGER,
            ended_at        INTEGER,
            error_detail    TEXT,
            succeeded       INTEGER NOT NULL DEFAULT 0,
            skipped         INTEGER NOT NULL DEFAULT 0,
            failed          INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (pipeline_run_id) REFERENCES pipeline_runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_stage_runs_pipeline
            ON stage_runs (pipeline_run_id, started_at ASC);

        -- Record migration.
        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| HarvestError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_message_identifier_is_unique() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO messages (identifier, channel, payload) VALUES ('101', 'chemedA', '{}')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO messages (identifier, channel, payload) VALUES ('101', 'chemedA', '{}')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_message_payload_must_be_json() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO messages (identifier, channel, payload) VALUES ('1', 'c', 'not json')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_detection_confidence_check() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO detections (message_identifier, channel, object_class, confidence)
             VALUES ('1', 'c', 'bottle', 0.5)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO detections (message_identifier, channel, object_class, confidence)
             VALUES ('1', 'c', 'bottle', 1.5)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stage_run_requires_pipeline_run() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let orphan = conn.execute(
            "INSERT INTO stage_runs (id, pipeline_run_id, stage_name, status)
             VALUES ('s1', 'missing', 'load', 'pending')",
            [],
        );
        assert!(orphan.is_err());
    }

    #[test]
    fn test_stage_run_status_check() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO pipeline_runs (id, status, started_at) VALUES ('p1', 'running', 0)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO stage_runs (id, pipeline_run_id, stage_name, status)
             VALUES ('s1', 'p1', 'load', 'exploded')",
            [],
        );
        assert!(result.is_err());
    }
}
