//! Read-side reporting queries.
//!
//! Every query binds its inputs as parameters; nothing caller-supplied is
//! spliced into SQL text.

use std::sync::Arc;

use serde::Serialize;

use harvest_core::error::HarvestError;

use crate::db::{storage_err, Database};

/// How often an object class was detected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectClassRow {
    pub object_class: String,
    pub detections: u64,
    pub avg_confidence: f64,
}

/// Message volume of one channel in one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelActivityRow {
    /// `YYYY-MM`.
    pub month: String,
    pub messages: u64,
}

/// Row counts for the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub messages: u64,
    pub channels: u64,
    pub detections: u64,
    pub enriched_messages: u64,
}

/// Reporting queries over ingested and enriched data.
#[derive(Clone, Debug)]
pub struct QueryService {
    db: Arc<Database>,
}

impl QueryService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Most frequently detected object classes.
    pub fn top_object_classes(&self, limit: u64) -> Result<Vec<ObjectClassRow>, HarvestError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT object_class, COUNT(*) AS n, AVG(confidence)
                     FROM detections
                     GROUP BY object_class
                     ORDER BY n DESC, object_class ASC
                     LIMIT ?1",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok(ObjectClassRow {
                        object_class: row.get(0)?,
                        detections: row.get::<_, i64>(1)? as u64,
                        avg_confidence: row.get(2)?,
                    })
                })
                .map_err(storage_err)?;

            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
    }

    /// Monthly message counts for one channel, oldest month first.
    ///
    /// Messages without a capture time fall back to their partition date;
    /// messages with neither are left out.
    pub fn channel_activity(&self, channel: &str) -> Result<Vec<ChannelActivityRow>, HarvestError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT strftime('%Y-%m', COALESCE(datetime(captured_at, 'unixepoch'), partition_date)) AS month,
                            COUNT(*)
                     FROM messages
                     WHERE channel = ?1
                     GROUP BY month
                     HAVING month IS NOT NULL
                     ORDER BY month ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![channel], |row| {
                    Ok(ChannelActivityRow {
                        month: row.get(0)?,
                        messages: row.get::<_, i64>(1)? as u64,
                    })
                })
                .map_err(storage_err)?;

            rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
        })
    }

    /// Row counts across the store.
    pub fn stats(&self) -> Result<StoreStats, HarvestError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM messages),
                    (SELECT COUNT(DISTINCT channel) FROM messages),
                    (SELECT COUNT(*) FROM detections),
                    (SELECT COUNT(DISTINCT message_identifier) FROM detections)",
                [],
                |row| {
                    Ok(StoreStats {
                        messages: row.get::<_, i64>(0)? as u64,
                        channels: row.get::<_, i64>(1)? as u64,
                        detections: row.get::<_, i64>(2)? as u64,
                        enriched_messages: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .map_err(storage_err)
        })
    }
}
