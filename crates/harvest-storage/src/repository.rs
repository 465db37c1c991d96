//! Repository implementations for SQLite-backed persistence.
//!
//! Provides MessageRepository, DetectionRepository, and RunRepository that
//! operate on the Database struct using raw SQL.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use harvest_core::error::HarvestError;
use harvest_core::types::{
    timestamp_from_millis, timestamp_from_secs, Detection, DetectionRecord, IngestedMessage,
    PipelineRun, PipelineStatus, RawRecord, RecordId, StageName, StageReport, StageRun,
    StageStatus,
};

use crate::db::{storage_err, Database};

/// Result of an upsert-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    AlreadyPresent,
}

// =============================================================================
// Messages
// =============================================================================

/// Repository for ingested messages.
#[derive(Clone, Debug)]
pub struct MessageRepository {
    db: Arc<Database>,
}

impl MessageRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a message unless its identifier is already stored.
    ///
    /// The check and the write are one statement, so concurrent writers of
    /// the same identifier produce exactly one row and existing rows are
    /// never modified.
    pub fn insert_if_absent(
        &self,
        id: &RecordId,
        record: &RawRecord,
        partition_date: Option<NaiveDate>,
    ) -> Result<WriteOutcome, HarvestError> {
        let payload = serde_json::to_string(&record.payload)?;
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "INSERT INTO messages (identifier, channel, payload, partition_date, captured_at, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(identifier) DO NOTHING",
                    rusqlite::params![
                        id.as_str(),
                        record.channel,
                        payload,
                        partition_date.map(|d| d.format("%Y-%m-%d").to_string()),
                        record.captured_at.map(|t| t.timestamp()),
                        Utc::now().timestamp(),
                    ],
                )
                .map_err(|e| {
                    HarvestError::Storage(format!("Failed to insert message {}: {}", id, e))
                })?;

            Ok(if changed == 0 {
                WriteOutcome::AlreadyPresent
            } else {
                WriteOutcome::Inserted
            })
        })
    }

    /// Find a message by identifier.
    pub fn find_by_id(&self, id: &RecordId) -> Result<Option<IngestedMessage>, HarvestError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT identifier, channel, payload, partition_date, captured_at, ingested_at
                     FROM messages WHERE identifier = ?1",
                    rusqlite::params![id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)?;

            match row {
                Some(raw) => Ok(Some(row_to_message(raw)?)),
                None => Ok(None),
            }
        })
    }

    /// Total number of stored messages.
    pub fn count(&self) -> Result<u64, HarvestError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }

    /// Stored identifiers for a channel, in identifier order.
    pub fn list_ids(&self, channel: &str) -> Result<Vec<RecordId>, HarvestError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT identifier FROM messages WHERE channel = ?1 ORDER BY identifier")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![channel], |row| row.get::<_, String>(0))
                .map_err(storage_err)?;

            let mut ids = Vec::new();
            for row in rows {
                let raw = row.map_err(storage_err)?;
                if let Some(id) = RecordId::parse(&raw) {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
    }
}

type MessageRow = (String, String, String, Option<String>, Option<i64>, i64);

fn row_to_message(row: MessageRow) -> Result<IngestedMessage, HarvestError> {
    let (identifier, channel, payload, partition_date, captured_at, ingested_at) = row;
    let id = RecordId::parse(&identifier)
        .ok_or_else(|| HarvestError::Storage(format!("Invalid stored identifier: {:?}", identifier)))?;
    let partition_date = partition_date
        .map(|d| {
            NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .map_err(|e| HarvestError::Storage(format!("Invalid partition date {}: {}", d, e)))
        })
        .transpose()?;

    Ok(IngestedMessage {
        id,
        channel,
        payload: serde_json::from_str(&payload)?,
        partition_date,
        captured_at: captured_at.map(timestamp_from_secs),
        ingested_at: timestamp_from_secs(ingested_at),
    })
}

// =============================================================================
// Detections
// =============================================================================

/// Repository for object detections. Rows are only ever appended.
#[derive(Clone, Debug)]
pub struct DetectionRepository {
    db: Arc<Database>,
}

impl DetectionRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append every detection of one image in a single transaction.
    ///
    /// Either all rows are written or none are. Returns the number of rows
    /// appended.
    pub fn append_all(
        &self,
        message_id: &RecordId,
        channel: &str,
        detections: &[Detection],
    ) -> Result<usize, HarvestError> {
        for detection in detections {
            if !(0.0..=1.0).contains(&detection.confidence) {
                return Err(HarvestError::Validation(format!(
                    "confidence {} for '{}' is outside [0, 1]",
                    detection.confidence, detection.object_class
                )));
            }
            if detection.object_class.trim().is_empty() {
                return Err(HarvestError::Validation(
                    "detection has an empty object class".to_string(),
                ));
            }
        }
        if detections.is_empty() {
            return Ok(0);
        }

        let detected_at = Utc::now().timestamp();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO detections (message_identifier, channel, object_class, confidence, detected_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(storage_err)?;
                for detection in detections {
                    stmt.execute(rusqlite::params![
                        message_id.as_str(),
                        channel,
                        detection.object_class,
                        detection.confidence,
                        detected_at,
                    ])
                    .map_err(|e| {
                        HarvestError::Storage(format!(
                            "Failed to append detection for {}: {}",
                            message_id, e
                        ))
                    })?;
                }
            }
            tx.commit().map_err(storage_err)?;
            Ok(detections.len())
        })
    }

    /// All detections recorded for one message, oldest first.
    pub fn find_for_message(&self, message_id: &RecordId) -> Result<Vec<DetectionRecord>, HarvestError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT detection_id, message_identifier, channel, object_class, confidence, detected_at
                     FROM detections WHERE message_identifier = ?1
                     ORDER BY detection_id ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![message_id.as_str()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .map_err(storage_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (detection_id, identifier, channel, object_class, confidence, detected_at) =
                    row.map_err(storage_err)?;
                let message_id = RecordId::parse(&identifier).ok_or_else(|| {
                    HarvestError::Storage(format!("Invalid stored identifier: {:?}", identifier))
                })?;
                records.push(DetectionRecord {
                    detection_id,
                    message_id,
                    channel,
                    object_class,
                    confidence,
                    detected_at: timestamp_from_secs(detected_at),
                });
            }
            Ok(records)
        })
    }

    /// Total number of stored detections.
    pub fn count(&self) -> Result<u64, HarvestError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }
}

// =============================================================================
// Run history
// =============================================================================

/// Repository for pipeline and stage run history.
#[derive(Clone, Debug)]
pub struct RunRepository {
    db: Arc<Database>,
}

impl RunRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record the start of a pipeline run.
    pub fn start_pipeline(&self, run: &PipelineRun) -> Result<(), HarvestError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pipeline_runs (id, status, started_at, ended_at, failed_stage)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    run.id.to_string(),
                    run.status.to_string(),
                    run.started_at.timestamp_millis(),
                    run.ended_at.map(|t| t.timestamp_millis()),
                    run.failed_stage.map(|s| s.to_string()),
                ],
            )
            .map_err(|e| HarvestError::Storage(format!("Failed to record pipeline run: {}", e)))?;
            Ok(())
        })
    }

    /// Record the terminal state of a pipeline run.
    pub fn finish_pipeline(&self, run: &PipelineRun) -> Result<(), HarvestError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE pipeline_runs SET status = ?2, ended_at = ?3, failed_stage = ?4
                     WHERE id = ?1",
                    rusqlite::params![
                        run.id.to_string(),
                        run.status.to_string(),
                        run.ended_at.map(|t| t.timestamp_millis()),
                        run.failed_stage.map(|s| s.to_string()),
                    ],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(HarvestError::Storage(format!("Unknown pipeline run {}", run.id)));
            }
            Ok(())
        })
    }

    /// Insert a stage run row.
    pub fn insert_stage_run(&self, run: &StageRun) -> Result<(), HarvestError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO stage_runs (id, pipeline_run_id, stage_name, status, started_at, ended_at,
                                         error_detail, succeeded, skipped, failed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    run.id.to_string(),
                    run.pipeline_run_id.to_string(),
                    run.stage.to_string(),
                    run.status.to_string(),
                    run.started_at.map(|t| t.timestamp_millis()),
                    run.ended_at.map(|t| t.timestamp_millis()),
                    run.error_detail,
                    run.report.succeeded as i64,
                    run.report.skipped as i64,
                    run.report.failed as i64,
                ],
            )
            .map_err(|e| HarvestError::Storage(format!("Failed to record stage run: {}", e)))?;
            Ok(())
        })
    }

    /// Persist the current state of a stage run.
    pub fn update_stage_run(&self, run: &StageRun) -> Result<(), HarvestError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE stage_runs
                     SET status = ?2, started_at = ?3, ended_at = ?4, error_detail = ?5,
                         succeeded = ?6, skipped = ?7, failed = ?8
                     WHERE id = ?1",
                    rusqlite::params![
                        run.id.to_string(),
                        run.status.to_string(),
                        run.started_at.map(|t| t.timestamp_millis()),
                        run.ended_at.map(|t| t.timestamp_millis()),
                        run.error_detail,
                        run.report.succeeded as i64,
                        run.report.skipped as i64,
                        run.report.failed as i64,
                    ],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(HarvestError::Storage(format!("Unknown stage run {}", run.id)));
            }
            Ok(())
        })
    }

    /// Stage runs belonging to one pipeline run, in start order.
    ///
    /// Per-unit error strings are not persisted, so `report.errors` is empty.
    pub fn stage_runs_for(&self, pipeline_run_id: Uuid) -> Result<Vec<StageRun>, HarvestError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, pipeline_run_id, stage_name, status, started_at, ended_at,
                            error_detail, succeeded, skipped, failed
                     FROM stage_runs WHERE pipeline_run_id = ?1
                     ORDER BY COALESCE(started_at, 9223372036854775807) ASC, rowid ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![pipeline_run_id.to_string()], |row| {
                    Ok(StageRunRow {
                        id: row.get(0)?,
                        pipeline_run_id: row.get(1)?,
                        stage: row.get(2)?,
                        status: row.get(3)?,
                        started_at: row.get(4)?,
                        ended_at: row.get(5)?,
                        error_detail: row.get(6)?,
                        succeeded: row.get(7)?,
                        skipped: row.get(8)?,
                        failed: row.get(9)?,
                    })
                })
                .map_err(storage_err)?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(row.map_err(storage_err)?.into_stage_run()?);
            }
            Ok(runs)
        })
    }

    /// Most recent pipeline runs, newest first.
    pub fn recent_pipeline_runs(&self, limit: u64) -> Result<Vec<PipelineRun>, HarvestError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, status, started_at, ended_at, failed_stage
                     FROM pipeline_runs
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT ?1",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(storage_err)?;

            let mut runs = Vec::new();
            for row in rows {
                let (id, status, started_at, ended_at, failed_stage) = row.map_err(storage_err)?;
                runs.push(PipelineRun {
                    id: parse_uuid(&id)?,
                    status: status.parse::<PipelineStatus>().map_err(HarvestError::Storage)?,
                    started_at: timestamp_from_millis(started_at),
                    ended_at: ended_at.map(timestamp_from_millis),
                    failed_stage: failed_stage
                        .map(|s| s.parse::<StageName>().map_err(HarvestError::Storage))
                        .transpose()?,
                });
            }
            Ok(runs)
        })
    }
}

struct StageRunRow {
    id: String,
    pipeline_run_id: String,
    stage: String,
    status: String,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    error_detail: Option<String>,
    succeeded: i64,
    skipped: i64,
    failed: i64,
}

impl StageRunRow {
    fn into_stage_run(self) -> Result<StageRun, HarvestError> {
        Ok(StageRun {
            id: parse_uuid(&self.id)?,
            pipeline_run_id: parse_uuid(&self.pipeline_run_id)?,
            stage: self.stage.parse::<StageName>().map_err(HarvestError::Storage)?,
            status: self.status.parse::<StageStatus>().map_err(HarvestError::Storage)?,
            started_at: self.started_at.map(timestamp_from_millis),
            ended_at: self.ended_at.map(timestamp_from_millis),
            error_detail: self.error_detail,
            report: StageReport {
                succeeded: self.succeeded.max(0) as u64,
                skipped: self.skipped.max(0) as u64,
                failed: self.failed.max(0) as u64,
                errors: Vec::new(),
            },
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, HarvestError> {
    Uuid::parse_str(raw).map_err(|e| HarvestError::Storage(format!("Invalid UUID {}: {}", raw, e)))
}

/// Milliseconds elapsed between two optional timestamps.
pub fn duration_millis(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
        _ => None,
    }
}
