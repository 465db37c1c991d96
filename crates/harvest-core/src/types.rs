use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable identifier of a scraped message.
///
/// Numeric and string identifiers share one canonical text form, so `101`
/// and `"101"` refer to the same message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Parse an identifier from text. Blank text is not an identifier.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// Extract an identifier from a JSON value.
    ///
    /// Numbers and non-blank strings qualify. A numeric zero is missing,
    /// while the string `"0"` is a valid identifier. Integral floats share
    /// the integer form, so `101.0` is `101`. `null`, booleans, arrays and
    /// objects are treated as a missing identifier.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    (u != 0).then(|| Self(u.to_string()))
                } else if let Some(i) = n.as_i64() {
                    Some(Self(i.to_string()))
                } else {
                    let f = n.as_f64().filter(|f| f.is_finite() && *f != 0.0)?;
                    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        Some(Self((f as i64).to_string()))
                    } else {
                        Some(Self(f.to_string()))
                    }
                }
            }
            serde_json::Value::String(s) => Self::parse(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert epoch seconds to a UTC timestamp, falling back to the epoch.
pub fn timestamp_from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Convert epoch milliseconds to a UTC timestamp, falling back to the epoch.
pub fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

// =============================================================================
// Raw store
// =============================================================================

/// One scraped message payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// `None` when the payload carries no usable identifier.
    pub id: Option<RecordId>,
    pub channel: String,
    /// Opaque structured content, stored as-is.
    pub payload: serde_json::Value,
    /// Capture time taken from the payload's `date` field, when present.
    pub captured_at: Option<DateTime<Utc>>,
}

impl RawRecord {
    /// Build a record from one scraped payload object.
    pub fn from_payload(channel: &str, payload: serde_json::Value) -> Self {
        let id = payload.get("id").and_then(RecordId::from_json);
        let captured_at = payload.get("date").and_then(parse_capture_time);
        Self {
            id,
            channel: channel.to_string(),
            payload,
            captured_at,
        }
    }
}

fn parse_capture_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

/// One (date, channel) unit of scraped output. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawPartition {
    pub date: NaiveDate,
    pub channel: String,
    pub records: Vec<RawRecord>,
}

impl RawPartition {
    /// Human-readable partition key, e.g. `2025-07-10/chemedA`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.date.format("%Y-%m-%d"), self.channel)
    }
}

// =============================================================================
// Persisted rows
// =============================================================================

/// Persisted row derived from a raw record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestedMessage {
    pub id: RecordId,
    pub channel: String,
    pub payload: serde_json::Value,
    pub partition_date: Option<NaiveDate>,
    pub captured_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
}

/// One downloaded image tied to a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaItem {
    pub message_id: RecordId,
    pub channel: String,
    pub path: PathBuf,
}

/// A directory under a store root that could not be listed.
///
/// Discovery records it and moves on, so one bad channel or date directory
/// does not hide the rest of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnreadableDir {
    pub path: PathBuf,
    pub reason: String,
}

/// One labelled object returned by the vision model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class")]
    pub object_class: String,
    pub confidence: f64,
}

impl Detection {
    pub fn new(object_class: &str, confidence: f64) -> Self {
        Self {
            object_class: object_class.to_string(),
            confidence,
        }
    }
}

/// One persisted detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub detection_id: i64,
    pub message_id: RecordId,
    pub channel: String,
    pub object_class: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

// =============================================================================
// Stages
// =============================================================================

/// A phase of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Scrape,
    Load,
    Transform,
    Enrich,
}

impl StageName {
    /// All stages in declared order.
    pub const ALL: [StageName; 4] = [
        StageName::Scrape,
        StageName::Load,
        StageName::Transform,
        StageName::Enrich,
    ];

    /// Stages that must succeed before this one may start.
    pub fn depends_on(&self) -> &'static [StageName] {
        match self {
            StageName::Scrape => &[],
            StageName::Load => &[StageName::Scrape],
            StageName::Transform => &[StageName::Load],
            StageName::Enrich => &[StageName::Transform],
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageName::Scrape => write!(f, "scrape"),
            StageName::Load => write!(f, "load"),
            StageName::Transform => write!(f, "transform"),
            StageName::Enrich => write!(f, "enrich"),
        }
    }
}

impl std::str::FromStr for StageName {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(StageName::Scrape),
            "load" => Ok(StageName::Load),
            "transform" => Ok(StageName::Transform),
            "enrich" => Ok(StageName::Enrich),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Lifecycle of one stage execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            _ => Err(format!("Unknown stage status: {}", s)),
        }
    }
}

/// Lifecycle of one pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Running => write!(f, "running"),
            PipelineStatus::Completed => write!(f, "completed"),
            PipelineStatus::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(PipelineStatus::Running),
            "completed" => Ok(PipelineStatus::Completed),
            "aborted" => Ok(PipelineStatus::Aborted),
            _ => Err(format!("Unknown pipeline status: {}", s)),
        }
    }
}

/// Unit counts a stage reports back to the orchestrator.
///
/// Contained per-unit failures show up here; they do not fail the stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Human-readable detail for each contained failure.
    pub errors: Vec<String>,
}

impl StageReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// One execution attempt of one stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    pub id: Uuid,
    pub pipeline_run_id: Uuid,
    pub stage: StageName,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub report: StageReport,
}

impl StageRun {
    pub fn pending(pipeline_run_id: Uuid, stage: StageName) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_run_id,
            stage,
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            error_detail: None,
            report: StageReport::default(),
        }
    }
}

/// One orchestrator run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub status: PipelineStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failed_stage: Option<StageName>,
}
