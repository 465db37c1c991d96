//! Raw partition store.
//!
//! Layout: `<root>/<YYYY-MM-DD>/<channel>.json`, each file a JSON array of
//! message objects. Partitions are written once and never modified.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, warn};

use harvest_core::config::{expand_home, RawStoreConfig};
use harvest_core::error::{HarvestError, Result};
use harvest_core::types::{RawPartition, RawRecord, UnreadableDir};

const PARTITION_EXTENSION: &str = "json";

/// A partition discovered on disk but not yet read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionRef {
    pub date: NaiveDate,
    pub channel: String,
    pub path: PathBuf,
}

impl PartitionRef {
    pub fn key(&self) -> String {
        format!("{}/{}", self.date.format("%Y-%m-%d"), self.channel)
    }
}

/// Result of scanning the raw store.
#[derive(Debug, Clone, Default)]
pub struct PartitionListing {
    pub partitions: Vec<PartitionRef>,
    pub unreadable: Vec<UnreadableDir>,
}

/// Filesystem-backed raw partition store.
#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &RawStoreConfig) -> Self {
        Self::new(expand_home(&config.root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, date: NaiveDate, channel: &str) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{}.{}", channel, PARTITION_EXTENSION))
    }

    /// List every partition under the root, sorted by date then channel.
    ///
    /// Directories that are not ISO dates and files with another extension
    /// are ignored. A date directory that cannot be listed is reported in
    /// `unreadable` and the rest of the store is still listed. Only an
    /// unreadable root is an error.
    pub fn discover(&self) -> Result<PartitionListing> {
        let mut listing = PartitionListing::default();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let dir = entry.path();
            if entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let date = match NaiveDate::parse_from_str(&name, "%Y-%m-%d") {
                Ok(date) => date,
                Err(_) => {
                    debug!(dir = %dir.display(), "Ignoring non-date directory in raw store");
                    continue;
                }
            };

            match list_partitions(date, &dir) {
                Ok(found) => listing.partitions.extend(found),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable partition directory");
                    listing.unreadable.push(UnreadableDir {
                        path: dir,
                        reason: e.to_string(),
                    });
                }
            }
        }

        listing.partitions.sort();
        Ok(listing)
    }

    /// Read and parse one partition.
    pub fn read(&self, partition: &PartitionRef) -> Result<RawPartition> {
        let partition_err = |reason: String| HarvestError::Partition {
            path: partition.path.display().to_string(),
            reason,
        };

        let content = fs::read_to_string(&partition.path).map_err(|e| partition_err(e.to_string()))?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| partition_err(e.to_string()))?;
        let items = match value {
            serde_json::Value::Array(items) => items,
            other => {
                return Err(partition_err(format!(
                    "expected a JSON array of messages, found {}",
                    json_kind(&other)
                )))
            }
        };

        let records = items
            .into_iter()
            .map(|payload| RawRecord::from_payload(&partition.channel, payload))
            .collect();

        Ok(RawPartition {
            date: partition.date,
            channel: partition.channel.clone(),
            records,
        })
    }

    /// Write a new partition. Refuses to replace an existing one.
    ///
    /// The file is written next to its final location and renamed into
    /// place, so readers never observe a partial partition.
    pub fn write(&self, partition: &RawPartition) -> Result<PathBuf> {
        let path = self.partition_path(partition.date, &partition.channel);
        if path.exists() {
            return Err(HarvestError::Partition {
                path: path.display().to_string(),
                reason: "partition already exists".to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let payloads: Vec<&serde_json::Value> =
            partition.records.iter().map(|r| &r.payload).collect();
        let body = serde_json::to_vec_pretty(&payloads)?;

        let tmp = path.with_extension(format!("{}.tmp", PARTITION_EXTENSION));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;

        debug!(partition = %partition.key(), records = partition.records.len(), "Wrote raw partition");
        Ok(path)
    }
}

fn list_partitions(date: NaiveDate, dir: &Path) -> std::io::Result<Vec<PartitionRef>> {
    let mut found = Vec::new();
    for file in fs::read_dir(dir)? {
        let path = file?.path();
        let is_partition = path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(PARTITION_EXTENSION);
        let channel = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty() && !s.starts_with('.'));
        match (is_partition, channel) {
            (true, Some(channel)) => found.push(PartitionRef {
                date,
                channel: channel.to_string(),
                path: path.clone(),
            }),
            _ => debug!(file = %path.display(), "Ignoring non-partition file in raw store"),
        }
    }
    Ok(found)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
