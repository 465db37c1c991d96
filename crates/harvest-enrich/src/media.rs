//! Downloaded media discovery.
//!
//! Layout: `<root>/<channel>/<message-id>.<ext>`. The file stem is the
//! message identifier and the parent directory is the channel.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use harvest_core::config::{expand_home, MediaConfig};
use harvest_core::error::Result;
use harvest_core::types::{MediaItem, RecordId, UnreadableDir};

/// Result of scanning the media tree.
#[derive(Debug, Clone, Default)]
pub struct MediaListing {
    pub items: Vec<MediaItem>,
    pub unreadable: Vec<UnreadableDir>,
}

/// Read-only view over the downloaded image tree.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    /// Lowercase, without the leading dot.
    extensions: Vec<String>,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(expand_home(&config.root), &config.extensions)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.extensions.contains(&e))
    }

    /// List every image under the root, sorted by channel then path.
    ///
    /// Files with other extensions, or whose stem is not a usable message
    /// identifier, are ignored. A channel directory that cannot be listed
    /// is reported in `unreadable`. Only an unreadable root is an error.
    pub fn discover(&self) -> Result<MediaListing> {
        let mut listing = MediaListing::default();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                continue;
            }
            let dir = entry.path();
            let channel = entry.file_name().to_string_lossy().to_string();

            match self.list_channel(&channel, &dir) {
                Ok(items) => listing.items.extend(items),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable channel directory");
                    listing.unreadable.push(UnreadableDir {
                        path: dir,
                        reason: e.to_string(),
                    });
                }
            }
        }

        listing
            .items
            .sort_by(|a, b| a.channel.cmp(&b.channel).then_with(|| a.path.cmp(&b.path)));
        Ok(listing)
    }

    fn list_channel(&self, channel: &str, dir: &Path) -> std::io::Result<Vec<MediaItem>> {
        let mut items = Vec::new();
        for file in fs::read_dir(dir)? {
            let path = file?.path();
            if !path.is_file() || !self.is_image(&path) {
                debug!(file = %path.display(), "Ignoring non-image file");
                continue;
            }
            let Some(message_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(RecordId::parse)
            else {
                debug!(file = %path.display(), "Ignoring image without a message identifier");
                continue;
            };
            items.push(MediaItem {
                message_id,
                channel: channel.to_string(),
                path,
            });
        }
        Ok(items)
    }
}
