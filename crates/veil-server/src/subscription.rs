//! On-disk copy of the last share link served.
//!
//! Each subscription request rewrites the file (last write wins), so an
//! operator or sidecar can pick up the current link without calling HTTP.

use std::path::{Path, PathBuf};
use tracing::debug;
use veil_core::VeilResult;

/// File-backed store for the encoded share link.
#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    path: PathBuf,
}

impl SubscriptionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `encoded`, creating the parent directory if needed.
    ///
    /// Writes to a sibling temp file and renames, so readers never see a
    /// half-written link.
    pub async fn save(&self, encoded: &str) -> VeilResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, encoded.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "subscription saved");
        Ok(())
    }

    /// Last saved link, if any.
    pub async fn load(&self) -> VeilResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
