use std::path::PathBuf;
use std::time::SystemTime;

use compio::fs;
use snafu::Snafu;
use time::PrimitiveDateTime;
use tracing::debug;

use crate::ext::SystemTimeExt;

/// A consistent, read-only view of the source, held for the duration of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMount {
    /// Directory the tool reads from.
    pub root: PathBuf,
    /// Moment the view represents; names the new backup version.
    pub timestamp: PrimitiveDateTime,
}

/// Provider of source views. Taking snapshots and mounting them is up to the implementation.
pub trait SourceView {
    /// Timestamp of the freshest view that [`SourceView::acquire`] would hand out.
    async fn latest_timestamp(&self) -> Result<PrimitiveDateTime, SourceViewError>;

    async fn acquire(&self) -> Result<SourceMount, SourceViewError>;

    async fn release(&self, mount: SourceMount) -> Result<(), SourceViewError>;
}

/// Reads the live source directory and stamps it with the current time.
#[derive(Debug, Clone)]
pub struct PlainSourceView {
    source: PathBuf,
}

impl PlainSourceView {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    async fn ensure_present(&self) -> Result<(), SourceViewError> {
        match fs::metadata(&self.source).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            _ => VolumeNotMountedSnafu {
                source_path: self.source.display().to_string(),
            }
            .fail(),
        }
    }
}

impl SourceView for PlainSourceView {
    async fn latest_timestamp(&self) -> Result<PrimitiveDateTime, SourceViewError> {
        self.ensure_present().await?;
        Ok(SystemTime::now().to_timestamp())
    }

    async fn acquire(&self) -> Result<SourceMount, SourceViewError> {
        self.ensure_present().await?;
        let mount = SourceMount {
            root: self.source.clone(),
            timestamp: SystemTime::now().to_timestamp(),
        };
        debug!("Using live source {} as of {}", mount.root.display(), mount.timestamp);
        Ok(mount)
    }

    async fn release(&self, mount: SourceMount) -> Result<(), SourceViewError> {
        debug!("Released source {}", mount.root.display());
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum SourceViewError {
    #[snafu(display("Source {source_path} is not available"))]
    VolumeNotMounted { source_path: String },
    #[snafu(display("The source snapshot is in use, try again later"))]
    SnapshotBusy,
}
