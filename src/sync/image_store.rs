use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Local filesystem image store. A file's presence under `datadir` is the
/// only state tracked for an image.
#[derive(Debug, Clone)]
pub struct ImageStore {
    datadir: PathBuf,
}

impl ImageStore {
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    /// `datadir/<image_id>`; ids that would escape the datadir are rejected.
    pub fn image_path(&self, image_id: &str) -> Result<PathBuf> {
        validate_image_id(image_id)?;
        Ok(self.datadir.join(image_id))
    }

    /// Hidden temporary files mentioning `image_id` (`datadir/.*<id>*`),
    /// split by whether they were written to within `max_age`.
    pub async fn in_flight_markers(&self, image_id: &str, max_age: Duration) -> Result<InFlightMarkers> {
        validate_image_id(image_id)?;

        let mut markers = InFlightMarkers::default();
        let mut entries = match tokio::fs::read_dir(&self.datadir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(markers),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !is_in_flight_marker(&name, image_id) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                // finished and renamed between listing and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            // A timestamp in the future counts as fresh.
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);

            debug!("Found in-flight marker {} for image {} ({:?} old)", name, image_id, age);
            if age >= max_age {
                markers.stale.push(entry.path());
            } else {
                markers.active.push(entry.path());
            }
        }

        Ok(markers)
    }

    /// Remove leftover markers; already missing ones are ignored.
    pub async fn remove_markers(&self, markers: &[PathBuf]) -> Result<()> {
        for marker in markers {
            match tokio::fs::remove_file(marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove the local copy. Returns `false` when there was nothing to
    /// remove, which is still a success.
    pub async fn delete(&self, image_id: &str) -> Result<bool> {
        let path = self.image_path(image_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Markers found for one image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InFlightMarkers {
    /// Recently written: a copy is still landing.
    pub active: Vec<PathBuf>,
    /// Untouched for longer than the max age: left behind by a killed copy.
    pub stale: Vec<PathBuf>,
}

impl InFlightMarkers {
    pub fn in_flight(&self) -> bool {
        !self.active.is_empty()
    }
}

fn is_in_flight_marker(file_name: &str, image_id: &str) -> bool {
    file_name
        .strip_prefix('.')
        .is_some_and(|rest| rest.contains(image_id))
}

fn validate_image_id(image_id: &str) -> Result<()> {
    if image_id.is_empty()
        || image_id == "."
        || image_id == ".."
        || image_id.contains(['/', '\\', '\0'])
    {
        return Err(SyncError::InvalidImageId(image_id.to_string()));
    }
    Ok(())
}
