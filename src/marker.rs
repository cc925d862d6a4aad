//! Durable milestone markers.
//!
//! A marker is a zero-byte sentinel file at `<session_root>/<session_id>/.<milestone>`,
//! written by the same operation that sets the milestone flag in the store.
//! It outlives store expiry and store outages, and is removed only by an
//! explicit session cleanup.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::state::validate_session_id;
use crate::{Milestone, Result};

/// Filesystem location of milestone markers for every session.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    root: PathBuf,
}

impl MarkerStore {
    /// Creates a marker store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every session's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one session's files.
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    /// Path of a session's marker for `milestone`.
    pub fn path(&self, session_id: &str, milestone: Milestone) -> Result<PathBuf> {
        Ok(self
            .session_dir(session_id)?
            .join(format!(".{}", milestone.as_str())))
    }

    /// Creates the marker if it does not exist. Never truncates or rewrites
    /// an existing one.
    pub async fn touch(&self, session_id: &str, milestone: Milestone) -> Result<PathBuf> {
        let path = self.path(session_id, milestone)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => debug!(session_id, %milestone, path = %path.display(), "marker written"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(path)
    }

    /// Returns true if the marker exists.
    pub async fn exists(&self, session_id: &str, milestone: Milestone) -> Result<bool> {
        let path = self.path(session_id, milestone)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Removes one marker. Returns true if it existed.
    pub async fn remove(&self, session_id: &str, milestone: Milestone) -> Result<bool> {
        let path = self.path(session_id, milestone)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every marker of a session, leaving other files in place.
    /// Returns how many were removed.
    pub async fn remove_all(&self, session_id: &str) -> Result<usize> {
        let mut removed = 0;
        for milestone in Milestone::ALL {
            if self.remove(session_id, milestone).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_path_layout() {
        let markers = MarkerStore::new("/srv/sessions");
        assert_eq!(
            markers
                .path("abc-123", Milestone::AnalysisComplete)
                .unwrap(),
            PathBuf::from("/srv/sessions/abc-123/.analysis_complete")
        );
    }

    #[test]
    fn test_rejects_escaping_session_id() {
        let markers = MarkerStore::new("/srv/sessions");
        assert!(markers.path("../etc", Milestone::CsvLoaded).is_err());
        assert!(markers.session_dir("a/b").is_err());
    }

    #[tokio::test]
    async fn test_touch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path());

        assert!(!markers
            .exists("s1", Milestone::AnalysisComplete)
            .await
            .unwrap());

        let path = markers
            .touch("s1", Milestone::AnalysisComplete)
            .await
            .unwrap();
        markers
            .touch("s1", Milestone::AnalysisComplete)
            .await
            .unwrap();

        assert!(markers
            .exists("s1", Milestone::AnalysisComplete)
            .await
            .unwrap());
        assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_remove_all_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path());

        markers.touch("s1", Milestone::CsvLoaded).await.unwrap();
        markers
            .touch("s1", Milestone::AnalysisComplete)
            .await
            .unwrap();
        let output = dir.path().join("s1").join("tpr_results.csv");
        std::fs::write(&output, "ward,tpr\n").unwrap();

        assert_eq!(markers.remove_all("s1").await.unwrap(), 2);
        assert_eq!(markers.remove_all("s1").await.unwrap(), 0);
        assert!(output.exists());
        assert!(!markers.exists("s1", Milestone::CsvLoaded).await.unwrap());
    }
}
