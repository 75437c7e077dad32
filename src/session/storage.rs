// Session folder management
//
// One folder per finished session under the storage root, named after the
// start instant, holding the `timing.json` sidecar. Cancelled sessions
// leave no folder at all.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::index::SessionIndex;
use super::metadata::{SessionReport, SessionSummary};

/// Sidecar file name inside each session folder.
pub const SIDECAR_FILE: &str = "timing.json";

/// Storage root + index, the engine's one stop for flushing a session.
/// `index` is None when neither the file nor the in-memory database could
/// be opened; sidecar writes still work, only the recent list goes dark.
pub struct SessionStore {
    root: PathBuf,
    index: Option<SessionIndex>,
}

impl SessionStore {
    /// Open the store rooted at `root`. The index falls back to memory if
    /// the database file cannot be opened, so this never fails outright.
    pub fn open(root: &Path) -> Self {
        let index = match SessionIndex::open(&root.join("sessions.db")) {
            Ok(index) => Some(index),
            Err(e) => {
                log::error!("Failed to open session index: {}", e);
                match SessionIndex::open_in_memory() {
                    Ok(index) => Some(index),
                    Err(e) => {
                        log::error!("In-memory index unavailable too, recent list disabled: {}", e);
                        None
                    }
                }
            }
        };
        Self {
            root: root.to_path_buf(),
            index,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist one finished (or partial) session: create the folder, write
    /// the sidecar, record the summary in the index. Returns the folder.
    pub fn flush(&self, report: &SessionReport) -> anyhow::Result<PathBuf> {
        let folder = self.session_folder(report);
        std::fs::create_dir_all(&folder)
            .with_context(|| format!("creating session folder {}", folder.display()))?;

        let sidecar = folder.join(SIDECAR_FILE);
        let contents = serde_json::to_string_pretty(report)?;
        std::fs::write(&sidecar, contents)
            .with_context(|| format!("writing {}", sidecar.display()))?;

        let summary = SessionSummary::from_report(report, folder.clone());
        if let Some(index) = &self.index {
            if let Err(e) = index.insert(&summary) {
                // The sidecar is the source of truth; a missing index row
                // only hurts the recent-sessions list.
                log::error!("Failed to index session {}: {}", report.session_id, e);
            }
        }

        log::info!(
            "[Session] flushed {} ({} frames, {:.1} ms) to {}",
            report.session_id,
            report.frame_count,
            report.duration_ms,
            folder.display()
        );
        Ok(folder)
    }

    /// Most recent sessions, newest first.
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<SessionSummary>> {
        match &self.index {
            Some(index) => index.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    fn session_folder(&self, report: &SessionReport) -> PathBuf {
        self.root
            .join(format!("race_{}", report.started_at.format("%Y%m%d_%H%M%S")))
    }
}

/// Load a sidecar back from disk (file browsing collaborators, tests).
pub fn load_report(folder: &Path) -> anyhow::Result<SessionReport> {
    let sidecar = folder.join(SIDECAR_FILE);
    let contents = std::fs::read_to_string(&sidecar)
        .with_context(|| format!("reading {}", sidecar.display()))?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::QualityProfile;
    use chrono::Utc;

    fn report() -> SessionReport {
        SessionReport {
            session_id: "abc-123".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 4321.0,
            frame_count: 130,
            calibrated_fps: 30.0,
            calibration_degraded: false,
            measured_effective_fps: 30.08,
            fps_mismatch: false,
            dropped_after_finish: 1,
            codec: "mp4v".into(),
            quality: QualityProfile::Medium720p,
            partial: false,
        }
    }

    #[test]
    fn flush_writes_sidecar_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path());

        let folder = store.flush(&report()).unwrap();
        assert!(folder.starts_with(dir.path()));
        assert!(folder
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("race_"));

        let loaded = load_report(&folder).unwrap();
        assert_eq!(loaded.session_id, "abc-123");
        assert_eq!(loaded.frame_count, 130);

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].session_id, "abc-123");
        assert_eq!(recent[0].path, folder);
    }

    #[test]
    fn unusable_db_path_falls_back_to_memory_index() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the root directory should be: sessions.db
        // cannot be created under it.
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"occupied").unwrap();

        let store = SessionStore::open(&root);
        assert!(store.recent(5).unwrap().is_empty());
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path());

        for i in 0..3 {
            let mut r = report();
            r.session_id = format!("session-{}", i);
            r.started_at = Utc::now() + chrono::Duration::seconds(i);
            store.flush(&r).unwrap();
        }

        let recent = store.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "session-2");
        assert_eq!(recent[1].session_id, "session-1");
    }
}
