//! Process-wide export job bookkeeping (§4.8). Not persisted: a restart
//! loses in-flight jobs and invalidates completed-job download URLs — a
//! deliberate simplification, not an oversight.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Succeeded | ExportState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportJob {
    pub id: String,
    pub camera_id: String,
    pub t0_ms: i64,
    pub t1_ms: i64,
    pub state: ExportState,
    pub progress: f32,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub error_tag: Option<String>,
    pub frame_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportJob {
    fn new(id: String, camera_id: String, t0_ms: i64, t1_ms: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            camera_id,
            t0_ms,
            t1_ms,
            state: ExportState::Queued,
            progress: 0.0,
            output_path: None,
            error: None,
            error_tag: None,
            frame_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A registry entry's cancellation handle is kept out of `ExportJob` itself
/// so the job record stays cheaply `Clone`/`Serialize` for the HTTP layer.
struct Entry {
    job: ExportJob,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct ExportRegistry {
    jobs: DashMap<String, Entry>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: String, camera_id: String, t0_ms: i64, t1_ms: i64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let job = ExportJob::new(id.clone(), camera_id, t0_ms, t1_ms);
        self.jobs.insert(id, Entry { job, cancel: cancel.clone() });
        cancel
    }

    pub fn get(&self, id: &str) -> Option<ExportJob> {
        self.jobs.get(id).map(|e| e.job.clone())
    }

    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.jobs.get(id).map(|e| e.cancel.clone())
    }

    pub fn set_running(&self, id: &str) {
        self.update(id, |job| job.state = ExportState::Running);
    }

    /// Progress is monotonic (§3 invariant); a late, smaller update is a
    /// no-op rather than an error, since the worker computes it from a
    /// wall-clock-independent frame timestamp and retries are not expected
    /// to regress it in practice.
    pub fn set_progress(&self, id: &str, progress: f32) {
        self.update(id, |job| {
            if progress > job.progress {
                job.progress = progress;
            }
        });
    }

    pub fn increment_frame_count(&self, id: &str) {
        self.update(id, |job| job.frame_count += 1);
    }

    pub fn set_succeeded(&self, id: &str, output_path: String) {
        self.update(id, |job| {
            job.state = ExportState::Succeeded;
            job.progress = 1.0;
            job.output_path = Some(output_path);
        });
    }

    pub fn set_failed(&self, id: &str, error: String, error_tag: &str) {
        self.update(id, |job| {
            job.state = ExportState::Failed;
            job.error = Some(error);
            job.error_tag = Some(error_tag.to_string());
        });
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut ExportJob)) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            f(&mut entry.job);
            entry.job.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_never_decreases() {
        let registry = ExportRegistry::new();
        registry.create("job-1".into(), "cam-1".into(), 0, 1000);
        registry.set_progress("job-1", 0.5);
        registry.set_progress("job-1", 0.2);
        assert_eq!(registry.get("job-1").unwrap().progress, 0.5);
        registry.set_progress("job-1", 0.9);
        assert_eq!(registry.get("job-1").unwrap().progress, 0.9);
    }

    #[test]
    fn terminal_states_are_flagged() {
        let registry = ExportRegistry::new();
        registry.create("job-1".into(), "cam-1".into(), 0, 1000);
        assert!(!registry.get("job-1").unwrap().state.is_terminal());
        registry.set_succeeded("job-1", "exports/job-1.mp4".into());
        assert!(registry.get("job-1").unwrap().state.is_terminal());
    }

    #[test]
    fn unknown_id_returns_none() {
        let registry = ExportRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.cancellation_token("missing").is_none());
    }
}
