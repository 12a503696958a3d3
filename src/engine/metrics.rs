//! Snapshot metrics
//!
//! Last-operation metrics exposed to the cache processor's monitoring
//! surface.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::errors::SnapshotResult;

#[derive(Debug, Default, Clone)]
struct MetricsState {
    last_start: Option<DateTime<Utc>>,
    last_end: Option<DateTime<Utc>>,
    last_name: Option<String>,
    last_error: Option<String>,
}

/// Per-engine snapshot metrics.
#[derive(Debug, Default)]
pub struct SnapshotMetrics {
    state: Mutex<MetricsState>,
}

impl SnapshotMetrics {
    /// Record the start of a cluster snapshot.
    pub fn on_start(&self, name: &str) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.last_start = Some(Utc::now());
        state.last_end = None;
        state.last_name = Some(name.to_string());
        state.last_error = None;
    }

    /// Record the end of a cluster snapshot.
    pub fn on_end(&self, name: &str, result: &SnapshotResult<()>) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.last_end = Some(Utc::now());
        state.last_name = Some(name.to_string());
        state.last_error = result.as_ref().err().map(|e| e.to_string());
    }

    /// Start time of the last snapshot.
    pub fn last_snapshot_start_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("metrics lock poisoned").last_start
    }

    /// End time of the last snapshot.
    pub fn last_snapshot_end_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("metrics lock poisoned").last_end
    }

    /// Name of the last snapshot.
    pub fn last_snapshot_name(&self) -> Option<String> {
        self.state.lock().expect("metrics lock poisoned").last_name.clone()
    }

    /// Error message of the last snapshot, if it failed.
    pub fn last_snapshot_error_message(&self) -> Option<String> {
        self.state.lock().expect("metrics lock poisoned").last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SnapshotError;

    #[test]
    fn test_start_end_roundtrip() {
        let metrics = SnapshotMetrics::default();
        assert!(metrics.last_snapshot_start_time().is_none());

        metrics.on_start("s1");
        assert_eq!(metrics.last_snapshot_name(), Some("s1".to_string()));
        assert!(metrics.last_snapshot_start_time().is_some());
        assert!(metrics.last_snapshot_end_time().is_none());

        metrics.on_end("s1", &Ok(()));
        assert!(metrics.last_snapshot_end_time().is_some());
        assert!(metrics.last_snapshot_error_message().is_none());
    }

    #[test]
    fn test_error_is_recorded() {
        let metrics = SnapshotMetrics::default();
        metrics.on_start("s1");
        metrics.on_end("s1", &Err(SnapshotError::TopologyChanged("node-12345678 left".into())));

        let message = metrics.last_snapshot_error_message().unwrap();
        assert!(message.contains("node-12345678"));
    }

    #[test]
    fn test_new_start_clears_previous_error() {
        let metrics = SnapshotMetrics::default();
        metrics.on_start("s1");
        metrics.on_end("s1", &Err(SnapshotError::Cancelled));
        assert!(metrics.last_snapshot_error_message().is_some());

        metrics.on_start("s2");
        assert!(metrics.last_snapshot_error_message().is_none());
        assert_eq!(metrics.last_snapshot_name(), Some("s2".to_string()));
    }
}
