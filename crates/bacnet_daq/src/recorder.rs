//! Recording collaborators that receive poll results

use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::PollResult;

/// Receives the values a group decided to record
///
/// Implementations own persistence and any further deduplication; the
/// engine only hands over what changed.
pub trait Recorder: Send + Sync {
    fn record(&self, group: &str, results: &[PollResult]);
}

/// Writes every result to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn record(&self, group: &str, results: &[PollResult]) {
        for result in results {
            tracing::info!(
                group = %group,
                variable = result.variable_id,
                value = ?result.value,
                timestamp = %result.timestamp,
                "Recorded value"
            );
        }
    }
}

/// Keeps results in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    results: Arc<Mutex<Vec<PollResult>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<PollResult> {
        self.results.lock().clone()
    }

    pub fn take(&self) -> Vec<PollResult> {
        std::mem::take(&mut *self.results.lock())
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, _group: &str, results: &[PollResult]) {
        self.results.lock().extend_from_slice(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_take_drains() {
        let recorder = MemoryRecorder::new();
        recorder.record("g", &[PollResult::new(1, Some(2.0)), PollResult::new(2, Some(3.0))]);
        assert_eq!(recorder.results().len(), 2);

        let taken = recorder.take();
        assert_eq!(taken[1].variable_id, 2);
        assert!(recorder.results().is_empty());
    }
}
