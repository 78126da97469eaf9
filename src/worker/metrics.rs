use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// 工作池计数快照 (最终一致, 不参与控制逻辑)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// 停机时仍在队列中被丢弃的任务
    pub abandoned: u64,
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    inner: RwLock<MetricsSnapshot>,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }

    pub fn record_submitted(&self) {
        self.update(|m| m.submitted += 1);
    }

    pub fn record_result(&self, success: bool) {
        self.update(|m| {
            m.processed += 1;
            if success {
                m.succeeded += 1;
            } else {
                m.failed += 1;
            }
        });
    }

    pub fn record_abandoned(&self, count: u64) {
        self.update(|m| m.abandoned += count);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_results_by_outcome() {
        let metrics = PoolMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_result(true);
        metrics.record_result(false);
        metrics.record_abandoned(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.abandoned, 1);
    }
}
