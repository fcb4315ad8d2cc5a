use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregator::Snapshot;
use crate::alert::Alert;

/// Copy-on-publish handoff between the aggregation cadence and whatever is
/// reading (display, plotting, tests). `publish` swaps in a freshly built
/// immutable snapshot; `current` hands out the `Arc` so readers never see a
/// half-updated view and writers never wait on readers. Readers before the
/// first publish get the well-defined empty snapshot.
#[derive(Debug)]
pub struct StatsPublisher {
    latest: RwLock<Arc<Snapshot>>,
}

impl Default for StatsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsPublisher {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(Arc::new(Snapshot::empty())),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        *self.latest.write() = Arc::new(snapshot);
    }

    /// Latest published snapshot. Non-blocking, safe at arbitrary cadence;
    /// the returned `Arc` stays valid however many publishes follow.
    pub fn current(&self) -> Arc<Snapshot> {
        self.latest.read().clone()
    }

    /// Recent alerts from the latest snapshot, most recent last.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.latest.read().alerts.clone()
    }
}
