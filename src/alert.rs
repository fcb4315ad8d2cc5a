use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::flow::FlowKey;

/// Which per-flow rate tripped the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Metric {
    PacketsPerSecond,
    SynPerSecond,
    DnsQueriesPerSecond,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::PacketsPerSecond => "packets/s",
            Metric::SynPerSecond => "syn/s",
            Metric::DnsQueriesPerSecond => "dns-queries/s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// One detector finding. Created once, read-only thereafter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub flow: FlowKey,
    pub metric: Metric,
    /// Observed rate in events per second at detection time.
    pub observed_rate: f64,
    /// Threshold the rate exceeded.
    pub threshold: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn message(&self) -> String {
        format!(
            "{} flood caution: {} at {:.2} {} (threshold {:.2})",
            self.flow.protocol, self.flow.source, self.observed_rate, self.metric.as_str(), self.threshold
        )
    }
}

/// Append-only log of recent alerts with bounded capacity, oldest evicted
/// first. A single lock is fine here: alerts arrive orders of magnitude
/// slower than packets.
#[derive(Debug)]
pub struct AlertLog {
    inner: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut log = self.inner.lock();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(alert);
    }

    /// Alerts in arrival order, most recent last.
    pub fn recent(&self) -> Vec<Alert> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
