use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::alert::Alert;
use crate::decode::ParsedPacket;
use crate::errors::ConfigError;
use crate::flow::{FlowKey, Protocol};
use crate::window::{Counts, WindowCounter};

/// Rolling counters for one flow, one ring per configured window duration.
#[derive(Debug, Clone)]
struct FlowWindows {
    windows: Vec<WindowCounter>,
}

impl FlowWindows {
    fn new(windows_ms: &[u64], bucket_count: usize) -> Self {
        Self {
            windows: windows_ms
                .iter()
                .map(|&ms| WindowCounter::new(ms, bucket_count))
                .collect(),
        }
    }

    fn record(&mut self, ts_ms: u64, counts: Counts) {
        for window in &mut self.windows {
            window.record(ts_ms, counts);
        }
    }
}

#[derive(Debug, Default)]
struct PipelineCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    malformed: AtomicU64,
    overruns: AtomicU64,
}

#[derive(Debug, Default)]
struct ProtocolCounters {
    tcp: AtomicU64,
    udp: AtomicU64,
    dns: AtomicU64,
    icmp: AtomicU64,
    other: AtomicU64,
}

impl ProtocolCounters {
    fn bump(&self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
            Protocol::Dns => &self.dns,
            Protocol::Icmp => &self.icmp,
            Protocol::Other => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default)]
struct InterfaceState {
    frames: u64,
    stale: bool,
    last_error: Option<String>,
}

/// Maintains per-`FlowKey` rolling counters over the configured sliding
/// windows. `record` is called concurrently from the decode paths and
/// `snapshot` from the detector timer; synchronization is per key through
/// the sharded map, never a pipeline-wide lock.
#[derive(Debug)]
pub struct FlowAggregator {
    flows: DashMap<FlowKey, FlowWindows>,
    windows_ms: Vec<u64>,
    bucket_count: usize,
    counters: PipelineCounters,
    protocols: ProtocolCounters,
    interfaces: DashMap<Arc<str>, InterfaceState>,
}

impl FlowAggregator {
    /// `windows_ms` is deduplicated and sorted ascending; the shortest
    /// window is the one the detector rates flows against.
    pub fn new(windows_ms: &[u64], bucket_count: usize) -> Result<Self, ConfigError> {
        let mut windows_ms: Vec<u64> = windows_ms.iter().copied().filter(|&ms| ms > 0).collect();
        windows_ms.sort_unstable();
        windows_ms.dedup();
        if windows_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one positive window duration required".into(),
            ));
        }
        Ok(Self {
            flows: DashMap::new(),
            windows_ms,
            bucket_count: bucket_count.max(2),
            counters: PipelineCounters::default(),
            protocols: ProtocolCounters::default(),
            interfaces: DashMap::new(),
        })
    }

    pub fn shortest_window_ms(&self) -> u64 {
        self.windows_ms[0]
    }

    pub fn register_interface(&self, interface: Arc<str>) {
        self.interfaces.entry(interface).or_default();
    }

    /// Fold one decoded packet into its flow's windows.
    pub fn record(&self, packet: &ParsedPacket) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(packet.size, Ordering::Relaxed);
        self.protocols.bump(packet.protocol);

        if let Some(mut state) = self.interfaces.get_mut(&packet.interface) {
            state.frames += 1;
        }

        let counts = Counts {
            packets: 1,
            bytes: packet.size,
            syn_packets: packet.syn as u64,
            dns_queries: packet.dns_query as u64,
        };

        self.flows
            .entry(packet.flow_key())
            .or_insert_with(|| FlowWindows::new(&self.windows_ms, self.bucket_count))
            .record(packet.ts_ms, counts);
    }

    pub fn note_malformed(&self) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_overrun(&self) {
        self.counters.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// A dead interface degrades the snapshot instead of stopping the
    /// pipeline; remaining interfaces keep capturing.
    pub fn mark_interface_stale(&self, interface: &Arc<str>, error: String) {
        let mut state = self.interfaces.entry(interface.clone()).or_default();
        state.stale = true;
        state.last_error = Some(error);
    }

    /// Consistent read-only copy of all current counters. Flows that have
    /// aged out of every window are dropped from the map here so idle
    /// sources do not accumulate forever.
    pub fn snapshot(&self, now_ms: u64) -> Snapshot {
        let mut flows = Vec::with_capacity(self.flows.len());
        self.flows.retain(|key, windows| {
            // A flow is dropped only once every ring is idle: everything it
            // ever counted is older than the corresponding window. Counts
            // newer than `now_ms` (snapshot running behind capture
            // timestamps) keep it alive.
            let live = windows.windows.iter().any(|w| !w.is_idle(now_ms));
            if live {
                flows.push(FlowStats {
                    key: key.clone(),
                    windows: windows
                        .windows
                        .iter()
                        .map(|w| WindowStats {
                            window_ms: w.window_ms(),
                            counts: w.total(now_ms),
                            packet_rate: w.rate(now_ms),
                        })
                        .collect(),
                });
            }
            live
        });
        flows.sort_by(|a, b| a.key.cmp(&b.key));

        let mut interfaces: Vec<InterfaceStatus> = self
            .interfaces
            .iter()
            .map(|entry| InterfaceStatus {
                name: entry.key().to_string(),
                frames: entry.value().frames,
                stale: entry.value().stale,
                last_error: entry.value().last_error.clone(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        Snapshot {
            taken_at_ms: now_ms,
            flows,
            protocols: ProtocolTotals {
                tcp: self.protocols.tcp.load(Ordering::Relaxed),
                udp: self.protocols.udp.load(Ordering::Relaxed),
                dns: self.protocols.dns.load(Ordering::Relaxed),
                icmp: self.protocols.icmp.load(Ordering::Relaxed),
                other: self.protocols.other.load(Ordering::Relaxed),
            },
            totals: PipelineTotals {
                frames: self.counters.frames.load(Ordering::Relaxed),
                bytes: self.counters.bytes.load(Ordering::Relaxed),
                malformed: self.counters.malformed.load(Ordering::Relaxed),
                overruns: self.counters.overruns.load(Ordering::Relaxed),
            },
            interfaces,
            alerts: Vec::new(),
        }
    }
}

/// Per-window totals for one flow inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub window_ms: u64,
    pub counts: Counts,
    pub packet_rate: f64,
}

impl WindowStats {
    pub fn syn_rate(&self) -> f64 {
        self.counts.syn_packets as f64 * 1_000.0 / self.window_ms as f64
    }

    pub fn dns_query_rate(&self) -> f64 {
        self.counts.dns_queries as f64 * 1_000.0 / self.window_ms as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStats {
    pub key: FlowKey,
    /// Ascending by window duration, index 0 is the shortest window.
    pub windows: Vec<WindowStats>,
}

impl FlowStats {
    pub fn shortest(&self) -> &WindowStats {
        &self.windows[0]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolTotals {
    pub tcp: u64,
    pub udp: u64,
    pub dns: u64,
    pub icmp: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineTotals {
    pub frames: u64,
    pub bytes: u64,
    pub malformed: u64,
    pub overruns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub frames: u64,
    pub stale: bool,
    pub last_error: Option<String>,
}

/// Immutable point-in-time view handed to consumers. A previously returned
/// snapshot stays valid for any holder after newer ones are published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at_ms: u64,
    pub flows: Vec<FlowStats>,
    pub protocols: ProtocolTotals,
    pub totals: PipelineTotals,
    pub interfaces: Vec<InterfaceStatus>,
    pub alerts: Vec<Alert>,
}

impl Snapshot {
    /// Well-defined initial state readers see before the first publish.
    pub fn empty() -> Self {
        Self {
            taken_at_ms: 0,
            flows: Vec::new(),
            protocols: ProtocolTotals::default(),
            totals: PipelineTotals::default(),
            interfaces: Vec::new(),
            alerts: Vec::new(),
        }
    }

    pub fn with_alerts(mut self, alerts: Vec<Alert>) -> Self {
        self.alerts = alerts;
        self
    }
}
