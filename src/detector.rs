use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::aggregator::{FlowStats, Snapshot};
use crate::alert::{Alert, Metric, Severity};
use crate::flow::{FlowKey, Protocol};

/// Detection policy knobs. The EWMA parameters are deliberate defaults for
/// bursty LAN traffic; all of them are plumbed through the config file.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Flag when rate > max(absolute_floor, baseline * sensitivity_factor).
    pub sensitivity_factor: f64,
    /// Events per second below which no alert fires regardless of baseline.
    pub absolute_floor: f64,
    /// Hysteresis: a (flow, metric) pair cannot re-alert until this elapses.
    pub cooldown_ms: u64,
    /// EWMA smoothing factor for the baseline rate.
    pub ewma_alpha: f64,
    /// Decay applied to the baseline before each update, so stale baselines
    /// drift down between observations.
    pub baseline_decay: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity_factor: 3.0,
            absolute_floor: 50.0,
            cooldown_ms: 10_000,
            ewma_alpha: 0.2,
            baseline_decay: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MetricState {
    baseline: f64,
    last_alert_ms: Option<u64>,
}

/// Evaluates aggregator snapshots on a fixed cadence and emits volumetric
/// alerts. Maintains an exponentially-decayed baseline per (flow, metric);
/// runs on its own timer, never inline with ingestion, so it owns its state
/// without locking.
#[derive(Debug)]
pub struct AnomalyDetector {
    config: DetectorConfig,
    states: HashMap<(FlowKey, Metric), MetricState>,
    /// Snapshot timestamp of the last cycle plus what it produced, so
    /// re-evaluating the same snapshot is idempotent.
    last_cycle: Option<(u64, Vec<Alert>)>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            last_cycle: None,
        }
    }

    /// Snapshot timestamp of the most recent cycle, if any. Callers use
    /// this to tell a fresh cycle from a replayed one.
    pub fn last_evaluated_ms(&self) -> Option<u64> {
        self.last_cycle.as_ref().map(|(ts, _)| *ts)
    }

    /// One detection cycle over `snapshot`. Rates come from each flow's
    /// shortest window. Returns the alerts raised this cycle, oldest first.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now_ms: u64) -> Vec<Alert> {
        if let Some((ts, alerts)) = &self.last_cycle {
            if *ts == snapshot.taken_at_ms {
                return alerts.clone();
            }
        }

        let mut alerts = Vec::new();
        for flow in &snapshot.flows {
            for (metric, rate) in Self::metric_rates(flow) {
                if let Some(alert) = self.check(&flow.key, metric, rate, now_ms) {
                    alerts.push(alert);
                }
            }
        }

        self.prune_idle(snapshot);
        self.last_cycle = Some((snapshot.taken_at_ms, alerts.clone()));
        alerts
    }

    fn metric_rates(flow: &FlowStats) -> Vec<(Metric, f64)> {
        let shortest = flow.shortest();
        let mut rates = vec![(Metric::PacketsPerSecond, shortest.packet_rate)];
        match flow.key.protocol {
            Protocol::Tcp => rates.push((Metric::SynPerSecond, shortest.syn_rate())),
            Protocol::Dns => rates.push((Metric::DnsQueriesPerSecond, shortest.dns_query_rate())),
            _ => {}
        }
        rates
    }

    fn check(&mut self, key: &FlowKey, metric: Metric, rate: f64, now_ms: u64) -> Option<Alert> {
        let state = self
            .states
            .entry((key.clone(), metric))
            .or_default();

        let threshold = (state.baseline * self.config.sensitivity_factor)
            .max(self.config.absolute_floor);

        if rate <= threshold {
            // EWMA update with decay: the baseline drifts down when traffic
            // quiets and chases rising-but-legitimate rates only slowly.
            // Anomalous cycles are excluded so a sustained attack cannot
            // teach the detector that flood rates are normal.
            state.baseline *= 1.0 - self.config.baseline_decay;
            state.baseline =
                self.config.ewma_alpha * rate + (1.0 - self.config.ewma_alpha) * state.baseline;
            return None;
        }

        if let Some(last) = state.last_alert_ms {
            if now_ms.saturating_sub(last) < self.config.cooldown_ms {
                debug!(flow = %key, metric = metric.as_str(), rate, "still in cooldown");
                return None;
            }
        }
        state.last_alert_ms = Some(now_ms);

        let severity = if rate >= threshold * 10.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };

        Some(Alert {
            flow: key.clone(),
            metric,
            observed_rate: rate,
            threshold,
            severity,
            timestamp: utc_from_ms(now_ms),
        })
    }

    /// Drop baseline state for flows no longer present in the snapshot;
    /// the aggregator already pruned them from its map.
    fn prune_idle(&mut self, snapshot: &Snapshot) {
        if self.states.len() < 2 * snapshot.flows.len() + 64 {
            return;
        }
        let live: std::collections::HashSet<&FlowKey> =
            snapshot.flows.iter().map(|f| &f.key).collect();
        self.states.retain(|(key, _), _| live.contains(key));
    }
}

fn utc_from_ms(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::FlowAggregator;
    use crate::decode::ParsedPacket;
    use std::net::IpAddr;
    use std::sync::Arc;

    fn tcp_packet(src: &str, ts_ms: u64, syn: bool) -> ParsedPacket {
        ParsedPacket {
            interface: Arc::from("test0"),
            ts_ms,
            source: src.parse::<IpAddr>().unwrap(),
            destination: "10.0.0.254".parse::<IpAddr>().unwrap(),
            protocol: Protocol::Tcp,
            size: 60,
            source_port: Some(40_000),
            destination_port: Some(80),
            syn,
            dns_query: false,
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            sensitivity_factor: 5.0,
            absolute_floor: 50.0,
            cooldown_ms: 3_000,
            ..DetectorConfig::default()
        }
    }

    /// Feed `rate` plain TCP packets/sec for one second from `start_ms`.
    fn feed(agg: &FlowAggregator, src: &str, start_ms: u64, rate: u64) {
        for i in 0..rate {
            agg.record(&tcp_packet(src, start_ms + i * 1_000 / rate, false));
        }
    }

    #[test]
    fn quiet_flow_never_alerts() {
        let agg = FlowAggregator::new(&[1_000], 10).unwrap();
        let mut detector = AnomalyDetector::new(config());
        for second in 0..10 {
            let t = 100_000 + second * 1_000;
            feed(&agg, "10.0.0.1", t, 10);
            let alerts = detector.evaluate(&agg.snapshot(t + 999), t + 999);
            assert!(alerts.is_empty(), "unexpected alert at second {}", second);
        }
    }

    #[test]
    fn burst_alerts_once_per_cooldown() {
        let agg = FlowAggregator::new(&[1_000], 10).unwrap();
        let mut detector = AnomalyDetector::new(config());

        // Baseline period: 10 packets/sec from flow A.
        for second in 0..5 {
            let t = 100_000 + second * 1_000;
            feed(&agg, "10.0.0.1", t, 10);
            assert!(detector.evaluate(&agg.snapshot(t + 999), t + 999).is_empty());
        }

        // Sustained burst: 1000 packets/sec for 5 seconds.
        let mut raised = Vec::new();
        for second in 5..10 {
            let t = 100_000 + second * 1_000;
            feed(&agg, "10.0.0.1", t, 1_000);
            let now = t + 999;
            for alert in detector.evaluate(&agg.snapshot(now), now) {
                raised.push((second, alert));
            }
        }

        // First evaluation of the burst alerts; cooldown (3 s) holds the
        // next two cycles back, then one more fires.
        let seconds: Vec<u64> = raised.iter().map(|(s, _)| *s).collect();
        assert_eq!(seconds, vec![5, 8]);
        let (_, first) = &raised[0];
        assert_eq!(first.metric, Metric::PacketsPerSecond);
        assert!(first.observed_rate > 900.0);
        assert_eq!(first.threshold, 50.0);
    }

    #[test]
    fn re_evaluating_the_same_snapshot_is_idempotent() {
        let agg = FlowAggregator::new(&[1_000], 10).unwrap();
        let mut detector = AnomalyDetector::new(config());
        feed(&agg, "10.0.0.1", 100_000, 1_000);

        let snap = agg.snapshot(100_999);
        let first = detector.evaluate(&snap, 100_999);
        let second = detector.evaluate(&snap, 100_999);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].observed_rate, second[0].observed_rate);
        assert_eq!(detector.last_evaluated_ms(), Some(100_999));
    }

    #[test]
    fn syn_metric_tracked_separately_from_packets() {
        let agg = FlowAggregator::new(&[1_000], 10).unwrap();
        let mut detector = AnomalyDetector::new(config());
        for i in 0..200 {
            agg.record(&tcp_packet("10.0.0.1", 100_000 + i * 5, true));
        }

        let alerts = detector.evaluate(&agg.snapshot(100_999), 100_999);
        let metrics: Vec<Metric> = alerts.iter().map(|a| a.metric).collect();
        assert!(metrics.contains(&Metric::PacketsPerSecond));
        assert!(metrics.contains(&Metric::SynPerSecond));
    }

    #[test]
    fn learned_baseline_raises_threshold_above_the_floor() {
        let agg = FlowAggregator::new(&[1_000], 10).unwrap();
        let mut detector = AnomalyDetector::new(config());

        // Legitimate traffic ramps up below the floor; the baseline learns.
        let mut t = 100_000;
        for rate in [20, 30, 40, 40, 40, 40, 40, 40] {
            feed(&agg, "10.0.0.1", t, rate);
            assert!(detector.evaluate(&agg.snapshot(t + 999), t + 999).is_empty());
            t += 1_000;
        }

        // 60/s would trip a cold detector's floor of 50, but the learned
        // baseline (~18/s at sensitivity 5) has pushed the threshold higher.
        feed(&agg, "10.0.0.1", t, 60);
        assert!(detector.evaluate(&agg.snapshot(t + 999), t + 999).is_empty());

        // A genuine burst still fires.
        t += 1_000;
        feed(&agg, "10.0.0.1", t, 500);
        assert_eq!(detector.evaluate(&agg.snapshot(t + 999), t + 999).len(), 1);
    }
}
