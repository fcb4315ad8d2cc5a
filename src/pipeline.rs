use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::aggregator::FlowAggregator;
use crate::alert::AlertLog;
use crate::capture::{capture_loop, FrameSource, PacketQueue, PcapSource};
use crate::config::Config;
use crate::detector::AnomalyDetector;
use crate::errors::PipelineError;
use crate::publish::StatsPublisher;

pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Explicit pipeline context constructed at startup and handed to every
/// worker: capture threads feed the bounded queue, one aggregation thread
/// folds packets into the window counters, and a timer task runs the
/// detector and publishes snapshots. `start`/`shutdown` bound the whole
/// lifecycle; there is no process-wide capture state.
pub struct Pipeline {
    config: Config,
    aggregator: Arc<FlowAggregator>,
    detector: Arc<Mutex<AnomalyDetector>>,
    alert_log: Arc<AlertLog>,
    publisher: Arc<StatsPublisher>,
    queue: PacketQueue,
    stop: Arc<AtomicBool>,
    capture_handles: Vec<thread::JoinHandle<()>>,
    aggregation_handle: Option<thread::JoinHandle<()>>,
    detector_handle: Option<tokio::task::JoinHandle<()>>,
    started: bool,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let aggregator = Arc::new(FlowAggregator::new(
            &config.windows_ms(),
            config.buckets_per_window,
        )?);
        let detector = Arc::new(Mutex::new(AnomalyDetector::new(config.detector())));
        let alert_log = Arc::new(AlertLog::new(config.alert_log_capacity));
        let publisher = Arc::new(StatsPublisher::new());
        let queue = PacketQueue::bounded(config.queue_capacity);

        Ok(Self {
            config,
            aggregator,
            detector,
            alert_log,
            publisher,
            queue,
            stop: Arc::new(AtomicBool::new(false)),
            capture_handles: Vec::new(),
            aggregation_handle: None,
            detector_handle: None,
            started: false,
        })
    }

    pub fn publisher(&self) -> Arc<StatsPublisher> {
        self.publisher.clone()
    }

    pub fn aggregator(&self) -> Arc<FlowAggregator> {
        self.aggregator.clone()
    }

    /// Opens every configured interface, spawns the workers and the
    /// detection timer. Must run inside a tokio runtime (the timer is a
    /// tokio task). A device that fails to open aborts startup; devices
    /// that die later only degrade their own interface.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::AlreadyStarted);
        }
        self.started = true;
        self.spawn_aggregation_worker();

        if self.config.interfaces.is_empty() {
            let source = self.open_source(None)?;
            self.spawn_source(source);
        } else {
            let names = self.config.interfaces.clone();
            for name in names {
                let source = self.open_source(Some(&name))?;
                self.spawn_source(source);
            }
        }

        self.spawn_detector_timer();
        info!(
            interfaces = self.capture_handles.len(),
            "pipeline started"
        );
        Ok(())
    }

    fn open_source(&self, name: Option<&str>) -> Result<PcapSource, PipelineError> {
        let mut source = PcapSource::open(
            name,
            self.config.snaplen,
            self.config.capture_timeout_ms,
        )?;
        if let Some(program) = &self.config.bpf_filter {
            source.filter(program)?;
        }
        Ok(source)
    }

    /// Spawns a dedicated capture worker for `source`. Public so callers
    /// can attach replay sources alongside (or instead of) live pcap ones.
    pub fn spawn_source<S: FrameSource + 'static>(&mut self, source: S) {
        self.aggregator.register_interface(source.interface().clone());
        let queue = self.queue.clone();
        let aggregator = self.aggregator.clone();
        let stop = self.stop.clone();
        self.capture_handles.push(thread::spawn(move || {
            capture_loop(source, queue, aggregator, stop);
        }));
    }

    fn spawn_aggregation_worker(&mut self) {
        let rx = self.queue.receiver();
        let aggregator = self.aggregator.clone();
        let stop = self.stop.clone();
        self.aggregation_handle = Some(thread::spawn(move || {
            loop {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(packet) => aggregator.record(&packet),
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::Relaxed) {
                            // Drain what capture workers already handed
                            // over; frames still at the source are
                            // discarded.
                            while let Ok(packet) = rx.try_recv() {
                                aggregator.record(&packet);
                            }
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("aggregation worker stopped");
        }));
    }

    fn spawn_detector_timer(&mut self) {
        let aggregator = self.aggregator.clone();
        let detector = self.detector.clone();
        let alert_log = self.alert_log.clone();
        let publisher = self.publisher.clone();
        let stop = self.stop.clone();
        let period = Duration::from_secs(self.config.detection_interval_secs);

        self.detector_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                run_detection_cycle(
                    &aggregator,
                    &detector,
                    &alert_log,
                    &publisher,
                    unix_now_ms(),
                );
            }
        }));
    }

    /// One snapshot → detect → publish pass at `now_ms`. Exposed so
    /// embedders and tests can run cycles at controlled times.
    pub fn run_detection_cycle(&self, now_ms: u64) {
        run_detection_cycle(
            &self.aggregator,
            &self.detector,
            &self.alert_log,
            &self.publisher,
            now_ms,
        );
    }

    /// Cooperative shutdown: workers observe the stop flag and exit after
    /// their current frame; the aggregation worker drains the queue. After
    /// `grace` the pipeline stops waiting and detaches whatever is left.
    pub fn shutdown(mut self, grace: Duration) {
        info!("pipeline shutting down");
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.detector_handle.take() {
            handle.abort();
        }

        let deadline = Instant::now() + grace;
        let mut pending: Vec<thread::JoinHandle<()>> = self.capture_handles.drain(..).collect();
        if let Some(handle) = self.aggregation_handle.take() {
            pending.push(handle);
        }

        while !pending.is_empty() {
            pending.retain(|h| !h.is_finished());
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    remaining = pending.len(),
                    "workers did not stop within the grace period; detaching"
                );
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        info!("pipeline stopped");
    }
}

/// A detection cycle never takes the pipeline down: any panic inside is
/// logged and that cycle is skipped.
fn run_detection_cycle(
    aggregator: &FlowAggregator,
    detector: &Mutex<AnomalyDetector>,
    alert_log: &AlertLog,
    publisher: &StatsPublisher,
    now_ms: u64,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let snapshot = aggregator.snapshot(now_ms);
        let mut detector = detector.lock();
        // A replayed cycle returns the same alerts for idempotence but
        // must not append them to the log a second time.
        let replayed = detector.last_evaluated_ms() == Some(snapshot.taken_at_ms);
        let alerts = detector.evaluate(&snapshot, now_ms);
        drop(detector);
        if !replayed {
            for alert in alerts {
                warn!(
                    flow = %alert.flow,
                    metric = alert.metric.as_str(),
                    rate = alert.observed_rate,
                    threshold = alert.threshold,
                    "{}",
                    alert.message()
                );
                alert_log.push(alert);
            }
        }
        publisher.publish(snapshot.with_alerts(alert_log.recent()));
    }));
    if outcome.is_err() {
        error!("detection cycle panicked; skipping this cycle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Metric;
    use crate::capture::ReplaySource;
    use crate::decode::Frame;
    use etherparse::PacketBuilder;
    use std::net::IpAddr;

    const BASE_MS: u64 = 1_700_000_000_000;

    fn udp_frame(src: [u8; 4], ts_ms: u64) -> Frame {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4(src, [10, 0, 0, 254], 64)
            .udp(40_000, 4_000);
        let mut data = Vec::with_capacity(builder.size(0));
        builder.write(&mut data, &[]).unwrap();
        Frame::new(data, ts_ms, Arc::from("replay0"))
    }

    /// `rate` frames/sec across `[start, start + secs)`.
    fn traffic(src: [u8; 4], start_ms: u64, secs: u64, rate: u64) -> Vec<Frame> {
        let mut frames = Vec::new();
        for s in 0..secs {
            for i in 0..rate {
                frames.push(udp_frame(src, start_ms + s * 1_000 + i * 1_000 / rate));
            }
        }
        frames
    }

    fn test_config() -> Config {
        Config {
            window_secs: vec![1],
            buckets_per_window: 10,
            sensitivity_factor: 5.0,
            absolute_floor: 50.0,
            cooldown_secs: 10,
            queue_capacity: 8_192,
            ..Config::default()
        }
    }

    fn wait_for_frames(pipeline: &Pipeline, expected: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snap = pipeline.aggregator.snapshot(BASE_MS);
            if snap.totals.frames >= expected {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "only {} of {} frames aggregated",
                snap.totals.frames,
                expected
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Replay one second of `rate` frames/sec and wait until the
    /// aggregation worker has folded all of them in. Feeding second by
    /// second keeps each detection cycle evaluating the window its
    /// timestamp actually covers; a short ring only retains the most
    /// recent second of event time.
    fn ingest_second(
        pipeline: &mut Pipeline,
        src: [u8; 4],
        start_ms: u64,
        rate: u64,
        total: &mut u64,
    ) {
        *total += rate;
        pipeline.spawn_source(ReplaySource::new("replay0", traffic(src, start_ms, 1, rate)));
        wait_for_frames(pipeline, *total);
    }

    #[test]
    fn sustained_burst_alerts_exactly_once_within_cooldown() {
        // 5 s of 10/s baseline, then 5 s of 1000/s from the same source,
        // with a detection cycle after every ingested second.
        let mut pipeline = Pipeline::new(test_config()).unwrap();
        pipeline.spawn_aggregation_worker();

        let mut total = 0;
        let mut alert_seconds = Vec::new();
        for second in 0..10u64 {
            let rate = if second < 5 { 10 } else { 1_000 };
            ingest_second(
                &mut pipeline,
                [10, 0, 0, 1],
                BASE_MS + second * 1_000,
                rate,
                &mut total,
            );
            pipeline.run_detection_cycle(BASE_MS + second * 1_000 + 999);
            if pipeline.publisher().recent_alerts().len() > alert_seconds.len() {
                alert_seconds.push(second);
            }
        }

        // The first cycle after the burst starts alerts; cooldown (10 s)
        // silences every later cycle.
        assert_eq!(alert_seconds, vec![5]);

        let publisher = pipeline.publisher();
        let alerts = publisher.recent_alerts();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.metric, Metric::PacketsPerSecond);
        assert_eq!(alert.flow.source, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(alert.observed_rate > 900.0);

        let snapshot = publisher.current();
        assert_eq!(snapshot.totals.frames, total);
        assert_eq!(snapshot.totals.malformed, 0);

        pipeline.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn after_cooldown_a_continuing_burst_realerts() {
        let mut config = test_config();
        config.cooldown_secs = 3;
        let mut pipeline = Pipeline::new(config).unwrap();
        pipeline.spawn_aggregation_worker();

        let mut total = 0;
        let mut alert_seconds = Vec::new();
        for second in 0..8u64 {
            ingest_second(
                &mut pipeline,
                [10, 0, 0, 7],
                BASE_MS + second * 1_000,
                500,
                &mut total,
            );
            pipeline.run_detection_cycle(BASE_MS + second * 1_000 + 999);
            if pipeline.publisher().recent_alerts().len() > alert_seconds.len() {
                alert_seconds.push(second);
            }
        }

        // One alert per cooldown interval while the burst continues.
        assert_eq!(alert_seconds, vec![0, 3, 6]);
        pipeline.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn replaying_a_cycle_does_not_duplicate_logged_alerts() {
        let mut pipeline = Pipeline::new(test_config()).unwrap();
        pipeline.spawn_aggregation_worker();
        let mut total = 0;
        ingest_second(&mut pipeline, [10, 0, 0, 4], BASE_MS, 1_000, &mut total);

        pipeline.run_detection_cycle(BASE_MS + 999);
        pipeline.run_detection_cycle(BASE_MS + 999);

        assert_eq!(pipeline.publisher().recent_alerts().len(), 1);
        pipeline.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn quiet_traffic_publishes_snapshots_without_alerts() {
        let frames = traffic([10, 0, 0, 2], BASE_MS, 3, 5);
        let total = frames.len() as u64;

        let mut pipeline = Pipeline::new(test_config()).unwrap();
        pipeline.spawn_aggregation_worker();
        pipeline.spawn_source(ReplaySource::new("replay0", frames));
        wait_for_frames(&pipeline, total);

        for second in 0..3 {
            pipeline.run_detection_cycle(BASE_MS + second * 1_000 + 999);
        }

        let snapshot = pipeline.publisher().current();
        assert!(snapshot.alerts.is_empty());
        assert_eq!(snapshot.totals.frames, total);
        assert_eq!(snapshot.interfaces.len(), 1);
        assert!(!snapshot.interfaces[0].stale);
        pipeline.shutdown(Duration::from_secs(2));
    }

    #[tokio::test]
    async fn detector_timer_publishes_on_its_own_cadence() {
        let now = unix_now_ms();
        let frames = traffic([10, 0, 0, 9], now, 1, 50);

        let mut pipeline = Pipeline::new(test_config()).unwrap();
        pipeline.spawn_aggregation_worker();
        pipeline.spawn_source(ReplaySource::new("replay0", frames));
        pipeline.spawn_detector_timer();

        let publisher = pipeline.publisher();
        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.current().taken_at_ms == 0 {
            assert!(Instant::now() < deadline, "timer never published a snapshot");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(publisher.current().taken_at_ms >= now);
        pipeline.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn shutdown_drains_packets_already_queued() {
        let frames = traffic([10, 0, 0, 3], BASE_MS, 1, 100);
        let total = frames.len() as u64;

        let mut pipeline = Pipeline::new(test_config()).unwrap();
        // No aggregation worker yet: everything sits in the queue.
        pipeline.spawn_source(ReplaySource::new("replay0", frames));
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.queue.len() < total as usize {
            assert!(Instant::now() < deadline, "capture worker stalled");
            thread::sleep(Duration::from_millis(5));
        }

        pipeline.spawn_aggregation_worker();
        let aggregator = pipeline.aggregator();
        pipeline.shutdown(Duration::from_secs(2));

        let snap = aggregator.snapshot(BASE_MS + 999);
        assert_eq!(snap.totals.frames, total);
    }
}
