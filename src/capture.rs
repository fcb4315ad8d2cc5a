use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use pcap::{Active, Capture, Device};
use tracing::{info, trace, warn};

use crate::aggregator::FlowAggregator;
use crate::decode::{decode, Frame, ParsedPacket};
use crate::errors::CaptureError;

/// Supplied capture capability: a lazy, infinite, non-restartable sequence
/// of raw frames with timestamps. `Ok(None)` means no frame was available
/// within the source's poll timeout, which is what keeps capture workers
/// responsive to the stop flag.
pub trait FrameSource: Send {
    fn interface(&self) -> &Arc<str>;

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Live pcap capture on one interface.
pub struct PcapSource {
    interface: Arc<str>,
    capture: Capture<Active>,
}

impl PcapSource {
    /// Opens `name` (or the default device when `None`) with a short read
    /// timeout so the capture loop can observe shutdown between frames.
    pub fn open(name: Option<&str>, snaplen: i32, timeout_ms: i32) -> Result<Self, CaptureError> {
        let device = lookup_device(name)?;
        let interface: Arc<str> = Arc::from(device.name.as_str());

        let capture = Capture::from_device(device)
            .map_err(|e| CaptureError::Device {
                interface: interface.to_string(),
                source: e,
            })?
            .promisc(false)
            .snaplen(snaplen)
            .timeout(timeout_ms)
            .immediate_mode(true)
            .open()
            .map_err(|e| CaptureError::Device {
                interface: interface.to_string(),
                source: e,
            })?;

        Ok(Self { interface, capture })
    }

    /// Installs a BPF filter, e.g. to restrict capture to IP traffic.
    pub fn filter(&mut self, program: &str) -> Result<(), CaptureError> {
        self.capture
            .filter(program, true)
            .map_err(|e| CaptureError::Device {
                interface: self.interface.to_string(),
                source: e,
            })
    }
}

impl FrameSource for PcapSource {
    fn interface(&self) -> &Arc<str> {
        &self.interface
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => {
                let ts = &packet.header.ts;
                let ts_ms =
                    (ts.tv_sec as i64 * 1_000 + ts.tv_usec as i64 / 1_000).max(0) as u64;
                Ok(Some(Frame::new(
                    packet.data.to_vec(),
                    ts_ms,
                    self.interface.clone(),
                )))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => {
                Err(CaptureError::EndOfCapture(self.interface.to_string()))
            }
            Err(e) => Err(CaptureError::Device {
                interface: self.interface.to_string(),
                source: e,
            }),
        }
    }
}

fn lookup_device(name: Option<&str>) -> Result<Device, CaptureError> {
    match name {
        Some(wanted) => Device::list()
            .map_err(|e| CaptureError::Device {
                interface: wanted.to_string(),
                source: e,
            })?
            .into_iter()
            .find(|d| d.name == wanted)
            .ok_or_else(|| CaptureError::NoSuchDevice(wanted.to_string())),
        None => Device::lookup()
            .map_err(|e| CaptureError::Device {
                interface: "<default>".to_string(),
                source: e,
            })?
            .ok_or_else(|| CaptureError::NoSuchDevice("<default>".to_string())),
    }
}

/// Names of the capture devices pcap can see, for `--list-interfaces`.
pub fn available_interfaces() -> Result<Vec<String>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Device {
        interface: "<list>".to_string(),
        source: e,
    })?;
    Ok(devices.into_iter().map(|d| d.name).collect())
}

/// Scripted source that replays pre-built frames and then reports end of
/// capture. Used to drive the pipeline in tests and for offline replay of
/// recorded bursts.
pub struct ReplaySource {
    interface: Arc<str>,
    frames: VecDeque<Frame>,
}

impl ReplaySource {
    pub fn new(interface: impl Into<Arc<str>>, frames: Vec<Frame>) -> Self {
        Self {
            interface: interface.into(),
            frames: frames.into(),
        }
    }
}

impl FrameSource for ReplaySource {
    fn interface(&self) -> &Arc<str> {
        &self.interface
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => Err(CaptureError::EndOfCapture(self.interface.to_string())),
        }
    }
}

/// Bounded decode-output queue between capture workers and the aggregation
/// worker. Producers keep a receiver clone so that, under overload, the
/// oldest queued packet is dropped to make room instead of stalling the
/// capture path.
#[derive(Clone)]
pub struct PacketQueue {
    tx: Sender<ParsedPacket>,
    rx: Receiver<ParsedPacket>,
}

impl PacketQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub fn receiver(&self) -> Receiver<ParsedPacket> {
        self.rx.clone()
    }

    /// Enqueue, evicting the oldest packet when full. Returns how many
    /// packets were evicted to make room (the `CaptureOverrun` count).
    pub fn push_drop_oldest(&self, packet: ParsedPacket) -> u64 {
        let mut evicted = 0;
        let mut packet = packet;
        loop {
            match self.tx.try_send(packet) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                    packet = back;
                }
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Per-interface capture worker: pull, decode, enqueue. Malformed frames
/// are counted and dropped. A device-level error is fatal to this worker
/// only; the interface is flagged stale and the rest of the pipeline keeps
/// running.
pub fn capture_loop<S: FrameSource>(
    mut source: S,
    queue: PacketQueue,
    aggregator: Arc<FlowAggregator>,
    stop: Arc<AtomicBool>,
) {
    let interface = source.interface().clone();
    info!(%interface, "capture worker started");

    while !stop.load(Ordering::Relaxed) {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(CaptureError::EndOfCapture(_)) => {
                info!(%interface, "end of capture");
                break;
            }
            Err(e) => {
                warn!(%interface, error = %e, "capture failed, marking interface stale");
                aggregator.mark_interface_stale(&interface, e.to_string());
                return;
            }
        };

        match decode(&frame) {
            Ok(packet) => {
                let evicted = queue.push_drop_oldest(packet);
                if evicted > 0 {
                    for _ in 0..evicted {
                        aggregator.note_overrun();
                    }
                    trace!(%interface, evicted, "queue overrun");
                }
            }
            Err(e) => {
                aggregator.note_malformed();
                trace!(%interface, error = %e, "dropped malformed frame");
            }
        }
    }
    info!(%interface, "capture worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Protocol;
    use etherparse::PacketBuilder;

    fn udp_frame(ts_ms: u64, dst_port: u16) -> Frame {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(40_000, dst_port);
        let mut data = Vec::with_capacity(builder.size(0));
        builder.write(&mut data, &[]).unwrap();
        Frame::new(data, ts_ms, Arc::from("replay0"))
    }

    #[test]
    fn queue_drops_oldest_under_overload() {
        let queue = PacketQueue::bounded(3);

        let mut evicted_total = 0;
        for ts in 0..5u64 {
            let packet = decode(&udp_frame(ts, 4_000)).unwrap();
            evicted_total += queue.push_drop_oldest(packet);
        }
        assert_eq!(evicted_total, 2);
        assert_eq!(queue.len(), 3);

        // The survivors are the newest three.
        let rx = queue.receiver();
        let remaining: Vec<u64> = (0..3).map(|_| rx.try_recv().unwrap().ts_ms).collect();
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[test]
    fn capture_loop_counts_malformed_and_stops_at_end() {
        let frames = vec![
            udp_frame(1_000, 4_000),
            Frame::new(vec![0u8; 4], 1_001, Arc::from("replay0")),
            udp_frame(1_002, 53),
        ];
        let source = ReplaySource::new("replay0", frames);
        let queue = PacketQueue::bounded(16);
        let agg = Arc::new(FlowAggregator::new(&[1_000], 10).unwrap());
        agg.register_interface(Arc::from("replay0"));

        capture_loop(source, queue.clone(), agg.clone(), Arc::new(AtomicBool::new(false)));

        let rx = queue.receiver();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.protocol, Protocol::Udp);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.protocol, Protocol::Dns);
        assert!(rx.try_recv().is_err());

        let snap = agg.snapshot(1_002);
        assert_eq!(snap.totals.malformed, 1);
        assert!(!snap.interfaces[0].stale, "clean end of capture is not a failure");
    }
}
