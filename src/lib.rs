//! Real-time packet visibility pipeline: capture ingestion, streaming
//! per-flow aggregation over sliding windows, and volumetric flood
//! detection, decoupled from whatever renders the results.

pub mod aggregator;
pub mod alert;
pub mod capture;
pub mod config;
pub mod decode;
pub mod detector;
pub mod errors;
pub mod flow;
pub mod pipeline;
pub mod publish;
pub mod window;

pub use aggregator::{FlowAggregator, Snapshot};
pub use alert::{Alert, AlertLog, Metric, Severity};
pub use capture::{FrameSource, PcapSource, ReplaySource};
pub use config::Config;
pub use decode::{decode, Frame, ParsedPacket};
pub use detector::{AnomalyDetector, DetectorConfig};
pub use errors::{CaptureError, ConfigError, DecodeError, PipelineError};
pub use flow::{FlowKey, Protocol};
pub use pipeline::Pipeline;
pub use publish::StatsPublisher;
