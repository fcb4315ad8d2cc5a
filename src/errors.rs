use thiserror::Error;

/// Decode-local failure. Counted and dropped by the caller, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short or header truncated: {0}")]
    MalformedFrame(String),
    #[error("unrecognized link-layer payload")]
    UnknownLinkType,
}

/// Interface-level capture failure, fatal to that interface's worker only.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no such capture device: {0}")]
    NoSuchDevice(String),
    #[error("capture device error on {interface}: {source}")]
    Device {
        interface: String,
        #[source]
        source: pcap::Error,
    },
    #[error("capture ended on {0}")]
    EndOfCapture(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("pipeline already started")]
    AlreadyStarted,
}
