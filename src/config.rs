use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::detector::DetectorConfig;
use crate::errors::ConfigError;

/// Pipeline configuration, loadable from a YAML file; every field has a
/// sensible default so a missing file section is not an error. CLI flags
/// override whatever the file says.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Interfaces to capture on; empty means the default device.
    pub interfaces: Vec<String>,
    /// Sliding window durations, seconds.
    pub window_secs: Vec<u64>,
    /// Sub-interval buckets per window ring.
    pub buckets_per_window: usize,
    /// Threshold multiple over the baseline rate.
    pub sensitivity_factor: f64,
    /// Minimum events/sec before any alert fires.
    pub absolute_floor: f64,
    /// Re-alert hysteresis per (flow, metric).
    pub cooldown_secs: u64,
    /// EWMA smoothing factor for baseline rates, in (0, 1].
    pub ewma_alpha: f64,
    /// Decay applied to a baseline before each update, in [0, 1).
    pub baseline_decay: f64,
    /// Detector cadence.
    pub detection_interval_secs: u64,
    /// Bounded decode-output queue capacity.
    pub queue_capacity: usize,
    pub alert_log_capacity: usize,
    pub snaplen: i32,
    /// pcap read timeout; also bounds how fast workers notice shutdown.
    pub capture_timeout_ms: i32,
    /// Optional BPF program applied to every capture.
    pub bpf_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            window_secs: vec![1, 10, 60],
            buckets_per_window: 10,
            sensitivity_factor: 3.0,
            absolute_floor: 50.0,
            cooldown_secs: 10,
            ewma_alpha: 0.2,
            baseline_decay: 0.3,
            detection_interval_secs: 1,
            queue_capacity: 4_096,
            alert_log_capacity: 256,
            snaplen: 2_048,
            capture_timeout_ms: 500,
            bpf_filter: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs.is_empty() || self.window_secs.contains(&0) {
            return Err(ConfigError::Invalid(
                "window_secs must be non-empty with positive durations".into(),
            ));
        }
        if self.sensitivity_factor <= 0.0 {
            return Err(ConfigError::Invalid("sensitivity_factor must be > 0".into()));
        }
        if self.absolute_floor < 0.0 {
            return Err(ConfigError::Invalid("absolute_floor must be >= 0".into()));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::Invalid("ewma_alpha must be in (0, 1]".into()));
        }
        if !(0.0..1.0).contains(&self.baseline_decay) {
            return Err(ConfigError::Invalid("baseline_decay must be in [0, 1)".into()));
        }
        if self.buckets_per_window < 2 {
            return Err(ConfigError::Invalid("buckets_per_window must be >= 2".into()));
        }
        if self.detection_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "detection_interval_secs must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn windows_ms(&self) -> Vec<u64> {
        self.window_secs.iter().map(|s| s * 1_000).collect()
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            sensitivity_factor: self.sensitivity_factor,
            absolute_floor: self.absolute_floor,
            cooldown_ms: self.cooldown_secs * 1_000,
            ewma_alpha: self.ewma_alpha,
            baseline_decay: self.baseline_decay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "
            interfaces: [eth0, wlan0]
            sensitivity_factor: 5.0
            cooldown_secs: 30
            ",
        )
        .unwrap();

        assert_eq!(cfg.interfaces, vec!["eth0".to_string(), "wlan0".to_string()]);
        assert_eq!(cfg.sensitivity_factor, 5.0);
        assert_eq!(cfg.cooldown_secs, 30);
        // untouched fields keep their defaults
        assert_eq!(cfg.window_secs, vec![1, 10, 60]);
        assert_eq!(cfg.queue_capacity, 4_096);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("sensitivty: 5.0");
        assert!(result.is_err());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut cfg = Config::default();
        cfg.sensitivity_factor = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.window_secs = vec![];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.window_secs = vec![1, 0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ewma_parameters_reach_the_detector() {
        let mut cfg = Config::default();
        cfg.ewma_alpha = 0.5;
        cfg.baseline_decay = 0.1;
        let detector = cfg.detector();
        assert_eq!(detector.ewma_alpha, 0.5);
        assert_eq!(detector.baseline_decay, 0.1);

        let mut cfg = Config::default();
        cfg.ewma_alpha = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.baseline_decay = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }
}
