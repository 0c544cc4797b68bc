//! Configuration types for the frame precomputation subsystem.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Upper bound the adaptive tuner may raise the prediction horizon to.
pub const MAX_PREDICTION_HORIZON: usize = 240;

/// Upper bound the adaptive tuner may raise the cache entry budget to.
pub const MAX_CACHE_FRAMES: usize = 2000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecomputeConfig {
    /// Worker pool parameters.
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Look-ahead prediction parameters.
    #[serde(default)]
    pub prediction: PredictionConfig,
    /// Frame cache budgets.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Frame time thresholds.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Compression applied to engine snapshots.
    #[serde(default)]
    pub snapshot_compression: CompressionType,
}

/// How workers are isolated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Tasks run on a shared rayon thread pool.
    #[default]
    Threads,
    /// Each worker is a dedicated OS thread fed only serialized snapshots.
    #[serde(alias = "process", alias = "processes")]
    Isolated,
}

/// Compression type for snapshot payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionType {
    /// No compression (raw JSON payload).
    #[default]
    None = 0,
    /// LZ4 fast compression.
    Lz4 = 1,
}

impl CompressionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 4)
}

/// Worker pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of parallel workers.
    pub count: usize,
    /// Thread or isolated execution.
    pub mode: ExecutionMode,
    /// Budget for retained results awaiting collection, in bytes.
    pub memory_budget_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            mode: ExecutionMode::default(),
            memory_budget_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Look-ahead prediction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Ticks precomputed ahead of the playback position.
    pub horizon_frames: usize,
    /// Leading ticks of each batch the background loop waits for.
    pub batch_size: usize,
    /// Interval between background cycles in milliseconds.
    pub cycle_interval_ms: u64,
    /// Allow the tuner to grow the horizon.
    pub adaptive: bool,
    /// Submit an initial horizon when prediction starts.
    pub cache_warming: bool,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            horizon_frames: 60,
            batch_size: 10,
            cycle_interval_ms: 50,
            adaptive: true,
            cache_warming: true,
        }
    }
}

/// Frame cache budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached frames.
    pub max_frames: usize,
    /// Maximum estimated footprint in bytes.
    pub max_memory_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_frames: 300,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Frame time thresholds in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Frame time budget (16.67 ms = 60 fps).
    pub target_frame_time_ms: f64,
    /// How long a frame request waits on the pool before computing synchronously.
    pub fallback_threshold_ms: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            target_frame_time_ms: 1000.0 / 60.0,
            fallback_threshold_ms: 8.0,
        }
    }
}

impl PrecomputeConfig {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: PrecomputeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        if self.prediction.horizon_frames == 0 {
            return Err(ConfigError::InvalidHorizon);
        }
        if self.prediction.batch_size == 0
            || self.prediction.batch_size > self.prediction.horizon_frames
        {
            return Err(ConfigError::InvalidBatchSize {
                batch: self.prediction.batch_size,
                horizon: self.prediction.horizon_frames,
            });
        }
        if self.prediction.cycle_interval_ms == 0 {
            return Err(ConfigError::InvalidCycleInterval);
        }
        if self.cache.max_frames == 0 || self.cache.max_memory_bytes == 0 {
            return Err(ConfigError::InvalidCacheBudget);
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.timing.target_frame_time_ms) || !positive(self.timing.fallback_threshold_ms)
        {
            return Err(ConfigError::InvalidFrameTime);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Worker count must be non-zero")]
    InvalidWorkerCount,
    #[error("Prediction horizon must be non-zero")]
    InvalidHorizon,
    #[error("Prediction batch size {batch} must be in 1..={horizon}")]
    InvalidBatchSize { batch: usize, horizon: usize },
    #[error("Prediction cycle interval must be non-zero")]
    InvalidCycleInterval,
    #[error("Cache frame and memory budgets must be non-zero")]
    InvalidCacheBudget,
    #[error("Frame time thresholds must be positive")]
    InvalidFrameTime,
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = PrecomputeConfig::default();
        config.validate().unwrap();
        assert!(config.workers.count >= 1);
        assert!((config.timing.target_frame_time_ms - 16.666).abs() < 0.01);
    }

    #[test]
    fn test_rejects_batch_larger_than_horizon() {
        let mut config = PrecomputeConfig::default();
        config.prediction.batch_size = config.prediction.horizon_frames + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBatchSize { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = PrecomputeConfig::default();
        config.workers.count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkerCount)
        ));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"workers": {{"count": 2, "mode": "process"}},
                "cache": {{"max_frames": 10}}}}"#
        )
        .unwrap();

        let config = PrecomputeConfig::load(file.path()).unwrap();
        assert_eq!(config.workers.count, 2);
        assert_eq!(config.workers.mode, ExecutionMode::Isolated);
        assert_eq!(config.cache.max_frames, 10);
        assert_eq!(config.cache.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.workers.memory_budget_bytes, 32 * 1024 * 1024);
        assert_eq!(config.prediction.horizon_frames, 60);
        assert_eq!(config.snapshot_compression, CompressionType::None);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            PrecomputeConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
