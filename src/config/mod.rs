use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Admin server bind address (e.g., "0.0.0.0:3000"). Unused by workers.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Worker Prometheus listener address.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Root directory that video file references are resolved against
    #[serde(default = "default_video_storage_path")]
    pub video_storage_path: PathBuf,

    /// Vehicle detection endpoint
    pub detector_url: String,

    /// Bearer token for the detection endpoint
    #[serde(default)]
    pub detector_api_token: Option<String>,

    /// Process every Nth frame
    #[serde(default = "default_frame_stride")]
    pub frame_stride: u64,

    /// Covered fraction of a slot's area that counts as occupied
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f64,

    /// Minimum detection confidence
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Consecutive samples needed to confirm a slot change
    #[serde(default = "default_confirm_frames")]
    pub confirm_frames: u32,

    /// Comma-separated class labels counted as vehicles
    #[serde(default = "default_vehicle_labels")]
    pub vehicle_labels: String,

    /// Sampled frames per checkpoint commit
    #[serde(default = "default_checkpoint_batch_size")]
    pub checkpoint_batch_size: u64,

    /// Start each new video from the lot's last confirmed slot states
    /// instead of all-free
    #[serde(default)]
    pub seed_from_last_event: bool,

    /// Timeout for a single detection call
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,
    #[serde(default = "default_detection_max_retries")]
    pub detection_max_retries: u32,
    #[serde(default = "default_detection_backoff_ms")]
    pub detection_backoff_ms: u64,

    /// Concurrent jobs per worker process
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_video_storage_path() -> PathBuf {
    PathBuf::from("./data/videos")
}

fn default_frame_stride() -> u64 {
    30
}

fn default_overlap_threshold() -> f64 {
    0.3
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_confirm_frames() -> u32 {
    3
}

fn default_vehicle_labels() -> String {
    "car,van,truck,bus,motor,tricycle,awning-tricycle".to_string()
}

fn default_checkpoint_batch_size() -> u64 {
    10
}

fn default_detection_timeout_ms() -> u64 {
    10_000
}

fn default_detection_max_retries() -> u32 {
    2
}

fn default_detection_backoff_ms() -> u64 {
    250
}

fn default_workers() -> usize {
    4
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_secs() -> u64 {
    5
}

fn default_retry_max_delay_secs() -> u64 {
    600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            frame_stride: self.frame_stride,
            overlap_threshold: self.overlap_threshold,
            confidence_threshold: self.confidence_threshold,
            confirm_frames: self.confirm_frames,
            vehicle_labels: self
                .vehicle_labels
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_lowercase)
                .collect(),
            checkpoint_batch_size: self.checkpoint_batch_size,
            seed_from_last_event: self.seed_from_last_event,
        }
    }

    pub fn detection(&self) -> DetectionConfig {
        DetectionConfig {
            timeout: Duration::from_millis(self.detection_timeout_ms),
            max_retries: self.detection_max_retries,
            base_backoff: Duration::from_millis(self.detection_backoff_ms),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers.max(1),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs.max(1)),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts.max(1),
            retry_base_delay: Duration::from_secs(self.retry_base_delay_secs),
            retry_max_delay: Duration::from_secs(self.retry_max_delay_secs),
        }
    }
}

/// Knobs for sampling, slot resolution and debouncing.
#[derive(Debug, Clone, Validate)]
pub struct PipelineConfig {
    /// Process every Nth frame.
    #[garde(range(min = 1))]
    pub frame_stride: u64,

    /// Minimum covered fraction of a slot's area to call it occupied.
    #[garde(range(min = 0.0, max = 1.0))]
    pub overlap_threshold: f64,

    /// Detections below this confidence are ignored.
    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f64,

    /// Consecutive samples needed to confirm a status change.
    #[garde(range(min = 1))]
    pub confirm_frames: u32,

    /// Lowercase class labels counted as vehicles.
    #[garde(length(min = 1))]
    pub vehicle_labels: Vec<String>,

    /// Frames per durable checkpoint.
    #[garde(range(min = 1))]
    pub checkpoint_batch_size: u64,

    /// Seed a fresh run from the lot's latest events. Off by default: each
    /// video otherwise starts with every slot `free`.
    #[garde(skip)]
    pub seed_from_last_event: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_stride: default_frame_stride(),
            overlap_threshold: default_overlap_threshold(),
            confidence_threshold: default_confidence_threshold(),
            confirm_frames: default_confirm_frames(),
            vehicle_labels: default_vehicle_labels()
                .split(',')
                .map(str::to_string)
                .collect(),
            checkpoint_batch_size: default_checkpoint_batch_size(),
            seed_from_last_event: false,
        }
    }
}

/// Timeout and retry policy around each detection call.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(default_detection_timeout_ms()),
            max_retries: default_detection_max_retries(),
            base_backoff: Duration::from_millis(default_detection_backoff_ms()),
        }
    }
}

/// Worker pool, lease and job retry policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease_ttl: Duration::from_secs(default_lease_ttl_secs()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            max_attempts: default_max_attempts(),
            retry_base_delay: Duration::from_secs(default_retry_base_delay_secs()),
            retry_max_delay: Duration::from_secs(default_retry_max_delay_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let config = PipelineConfig {
            overlap_threshold: 1.5,
            frame_stride: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
