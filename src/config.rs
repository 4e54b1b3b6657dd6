use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Retry/backoff tuning, nested under `retry_config` in the YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Every N consecutive failures, the task enters backoff.
    pub max_retry_before_backoff: u32,
    /// Backoff duration in seconds.
    pub backoff_duration: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        // Matches `app/utils/retry.py`'s `RetryConfig` dataclass defaults.
        Self {
            max_retry_before_backoff: 3,
            backoff_duration: 600,
        }
    }
}

/// The daemon's effectively-constant configuration, loaded once at startup.
///
/// Every field has a default so a partial YAML document is valid, matching
/// `ProcessYAML.get`'s permissive dotted-key lookup in the original tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between admission polls.
    pub check_time: u64,
    /// If true, ignore ownership/foreign-user filtering entirely.
    pub maximize_resource_utilization: bool,
    /// Selector scoring mode: true = pack tight (save), false = avoid
    /// collisions (safe).
    pub memory_save_mode: bool,
    /// Explicit candidate device list. Ignored when `use_all_gpus` is set.
    pub compete_gpus: Vec<u32>,
    /// If true, ignore `compete_gpus` and enumerate all visible devices.
    pub use_all_gpus: bool,
    /// Devices to leave free for other users when computing the quota.
    pub gpu_left: u32,
    /// Quota floor.
    pub min_gpu: u32,
    /// Quota ceiling.
    pub max_gpu: u32,
    pub retry_config: RetryConfig,
    /// Absolute or relative working directory substituted into commands.
    pub work_dir: Option<String>,
    /// Directory the status sink writes its JSON file into.
    pub status_dir: String,
    /// Optional command prefix (e.g. a conda-init equivalent), prepended
    /// to every command instead of being baked into the spawn path.
    pub command_prefix: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_time: 5,
            maximize_resource_utilization: false,
            memory_save_mode: true,
            compete_gpus: Vec::new(),
            use_all_gpus: false,
            gpu_left: 0,
            min_gpu: 1,
            max_gpu: u32::MAX,
            retry_config: RetryConfig::default(),
            work_dir: None,
            status_dir: "/tmp/gpu-scheduler/status".to_string(),
            command_prefix: None,
        }
    }
}

impl Config {
    pub fn check_time_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_time)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fixed values the spec marks as non-configurable.
pub mod fixed {
    use std::time::Duration;

    /// Hard per-command wall timeout (§3).
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
    /// `wait_for_devices` gives up after this long with no acquirable set.
    pub const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);
    /// Backoff sleeps are capped so shutdown stays responsive (§5).
    pub const MAX_BACKOFF_SLEEP: Duration = Duration::from_secs(60);
    /// Sleep between retry attempts once a task is ready again.
    pub const RETRY_SLEEP: Duration = Duration::from_secs(5);
    /// retry_count ceiling before a task becomes permanently failed.
    pub const MAX_RETRY_CEILING: u32 = 100;
    /// Number of samples the selector's stability burst takes.
    pub const SELECTOR_SAMPLE_COUNT: usize = 30;
    /// Interval between selector samples.
    pub const SELECTOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
    /// Devices need at least this much free memory to count toward
    /// the admission controller's `available` figure.
    pub const ADMISSION_MIN_FREE_GIB: f64 = 1.0;
}
