//! Configuration sections.
//!
//! Every component receives its section (behind one `Arc<GatewayConfig>`)
//! at construction; there is no global mutable configuration. Destination
//! records are the only hot-reloadable inputs and they live in the
//! catalog, not here.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;
use crate::queue::backoff::BackoffPolicy;
use crate::queue::QueueSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Stable identifier for this gateway instance, used in worker ids
    pub instance_id: String,
}

impl GatewaySection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::InvalidInstanceId);
        }
        if !self
            .instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidInstanceId);
        }
        Ok(())
    }
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            instance_id: "gantry".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_file_path")]
    pub log_file_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file_path: default_log_file_path(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Server-side statement timeout; caps a hung query
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidDatabase {
                reason: "max_connections must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Root of the object store; holds `storage/` and `tmp/`
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Scratch files older than this are swept by the supervisor
    #[serde(default = "default_scratch_horizon")]
    pub scratch_sweep_horizon_secs: u64,
}

impl StorageSection {
    pub fn sweep_horizon(&self) -> Duration {
        Duration::from_secs(self.scratch_sweep_horizon_secs)
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            scratch_sweep_horizon_secs: default_scratch_horizon(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// Number of forwarder workers in this process
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Jobs claimed per batch
    #[serde(default = "default_claim_batch")]
    pub claim_batch_size: i64,
    /// Lease held per claim; must exceed the heartbeat interval
    #[serde(default = "default_lease_ms")]
    pub lease_duration_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Poll fallback when no notification arrives
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    /// Retryable attempts before dead-letter
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// Idle associations to destinations are closed after this long
    #[serde(default = "default_idle_ms")]
    pub association_idle_timeout_ms: u64,
    /// Treat a refused presentation context as retryable instead of
    /// terminal, for sites that expect destinations to widen support
    #[serde(default)]
    pub context_reject_retryable: bool,
}

impl ForwarderConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn association_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.association_idle_timeout_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
            self.backoff_jitter,
        )
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_attempts: self.max_attempts,
            lease_duration: self.lease_duration(),
            backoff: self.backoff_policy(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidForwarder {
                reason: "workers must be at least 1".to_string(),
            });
        }
        if self.claim_batch_size <= 0 {
            return Err(ConfigError::InvalidForwarder {
                reason: "claim_batch_size must be positive".to_string(),
            });
        }
        if self.max_attempts <= 0 {
            return Err(ConfigError::InvalidForwarder {
                reason: "max_attempts must be positive".to_string(),
            });
        }
        if self.heartbeat_interval_ms >= self.lease_duration_ms {
            return Err(ConfigError::InvalidForwarder {
                reason: "heartbeat_interval_ms must be shorter than lease_duration_ms"
                    .to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::InvalidForwarder {
                reason: "backoff_jitter must be between 0 and 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            claim_batch_size: default_claim_batch(),
            lease_duration_ms: default_lease_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            poll_interval_ms: default_poll_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
            association_idle_timeout_ms: default_idle_ms(),
            context_reject_retryable: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Interval between lease-recovery and scratch-sweep passes
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
    /// How long a draining process waits for in-flight jobs
    #[serde(default = "default_drain_ms")]
    pub drain_deadline_ms: u64,
}

impl SupervisorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_ms(),
            drain_deadline_ms: default_drain_ms(),
        }
    }
}

fn default_log_file_path() -> String {
    "./gantry.log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_scratch_horizon() -> u64 {
    3_600
}

fn default_workers() -> u32 {
    2
}

fn default_claim_batch() -> i64 {
    8
}

fn default_lease_ms() -> u64 {
    60_000
}

fn default_heartbeat_ms() -> u64 {
    20_000
}

fn default_poll_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> i32 {
    8
}

fn default_backoff_base_ms() -> u64 {
    5_000
}

fn default_backoff_cap_ms() -> u64 {
    900_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_idle_ms() -> u64 {
    30_000
}

fn default_sweep_ms() -> u64 {
    30_000
}

fn default_drain_ms() -> u64 {
    30_000
}
