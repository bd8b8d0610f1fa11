use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a range request behaves when its bytes are not cached yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UncachedSeekPolicy {
    /// Hold the request until the whole range is on disk
    Strict,
    /// Serve whatever is cached and stall the pull until more bytes land
    #[default]
    Relaxed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Flush the write buffer to disk once it holds this many KiB
    pub flush_threshold_kb: u32,

    /// Largest single read handed to a consumer, in KiB
    pub read_chunk_kb: u32,

    /// Retry budget per request kind (negotiation and download count separately)
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds
    pub retry_base_delay_ms: u64,

    pub uncached_seek_policy: UncachedSeekPolicy,

    /// Compare the expected content length against the final cache size
    pub verify_size: bool,

    /// Reject completed downloads smaller than this
    pub minimum_file_size: Option<u64>,

    /// Fail before the body transfer when the disk cannot hold the resource
    pub track_free_space: bool,

    /// Connect/header timeout for outbound requests in seconds
    pub request_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            flush_threshold_kb: 1024, // 1 MiB
            read_chunk_kb: 512,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            uncached_seek_policy: UncachedSeekPolicy::Relaxed,
            verify_size: true,
            minimum_file_size: None,
            track_free_space: true,
            request_timeout_secs: 30,
        }
    }
}

static INSTALLED_DEFAULT: OnceCell<CoordinatorConfig> = OnceCell::new();

impl CoordinatorConfig {
    /// Install the process-wide default. Only the first call succeeds.
    pub fn install_default(config: CoordinatorConfig) -> Result<()> {
        config.validate()?;
        INSTALLED_DEFAULT
            .set(config)
            .map_err(|_| anyhow::anyhow!("Default coordinator config already installed"))
    }

    /// The installed default, or the built-in one if nothing was installed
    pub fn installed_default() -> CoordinatorConfig {
        INSTALLED_DEFAULT.get().cloned().unwrap_or_default()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold_kb == 0 {
            return Err(anyhow::anyhow!("flush_threshold_kb must be greater than 0"));
        }

        if self.read_chunk_kb == 0 {
            return Err(anyhow::anyhow!("read_chunk_kb must be greater than 0"));
        }

        if self.retry_base_delay_ms == 0 {
            return Err(anyhow::anyhow!(
                "retry_base_delay_ms must be greater than 0"
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "request_timeout_secs must be greater than 0"
            ));
        }

        Ok(())
    }

    pub fn flush_threshold_bytes(&self) -> usize {
        self.flush_threshold_kb as usize * 1024
    }

    pub fn read_chunk_bytes(&self) -> u64 {
        self.read_chunk_kb as u64 * 1024
    }

    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << exponent))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
