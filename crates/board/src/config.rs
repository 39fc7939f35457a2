//! Board Configuration

use crate::error::{BoardError, BoardResult};
use ring_buffer::MAX_RECORD_BYTES;
use serde::{Deserialize, Serialize};
use shuttle_protocol::limits::STREAM_RSP_BUF_SIZE;
use shuttle_protocol::{CommInterface, TimerInstance};
use std::path::Path;
use stream_engine::EngineConfig;

/// Prefix of environment overrides, e.g. `SHUTTLE_LOG_LEVEL=debug`
pub const ENV_PREFIX: &str = "SHUTTLE";

/// Board configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Socket the emulated VCOM interface listens on
    pub listen_addr: String,

    /// Host interface served by the command loop
    pub interface: CommInterface,

    /// Response buffer size in bytes
    pub response_buffer_bytes: usize,

    /// Timer instance reserved for polling-mode streaming (0..=2)
    pub streaming_timer: u8,

    /// Foreground command loop cadence (microseconds)
    pub poll_interval_us: u64,

    /// Tracing level filter
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5555".to_string(),
            interface: CommInterface::Vcom,
            response_buffer_bytes: STREAM_RSP_BUF_SIZE,
            streaming_timer: 0,
            poll_interval_us: 1_000,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl BoardConfig {
    /// Load defaults, then `path` if given and present, then `SHUTTLE_*` variables
    pub fn load(path: Option<&Path>) -> BoardResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges the type system does not
    pub fn validate(&self) -> BoardResult<()> {
        self.timer_instance()?;
        if self.response_buffer_bytes < MAX_RECORD_BYTES {
            return Err(BoardError::InvalidSetting {
                field: "response_buffer_bytes",
                reason: format!("must hold one full record ({} bytes)", MAX_RECORD_BYTES),
            });
        }
        if self.poll_interval_us == 0 {
            return Err(BoardError::InvalidSetting {
                field: "poll_interval_us",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Timer instance reserved for streaming
    pub fn timer_instance(&self) -> BoardResult<TimerInstance> {
        TimerInstance::try_from(self.streaming_timer).map_err(|e| BoardError::InvalidSetting {
            field: "streaming_timer",
            reason: e.to_string(),
        })
    }

    /// Streaming engine parameters derived from this configuration
    pub fn engine_config(&self) -> BoardResult<EngineConfig> {
        Ok(EngineConfig {
            timer: self.timer_instance()?,
            buffer_capacity: self.response_buffer_bytes,
        })
    }
}
