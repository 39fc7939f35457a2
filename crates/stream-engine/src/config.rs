//! Streaming Channel Descriptors

use bus_manager::SensorTarget;
use serde::{Deserialize, Serialize};
use shuttle_protocol::limits::{MAX_BLOCKS, MAX_CHANNEL_ID, RECORD_CAPACITY, TIMESTAMP_BYTES};
use shuttle_protocol::{BridgeError, BridgeResult, MultiIoPin, PinInterruptMode, SamplingUnit};

/// A contiguous register range read on every sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub start_register: u8,
    /// Bytes read starting at `start_register`, at least one
    pub byte_count: u8,
}

impl Block {
    pub fn new(start_register: u8, byte_count: u8) -> Self {
        Self { start_register, byte_count }
    }
}

/// Pin and trigger policy that paces a channel in interrupt mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptBinding {
    pub pin: MultiIoPin,
    pub mode: PinInterruptMode,
}

/// Per-channel streaming parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Sensor the channel reads from
    pub target: SensorTarget,
    /// Sampling period in `sampling_unit`, used in polling mode
    pub sampling_time: u16,
    pub sampling_unit: SamplingUnit,
    /// Edge source, used in interrupt mode
    pub interrupt: Option<InterruptBinding>,
    /// Prefix every record with a 48-bit microsecond timestamp
    pub timestamp: bool,
}

impl StreamingConfig {
    /// Polling period of the channel in microseconds
    pub fn period_us(&self) -> u32 {
        self.sampling_unit.to_micros(self.sampling_time)
    }
}

/// A validated channel: where to read, what to read and how often
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub channel_id: u8,
    pub config: StreamingConfig,
    pub blocks: Vec<Block>,
}

impl ChannelDescriptor {
    /// Validate a channel description
    ///
    /// Bus configuration is not checked here; the engine does that against
    /// the live bus manager.
    pub fn new(channel_id: u8, config: StreamingConfig, blocks: &[Block]) -> BridgeResult<Self> {
        if channel_id > MAX_CHANNEL_ID {
            return Err(BridgeError::InvalidConfig(format!(
                "channel id {} exceeds {}",
                channel_id, MAX_CHANNEL_ID
            )));
        }
        if blocks.is_empty() || blocks.len() > MAX_BLOCKS {
            return Err(BridgeError::InvalidConfig(format!(
                "channel {} needs 1..={} blocks, got {}",
                channel_id,
                MAX_BLOCKS,
                blocks.len()
            )));
        }
        if let Some(index) = blocks.iter().position(|b| b.byte_count == 0) {
            return Err(BridgeError::InvalidConfig(format!(
                "channel {} block {} reads zero bytes",
                channel_id, index
            )));
        }

        let descriptor = Self {
            channel_id,
            config,
            blocks: blocks.to_vec(),
        };
        if descriptor.record_bytes() > RECORD_CAPACITY {
            return Err(BridgeError::InvalidConfig(format!(
                "channel {} records need {} bytes, capacity is {}",
                channel_id,
                descriptor.record_bytes(),
                RECORD_CAPACITY
            )));
        }
        if config.interrupt.is_none() && config.period_us() == 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "channel {} has neither a sampling period nor an interrupt pin",
                channel_id
            )));
        }

        Ok(descriptor)
    }

    /// Data bytes produced per sample
    pub fn sample_bytes(&self) -> usize {
        self.blocks.iter().map(|b| usize::from(b.byte_count)).sum()
    }

    /// Bytes a successful record occupies, timestamp included
    pub fn record_bytes(&self) -> usize {
        let timestamp = if self.config.timestamp { TIMESTAMP_BYTES } else { 0 };
        self.sample_bytes() + timestamp
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Timer period that lands on every channel's sampling instant
pub(crate) fn base_period_us<I: IntoIterator<Item = u32>>(periods: I) -> u32 {
    periods.into_iter().filter(|&p| p > 0).fold(0, gcd)
}
