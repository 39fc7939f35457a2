//! Shuttle Board Bridge Protocol
//!
//! Shared vocabulary for the bridge firmware: the flat status-code taxonomy
//! returned to host tools, the bus/pin/timer enumerations whose numeric
//! values are part of the wire contract, and the transport boundary.

mod error;
mod protocol;
mod transport;

pub use error::{BridgeError, BridgeResult, ErrorCode};
pub use protocol::{
    BusId, CommInterface, Edge, I2cBus, I2cMode, MultiIoPin, PinInterruptMode, PinValue,
    SamplingUnit, SpiBus, SpiMode, SpiSpeed, SpiTransferBits, StreamingMode, TimerInstance,
};
pub use transport::Transport;

/// Streaming limits shared by the engine and the response buffer
pub mod limits {
    /// Highest valid streaming channel id (ids are `0..=MAX_CHANNEL_ID`)
    pub const MAX_CHANNEL_ID: u8 = 2;
    /// Number of channel slots
    pub const CHANNEL_COUNT: usize = MAX_CHANNEL_ID as usize + 1;
    /// Maximum register blocks per channel
    pub const MAX_BLOCKS: usize = 10;
    /// Fixed per-record payload capacity (data bytes + timestamp)
    pub const RECORD_CAPACITY: usize = 1024;
    /// Timestamp width counted against the record capacity (48-bit microseconds)
    pub const TIMESTAMP_BYTES: usize = 6;
    /// Mask applied to microsecond timestamps stored in records
    pub const TIMESTAMP_MASK: u64 = (1 << (TIMESTAMP_BYTES * 8)) - 1;
    /// Default response buffer capacity in bytes
    pub const STREAM_RSP_BUF_SIZE: usize = 1_048_576;
}
