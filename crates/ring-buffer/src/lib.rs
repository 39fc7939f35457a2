//! Streaming Response Buffer
//!
//! A single fixed-capacity byte ring shared by every streaming channel.
//! Records are variable length and tagged with their channel id; when the
//! ring is full the oldest unread record is evicted and an overflow flag is
//! raised for the next drain.

mod buffer;

pub use buffer::{Drain, ResponseBuffer, DEFAULT_CAPACITY, HEADER_LEN, MAX_RECORD_BYTES};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of the bus transaction behind a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// All blocks were read
    Ok,
    /// A block read failed with this status code; the record carries no data
    BusError(i16),
}

/// One formatted sample, tagged by channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub channel_id: u8,
    pub status: RecordStatus,
    /// 48-bit microsecond timestamp, when the channel has timestamps enabled
    pub timestamp_us: Option<u64>,
    /// Concatenated block bytes in block order
    pub data: Vec<u8>,
}

impl Record {
    /// Whether the sample was read successfully
    pub fn is_ok(&self) -> bool {
        self.status == RecordStatus::Ok
    }
}

/// Errors raised by the response buffer
#[derive(Debug, Error)]
pub enum BufferError {
    /// Record does not fit the fixed per-record capacity or the ring itself
    #[error("Record of {size} bytes exceeds the limit of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    /// Record body could not be encoded
    #[error("Record encoding failed: {0}")]
    Encode(String),

    /// Stored record could not be decoded
    #[error("Corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },
}
