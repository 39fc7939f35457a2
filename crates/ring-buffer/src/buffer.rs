//! Fixed-Capacity Record Ring
//!
//! Layout of a stored record (all indices wrap at `capacity`):
//!
//! ```text
//! [body_len: u16 LE][channel_id: u8][flags: u8][postcard body ...]
//! ```
//!
//! A filtered drain may take records out of the middle of the ring; those
//! are tombstoned with `FLAG_CONSUMED` and their bytes are reclaimed once
//! they reach the tail.

use crate::{BufferError, Record, RecordStatus};
use serde::{Deserialize, Serialize};
use shuttle_protocol::limits::{RECORD_CAPACITY, STREAM_RSP_BUF_SIZE};

/// Default buffer capacity (1 MiB)
pub const DEFAULT_CAPACITY: usize = STREAM_RSP_BUF_SIZE;

/// Bytes of fixed header in front of every record body
pub const HEADER_LEN: usize = 4;

/// Largest encoded body: payload plus postcard framing of status, timestamp and length
const MAX_BODY_BYTES: usize = RECORD_CAPACITY + 24;

/// Largest footprint of one record in the ring
pub const MAX_RECORD_BYTES: usize = HEADER_LEN + MAX_BODY_BYTES;

const FLAG_CONSUMED: u8 = 0x01;

#[derive(Serialize)]
struct BodyRef<'a> {
    status: RecordStatus,
    timestamp_us: Option<u64>,
    data: &'a [u8],
}

#[derive(Deserialize)]
struct Body {
    status: RecordStatus,
    timestamp_us: Option<u64>,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    body_len: usize,
    channel_id: u8,
    flags: u8,
}

impl Header {
    fn footprint(&self) -> usize {
        HEADER_LEN + self.body_len
    }

    fn is_consumed(&self) -> bool {
        self.flags & FLAG_CONSUMED != 0
    }
}

/// Result of a drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drain {
    /// Records in FIFO order
    pub records: Vec<Record>,
    /// Unread records were evicted since the previous drain
    pub overflowed: bool,
}

/// Bounded byte ring of tagged records
pub struct ResponseBuffer {
    /// Pre-allocated storage
    storage: Box<[u8]>,
    /// Write position
    head: usize,
    /// Start of the oldest stored record
    tail: usize,
    /// Bytes between tail and head
    used: usize,
    /// Stored records not yet drained
    unread: usize,
    /// Sticky overflow indicator, cleared by the next drain
    overflow: bool,
    /// Total records written (for statistics)
    total_written: usize,
    /// Total unread records evicted (for statistics)
    total_evicted: usize,
}

impl ResponseBuffer {
    /// Create a ring with `capacity` bytes of storage
    ///
    /// The capacity is raised to [`MAX_RECORD_BYTES`] if smaller, so any
    /// record the engine accepts can always be stored.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_RECORD_BYTES);
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            used: 0,
            unread: 0,
            overflow: false,
            total_written: 0,
            total_evicted: 0,
        }
    }

    /// Create a ring with the default 1 MiB capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Append a record, evicting the oldest records until it fits
    ///
    /// Returns how many unread records were evicted to make room.
    pub fn push(&mut self, record: &Record) -> Result<usize, BufferError> {
        if record.data.len() > RECORD_CAPACITY {
            return Err(BufferError::RecordTooLarge {
                size: record.data.len(),
                limit: RECORD_CAPACITY,
            });
        }

        let mut body = [0u8; MAX_BODY_BYTES];
        let encoded = postcard::to_slice(
            &BodyRef {
                status: record.status,
                timestamp_us: record.timestamp_us,
                data: &record.data,
            },
            &mut body,
        )
        .map_err(|e| BufferError::Encode(e.to_string()))?;
        let body_len = encoded.len();

        let footprint = HEADER_LEN + body_len;
        if footprint > self.capacity() {
            return Err(BufferError::RecordTooLarge {
                size: footprint,
                limit: self.capacity(),
            });
        }

        let mut evicted = 0;
        while self.capacity() - self.used < footprint {
            if self.evict_oldest() {
                evicted += 1;
            }
        }

        let len = (body_len as u16).to_le_bytes();
        let header = [len[0], len[1], record.channel_id, 0];
        let head = self.head;
        self.write_at(head, &header);
        self.write_at(head + HEADER_LEN, &body[..body_len]);

        self.head = (head + footprint) % self.capacity();
        self.used += footprint;
        self.unread += 1;
        self.total_written += 1;
        Ok(evicted)
    }

    /// Drain up to `max_records` unread records whose tag matches `channel`
    /// (every channel when `None`), oldest first
    ///
    /// Never blocks; an empty ring yields an empty drain. The overflow flag is
    /// reported by every drain and cleared by any drain that may deliver
    /// records (`max_records > 0`).
    ///
    /// A record that fails to decode ends the drain. When it is the first
    /// match it is dropped and reported as [`BufferError::Corrupt`];
    /// otherwise the records before it are returned and the next drain
    /// reports it.
    pub fn read(&mut self, channel: Option<u8>, max_records: usize) -> Result<Drain, BufferError> {
        let mut records = Vec::new();
        let mut corrupt = None;

        let mut pos = self.tail;
        let mut remaining = self.used;
        while remaining > 0 && records.len() < max_records {
            let header = self.header_at(pos);
            let matches = channel.map_or(true, |id| id == header.channel_id);
            if !header.is_consumed() && matches {
                match self.decode_at(pos, &header) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        if records.is_empty() {
                            corrupt = Some(e);
                        } else {
                            break;
                        }
                    }
                }
                self.mark_consumed(pos);
                self.unread -= 1;
                if corrupt.is_some() {
                    break;
                }
            }
            pos = (pos + header.footprint()) % self.capacity();
            remaining -= header.footprint();
        }

        self.reclaim();
        if let Some(e) = corrupt {
            return Err(e);
        }
        let overflowed = if max_records > 0 {
            std::mem::take(&mut self.overflow)
        } else {
            self.overflow
        };
        Ok(Drain { records, overflowed })
    }

    /// Number of unread records, optionally for one channel only
    pub fn unread(&self, channel: Option<u8>) -> usize {
        let Some(id) = channel else { return self.unread };

        let mut count = 0;
        let mut pos = self.tail;
        let mut remaining = self.used;
        while remaining > 0 {
            let header = self.header_at(pos);
            if !header.is_consumed() && header.channel_id == id {
                count += 1;
            }
            pos = (pos + header.footprint()) % self.capacity();
            remaining -= header.footprint();
        }
        count
    }

    /// Get the number of unread records
    pub fn len(&self) -> usize {
        self.unread
    }

    /// Check if no unread records remain
    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    /// Get the buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently occupied, tombstones included
    pub fn bytes_used(&self) -> usize {
        self.used
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.used as f64 / self.capacity() as f64
    }

    /// Whether an overflow is pending for the next drain
    pub fn overflow_pending(&self) -> bool {
        self.overflow
    }

    /// Get total records written (for statistics)
    pub fn total_written(&self) -> usize {
        self.total_written
    }

    /// Get total unread records lost to eviction (for statistics)
    pub fn total_evicted(&self) -> usize {
        self.total_evicted
    }

    /// Drop every stored record and the overflow flag
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.used = 0;
        self.unread = 0;
        self.overflow = false;
    }

    /// Remove the record at the tail; returns whether it was still unread
    fn evict_oldest(&mut self) -> bool {
        let header = self.header_at(self.tail);
        self.tail = (self.tail + header.footprint()) % self.capacity();
        self.used -= header.footprint();
        if header.is_consumed() {
            return false;
        }
        self.unread -= 1;
        self.overflow = true;
        self.total_evicted += 1;
        true
    }

    /// Advance the tail past drained records
    fn reclaim(&mut self) {
        while self.used > 0 {
            let header = self.header_at(self.tail);
            if !header.is_consumed() {
                break;
            }
            self.tail = (self.tail + header.footprint()) % self.capacity();
            self.used -= header.footprint();
        }
        if self.used == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    fn header_at(&self, pos: usize) -> Header {
        let mut raw = [0u8; HEADER_LEN];
        self.read_at(pos, &mut raw);
        Header {
            body_len: usize::from(u16::from_le_bytes([raw[0], raw[1]])),
            channel_id: raw[2],
            flags: raw[3],
        }
    }

    fn mark_consumed(&mut self, pos: usize) {
        let idx = (pos + 3) % self.capacity();
        self.storage[idx] |= FLAG_CONSUMED;
    }

    fn decode_at(&self, pos: usize, header: &Header) -> Result<Record, BufferError> {
        let mut body = vec![0u8; header.body_len];
        self.read_at(pos + HEADER_LEN, &mut body);
        let body: Body = postcard::from_bytes(&body).map_err(|e| BufferError::Corrupt {
            offset: pos,
            reason: e.to_string(),
        })?;
        Ok(Record {
            channel_id: header.channel_id,
            status: body.status,
            timestamp_us: body.timestamp_us,
            data: body.data,
        })
    }

    fn write_at(&mut self, pos: usize, bytes: &[u8]) {
        let cap = self.capacity();
        let start = pos % cap;
        let first = bytes.len().min(cap - start);
        self.storage[start..start + first].copy_from_slice(&bytes[..first]);
        self.storage[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    }

    fn read_at(&self, pos: usize, out: &mut [u8]) {
        let cap = self.capacity();
        let start = pos % cap;
        let first = out.len().min(cap - start);
        let len = out.len();
        out[..first].copy_from_slice(&self.storage[start..start + first]);
        out[first..].copy_from_slice(&self.storage[..len - first]);
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
