//! Host Transport Boundary
//!
//! The bridge talks to exactly one host tool over USB, a virtual COM port or
//! BLE. Radio stacks and USB descriptors live behind this trait.

use crate::error::BridgeResult;
use crate::protocol::CommInterface;

/// Byte-level transport to the host tool
///
/// Implementations must never block in [`Transport::read`]: it returns the
/// bytes already available, possibly zero.
pub trait Transport {
    /// Open the interface
    fn open(&mut self, intf: CommInterface) -> BridgeResult<()>;

    /// Close the interface
    fn close(&mut self, intf: CommInterface) -> BridgeResult<()>;

    /// Number of bytes ready to be read
    fn available(&mut self, intf: CommInterface) -> usize;

    /// Whether a host is attached
    fn connected(&self, intf: CommInterface) -> bool;

    /// Read up to `buffer.len()` bytes, returning how many were copied
    fn read(&mut self, intf: CommInterface, buffer: &mut [u8]) -> BridgeResult<usize>;

    /// Queue bytes for the host
    fn write(&mut self, intf: CommInterface, buffer: &[u8]) -> BridgeResult<()>;

    /// Push queued bytes out
    fn flush(&mut self, intf: CommInterface) -> BridgeResult<()>;
}
