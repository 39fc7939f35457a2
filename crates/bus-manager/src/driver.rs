//! Electrical Bus Driver Boundary

use crate::manager::{BusSettings, SensorTarget};
use shuttle_protocol::{BridgeError, BridgeResult, BusId, I2cBus, SpiBus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Raw bus primitives provided by the board support package
///
/// Reads are called from trigger context and must complete in bounded time.
pub trait BusDriver: Send {
    /// Apply clock rate and mode to a bus
    fn apply(&mut self, bus: BusId, settings: &BusSettings) -> BridgeResult<()>;

    /// Return a bus to its idle electrical state
    fn release(&mut self, bus: BusId) -> BridgeResult<()>;

    /// Whether the SPI peripheral can shift 16-bit words
    fn supports_16bit_spi(&self) -> bool;

    /// Read `buf.len()` bytes starting at `reg` from an I2C device
    fn i2c_read(&mut self, bus: I2cBus, address: u8, reg: u8, buf: &mut [u8]) -> BridgeResult<()>;

    /// Read `buf.len()` bytes after clocking out `reg` with `cs_pin` asserted
    fn spi_read(&mut self, bus: SpiBus, cs_pin: u8, reg: u16, buf: &mut [u8]) -> BridgeResult<()>;
}

/// Simulated device register file
#[derive(Debug, Clone)]
struct MockDevice {
    registers: Vec<u8>,
    nack: bool,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            registers: vec![0; 256],
            nack: false,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<SensorTarget, MockDevice>,
    applied: HashMap<BusId, BusSettings>,
    supports_16bit: bool,
    reads: usize,
}

/// In-memory bus driver for tests and the simulator
///
/// Clones share the same device table, so a test can keep a handle and
/// change register contents while the manager owns another clone.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// Create a mock driver with 8-bit-only SPI
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock driver whose SPI peripheral supports 16-bit words
    pub fn with_16bit_spi() -> Self {
        let bus = Self::default();
        bus.lock().supports_16bit = true;
        bus
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // The register table has no cross-field invariants, so poisoning is ignored
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a device that acknowledges and reads zeros
    pub fn add_device(&self, target: SensorTarget) {
        self.lock().devices.entry(target).or_default();
    }

    /// Write bytes into a device's register file starting at `reg`
    pub fn set_registers(&self, target: SensorTarget, reg: u8, bytes: &[u8]) {
        let mut state = self.lock();
        let device = state.devices.entry(target).or_default();
        for (offset, byte) in bytes.iter().enumerate() {
            let idx = (usize::from(reg) + offset) % device.registers.len();
            device.registers[idx] = *byte;
        }
    }

    /// Make a device stop (or resume) acknowledging
    pub fn set_nack(&self, target: SensorTarget, nack: bool) {
        if let Some(device) = self.lock().devices.get_mut(&target) {
            device.nack = nack;
        }
    }

    /// Settings last applied to a bus, if it is electrically active
    pub fn applied(&self, bus: BusId) -> Option<BusSettings> {
        self.lock().applied.get(&bus).copied()
    }

    /// Total register reads served
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    fn read_device(&self, target: SensorTarget, reg: u8, buf: &mut [u8]) -> BridgeResult<()> {
        let mut state = self.lock();
        state.reads += 1;
        let device = match state.devices.get(&target) {
            Some(device) if !device.nack => device,
            _ => {
                return Err(BridgeError::Nack {
                    bus: target.bus(),
                    address: target.address(),
                })
            }
        };
        for (offset, slot) in buf.iter_mut().enumerate() {
            *slot = device.registers[(usize::from(reg) + offset) % device.registers.len()];
        }
        Ok(())
    }
}

impl BusDriver for MockBus {
    fn apply(&mut self, bus: BusId, settings: &BusSettings) -> BridgeResult<()> {
        debug!("Mock: applying {:?} to {}", settings, bus);
        self.lock().applied.insert(bus, *settings);
        Ok(())
    }

    fn release(&mut self, bus: BusId) -> BridgeResult<()> {
        self.lock().applied.remove(&bus);
        Ok(())
    }

    fn supports_16bit_spi(&self) -> bool {
        self.lock().supports_16bit
    }

    fn i2c_read(&mut self, bus: I2cBus, address: u8, reg: u8, buf: &mut [u8]) -> BridgeResult<()> {
        self.read_device(SensorTarget::I2c { bus, address }, reg, buf)
    }

    fn spi_read(&mut self, bus: SpiBus, cs_pin: u8, reg: u16, buf: &mut [u8]) -> BridgeResult<()> {
        // Strip the read flag; the register index is the low 7 bits
        let reg = (reg & 0x7F) as u8;
        self.read_device(SensorTarget::Spi { bus, cs_pin }, reg, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reads_register_file() {
        let mut bus = MockBus::new();
        let target = SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 };
        bus.set_registers(target, 0x02, &[0xAA, 0xBB]);

        let mut buf = [0u8; 3];
        bus.i2c_read(I2cBus::Bus0, 0x18, 0x02, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0x00]);
        assert_eq!(bus.read_count(), 1);
    }

    #[test]
    fn test_mock_nack_for_missing_device() {
        let mut bus = MockBus::new();
        let mut buf = [0u8; 1];
        let err = bus.i2c_read(I2cBus::Bus1, 0x68, 0x00, &mut buf).unwrap_err();
        assert!(matches!(err, BridgeError::Nack { address: 0x68, .. }));
    }

    #[test]
    fn test_mock_spi_strips_read_flag() {
        let mut bus = MockBus::new();
        let target = SensorTarget::Spi { bus: SpiBus::Bus0, cs_pin: 0x09 };
        bus.set_registers(target, 0x12, &[0x5A]);

        let mut buf = [0u8; 1];
        bus.spi_read(SpiBus::Bus0, 0x09, 0x92, &mut buf).unwrap();
        assert_eq!(buf[0], 0x5A);
    }
}
