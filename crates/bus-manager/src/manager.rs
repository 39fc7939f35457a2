//! Bus Configuration State

use crate::driver::BusDriver;
use crate::scan;
use serde::{Deserialize, Serialize};
use shuttle_protocol::{
    BridgeError, BridgeResult, BusId, I2cBus, I2cMode, SpiBus, SpiMode, SpiSpeed, SpiTransferBits,
};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Electrical parameters of a configured bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusSettings {
    I2c { mode: I2cMode },
    Spi { speed: SpiSpeed, mode: SpiMode, bits: SpiTransferBits },
}

/// A sensor reachable on one of the buses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorTarget {
    /// I2C device by 7-bit address
    I2c { bus: I2cBus, address: u8 },
    /// SPI device by chip-select pin
    Spi { bus: SpiBus, cs_pin: u8 },
}

impl SensorTarget {
    /// Bus the target sits on
    pub fn bus(&self) -> BusId {
        match self {
            SensorTarget::I2c { bus, .. } => BusId::I2c(*bus),
            SensorTarget::Spi { bus, .. } => BusId::Spi(*bus),
        }
    }

    /// Device address or chip-select pin
    pub fn address(&self) -> u8 {
        match self {
            SensorTarget::I2c { address, .. } => *address,
            SensorTarget::Spi { cs_pin, .. } => *cs_pin,
        }
    }
}

/// Configuration of a single bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub bus: BusId,
    pub settings: BusSettings,
}

#[derive(Debug, Default, Clone, Copy)]
struct BusSlot {
    config: Option<BusConfig>,
    /// Armed streaming channels reading from this bus
    leases: u32,
}

/// Owner of all I2C/SPI configuration state
pub struct BusManager {
    driver: Box<dyn BusDriver>,
    i2c: [BusSlot; 2],
    spi: [BusSlot; 2],
}

impl BusManager {
    /// Create a manager with every bus deconfigured
    pub fn new(driver: Box<dyn BusDriver>) -> Self {
        Self {
            driver,
            i2c: [BusSlot::default(); 2],
            spi: [BusSlot::default(); 2],
        }
    }

    fn slot(&self, bus: BusId) -> &BusSlot {
        match bus {
            BusId::I2c(b) => &self.i2c[b.index()],
            BusId::Spi(b) => &self.spi[b.index()],
        }
    }

    fn slot_mut(&mut self, bus: BusId) -> &mut BusSlot {
        match bus {
            BusId::I2c(b) => &mut self.i2c[b.index()],
            BusId::Spi(b) => &mut self.spi[b.index()],
        }
    }

    /// Configure an I2C bus
    pub fn config_i2c_bus(&mut self, bus: I2cBus, mode: I2cMode) -> BridgeResult<()> {
        self.configure(BusId::I2c(bus), BusSettings::I2c { mode })
    }

    /// Configure an SPI bus for 8-bit transfers
    pub fn config_spi_bus(&mut self, bus: SpiBus, speed: SpiSpeed, mode: SpiMode) -> BridgeResult<()> {
        self.config_word_spi_bus(bus, speed, mode, SpiTransferBits::Bits8)
    }

    /// Configure an SPI bus with an explicit word width
    pub fn config_word_spi_bus(
        &mut self,
        bus: SpiBus,
        speed: SpiSpeed,
        mode: SpiMode,
        bits: SpiTransferBits,
    ) -> BridgeResult<()> {
        let id = BusId::Spi(bus);
        if bits == SpiTransferBits::Bits16 && !self.driver.supports_16bit_spi() {
            warn!("{} rejected 16-bit transfers: hardware supports 8-bit words only", id);
            return Err(BridgeError::Spi16BitNotConfigured(id));
        }
        self.configure(id, BusSettings::Spi { speed, mode, bits })
    }

    fn configure(&mut self, bus: BusId, settings: BusSettings) -> BridgeResult<()> {
        if self.slot(bus).config.is_some() {
            return Err(BridgeError::BusAlreadyConfigured(bus));
        }

        self.driver.apply(bus, &settings).map_err(|e| BridgeError::BusConfigFailed {
            bus,
            reason: e.to_string(),
        })?;

        self.slot_mut(bus).config = Some(BusConfig { bus, settings });
        info!("{} configured: {:?}", bus, settings);
        Ok(())
    }

    /// Deconfigure an I2C bus
    pub fn deconfig_i2c_bus(&mut self, bus: I2cBus) -> BridgeResult<()> {
        self.deconfigure(BusId::I2c(bus))
    }

    /// Deconfigure an SPI bus
    pub fn deconfig_spi_bus(&mut self, bus: SpiBus) -> BridgeResult<()> {
        self.deconfigure(BusId::Spi(bus))
    }

    fn deconfigure(&mut self, bus: BusId) -> BridgeResult<()> {
        let slot = *self.slot(bus);
        if slot.config.is_none() {
            return Err(BridgeError::BusNotConfigured(bus));
        }
        if slot.leases > 0 {
            return Err(BridgeError::BusInUse(bus));
        }

        self.driver.release(bus).map_err(|e| BridgeError::BusConfigFailed {
            bus,
            reason: e.to_string(),
        })?;

        self.slot_mut(bus).config = None;
        info!("{} deconfigured", bus);
        Ok(())
    }

    /// Deconfigure every idle bus (teardown)
    pub fn deconfig_all(&mut self) {
        let buses = I2cBus::ALL
            .iter()
            .map(|b| BusId::I2c(*b))
            .chain(SpiBus::ALL.iter().map(|b| BusId::Spi(*b)));
        for bus in buses {
            if self.is_configured(bus) {
                if let Err(e) = self.deconfigure(bus) {
                    warn!("Teardown left {} configured: {}", bus, e);
                }
            }
        }
    }

    /// Whether a bus is configured
    pub fn is_configured(&self, bus: BusId) -> bool {
        self.slot(bus).config.is_some()
    }

    /// Current configuration of a bus
    pub fn config(&self, bus: BusId) -> Option<BusConfig> {
        self.slot(bus).config
    }

    /// Pin a configured bus for an armed streaming channel
    pub fn claim(&mut self, bus: BusId) -> BridgeResult<()> {
        let slot = self.slot_mut(bus);
        if slot.config.is_none() {
            return Err(BridgeError::BusNotConfigured(bus));
        }
        slot.leases += 1;
        debug!("{} claimed ({} leases)", bus, slot.leases);
        Ok(())
    }

    /// Drop one lease taken with [`BusManager::claim`]
    pub fn release(&mut self, bus: BusId) {
        let slot = self.slot_mut(bus);
        slot.leases = slot.leases.saturating_sub(1);
        debug!("{} released ({} leases)", bus, slot.leases);
    }

    /// Number of active leases on a bus
    pub fn leases(&self, bus: BusId) -> u32 {
        self.slot(bus).leases
    }

    /// Read `buf.len()` bytes from a sensor starting at `reg`
    pub fn read_block(&mut self, target: SensorTarget, reg: u8, buf: &mut [u8]) -> BridgeResult<()> {
        let config = self
            .config(target.bus())
            .ok_or(BridgeError::BusNotConfigured(target.bus()))?;

        match (target, config.settings) {
            (SensorTarget::I2c { bus, address }, _) => self.driver.i2c_read(bus, address, reg, buf),
            (SensorTarget::Spi { bus, cs_pin }, BusSettings::Spi { bits, .. }) => {
                let addr = match bits {
                    SpiTransferBits::Bits8 => u16::from(reg | 0x80),
                    SpiTransferBits::Bits16 => 0x8000 | u16::from(reg),
                };
                self.driver.spi_read(bus, cs_pin, addr, buf)
            }
            (SensorTarget::Spi { .. }, BusSettings::I2c { .. }) => {
                Err(BridgeError::Failure(format!("{} holds I2C settings", target.bus())))
            }
        }
    }

    /// Whether a device acknowledges `address` on a configured I2C bus
    ///
    /// A NACK means "no device at this address"; any other transfer error is
    /// reported as an error.
    pub fn detect_i2c(&mut self, bus: I2cBus, address: u8) -> BridgeResult<bool> {
        let id = BusId::I2c(bus);
        if !self.is_configured(id) {
            return Err(BridgeError::BusNotConfigured(id));
        }
        let mut scratch = [0u8; 1];
        match self.driver.i2c_read(bus, address, 0x00, &mut scratch) {
            Ok(()) => Ok(true),
            Err(BridgeError::Nack { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check every 7-bit address on an I2C bus until `deadline`
    ///
    /// An unconfigured bus is an error, not an empty scan.
    pub fn scan_i2c(&mut self, bus: I2cBus, deadline: Instant) -> BridgeResult<Vec<u8>> {
        let id = BusId::I2c(bus);
        if !self.is_configured(id) {
            return Err(BridgeError::BusNotConfigured(id));
        }
        scan::run(bus, deadline, |address| self.detect_i2c(bus, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockBus;
    use shuttle_protocol::ErrorCode;
    use std::time::Duration;

    fn manager() -> (BusManager, MockBus) {
        let mock = MockBus::new();
        (BusManager::new(Box::new(mock.clone())), mock)
    }

    #[test]
    fn test_configure_and_deconfigure_i2c() {
        let (mut buses, mock) = manager();
        let id = BusId::I2c(I2cBus::Bus0);

        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();
        assert!(buses.is_configured(id));
        assert_eq!(mock.applied(id), Some(BusSettings::I2c { mode: I2cMode::Fast }));

        buses.deconfig_i2c_bus(I2cBus::Bus0).unwrap();
        assert!(!buses.is_configured(id));
        assert_eq!(mock.applied(id), None);
    }

    #[test]
    fn test_double_configure_is_rejected() {
        let (mut buses, _) = manager();
        buses.config_i2c_bus(I2cBus::Bus1, I2cMode::Standard).unwrap();
        let err = buses.config_i2c_bus(I2cBus::Bus1, I2cMode::Fast).unwrap_err();
        assert_eq!(err.code(), ErrorCode::I2cConfigExists);
        // The original settings stay in force
        assert_eq!(
            buses.config(BusId::I2c(I2cBus::Bus1)).unwrap().settings,
            BusSettings::I2c { mode: I2cMode::Standard }
        );
    }

    #[test]
    fn test_deconfigure_unconfigured_bus() {
        let (mut buses, _) = manager();
        let err = buses.deconfig_spi_bus(SpiBus::Bus0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SpiBusNotEnabled);
    }

    #[test]
    fn test_16bit_spi_rejected_on_8bit_hardware() {
        let (mut buses, _) = manager();
        let err = buses
            .config_word_spi_bus(SpiBus::Bus0, SpiSpeed::Speed5MHz, SpiMode::Mode0, SpiTransferBits::Bits16)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Spi16BitNotConfigured);
        assert!(!buses.is_configured(BusId::Spi(SpiBus::Bus0)));

        buses
            .config_word_spi_bus(SpiBus::Bus0, SpiSpeed::Speed5MHz, SpiMode::Mode0, SpiTransferBits::Bits8)
            .unwrap();
    }

    #[test]
    fn test_16bit_spi_on_capable_hardware() {
        let mock = MockBus::with_16bit_spi();
        let mut buses = BusManager::new(Box::new(mock));
        buses
            .config_word_spi_bus(SpiBus::Bus1, SpiSpeed::Speed1MHz, SpiMode::Mode3, SpiTransferBits::Bits16)
            .unwrap();
        assert!(buses.is_configured(BusId::Spi(SpiBus::Bus1)));
    }

    #[test]
    fn test_leased_bus_cannot_be_deconfigured() {
        let (mut buses, _) = manager();
        let id = BusId::I2c(I2cBus::Bus0);
        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();
        buses.claim(id).unwrap();

        let err = buses.deconfig_i2c_bus(I2cBus::Bus0).unwrap_err();
        assert_eq!(err, BridgeError::BusInUse(id));

        buses.release(id);
        buses.deconfig_i2c_bus(I2cBus::Bus0).unwrap();
    }

    #[test]
    fn test_claim_requires_configured_bus() {
        let (mut buses, _) = manager();
        let id = BusId::Spi(SpiBus::Bus1);
        assert_eq!(buses.claim(id).unwrap_err(), BridgeError::BusNotConfigured(id));
    }

    #[test]
    fn test_read_block_routes_to_device() {
        let (mut buses, mock) = manager();
        let target = SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 };
        mock.set_registers(target, 0x00, &[0x12, 0x34]);

        let mut buf = [0u8; 2];
        let err = buses.read_block(target, 0x00, &mut buf).unwrap_err();
        assert_eq!(err.code(), ErrorCode::I2cBusNotEnabled);

        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();
        buses.read_block(target, 0x00, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34]);
    }

    #[test]
    fn test_scan_reports_present_devices() {
        let (mut buses, mock) = manager();
        mock.add_device(SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 });
        mock.add_device(SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x68 });
        mock.add_device(SensorTarget::I2c { bus: I2cBus::Bus1, address: 0x76 });
        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(buses.scan_i2c(I2cBus::Bus0, deadline).unwrap(), vec![0x18, 0x68]);
    }

    #[test]
    fn test_scan_distinguishes_unconfigured_bus() {
        let (mut buses, _) = manager();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = buses.scan_i2c(I2cBus::Bus1, deadline).unwrap_err();
        assert_eq!(err.code(), ErrorCode::I2cBusNotEnabled);
    }

    #[test]
    fn test_scan_stops_at_deadline() {
        let (mut buses, mock) = manager();
        mock.add_device(SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 });
        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();

        let found = buses.scan_i2c(I2cBus::Bus0, Instant::now()).unwrap();
        assert!(found.is_empty());
        assert_eq!(mock.read_count(), 0);
    }

    #[test]
    fn test_detect_reports_presence() {
        let (mut buses, mock) = manager();
        mock.add_device(SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 });
        assert_eq!(
            buses.detect_i2c(I2cBus::Bus0, 0x18).unwrap_err(),
            BridgeError::BusNotConfigured(BusId::I2c(I2cBus::Bus0))
        );

        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();
        assert!(buses.detect_i2c(I2cBus::Bus0, 0x18).unwrap());
        assert!(!buses.detect_i2c(I2cBus::Bus0, 0x19).unwrap());
    }
}
