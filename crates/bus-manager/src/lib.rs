//! Sensor Bus Manager
//!
//! Owns the configuration state of the board's I2C and SPI buses and routes
//! register reads to the electrical driver. Streaming channels lease the
//! buses they read from so a bus cannot be reconfigured under them.

mod driver;
mod manager;

pub use driver::{BusDriver, MockBus};
pub use manager::{BusConfig, BusManager, BusSettings, SensorTarget};

/// I2C presence scan
pub mod scan {
    use shuttle_protocol::{BridgeResult, I2cBus};
    use std::time::Instant;
    use tracing::{info, warn};

    /// First and last 7-bit addresses scanned
    pub const FIRST_ADDRESS: u8 = 0x08;
    pub const LAST_ADDRESS: u8 = 0x77;

    /// Walk the address range with `detect` until `deadline`
    ///
    /// `detect` answers whether an address acknowledged; its first error ends
    /// the scan.
    pub fn run<F>(bus: I2cBus, deadline: Instant, mut detect: F) -> BridgeResult<Vec<u8>>
    where
        F: FnMut(u8) -> BridgeResult<bool>,
    {
        let mut found = Vec::new();
        for address in FIRST_ADDRESS..=LAST_ADDRESS {
            if Instant::now() >= deadline {
                warn!("{:?} scan hit its deadline at {:#04X}", bus, address);
                break;
            }
            if detect(address)? {
                found.push(address);
            }
        }
        info!("{:?} scan found {} device(s)", bus, found.len());
        Ok(found)
    }
}
