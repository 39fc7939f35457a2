//! Shuttle Bridge Simulator - Main Entry Point
//!
//! Serves the bridge protocol over TCP with a simulated accelerometer on
//! I2C bus 0, address 0x18. Its data-ready line is multi-IO pin 21.

use anyhow::Context;
use board::{init_logging, Board, BoardConfig, CommandLoop, TcpTransport};
use bus_manager::{MockBus, SensorTarget};
use shuttle_protocol::{I2cBus, MultiIoPin, PinValue, Transport};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

const ACCEL: SensorTarget = SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 };
const ACCEL_CHIP_ID: [u8; 2] = [0x1E, 0x00];
const ACCEL_DATA_REG: u8 = 0x02;
const ACCEL_DRDY: MultiIoPin = MultiIoPin::ShuttlePin21;
const ACCEL_ODR: Duration = Duration::from_millis(10);

fn simulated_accelerometer() -> MockBus {
    let mock = MockBus::new();
    mock.set_registers(ACCEL, 0x00, &ACCEL_CHIP_ID);
    mock
}

/// Latch a new X/Y/Z sample and pulse the data-ready line
fn update_accelerometer(mock: &MockBus, board: &Board, sample: u32) {
    let phase = sample as f32 * 0.05;
    let axes = [phase.sin(), phase.cos(), 1.0].map(|g| (g * 4096.0) as i16);
    let mut data = [0u8; 6];
    for (chunk, axis) in data.chunks_exact_mut(2).zip(axes) {
        chunk.copy_from_slice(&axis.to_le_bytes());
    }
    mock.set_registers(ACCEL, ACCEL_DATA_REG, &data);

    board.interrupts().set_level(ACCEL_DRDY, PinValue::High);
    board.interrupts().set_level(ACCEL_DRDY, PinValue::Low);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BoardConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level, config.log_json)?;

    info!("=== Shuttle Bridge Simulator v{} ===", env!("CARGO_PKG_VERSION"));

    let mock = simulated_accelerometer();
    let board = Board::new(config.clone(), Box::new(mock.clone())).context("bringing the board up")?;
    let transport = TcpTransport::bind(&config.listen_addr)
        .await
        .context("binding the VCOM socket")?;
    let mut commands = CommandLoop::new(transport, config.interface);
    commands.open().context("opening the host interface")?;

    let mut poll = interval(Duration::from_micros(config.poll_interval_us));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sensor = interval(ACCEL_ODR);
    let mut sample = 0u32;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            accepted = commands.transport_mut().accept(), if !commands.transport().connected(config.interface) => {
                if let Err(e) = accepted {
                    warn!("Host not admitted: {}", e);
                }
            }
            _ = poll.tick() => {
                if let Err(e) = commands.poll(&board) {
                    error!("Command loop error: {}", e);
                }
            }
            _ = sensor.tick() => {
                update_accelerometer(&mock, &board, sample);
                sample = sample.wrapping_add(1);
            }
        }
    }

    board.shutdown();
    commands.close()?;
    info!("Served {} command(s)", commands.handled());
    Ok(())
}
