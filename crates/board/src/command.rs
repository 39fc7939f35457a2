//! Host Commands
//!
//! Every request a host tool can make over the transport, and the reply it
//! gets. Callbacks cannot cross the wire, so timer handlers and interrupt
//! callbacks stay in-process; the host reaches them through streaming, pin
//! levels and timer stop.

use crate::board::Board;
use bus_manager::SensorTarget;
use ring_buffer::Record;
use serde::{Deserialize, Serialize};
use shuttle_protocol::{
    BridgeError, BridgeResult, I2cBus, I2cMode, MultiIoPin, PinValue, SpiBus, SpiMode, SpiSpeed,
    SpiTransferBits, StreamingMode, TimerInstance,
};
use std::time::Duration;
use stream_engine::{Block, EngineStatus, StreamingConfig};
use tracing::debug;

/// Request sent by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    ConfigI2cBus {
        bus: I2cBus,
        mode: I2cMode,
    },
    ConfigSpiBus {
        bus: SpiBus,
        speed: SpiSpeed,
        mode: SpiMode,
        bits: SpiTransferBits,
    },
    DeconfigI2cBus {
        bus: I2cBus,
    },
    DeconfigSpiBus {
        bus: SpiBus,
    },
    ReadRegisters {
        target: SensorTarget,
        register: u8,
        len: u16,
    },
    ScanI2c {
        bus: I2cBus,
        timeout_ms: u32,
    },
    ConfigureStreaming {
        channel_id: u8,
        config: StreamingConfig,
        blocks: Vec<Block>,
    },
    StartStopStreaming {
        mode: StreamingMode,
        sample_count: u32,
        start: bool,
    },
    /// `channel_id: None` drains every channel
    ReadStreamSamples {
        channel_id: Option<u8>,
        max_records: u16,
    },
    StreamingStatus,
    TimerStop {
        instance: TimerInstance,
    },
    /// Drive a multi-IO pin, raising an edge when the level changes
    SetPinLevel {
        pin: MultiIoPin,
        value: PinValue,
    },
    DetachInterrupt {
        pin: MultiIoPin,
    },
    GetMillis,
    GetMicros,
    /// Return the board to its power-up state
    SoftReset,
}

/// Reply sent to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Registers(Vec<u8>),
    Devices(Vec<u8>),
    Samples { records: Vec<Record>, overflowed: bool },
    Streaming(EngineStatus),
    Millis(u32),
    Micros(u64),
    /// Negative status code plus a description
    Error { code: i16, message: String },
}

impl Response {
    /// Error reply carrying the flat status code of `error`
    pub fn error(error: &BridgeError) -> Self {
        Self::Error {
            code: error.code().as_i16(),
            message: error.to_string(),
        }
    }

    /// Status value of the reply, zero for success
    pub fn status(&self) -> i16 {
        match self {
            Self::Error { code, .. } => *code,
            _ => 0,
        }
    }
}

impl Board {
    /// Run one host command to completion
    pub fn execute(&self, command: Command) -> Response {
        debug!("Executing {:?}", command);
        match self.dispatch(command) {
            Ok(response) => response,
            Err(e) => {
                debug!("Command failed: {}", e);
                Response::error(&e)
            }
        }
    }

    fn dispatch(&self, command: Command) -> BridgeResult<Response> {
        let response = match command {
            Command::ConfigI2cBus { bus, mode } => {
                self.config_i2c_bus(bus, mode)?;
                Response::Done
            }
            Command::ConfigSpiBus { bus, speed, mode, bits } => {
                self.config_word_spi_bus(bus, speed, mode, bits)?;
                Response::Done
            }
            Command::DeconfigI2cBus { bus } => {
                self.deconfig_i2c_bus(bus)?;
                Response::Done
            }
            Command::DeconfigSpiBus { bus } => {
                self.deconfig_spi_bus(bus)?;
                Response::Done
            }
            Command::ReadRegisters { target, register, len } => {
                Response::Registers(self.read_registers(target, register, usize::from(len))?)
            }
            Command::ScanI2c { bus, timeout_ms } => {
                Response::Devices(self.scan_i2c(bus, Duration::from_millis(u64::from(timeout_ms)))?)
            }
            Command::ConfigureStreaming { channel_id, config, blocks } => {
                self.configure_streaming(channel_id, config, &blocks)?;
                Response::Done
            }
            Command::StartStopStreaming { mode, sample_count, start } => {
                self.start_stop_streaming(mode, sample_count, start)?;
                Response::Done
            }
            Command::ReadStreamSamples { channel_id, max_records } => {
                let drain = self.read_stream_samples(channel_id, usize::from(max_records))?;
                Response::Samples {
                    records: drain.records,
                    overflowed: drain.overflowed,
                }
            }
            Command::StreamingStatus => Response::Streaming(self.streaming_status()),
            Command::TimerStop { instance } => {
                self.timer_stop(instance)?;
                Response::Done
            }
            Command::SetPinLevel { pin, value } => {
                self.interrupts().set_level(pin, value);
                Response::Done
            }
            Command::DetachInterrupt { pin } => {
                self.detach_interrupt(pin)?;
                Response::Done
            }
            Command::GetMillis => Response::Millis(self.get_millis()),
            Command::GetMicros => Response::Micros(self.get_micro_sec()),
            Command::SoftReset => {
                self.shutdown();
                Response::Done
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use bus_manager::MockBus;
    use shuttle_protocol::{ErrorCode, SamplingUnit};

    const ACCEL: SensorTarget = SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 };

    fn board() -> Board {
        let mock = MockBus::new();
        mock.set_registers(ACCEL, 0x0F, &[0x33]);
        Board::new(BoardConfig::default(), Box::new(mock)).unwrap()
    }

    #[test]
    fn test_errors_carry_status_codes() {
        let board = board();
        let response = board.execute(Command::ReadRegisters { target: ACCEL, register: 0x0F, len: 1 });
        assert_eq!(response.status(), ErrorCode::I2cBusNotEnabled.as_i16());

        board.execute(Command::ConfigI2cBus { bus: I2cBus::Bus0, mode: I2cMode::Fast });
        let response = board.execute(Command::ConfigI2cBus { bus: I2cBus::Bus0, mode: I2cMode::Fast });
        assert_eq!(response.status(), ErrorCode::I2cConfigExists.as_i16());
    }

    #[test]
    fn test_register_read_and_scan() {
        let board = board();
        assert_eq!(board.execute(Command::ConfigI2cBus { bus: I2cBus::Bus0, mode: I2cMode::Fast }), Response::Done);
        assert_eq!(
            board.execute(Command::ReadRegisters { target: ACCEL, register: 0x0F, len: 1 }),
            Response::Registers(vec![0x33])
        );
        assert_eq!(
            board.execute(Command::ScanI2c { bus: I2cBus::Bus0, timeout_ms: 1_000 }),
            Response::Devices(vec![0x18])
        );
    }

    #[test]
    fn test_streaming_needs_a_bus() {
        let board = board();
        let config = StreamingConfig {
            target: ACCEL,
            sampling_time: 10,
            sampling_unit: SamplingUnit::Milliseconds,
            interrupt: None,
            timestamp: true,
        };
        let response = board.execute(Command::ConfigureStreaming {
            channel_id: 0,
            config,
            blocks: vec![Block::new(0x00, 2)],
        });
        assert_eq!(response.status(), ErrorCode::I2cBusNotEnabled.as_i16());

        let response = board.execute(Command::ReadStreamSamples { channel_id: Some(7), max_records: 1 });
        assert_eq!(response.status(), ErrorCode::Failure.as_i16());
    }
}
