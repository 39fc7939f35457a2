//! Bus, Pin and Timer Definitions
//!
//! Numeric discriminants match the values host tools send on the wire.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-facing communication interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommInterface {
    /// Native USB
    Usb,
    /// Virtual COM port
    Vcom,
    /// Bluetooth Low Energy
    Ble,
}

impl Default for CommInterface {
    fn default() -> Self {
        CommInterface::Usb
    }
}

/// I2C bus instances
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum I2cBus {
    Bus0 = 0,
    Bus1 = 1,
}

impl I2cBus {
    pub const ALL: [I2cBus; 2] = [I2cBus::Bus0, I2cBus::Bus1];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for I2cBus {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bus0),
            1 => Ok(Self::Bus1),
            index => Err(BridgeError::InvalidBus { kind: "I2C", index }),
        }
    }
}

/// SPI bus instances
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpiBus {
    /// Sensor interface
    Bus0 = 0,
    /// OIS interface
    Bus1 = 1,
}

impl SpiBus {
    pub const ALL: [SpiBus; 2] = [SpiBus::Bus0, SpiBus::Bus1];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for SpiBus {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bus0),
            1 => Ok(Self::Bus1),
            index => Err(BridgeError::InvalidBus { kind: "SPI", index }),
        }
    }
}

/// A concrete sensor-facing bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusId {
    I2c(I2cBus),
    Spi(SpiBus),
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusId::I2c(bus) => write!(f, "I2C bus {}", *bus as u8),
            BusId::Spi(bus) => write!(f, "SPI bus {}", *bus as u8),
        }
    }
}

/// I2C speed classes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum I2cMode {
    /// 100 kHz
    Standard = 0x00,
    /// 400 kHz
    Fast = 0x01,
    /// 3.4 MHz high-speed
    Speed3_4MHz = 0x02,
    /// 1.7 MHz high-speed
    Speed1_7MHz = 0x03,
}

impl I2cMode {
    /// Bus clock in Hz
    pub fn clock_hz(self) -> u32 {
        match self {
            I2cMode::Standard => 100_000,
            I2cMode::Fast => 400_000,
            I2cMode::Speed3_4MHz => 3_400_000,
            I2cMode::Speed1_7MHz => 1_700_000,
        }
    }
}

/// SPI clock settings (value is the clock divider of a 60 MHz source)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpiSpeed {
    Speed10MHz = 6,
    Speed7_5MHz = 8,
    Speed6MHz = 10,
    Speed5MHz = 12,
    Speed3_75MHz = 16,
    Speed3MHz = 20,
    Speed2_5MHz = 24,
    Speed2MHz = 30,
    Speed1_5MHz = 40,
    Speed1_25MHz = 48,
    Speed1_2MHz = 50,
    Speed1MHz = 60,
    Speed750KHz = 80,
    Speed600KHz = 100,
    Speed500KHz = 120,
    Speed400KHz = 150,
    Speed300KHz = 200,
    Speed250KHz = 240,
}

impl SpiSpeed {
    /// Bus clock in Hz
    pub fn clock_hz(self) -> u32 {
        60_000_000 / self as u32
    }
}

/// SPI clock polarity/phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0
    Mode0 = 0x00,
    /// CPOL=0, CPHA=1
    Mode1 = 0x01,
    /// CPOL=1, CPHA=0
    Mode2 = 0x02,
    /// CPOL=1, CPHA=1
    Mode3 = 0x03,
}

/// SPI word width
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpiTransferBits {
    Bits8 = 8,
    Bits16 = 16,
}

impl Default for SpiTransferBits {
    fn default() -> Self {
        SpiTransferBits::Bits8
    }
}

/// Shuttle-board multi-IO pins
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultiIoPin {
    /// Multi-IO 0
    ShuttlePin9 = 0x00,
    /// Multi-IO 1
    ShuttlePin14 = 0x01,
    /// Multi-IO 2
    ShuttlePin15 = 0x02,
    /// Multi-IO 3
    ShuttlePin16 = 0x03,
    /// Multi-IO 4
    ShuttlePin22 = 0x04,
    /// Multi-IO 5
    ShuttlePin8 = 0x05,
    /// Multi-IO 6
    ShuttlePin20 = 0x06,
    /// Multi-IO 7
    ShuttlePin21 = 0x07,
    /// Multi-IO 8
    ShuttlePin19 = 0x08,
    /// Chip select
    ShuttlePin7 = 0x09,
    /// GPIO0
    MiniPin1_4 = 0x10,
    /// GPIO1
    MiniPin1_5 = 0x11,
    /// GPIO2 / INT1
    MiniPin1_6 = 0x12,
    /// GPIO3 / INT2
    MiniPin1_7 = 0x13,
    /// GPIO4
    MiniPin2_5 = 0x14,
    /// GPIO5
    MiniPin2_6 = 0x15,
    /// Chip select
    MiniPin2_1 = 0x16,
    /// SDO
    MiniPin2_3 = 0x17,
    LedRed = 0x18,
    LedGreen = 0x19,
    LedBlue = 0x1A,
    Button1 = 0x1B,
    Button2 = 0x1C,
    /// GPIO6
    MiniPin2_7 = 0x1D,
    /// GPIO7
    MiniPin2_8 = 0x1E,
    ShuttlePinSdo = 0x1F,
}

impl MultiIoPin {
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MultiIoPin {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MultiIoPin::*;
        let pin = match value {
            0x00 => ShuttlePin9,
            0x01 => ShuttlePin14,
            0x02 => ShuttlePin15,
            0x03 => ShuttlePin16,
            0x04 => ShuttlePin22,
            0x05 => ShuttlePin8,
            0x06 => ShuttlePin20,
            0x07 => ShuttlePin21,
            0x08 => ShuttlePin19,
            0x09 => ShuttlePin7,
            0x10 => MiniPin1_4,
            0x11 => MiniPin1_5,
            0x12 => MiniPin1_6,
            0x13 => MiniPin1_7,
            0x14 => MiniPin2_5,
            0x15 => MiniPin2_6,
            0x16 => MiniPin2_1,
            0x17 => MiniPin2_3,
            0x18 => LedRed,
            0x19 => LedGreen,
            0x1A => LedBlue,
            0x1B => Button1,
            0x1C => Button2,
            0x1D => MiniPin2_7,
            0x1E => MiniPin2_8,
            0x1F => ShuttlePinSdo,
            other => return Err(BridgeError::InvalidConfig(format!("unknown pin {other:#04X}"))),
        };
        Ok(pin)
    }
}

/// Logic level of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinValue {
    Low = 0,
    High = 1,
}

impl From<bool> for PinValue {
    fn from(high: bool) -> Self {
        if high {
            PinValue::High
        } else {
            PinValue::Low
        }
    }
}

/// A single electrical transition on a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Pin level after the transition
    pub fn level_after(self) -> PinValue {
        match self {
            Edge::Rising => PinValue::High,
            Edge::Falling => PinValue::Low,
        }
    }
}

/// Interrupt trigger policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinInterruptMode {
    /// Any state change
    Change,
    /// Low to high
    RisingEdge,
    /// High to low
    FallingEdge,
}

impl PinInterruptMode {
    /// Whether an edge qualifies under this policy
    pub fn accepts(self, edge: Edge) -> bool {
        match self {
            PinInterruptMode::Change => true,
            PinInterruptMode::RisingEdge => edge == Edge::Rising,
            PinInterruptMode::FallingEdge => edge == Edge::Falling,
        }
    }
}

/// Unit of a channel's sampling period
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingUnit {
    Microseconds = 0x01,
    Milliseconds = 0x02,
}

impl SamplingUnit {
    /// Convert a period in this unit to microseconds
    pub fn to_micros(self, period: u16) -> u32 {
        match self {
            SamplingUnit::Microseconds => u32::from(period),
            SamplingUnit::Milliseconds => u32::from(period) * 1000,
        }
    }
}

impl TryFrom<u8> for SamplingUnit {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Microseconds),
            0x02 => Ok(Self::Milliseconds),
            other => Err(BridgeError::InvalidConfig(format!(
                "unknown sampling unit {other:#04X}"
            ))),
        }
    }
}

/// Cadence source for streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamingMode {
    /// Driven by a periodic hardware timer
    Polling,
    /// Driven by pin interrupts
    Interrupt,
}

/// Hardware timer instances
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimerInstance {
    Instance0 = 0,
    Instance1 = 1,
    Instance2 = 2,
}

impl TimerInstance {
    pub const ALL: [TimerInstance; 3] = [
        TimerInstance::Instance0,
        TimerInstance::Instance1,
        TimerInstance::Instance2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for TimerInstance {
    fn default() -> Self {
        TimerInstance::Instance0
    }
}

impl TryFrom<u8> for TimerInstance {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Instance0),
            1 => Ok(Self::Instance1),
            2 => Ok(Self::Instance2),
            other => Err(BridgeError::InvalidTimerInstance(other)),
        }
    }
}
