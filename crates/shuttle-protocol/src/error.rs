//! Bridge Status Codes and Error Types

use crate::protocol::{BusId, MultiIoPin, TimerInstance};
use thiserror::Error;

/// Flat status-code taxonomy returned to host tools.
///
/// The numeric values are a wire contract and must not change.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    Failure = -1,
    CommIoError = -2,
    CommInitFailed = -3,
    UnableOpenDevice = -4,
    DeviceNotFound = -5,
    UnableClaimInterface = -6,
    MemoryAllocation = -7,
    NotSupported = -8,
    NullPointer = -9,
    CommWrongResponse = -10,
    Spi16BitNotConfigured = -11,
    SpiInvalidBusInterface = -12,
    SpiConfigExists = -13,
    SpiBusNotEnabled = -14,
    SpiConfigFailed = -15,
    I2cInvalidBusInterface = -16,
    I2cBusNotEnabled = -17,
    I2cConfigFailed = -18,
    I2cConfigExists = -19,
    TimerInitFailed = -20,
    TimerInvalidInstance = -21,
    EepromResetFailed = -22,
    EepromReadFailed = -23,
    InitFailed = -24,
}

impl ErrorCode {
    /// Raw status value as sent to the host
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Whether this code reports success
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => Self::Success,
            -2 => Self::CommIoError,
            -3 => Self::CommInitFailed,
            -4 => Self::UnableOpenDevice,
            -5 => Self::DeviceNotFound,
            -6 => Self::UnableClaimInterface,
            -7 => Self::MemoryAllocation,
            -8 => Self::NotSupported,
            -9 => Self::NullPointer,
            -10 => Self::CommWrongResponse,
            -11 => Self::Spi16BitNotConfigured,
            -12 => Self::SpiInvalidBusInterface,
            -13 => Self::SpiConfigExists,
            -14 => Self::SpiBusNotEnabled,
            -15 => Self::SpiConfigFailed,
            -16 => Self::I2cInvalidBusInterface,
            -17 => Self::I2cBusNotEnabled,
            -18 => Self::I2cConfigFailed,
            -19 => Self::I2cConfigExists,
            -20 => Self::TimerInitFailed,
            -21 => Self::TimerInvalidInstance,
            -22 => Self::EepromResetFailed,
            -23 => Self::EepromReadFailed,
            -24 => Self::InitFailed,
            _ => Self::Failure,
        }
    }
}

/// Result alias used across the bridge crates
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by bridge operations
///
/// Each variant maps to exactly one [`ErrorCode`] via [`BridgeError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Generic failure
    #[error("Operation failed: {0}")]
    Failure(String),

    /// Rejected streaming or channel configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel descriptors cannot change while streaming is armed
    #[error("Streaming is active; stop it before reconfiguring")]
    StreamingActive,

    /// Transport read/write failure
    #[error("Communication I/O error: {0}")]
    CommIo(String),

    /// Transport could not be initialised
    #[error("Communication interface init failed: {0}")]
    CommInitFailed(String),

    /// Malformed frame or unexpected reply on the transport
    #[error("Wrong response: {0}")]
    WrongResponse(String),

    /// Device did not acknowledge its address
    #[error("No acknowledge from device {address:#04X} on {bus}")]
    Nack { bus: BusId, address: u8 },

    /// Operation not supported by this board
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Bus index outside the valid range
    #[error("Invalid {kind} bus interface: {index}")]
    InvalidBus { kind: &'static str, index: u8 },

    /// Bus used before configuration
    #[error("{0} is not configured")]
    BusNotConfigured(BusId),

    /// Bus configured twice without deconfiguring
    #[error("{0} is already configured")]
    BusAlreadyConfigured(BusId),

    /// Bus configuration rejected by the driver
    #[error("{bus} configuration failed: {reason}")]
    BusConfigFailed { bus: BusId, reason: String },

    /// Bus referenced by an armed streaming channel
    #[error("{0} is in use by active streaming")]
    BusInUse(BusId),

    /// 16-bit SPI transfers requested on hardware that only supports 8-bit words
    #[error("16-bit transfers are not available on {0}")]
    Spi16BitNotConfigured(BusId),

    /// Timer could not be armed
    #[error("Timer init failed: {0}")]
    TimerInitFailed(String),

    /// Timer index outside the valid range
    #[error("Invalid timer instance: {0}")]
    InvalidTimerInstance(u8),

    /// Timer already armed by another consumer
    #[error("{0:?} is already running")]
    TimerBusy(TimerInstance),

    /// Pin bound by active streaming
    #[error("{0:?} is in use by active streaming")]
    PinInUse(MultiIoPin),
}

impl BridgeError {
    /// Flat status code reported to the host
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failure(_) | Self::InvalidConfig(_) | Self::StreamingActive | Self::PinInUse(_) => {
                ErrorCode::Failure
            }
            Self::CommIo(_) => ErrorCode::CommIoError,
            Self::CommInitFailed(_) => ErrorCode::CommInitFailed,
            Self::WrongResponse(_) => ErrorCode::CommWrongResponse,
            Self::Nack { .. } => ErrorCode::DeviceNotFound,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::InvalidBus { kind, .. } => {
                if *kind == "SPI" {
                    ErrorCode::SpiInvalidBusInterface
                } else {
                    ErrorCode::I2cInvalidBusInterface
                }
            }
            Self::BusNotConfigured(bus) => match bus {
                BusId::I2c(_) => ErrorCode::I2cBusNotEnabled,
                BusId::Spi(_) => ErrorCode::SpiBusNotEnabled,
            },
            Self::BusAlreadyConfigured(bus) => match bus {
                BusId::I2c(_) => ErrorCode::I2cConfigExists,
                BusId::Spi(_) => ErrorCode::SpiConfigExists,
            },
            Self::BusConfigFailed { bus, .. } | Self::BusInUse(bus) => match bus {
                BusId::I2c(_) => ErrorCode::I2cConfigFailed,
                BusId::Spi(_) => ErrorCode::SpiConfigFailed,
            },
            Self::Spi16BitNotConfigured(_) => ErrorCode::Spi16BitNotConfigured,
            Self::TimerInitFailed(_) => ErrorCode::TimerInitFailed,
            Self::InvalidTimerInstance(_) | Self::TimerBusy(_) => ErrorCode::TimerInvalidInstance,
        }
    }

    /// Collapse a result into the raw status value sent to the host
    pub fn status_of<T>(result: &BridgeResult<T>) -> i16 {
        match result {
            Ok(_) => ErrorCode::Success.as_i16(),
            Err(e) => e.code().as_i16(),
        }
    }
}
