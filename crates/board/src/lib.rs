//! Shuttle Bridge Board
//!
//! The device context tying the bus manager, timers, interrupt dispatch and
//! streaming engine together, plus the host-facing command loop that serves
//! them over a byte transport.

mod board;
mod command;
mod command_loop;
mod config;
mod error;
mod transport;

pub use board::Board;
pub use command::{Command, Response};
pub use command_loop::{encode_frame, CommandLoop, MAX_COMMAND_FRAME};
pub use config::{BoardConfig, ENV_PREFIX};
pub use error::{BoardError, BoardResult};
pub use transport::{MemoryTransport, TcpTransport, MAX_OUTBOUND_BYTES};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber
///
/// Fails instead of panicking when `level` is not a tracing level or a
/// subscriber is already installed.
pub fn init_logging(level: &str, json: bool) -> BoardResult<()> {
    let level: Level = level.parse().map_err(|_| BoardError::InvalidSetting {
        field: "log_level",
        reason: format!("unknown level {:?}", level),
    })?;

    let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);
    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.map_err(|e| BoardError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_rejects_unknown_level() {
        assert!(matches!(
            init_logging("chatty", false),
            Err(BoardError::InvalidSetting { field: "log_level", .. })
        ));
    }

    #[test]
    fn test_init_logging_twice_is_an_error() {
        // Whichever call comes first in this process wins
        let first = init_logging("debug", false);
        let second = init_logging("debug", false);
        assert!(first.is_ok() || matches!(first, Err(BoardError::Logging(_))));
        assert!(matches!(second, Err(BoardError::Logging(_))));
    }
}
