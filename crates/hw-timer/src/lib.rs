//! Hardware Timer Subsystem
//!
//! Emulates the board's independent timer instances on top of tokio and
//! provides the free-running millisecond/microsecond clock used for
//! timestamps.

mod clock;
mod timer;

pub use clock::Clock;
pub use timer::{TimerClaim, TimerHandler, TimerPolicy, TimerState, TimerSubsystem};
