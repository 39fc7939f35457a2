//! Pin Interrupt Dispatch
//!
//! Binds a multi-IO pin and a trigger policy to a callback that receives the
//! pin level and a microsecond timestamp from interrupt context.

mod dispatch;

pub use dispatch::{InterruptCallback, InterruptDispatch, PinClaim};
