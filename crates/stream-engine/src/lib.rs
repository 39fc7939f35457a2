//! Sensor Streaming Engine
//!
//! Turns per-channel streaming descriptors into a cadence of bus reads.
//! In polling mode a hardware timer drives the cadence; in interrupt mode
//! pin edges do. Every tick reads each due channel's register blocks,
//! formats one record and pushes it into the shared response buffer.

mod config;
mod engine;
mod sampler;

pub use config::{Block, ChannelDescriptor, InterruptBinding, StreamingConfig};
pub use engine::{ChannelStatus, EngineConfig, EnginePhase, EngineStatus, StreamEngine};
pub use ring_buffer::{Drain, Record, RecordStatus};
