//! Streaming Engine

use crate::config::{base_period_us, Block, ChannelDescriptor, InterruptBinding, StreamingConfig};
use crate::sampler;
use bus_manager::BusManager;
use hw_timer::{Clock, TimerClaim, TimerHandler, TimerSubsystem};
use pin_interrupt::{InterruptCallback, InterruptDispatch, PinClaim};
use ring_buffer::{Drain, Record, ResponseBuffer, DEFAULT_CAPACITY};
use serde::{Deserialize, Serialize};
use shuttle_protocol::limits::{CHANNEL_COUNT, MAX_CHANNEL_ID};
use shuttle_protocol::{BridgeError, BridgeResult, BusId, MultiIoPin, StreamingMode, TimerInstance};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Engine construction parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timer instance that paces polling mode
    pub timer: TimerInstance,
    /// Response buffer size in bytes
    pub buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer: TimerInstance::Instance0,
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Lifecycle phase of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnginePhase {
    /// No channel has a descriptor
    Unconfigured,
    /// At least one descriptor is stored, nothing is sampling
    Configured,
    /// A trigger source is bound and channels are sampling
    Armed(StreamingMode),
}

/// Snapshot of one configured channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel_id: u8,
    /// Still sampling in the current session
    pub armed: bool,
    /// Records produced in the current or last session
    pub produced: u32,
}

/// Snapshot of the whole engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: EnginePhase,
    /// Per-channel record limit of the current session, zero for unbounded
    pub sample_count: u32,
    pub channels: Vec<ChannelStatus>,
    /// Records waiting in the response buffer
    pub buffered: usize,
    pub overflow_pending: bool,
}

struct ChannelSlot {
    descriptor: ChannelDescriptor,
    armed: bool,
    produced: u32,
    /// Base timer ticks between two samples of this channel
    divisor: u32,
    countdown: u32,
}

struct EngineState {
    channels: [Option<ChannelSlot>; CHANNEL_COUNT],
    phase: EnginePhase,
    sample_count: u32,
    /// Bumped on every arm/disarm; trigger callbacks carry the value they were bound with
    generation: u64,
    leases: Vec<BusId>,
    /// Pacing timer held while armed for polling
    timer: Option<TimerClaim>,
    /// Trigger pins held while armed for interrupts
    pins: Vec<PinClaim>,
}

/// State reachable from trigger context
///
/// Lock order is state, then buses, then buffer.
struct Shared {
    state: Mutex<EngineState>,
    buffer: Mutex<ResponseBuffer>,
    buses: Arc<Mutex<BusManager>>,
    timers: TimerSubsystem,
    interrupts: InterruptDispatch,
    clock: Clock,
    timer: TimerInstance,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_buses(&self) -> MutexGuard<'_, BusManager> {
        self.buses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, ResponseBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_timer_expiry(&self, generation: u64) {
        let timestamp_us = self.clock.micros();
        let mut state = self.lock_state();
        if state.generation != generation || state.phase != EnginePhase::Armed(StreamingMode::Polling) {
            return;
        }
        self.sample_due(&mut state, timestamp_us, |slot| {
            slot.countdown = slot.countdown.saturating_sub(1);
            if slot.countdown == 0 {
                slot.countdown = slot.divisor;
                true
            } else {
                false
            }
        });
    }

    fn on_edge(&self, generation: u64, pin: MultiIoPin, timestamp_us: u64) {
        let mut state = self.lock_state();
        if state.generation != generation || state.phase != EnginePhase::Armed(StreamingMode::Interrupt) {
            return;
        }
        self.sample_due(&mut state, timestamp_us, |slot| {
            slot.descriptor.config.interrupt.map(|b| b.pin) == Some(pin)
        });
    }

    /// Sample every armed channel selected by `is_due` and stage the records
    fn sample_due<F>(&self, state: &mut EngineState, timestamp_us: u64, mut is_due: F)
    where
        F: FnMut(&mut ChannelSlot) -> bool,
    {
        let limit = state.sample_count;
        let mut records: Vec<Record> = Vec::new();
        {
            let mut buses = self.lock_buses();
            for slot in state.channels.iter_mut().flatten().filter(|s| s.armed) {
                if !is_due(slot) {
                    continue;
                }
                records.push(sampler::sample(&mut buses, &slot.descriptor, timestamp_us));
                slot.produced = slot.produced.saturating_add(1);
                if limit > 0 && slot.produced >= limit {
                    slot.armed = false;
                    debug!("Channel {} reached {} samples", slot.descriptor.channel_id, limit);
                }
            }
        }

        {
            let mut buffer = self.lock_buffer();
            for record in &records {
                match buffer.push(record) {
                    Ok(0) => {}
                    Ok(evicted) => warn!("Response buffer full, evicted {} unread record(s)", evicted),
                    Err(e) => warn!("Dropping channel {} record: {}", record.channel_id, e),
                }
            }
        }

        if limit > 0 && state.channels.iter().flatten().all(|s| !s.armed) {
            info!("All channels delivered {} samples", limit);
            self.disarm(state);
        }
    }

    /// Unbind the trigger source and release bus leases; descriptors are kept
    fn disarm(&self, state: &mut EngineState) {
        let EnginePhase::Armed(mode) = state.phase else {
            return;
        };
        state.generation = state.generation.wrapping_add(1);

        match mode {
            StreamingMode::Polling => {
                if let Some(claim) = state.timer.take() {
                    self.timers.release(claim);
                }
            }
            StreamingMode::Interrupt => {
                for claim in state.pins.drain(..) {
                    self.interrupts.release(claim);
                }
            }
        }

        let mut buses = self.lock_buses();
        for bus in state.leases.drain(..) {
            buses.release(bus);
        }
        for slot in state.channels.iter_mut().flatten() {
            slot.armed = false;
        }
        state.phase = EnginePhase::Configured;
        info!("{:?} streaming stopped", mode);
    }
}

/// Polling and interrupt driven sensor streaming
///
/// Owns the channel descriptors and the response buffer. The bus manager is
/// shared with the foreground API; the timer and interrupt subsystems are
/// handles onto the board-wide instances.
pub struct StreamEngine {
    shared: Arc<Shared>,
}

impl StreamEngine {
    pub fn new(
        config: EngineConfig,
        buses: Arc<Mutex<BusManager>>,
        timers: TimerSubsystem,
        interrupts: InterruptDispatch,
        clock: Clock,
    ) -> Self {
        info!(
            "Stream engine created ({:?}, {} byte buffer)",
            config.timer, config.buffer_capacity
        );
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    channels: std::array::from_fn(|_| None),
                    phase: EnginePhase::Unconfigured,
                    sample_count: 0,
                    generation: 0,
                    leases: Vec::new(),
                    timer: None,
                    pins: Vec::new(),
                }),
                buffer: Mutex::new(ResponseBuffer::new(config.buffer_capacity)),
                buses,
                timers,
                interrupts,
                clock,
                timer: config.timer,
            }),
        }
    }

    /// Store or replace the descriptor of a channel
    ///
    /// Rejected while streaming is armed, and when the target's bus is not
    /// configured.
    pub fn configure(&self, channel_id: u8, config: StreamingConfig, blocks: &[Block]) -> BridgeResult<()> {
        let descriptor = ChannelDescriptor::new(channel_id, config, blocks)?;

        let mut state = self.shared.lock_state();
        if matches!(state.phase, EnginePhase::Armed(_)) {
            return Err(BridgeError::StreamingActive);
        }
        let bus = config.target.bus();
        if !self.shared.lock_buses().is_configured(bus) {
            return Err(BridgeError::BusNotConfigured(bus));
        }

        info!(
            "Channel {} configured: {} block(s), {} bytes/sample, {} us",
            channel_id,
            descriptor.blocks.len(),
            descriptor.sample_bytes(),
            config.period_us()
        );
        state.channels[usize::from(channel_id)] = Some(ChannelSlot {
            descriptor,
            armed: false,
            produced: 0,
            divisor: 1,
            countdown: 1,
        });
        state.phase = EnginePhase::Configured;
        Ok(())
    }

    /// Arm every channel that can run in `mode`
    ///
    /// Channels stop individually after `sample_count` records; once all of
    /// them have, the engine stops itself. Zero streams until [`stop`].
    ///
    /// [`stop`]: StreamEngine::stop
    pub fn start(&self, mode: StreamingMode, sample_count: u32) -> BridgeResult<()> {
        let mut state = self.shared.lock_state();
        if matches!(state.phase, EnginePhase::Armed(_)) {
            return Err(BridgeError::StreamingActive);
        }

        let participants: Vec<usize> = state
            .channels
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let config = slot.as_ref()?.descriptor.config;
                let eligible = match mode {
                    StreamingMode::Polling => config.period_us() > 0,
                    StreamingMode::Interrupt => config.interrupt.is_some(),
                };
                eligible.then_some(index)
            })
            .collect();
        if participants.is_empty() {
            return Err(BridgeError::InvalidConfig(format!(
                "no channel is configured for {:?} streaming",
                mode
            )));
        }
        let configs: Vec<StreamingConfig> = participants
            .iter()
            .filter_map(|&i| state.channels[i].as_ref().map(|s| s.descriptor.config))
            .collect();

        let base_us = base_period_us(configs.iter().map(StreamingConfig::period_us));
        let mut bindings: Vec<InterruptBinding> = Vec::new();
        if mode == StreamingMode::Interrupt {
            for binding in configs.iter().filter_map(|c| c.interrupt) {
                match bindings.iter().find(|b| b.pin == binding.pin) {
                    Some(existing) if existing.mode != binding.mode => {
                        return Err(BridgeError::InvalidConfig(format!(
                            "{:?} is bound with both {:?} and {:?}",
                            binding.pin, existing.mode, binding.mode
                        )));
                    }
                    Some(_) => {}
                    None => bindings.push(binding),
                }
            }
        }

        let mut leases = Vec::with_capacity(configs.len());
        {
            let mut buses = self.shared.lock_buses();
            for config in &configs {
                let bus = config.target.bus();
                if let Err(e) = buses.claim(bus) {
                    for bus in leases.drain(..) {
                        buses.release(bus);
                    }
                    return Err(e);
                }
                leases.push(bus);
            }
        }

        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        for (index, slot) in state.channels.iter_mut().enumerate() {
            if let Some(slot) = slot {
                slot.armed = participants.contains(&index);
                slot.produced = 0;
                slot.divisor = match mode {
                    StreamingMode::Polling if slot.armed => slot.descriptor.config.period_us() / base_us,
                    _ => 1,
                };
                slot.countdown = slot.divisor;
            }
        }

        let triggers = match mode {
            StreamingMode::Polling => self.claim_timer(generation, base_us).map(|claim| {
                state.timer = Some(claim);
            }),
            StreamingMode::Interrupt => self.claim_pins(generation, &bindings).map(|claims| {
                state.pins = claims;
            }),
        };
        if let Err(e) = triggers {
            warn!("{:?} streaming could not bind its trigger: {}", mode, e);
            let mut buses = self.shared.lock_buses();
            for bus in leases.drain(..) {
                buses.release(bus);
            }
            for slot in state.channels.iter_mut().flatten() {
                slot.armed = false;
            }
            state.generation = state.generation.wrapping_add(1);
            return Err(e);
        }

        state.leases = leases;
        state.sample_count = sample_count;
        state.phase = EnginePhase::Armed(mode);
        info!(
            "{:?} streaming started: {} channel(s), {} samples each, base period {} us",
            mode,
            participants.len(),
            sample_count,
            base_us
        );
        Ok(())
    }

    /// Disarm streaming; stopping an idle engine is a no-op
    ///
    /// Descriptors and buffered records survive, so a later [`start`]
    /// resumes with the same channels.
    ///
    /// [`start`]: StreamEngine::start
    pub fn stop(&self) -> BridgeResult<()> {
        let mut state = self.shared.lock_state();
        self.shared.disarm(&mut state);
        Ok(())
    }

    /// Forget every channel descriptor; rejected while armed
    pub fn clear_channels(&self) -> BridgeResult<()> {
        let mut state = self.shared.lock_state();
        if matches!(state.phase, EnginePhase::Armed(_)) {
            return Err(BridgeError::StreamingActive);
        }
        state.channels = std::array::from_fn(|_| None);
        state.phase = EnginePhase::Unconfigured;
        info!("Streaming channels cleared");
        Ok(())
    }

    /// Start or stop with one call, as the host protocol does
    pub fn start_stop(&self, mode: StreamingMode, sample_count: u32, start: bool) -> BridgeResult<()> {
        if start {
            self.start(mode, sample_count)
        } else {
            self.stop()
        }
    }

    /// Drain up to `max_records` records, all channels or just `channel`
    pub fn read(&self, channel: Option<u8>, max_records: usize) -> BridgeResult<Drain> {
        if let Some(id) = channel {
            if id > MAX_CHANNEL_ID {
                return Err(BridgeError::InvalidConfig(format!(
                    "channel id {} exceeds {}",
                    id, MAX_CHANNEL_ID
                )));
            }
        }
        self.shared
            .lock_buffer()
            .read(channel, max_records)
            .map_err(|e| BridgeError::Failure(e.to_string()))
    }

    /// Records waiting to be read
    pub fn unread(&self, channel: Option<u8>) -> usize {
        self.shared.lock_buffer().unread(channel)
    }

    /// Discard every buffered record
    pub fn clear_buffer(&self) {
        self.shared.lock_buffer().clear();
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.lock_state().phase
    }

    /// Stored descriptor of a channel
    pub fn descriptor(&self, channel_id: u8) -> Option<ChannelDescriptor> {
        self.shared
            .lock_state()
            .channels
            .get(usize::from(channel_id))?
            .as_ref()
            .map(|slot| slot.descriptor.clone())
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.shared.lock_state();
        let channels = state
            .channels
            .iter()
            .flatten()
            .map(|slot| ChannelStatus {
                channel_id: slot.descriptor.channel_id,
                armed: slot.armed,
                produced: slot.produced,
            })
            .collect();
        let buffer = self.shared.lock_buffer();
        EngineStatus {
            phase: state.phase,
            sample_count: state.sample_count,
            channels,
            buffered: buffer.len(),
            overflow_pending: buffer.overflow_pending(),
        }
    }

    /// Hold the pacing timer and arm it at the base period
    fn claim_timer(&self, generation: u64, base_us: u32) -> BridgeResult<TimerClaim> {
        let timers = &self.shared.timers;
        let claim = timers.claim(self.shared.timer, self.timer_handler(generation))?;
        if let Err(e) = timers.start_claimed(&claim, base_us) {
            timers.release(claim);
            return Err(e);
        }
        Ok(claim)
    }

    /// Hold every trigger pin, all or none
    fn claim_pins(&self, generation: u64, bindings: &[InterruptBinding]) -> BridgeResult<Vec<PinClaim>> {
        let interrupts = &self.shared.interrupts;
        let mut claims = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match interrupts.claim(binding.pin, self.edge_callback(generation, binding.pin), binding.mode) {
                Ok(claim) => claims.push(claim),
                Err(e) => {
                    for claim in claims {
                        interrupts.release(claim);
                    }
                    return Err(e);
                }
            }
        }
        Ok(claims)
    }

    fn timer_handler(&self, generation: u64) -> TimerHandler {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.on_timer_expiry(generation);
            }
        })
    }

    fn edge_callback(&self, generation: u64, pin: MultiIoPin) -> InterruptCallback {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |_level, timestamp_us| {
            if let Some(shared) = shared.upgrade() {
                shared.on_edge(generation, pin, timestamp_us);
            }
        })
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        self.shared.disarm(&mut state);
    }
}
