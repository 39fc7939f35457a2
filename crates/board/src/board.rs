//! Device Context

use crate::config::BoardConfig;
use crate::error::BoardResult;
use bus_manager::{scan, BusDriver, BusManager, SensorTarget};
use hw_timer::{Clock, TimerHandler, TimerSubsystem};
use pin_interrupt::{InterruptCallback, InterruptDispatch};
use ring_buffer::Drain;
use shuttle_protocol::{
    BridgeError, BridgeResult, BusId, I2cBus, I2cMode, MultiIoPin, PinInterruptMode, SpiBus, SpiMode,
    SpiSpeed, SpiTransferBits, StreamingMode, TimerInstance,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use stream_engine::{Block, EngineStatus, StreamEngine, StreamingConfig};
use tracing::{info, warn};

/// Everything the bridge owns between power-up and shutdown
///
/// Components hold handles onto each other (the engine shares the bus
/// manager, timers and interrupt table), but the board is the only place
/// they are created and the only place they are torn down.
pub struct Board {
    config: BoardConfig,
    clock: Clock,
    buses: Arc<Mutex<BusManager>>,
    timers: TimerSubsystem,
    interrupts: InterruptDispatch,
    engine: StreamEngine,
}

impl Board {
    /// Bring the board up on top of a bus driver
    pub fn new(config: BoardConfig, driver: Box<dyn BusDriver>) -> BoardResult<Self> {
        config.validate()?;
        let clock = Clock::new();
        let buses = Arc::new(Mutex::new(BusManager::new(driver)));
        let timers = TimerSubsystem::new();
        let interrupts = InterruptDispatch::new(clock);
        let engine = StreamEngine::new(
            config.engine_config()?,
            buses.clone(),
            timers.clone(),
            interrupts.clone(),
            clock,
        );

        info!("Board up: {:?} interface, streaming on timer {}", config.interface, config.streaming_timer);
        Ok(Self {
            config,
            clock,
            buses,
            timers,
            interrupts,
            engine,
        })
    }

    fn lock_buses(&self) -> MutexGuard<'_, BusManager> {
        self.buses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn timers(&self) -> &TimerSubsystem {
        &self.timers
    }

    pub fn interrupts(&self) -> &InterruptDispatch {
        &self.interrupts
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    // Buses

    pub fn config_i2c_bus(&self, bus: I2cBus, mode: I2cMode) -> BridgeResult<()> {
        self.lock_buses().config_i2c_bus(bus, mode)
    }

    pub fn config_spi_bus(&self, bus: SpiBus, speed: SpiSpeed, mode: SpiMode) -> BridgeResult<()> {
        self.lock_buses().config_spi_bus(bus, speed, mode)
    }

    pub fn config_word_spi_bus(
        &self,
        bus: SpiBus,
        speed: SpiSpeed,
        mode: SpiMode,
        bits: SpiTransferBits,
    ) -> BridgeResult<()> {
        self.lock_buses().config_word_spi_bus(bus, speed, mode, bits)
    }

    pub fn deconfig_i2c_bus(&self, bus: I2cBus) -> BridgeResult<()> {
        self.lock_buses().deconfig_i2c_bus(bus)
    }

    pub fn deconfig_spi_bus(&self, bus: SpiBus) -> BridgeResult<()> {
        self.lock_buses().deconfig_spi_bus(bus)
    }

    /// Foreground register read outside of streaming
    pub fn read_registers(&self, target: SensorTarget, register: u8, len: usize) -> BridgeResult<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.lock_buses().read_block(target, register, &mut data)?;
        Ok(data)
    }

    /// Addresses answering on an I2C bus, probing for at most `timeout`
    ///
    /// The bus lock is held for one address at a time, so streaming ticks
    /// interleave with the scan.
    pub fn scan_i2c(&self, bus: I2cBus, timeout: Duration) -> BridgeResult<Vec<u8>> {
        let id = BusId::I2c(bus);
        if !self.lock_buses().is_configured(id) {
            return Err(BridgeError::BusNotConfigured(id));
        }
        scan::run(bus, Instant::now() + timeout, |address| {
            let present = self.lock_buses().detect_i2c(bus, address);
            thread::yield_now();
            present
        })
    }

    // Timers

    pub fn timer_config(&self, instance: TimerInstance, handler: TimerHandler) -> BridgeResult<()> {
        self.timers.config(instance, handler)
    }

    pub fn timer_start(&self, instance: TimerInstance, timeout_us: u32) -> BridgeResult<()> {
        self.timers.start(instance, timeout_us)
    }

    /// Stop a timer; the instance pacing armed polling streams is refused
    pub fn timer_stop(&self, instance: TimerInstance) -> BridgeResult<()> {
        self.timers.stop(instance)
    }

    /// Milliseconds since power-up, wrapping
    pub fn get_millis(&self) -> u32 {
        self.clock.millis()
    }

    /// Microseconds since power-up
    pub fn get_micro_sec(&self) -> u64 {
        self.clock.micros()
    }

    // Interrupts

    /// Bind a pin callback; pins triggering armed streams are refused
    pub fn attach_interrupt(
        &self,
        pin: MultiIoPin,
        callback: InterruptCallback,
        mode: PinInterruptMode,
    ) -> BridgeResult<()> {
        self.interrupts.attach(pin, callback, mode)
    }

    pub fn detach_interrupt(&self, pin: MultiIoPin) -> BridgeResult<()> {
        self.interrupts.detach(pin)
    }

    // Streaming

    pub fn configure_streaming(&self, channel_id: u8, config: StreamingConfig, blocks: &[Block]) -> BridgeResult<()> {
        self.engine.configure(channel_id, config, blocks)
    }

    pub fn start_stop_streaming(&self, mode: StreamingMode, sample_count: u32, start: bool) -> BridgeResult<()> {
        self.engine.start_stop(mode, sample_count, start)
    }

    pub fn read_stream_samples(&self, channel_id: Option<u8>, max_records: usize) -> BridgeResult<Drain> {
        self.engine.read(channel_id, max_records)
    }

    pub fn streaming_status(&self) -> EngineStatus {
        self.engine.status()
    }

    /// Return every component to its power-up state
    ///
    /// Streaming is stopped first so its bus leases are gone before the
    /// buses are deconfigured. Channel descriptors and buffered records are
    /// discarded.
    pub fn shutdown(&self) {
        if let Err(e) = self.engine.stop() {
            warn!("Streaming did not stop cleanly: {}", e);
        }
        if let Err(e) = self.engine.clear_channels() {
            warn!("Streaming channels were not cleared: {}", e);
        }
        self.engine.clear_buffer();
        self.timers.stop_all();
        self.interrupts.detach_all();
        self.lock_buses().deconfig_all();
        info!("Board shut down after {} ms", self.clock.millis());
    }
}
