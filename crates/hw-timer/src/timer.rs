//! Timer Instances

use shuttle_protocol::{BridgeError, BridgeResult, TimerInstance};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Callback invoked from timer context on every expiry
///
/// Runs to completion before the next expiry of the same instance is
/// delivered, so it must not block.
pub type TimerHandler = Arc<dyn Fn() + Send + Sync>;

/// Classification of a timer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not armed
    Stopped,
    /// Handler bound, not armed
    Ready,
    /// Armed and firing
    Running,
}

/// Re-arm behaviour after an expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPolicy {
    Periodic,
    OneShot,
}

/// Exclusive hold on a timer instance
///
/// While a claim is outstanding the unclaimed calls ([`TimerSubsystem::config`],
/// [`TimerSubsystem::start`], [`TimerSubsystem::stop`], ...) fail with
/// [`BridgeError::TimerBusy`] for that instance. Give it back with
/// [`TimerSubsystem::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct TimerClaim {
    instance: TimerInstance,
    token: u64,
}

impl TimerClaim {
    pub fn instance(&self) -> TimerInstance {
        self.instance
    }
}

struct Slot {
    state: TimerState,
    policy: TimerPolicy,
    handler: Option<TimerHandler>,
    timeout_us: u32,
    /// Zero point of the instance's timestamp counter
    counter_origin: Option<Instant>,
    fires: u64,
    /// Bumped on every arm/disarm so stale expiries are dropped
    generation: u64,
    task: Option<JoinHandle<()>>,
    /// Token of the outstanding claim
    owner: Option<u64>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: TimerState::Stopped,
            policy: TimerPolicy::Periodic,
            handler: None,
            timeout_us: 0,
            counter_origin: None,
            fires: 0,
            generation: 0,
            task: None,
            owner: None,
        }
    }

    /// Reject callers that do not hold the outstanding claim
    fn admit(&self, instance: TimerInstance, holder: Option<u64>) -> BridgeResult<()> {
        match self.owner {
            Some(owner) if holder != Some(owner) => Err(BridgeError::TimerBusy(instance)),
            _ => Ok(()),
        }
    }

    fn bind(&mut self, handler: TimerHandler, policy: TimerPolicy) {
        self.handler = Some(handler);
        self.policy = policy;
        self.state = TimerState::Ready;
    }

    fn disarm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Disarm a running instance; returns whether it was running
    fn halt(&mut self) -> bool {
        if self.state != TimerState::Running {
            return false;
        }
        self.disarm();
        self.state = TimerState::Stopped;
        self.counter_origin = None;
        true
    }
}

struct Inner {
    slots: Mutex<[Slot; 3]>,
    tokens: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, [Slot; 3]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The board's hardware timer instances
///
/// Cloning yields another handle to the same instances.
#[derive(Clone)]
pub struct TimerSubsystem {
    inner: Arc<Inner>,
}

impl TimerSubsystem {
    /// Create the subsystem with every instance stopped and unbound
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new([Slot::new(), Slot::new(), Slot::new()]),
                tokens: AtomicU64::new(1),
            }),
        }
    }

    /// Bind a periodic expiry handler
    pub fn config(&self, instance: TimerInstance, handler: TimerHandler) -> BridgeResult<()> {
        self.config_with_policy(instance, handler, TimerPolicy::Periodic)
    }

    /// Bind a handler that fires once per start
    pub fn config_one_shot(&self, instance: TimerInstance, handler: TimerHandler) -> BridgeResult<()> {
        self.config_with_policy(instance, handler, TimerPolicy::OneShot)
    }

    fn config_with_policy(
        &self,
        instance: TimerInstance,
        handler: TimerHandler,
        policy: TimerPolicy,
    ) -> BridgeResult<()> {
        let mut slots = self.inner.lock();
        let slot = &mut slots[instance.index()];
        slot.admit(instance, None)?;
        if slot.state == TimerState::Running {
            return Err(BridgeError::TimerBusy(instance));
        }
        slot.bind(handler, policy);
        debug!("{:?} configured ({:?})", instance, policy);
        Ok(())
    }

    /// Take exclusive hold of an idle instance and bind a periodic handler
    ///
    /// Fails with [`BridgeError::TimerBusy`] when the instance is running or
    /// already claimed.
    pub fn claim(&self, instance: TimerInstance, handler: TimerHandler) -> BridgeResult<TimerClaim> {
        let mut slots = self.inner.lock();
        let slot = &mut slots[instance.index()];
        slot.admit(instance, None)?;
        if slot.state == TimerState::Running {
            return Err(BridgeError::TimerBusy(instance));
        }

        let token = self.inner.tokens.fetch_add(1, Ordering::Relaxed);
        slot.owner = Some(token);
        slot.bind(handler, TimerPolicy::Periodic);
        debug!("{:?} claimed", instance);
        Ok(TimerClaim { instance, token })
    }

    /// Give a claimed instance back, disarming it and unbinding its handler
    ///
    /// A claim that was already revoked by [`TimerSubsystem::stop_all`]
    /// leaves the instance untouched.
    pub fn release(&self, claim: TimerClaim) {
        let mut slots = self.inner.lock();
        let slot = &mut slots[claim.instance.index()];
        if slot.owner != Some(claim.token) {
            return;
        }
        if slot.halt() {
            info!("{:?} stopped after {} expiries", claim.instance, slot.fires);
        }
        slot.owner = None;
        slot.handler = None;
        slot.state = TimerState::Stopped;
        debug!("{:?} released", claim.instance);
    }

    /// Arm an instance to expire every `timeout_us` microseconds
    ///
    /// Starting an instance that is already running is rejected so two
    /// consumers can never silently re-arm the same hardware.
    pub fn start(&self, instance: TimerInstance, timeout_us: u32) -> BridgeResult<()> {
        self.arm(instance, timeout_us, None)
    }

    /// [`TimerSubsystem::start`] on behalf of the claim holder
    pub fn start_claimed(&self, claim: &TimerClaim, timeout_us: u32) -> BridgeResult<()> {
        self.arm(claim.instance, timeout_us, Some(claim.token))
    }

    fn arm(&self, instance: TimerInstance, timeout_us: u32, holder: Option<u64>) -> BridgeResult<()> {
        if timeout_us == 0 {
            return Err(BridgeError::TimerInitFailed("timeout must be non-zero".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::TimerInitFailed(e.to_string()))?;

        let mut slots = self.inner.lock();
        let slot = &mut slots[instance.index()];
        slot.admit(instance, holder)?;
        match slot.state {
            TimerState::Running => return Err(BridgeError::TimerBusy(instance)),
            _ if slot.handler.is_none() => {
                return Err(BridgeError::TimerInitFailed(format!("{instance:?} has no handler")))
            }
            _ => {}
        }

        slot.generation = slot.generation.wrapping_add(1);
        slot.state = TimerState::Running;
        slot.timeout_us = timeout_us;
        slot.counter_origin = Some(Instant::now());
        slot.task = Some(runtime.spawn(run_instance(
            Arc::downgrade(&self.inner),
            instance,
            slot.generation,
            Duration::from_micros(u64::from(timeout_us)),
            slot.policy,
        )));

        info!("{:?} started: {} us ({:?})", instance, timeout_us, slot.policy);
        Ok(())
    }

    /// Disarm an instance; stopping an idle instance is a no-op
    pub fn stop(&self, instance: TimerInstance) -> BridgeResult<()> {
        let mut slots = self.inner.lock();
        let slot = &mut slots[instance.index()];
        slot.admit(instance, None)?;
        if slot.halt() {
            info!("{:?} stopped after {} expiries", instance, slot.fires);
        }
        Ok(())
    }

    /// Zero an instance's counter without changing whether it runs
    ///
    /// A running instance is re-phased so its next expiry is a full period away.
    pub fn reset(&self, instance: TimerInstance) -> BridgeResult<()> {
        let mut slots = self.inner.lock();
        let slot = &mut slots[instance.index()];
        slot.admit(instance, None)?;
        slot.fires = 0;
        if slot.state != TimerState::Running {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::TimerInitFailed(e.to_string()))?;
        slot.disarm();
        slot.counter_origin = Some(Instant::now());
        slot.task = Some(runtime.spawn(run_instance(
            Arc::downgrade(&self.inner),
            instance,
            slot.generation,
            Duration::from_micros(u64::from(slot.timeout_us)),
            slot.policy,
        )));
        debug!("{:?} reset", instance);
        Ok(())
    }

    /// Stop every instance and revoke outstanding claims (teardown)
    pub fn stop_all(&self) {
        let mut slots = self.inner.lock();
        for (instance, slot) in TimerInstance::ALL.into_iter().zip(slots.iter_mut()) {
            if slot.halt() {
                info!("{:?} stopped after {} expiries", instance, slot.fires);
            }
            if slot.owner.take().is_some() {
                warn!("{:?} claim revoked", instance);
                slot.handler = None;
            }
        }
    }

    /// Current classification of an instance
    pub fn state(&self, instance: TimerInstance) -> TimerState {
        self.inner.lock()[instance.index()].state
    }

    /// Whether a claim is outstanding on an instance
    pub fn is_claimed(&self, instance: TimerInstance) -> bool {
        self.inner.lock()[instance.index()].owner.is_some()
    }

    /// Microseconds since the instance was started or last reset; zero when stopped
    pub fn counter_us(&self, instance: TimerInstance) -> u64 {
        self.inner.lock()[instance.index()]
            .counter_origin
            .map(|origin| origin.elapsed().as_micros() as u64)
            .unwrap_or(0)
    }

    /// Expiries delivered since start or last reset
    pub fn fire_count(&self, instance: TimerInstance) -> u64 {
        self.inner.lock()[instance.index()].fires
    }
}

impl Default for TimerSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Expiry loop of one armed instance
async fn run_instance(
    inner: Weak<Inner>,
    instance: TimerInstance,
    generation: u64,
    period: Duration,
    policy: TimerPolicy,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;

        let handler = {
            let Some(inner) = inner.upgrade() else { return };
            let mut slots = inner.lock();
            let slot = &mut slots[instance.index()];
            if slot.generation != generation || slot.state != TimerState::Running {
                return;
            }
            slot.fires += 1;
            if policy == TimerPolicy::OneShot {
                slot.state = TimerState::Stopped;
                slot.counter_origin = None;
                slot.task = None;
            }
            slot.handler.clone()
        };

        // The slot lock is released before the handler runs, so a handler
        // may stop or reconfigure its own instance.
        if let Some(handler) = handler {
            handler();
        }
        if policy == TimerPolicy::OneShot {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttle_protocol::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler() -> (TimerHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (Arc::new(move || { c.fetch_add(1, Ordering::SeqCst); }), count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_expiries() {
        let timers = TimerSubsystem::new();
        let (handler, count) = counting_handler();
        timers.config(TimerInstance::Instance0, handler).unwrap();
        assert_eq!(timers.state(TimerInstance::Instance0), TimerState::Ready);

        timers.start(TimerInstance::Instance0, 10_000).unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timers.stop(TimerInstance::Instance0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(timers.state(TimerInstance::Instance0), TimerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_running_instance_rejected() {
        let timers = TimerSubsystem::new();
        let (handler, _) = counting_handler();
        timers.config(TimerInstance::Instance1, handler.clone()).unwrap();
        timers.start(TimerInstance::Instance1, 1_000).unwrap();

        let err = timers.start(TimerInstance::Instance1, 500).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimerInvalidInstance);
        let err = timers.config(TimerInstance::Instance1, handler).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimerInvalidInstance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_handler_fails() {
        let timers = TimerSubsystem::new();
        let err = timers.start(TimerInstance::Instance2, 1_000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimerInitFailed);
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let timers = TimerSubsystem::new();
        let (handler, _) = counting_handler();
        timers.config(TimerInstance::Instance0, handler).unwrap();
        let err = timers.start(TimerInstance::Instance0, 1_000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimerInitFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let timers = TimerSubsystem::new();
        let (handler, count) = counting_handler();
        timers.config_one_shot(TimerInstance::Instance0, handler).unwrap();
        timers.start(TimerInstance::Instance0, 5_000).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.state(TimerInstance::Instance0), TimerState::Stopped);

        // The handler stays bound, so the instance can be re-armed
        timers.start(TimerInstance::Instance0, 5_000).unwrap();
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rephases_and_keeps_running() {
        let timers = TimerSubsystem::new();
        let (handler, count) = counting_handler();
        timers.config(TimerInstance::Instance0, handler).unwrap();
        timers.start(TimerInstance::Instance0, 10_000).unwrap();

        tokio::time::sleep(Duration::from_millis(8)).await;
        assert_eq!(timers.counter_us(TimerInstance::Instance0), 8_000);
        timers.reset(TimerInstance::Instance0).unwrap();
        assert_eq!(timers.counter_us(TimerInstance::Instance0), 0);
        assert_eq!(timers.state(TimerInstance::Instance0), TimerState::Running);

        // Original phase would have fired at 10 ms; after reset the next is at 18 ms
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_can_stop_its_own_instance() {
        let timers = TimerSubsystem::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let (t, f) = (timers.clone(), fired.clone());
        let handler: TimerHandler = Arc::new(move || {
            if f.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                t.stop(TimerInstance::Instance2).unwrap();
            }
        });
        timers.config(TimerInstance::Instance2, handler).unwrap();
        timers.start(TimerInstance::Instance2, 1_000).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_are_independent() {
        let timers = TimerSubsystem::new();
        let (h0, c0) = counting_handler();
        let (h1, c1) = counting_handler();
        timers.config(TimerInstance::Instance0, h0).unwrap();
        timers.config(TimerInstance::Instance1, h1).unwrap();
        timers.start(TimerInstance::Instance0, 1_000).unwrap();
        timers.start(TimerInstance::Instance1, 4_000).unwrap();

        tokio::time::sleep(Duration::from_micros(8_500)).await;
        timers.stop_all();
        assert_eq!(c0.load(Ordering::SeqCst), 8);
        assert_eq!(c1.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_instance_rejects_unclaimed_calls() {
        let timers = TimerSubsystem::new();
        let (handler, count) = counting_handler();
        let claim = timers.claim(TimerInstance::Instance0, handler.clone()).unwrap();
        timers.start_claimed(&claim, 10_000).unwrap();
        assert!(timers.is_claimed(TimerInstance::Instance0));

        for err in [
            timers.stop(TimerInstance::Instance0).unwrap_err(),
            timers.config(TimerInstance::Instance0, handler.clone()).unwrap_err(),
            timers.start(TimerInstance::Instance0, 1_000).unwrap_err(),
            timers.reset(TimerInstance::Instance0).unwrap_err(),
        ] {
            assert_eq!(err, BridgeError::TimerBusy(TimerInstance::Instance0));
        }
        assert_eq!(
            timers.claim(TimerInstance::Instance0, handler).unwrap_err(),
            BridgeError::TimerBusy(TimerInstance::Instance0)
        );

        // The holder keeps firing undisturbed
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        timers.release(claim);
        assert!(!timers.is_claimed(TimerInstance::Instance0));
        assert_eq!(timers.state(TimerInstance::Instance0), TimerState::Stopped);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_rejected_while_running() {
        let timers = TimerSubsystem::new();
        let (handler, _) = counting_handler();
        timers.config(TimerInstance::Instance1, handler.clone()).unwrap();
        timers.start(TimerInstance::Instance1, 1_000).unwrap();

        let err = timers.claim(TimerInstance::Instance1, handler).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimerInvalidInstance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_claim_does_not_touch_next_consumer() {
        let timers = TimerSubsystem::new();
        let (first, _) = counting_handler();
        let (second, count) = counting_handler();
        let claim = timers.claim(TimerInstance::Instance2, first).unwrap();
        timers.start_claimed(&claim, 1_000).unwrap();

        timers.stop_all();
        assert!(!timers.is_claimed(TimerInstance::Instance2));
        timers.config(TimerInstance::Instance2, second).unwrap();
        timers.start(TimerInstance::Instance2, 1_000).unwrap();

        // Releasing the stale claim leaves the new consumer running
        timers.release(claim);
        assert_eq!(timers.state(TimerInstance::Instance2), TimerState::Running);
        tokio::time::sleep(Duration::from_micros(3_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
