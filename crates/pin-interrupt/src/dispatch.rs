//! Interrupt Bindings

use hw_timer::Clock;
use shuttle_protocol::{BridgeError, BridgeResult, Edge, MultiIoPin, PinInterruptMode, PinValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Callback receiving `(pin_level, timestamp_us)` from interrupt context
pub type InterruptCallback = Arc<dyn Fn(PinValue, u64) + Send + Sync>;

/// Exclusive binding of a pin
///
/// While a claim is outstanding, [`InterruptDispatch::attach`] and
/// [`InterruptDispatch::detach`] fail with [`BridgeError::PinInUse`] for
/// that pin. Give it back with [`InterruptDispatch::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct PinClaim {
    pin: MultiIoPin,
    token: u64,
}

impl PinClaim {
    pub fn pin(&self) -> MultiIoPin {
        self.pin
    }
}

struct Binding {
    mode: PinInterruptMode,
    callback: InterruptCallback,
    owner: Option<u64>,
}

#[derive(Default)]
struct PinTable {
    bindings: HashMap<MultiIoPin, Binding>,
    levels: HashMap<MultiIoPin, PinValue>,
    next_token: u64,
}

impl PinTable {
    fn admit(&self, pin: MultiIoPin) -> BridgeResult<()> {
        match self.bindings.get(&pin) {
            Some(binding) if binding.owner.is_some() => Err(BridgeError::PinInUse(pin)),
            _ => Ok(()),
        }
    }
}

/// Per-pin interrupt bindings
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct InterruptDispatch {
    pins: Arc<Mutex<PinTable>>,
    clock: Clock,
}

impl InterruptDispatch {
    /// Create a dispatcher stamping events with `clock`
    pub fn new(clock: Clock) -> Self {
        Self {
            pins: Arc::new(Mutex::new(PinTable::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PinTable> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `callback` to `pin`, replacing any previous unclaimed binding
    ///
    /// The swap happens under the table lock: every edge is delivered to
    /// exactly one of the old or the new callback, never both.
    pub fn attach(&self, pin: MultiIoPin, callback: InterruptCallback, mode: PinInterruptMode) -> BridgeResult<()> {
        let mut pins = self.lock();
        pins.admit(pin)?;
        let replaced = pins
            .bindings
            .insert(pin, Binding { mode, callback, owner: None })
            .is_some();
        info!("Interrupt attached on {:?} ({:?}){}", pin, mode, if replaced { ", replaced" } else { "" });
        Ok(())
    }

    /// Bind `pin` exclusively until the returned claim is released
    ///
    /// An unclaimed binding on the pin is replaced.
    pub fn claim(&self, pin: MultiIoPin, callback: InterruptCallback, mode: PinInterruptMode) -> BridgeResult<PinClaim> {
        let mut pins = self.lock();
        pins.admit(pin)?;
        pins.next_token = pins.next_token.wrapping_add(1);
        let token = pins.next_token;
        if pins
            .bindings
            .insert(pin, Binding { mode, callback, owner: Some(token) })
            .is_some()
        {
            warn!("Interrupt binding on {:?} displaced by a claim", pin);
        }
        info!("Interrupt claimed on {:?} ({:?})", pin, mode);
        Ok(PinClaim { pin, token })
    }

    /// Remove a claimed binding; a claim revoked by [`InterruptDispatch::detach_all`] is ignored
    pub fn release(&self, claim: PinClaim) {
        let mut pins = self.lock();
        let held = pins
            .bindings
            .get(&claim.pin)
            .is_some_and(|binding| binding.owner == Some(claim.token));
        if held {
            pins.bindings.remove(&claim.pin);
            info!("Interrupt released on {:?}", claim.pin);
        }
    }

    /// Remove the binding on `pin`; a pin without a binding is left untouched
    pub fn detach(&self, pin: MultiIoPin) -> BridgeResult<()> {
        let mut pins = self.lock();
        pins.admit(pin)?;
        if pins.bindings.remove(&pin).is_some() {
            info!("Interrupt detached from {:?}", pin);
        }
        Ok(())
    }

    /// Remove every binding, claimed or not (teardown)
    pub fn detach_all(&self) {
        let mut pins = self.lock();
        let count = pins.bindings.len();
        pins.bindings.clear();
        if count > 0 {
            info!("Detached {} interrupt binding(s)", count);
        }
    }

    /// Whether `pin` has a binding
    pub fn is_attached(&self, pin: MultiIoPin) -> bool {
        self.lock().bindings.contains_key(&pin)
    }

    /// Whether `pin` is bound under a claim
    pub fn is_claimed(&self, pin: MultiIoPin) -> bool {
        self.lock().bindings.get(&pin).is_some_and(|b| b.owner.is_some())
    }

    /// Last known level of `pin`
    pub fn level(&self, pin: MultiIoPin) -> PinValue {
        self.lock().levels.get(&pin).copied().unwrap_or(PinValue::Low)
    }

    /// Drive the electrical level of `pin`, raising an edge if it changed
    ///
    /// Returns whether a callback was invoked.
    pub fn set_level(&self, pin: MultiIoPin, value: PinValue) -> bool {
        if self.level(pin) == value {
            return false;
        }
        let edge = match value {
            PinValue::High => Edge::Rising,
            PinValue::Low => Edge::Falling,
        };
        self.signal_edge(pin, edge)
    }

    /// Deliver a raw edge event for `pin`
    ///
    /// Returns whether a callback was invoked.
    pub fn signal_edge(&self, pin: MultiIoPin, edge: Edge) -> bool {
        let level = edge.level_after();
        let callback = {
            let mut pins = self.lock();
            pins.levels.insert(pin, level);
            match pins.bindings.get(&pin) {
                Some(binding) if binding.mode.accepts(edge) => binding.callback.clone(),
                _ => return false,
            }
        };

        let timestamp_us = self.clock.micros();
        debug!("{:?} edge on {:?} at {} us", edge, pin, timestamp_us);
        // Table lock is released: the callback may attach or detach pins
        callback(level, timestamp_us);
        true
    }
}
