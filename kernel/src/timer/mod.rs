//! System time and periodic callbacks.
//!
//! The PIT fires at ~69 Hz. Each tick advances the monotonic system time by
//! `1 / PIT_FREQUENCY` seconds and drives a registry of periodic callbacks
//! (ARP eviction, the alarm signal). Callbacks run in interrupt context and
//! must be quick.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::SpinLock;

/// Frequency at which the PIT generates interrupts, in Hz.
pub const PIT_FREQUENCY: u32 = 69;

/// Seconds of system time added per tick.
pub const TICK_INTERVAL: f64 = 1.0 / PIT_FREQUENCY as f64;

/// Callbacks receive the current system time in seconds.
pub type PeriodicCallback = fn(f64);

/// Monotonic system time in seconds, stored as f64 bits.
static SYS_TIME_BITS: AtomicU64 = AtomicU64::new(0);

/// Current system time in seconds since boot.
pub fn system_time() -> f64 {
    f64::from_bits(SYS_TIME_BITS.load(Ordering::Relaxed))
}

fn advance_system_time() -> f64 {
    let now = system_time() + TICK_INTERVAL;
    SYS_TIME_BITS.store(now.to_bits(), Ordering::Relaxed);
    now
}

/// One registered periodic callback.
struct CallbackEntry {
    /// Unique positive id handed back to the registrant.
    id: u32,
    /// Ticks between invocations.
    interval: u32,
    /// Ticks remaining until the next invocation.
    counter: u32,
    callback: PeriodicCallback,
}

/// Registry of periodic callbacks, kept sorted by id so the smallest
/// unused id is found in one pass.
#[derive(Default)]
struct CallbackRegistry {
    entries: Vec<CallbackEntry>,
}

impl CallbackRegistry {
    /// Register `callback` to fire every `interval` ticks. Returns the
    /// assigned id, or 0 when `interval` is zero.
    fn register(&mut self, interval: u32, callback: PeriodicCallback) -> u32 {
        if interval == 0 {
            return 0;
        }

        // Entries are sorted by id; the first index where the id differs
        // from position + 1 is a hole to reuse.
        let mut id = 1;
        let mut insert_at = self.entries.len();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.id != id {
                insert_at = i;
                break;
            }
            id += 1;
        }

        self.entries.insert(
            insert_at,
            CallbackEntry {
                id,
                interval,
                counter: interval,
                callback,
            },
        );
        id
    }

    /// Remove the callback with the given id, if present.
    fn unregister(&mut self, id: u32) {
        self.entries.retain(|entry| entry.id != id);
    }

    /// Decrement every counter; reload and collect the callbacks that are
    /// due this tick.
    fn tick(&mut self, due: &mut Vec<PeriodicCallback>) {
        for entry in self.entries.iter_mut() {
            entry.counter -= 1;
            if entry.counter == 0 {
                entry.counter = entry.interval;
                due.push(entry.callback);
            }
        }
    }
}

static CALLBACKS: SpinLock<CallbackRegistry> = SpinLock::new(CallbackRegistry {
    entries: Vec::new(),
});

/// Register a callback to fire every `interval` ticks (each tick is
/// `1 / PIT_FREQUENCY` seconds). Returns the callback id, 0 on failure.
pub fn register_periodic_callback(interval: u32, callback: PeriodicCallback) -> u32 {
    CALLBACKS.lock_irqsave().register(interval, callback)
}

/// Unregister a callback previously returned by
/// [`register_periodic_callback`].
pub fn unregister_periodic_callback(id: u32) {
    CALLBACKS.lock_irqsave().unregister(id);
}

/// Advance system time by one tick and fire due callbacks.
///
/// Called from the timer interrupt. Callbacks are invoked after the
/// registry lock is released; they take the PCB and network locks
/// themselves.
pub fn tick() {
    let now = advance_system_time();

    let mut due: Vec<PeriodicCallback> = Vec::new();
    CALLBACKS.lock_irqsave().tick(&mut due);

    for callback in due {
        callback(now);
    }
}
