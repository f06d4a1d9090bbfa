//! Cooperative cycle manager driving periodic maintenance callbacks.
//!
//! Components register a callback under an id and receive periodic
//! invocations from a background ticker thread. Each invocation gets an
//! abort flag that long passes poll to cancel cooperatively.
//! Unregistration waits for an in-flight invocation to finish, bounded
//! by the caller's deadline, which is what lets a group shut down
//! without racing its own maintenance.

use crate::error::{LsmError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Signal polled by long maintenance passes to cancel cooperatively.
pub type AbortFlag = Arc<AtomicBool>;

/// A registered maintenance callback. Returns true when it did work.
pub type CycleCallback = Box<dyn FnMut(&AbortFlag) -> bool + Send>;

struct SlotFlags {
    active: bool,
    running: bool,
}

struct Slot {
    id: String,
    callback: Mutex<CycleCallback>,
    flags: Mutex<SlotFlags>,
    cond: Condvar,
}

type SlotList = Mutex<Vec<Arc<Slot>>>;

/// Periodic scheduler for maintenance callbacks.
///
/// A background thread invokes every registered callback once per
/// interval; [`CycleManager::run_once`] drives the same pass manually,
/// which tests use for determinism. Dropping the manager stops the
/// thread.
pub struct CycleManager {
    slots: Arc<SlotList>,
    abort: AbortFlag,
    stop_signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CycleManager {
    /// Creates a manager whose ticker fires every `interval`.
    pub fn new(interval: Duration) -> Self {
        let slots: Arc<SlotList> = Arc::new(Mutex::new(Vec::new()));
        let abort: AbortFlag = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::new((Mutex::new(false), Condvar::new()));

        let thread_slots = slots.clone();
        let thread_abort = abort.clone();
        let thread_stop = stop_signal.clone();
        let handle = std::thread::spawn(move || loop {
            let (lock, cvar) = &*thread_stop;
            let mut stopped = lock.lock().unwrap_or_else(|err| err.into_inner());
            while !*stopped {
                let (guard, timeout) = cvar
                    .wait_timeout(stopped, interval)
                    .unwrap_or_else(|err| err.into_inner());
                stopped = guard;
                if timeout.timed_out() {
                    break;
                }
            }
            if *stopped {
                return;
            }
            drop(stopped);
            run_slots(&thread_slots, &thread_abort);
        });

        Self {
            slots,
            abort,
            stop_signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Registers a callback under `id` and returns its control handle.
    pub fn register(&self, id: impl Into<String>, callback: CycleCallback) -> CycleCallbackCtrl {
        let slot = Arc::new(Slot {
            id: id.into(),
            callback: Mutex::new(callback),
            flags: Mutex::new(SlotFlags {
                active: true,
                running: false,
            }),
            cond: Condvar::new(),
        });
        debug!("registered maintenance callback {}", slot.id);

        let mut slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        slots.push(slot.clone());

        CycleCallbackCtrl {
            slot,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Invokes every active callback once. Returns true when any of
    /// them did work.
    pub fn run_once(&self) -> bool {
        run_slots(&self.slots, &self.abort)
    }

    /// Returns the abort flag handed to callbacks.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Stops the ticker thread and raises the abort flag so in-flight
    /// passes cancel. Idempotent.
    pub fn stop(&self) {
        self.abort.store(true, Ordering::SeqCst);
        {
            let (lock, cvar) = &*self.stop_signal;
            let mut stopped = lock.lock().unwrap_or_else(|err| err.into_inner());
            *stopped = true;
            cvar.notify_all();
        }
        let handle = {
            let mut guard = self.handle.lock().unwrap_or_else(|err| err.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for CycleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_slots(slots: &SlotList, abort: &AbortFlag) -> bool {
    let list: Vec<Arc<Slot>> = {
        let guard = slots.lock().unwrap_or_else(|err| err.into_inner());
        guard.clone()
    };

    let mut any = false;
    for slot in list {
        {
            let mut flags = slot.flags.lock().unwrap_or_else(|err| err.into_inner());
            if !flags.active {
                continue;
            }
            flags.running = true;
        }

        let did_work = {
            let mut callback = slot.callback.lock().unwrap_or_else(|err| err.into_inner());
            callback(abort)
        };

        {
            let mut flags = slot.flags.lock().unwrap_or_else(|err| err.into_inner());
            flags.running = false;
            slot.cond.notify_all();
        }

        any |= did_work;
    }

    any
}

/// Handle controlling one registered callback.
pub struct CycleCallbackCtrl {
    slot: Arc<Slot>,
    slots: Weak<SlotList>,
}

impl CycleCallbackCtrl {
    /// Deactivates the callback and waits for an in-flight invocation
    /// to finish.
    ///
    /// # Errors
    ///
    /// `LsmError::ShutdownTimedOut` when the invocation is still
    /// running once `deadline` elapses. The callback stays deactivated,
    /// so no further invocations start either way.
    pub fn unregister(&self, deadline: Duration) -> Result<()> {
        let deadline_at = Instant::now() + deadline;

        let mut flags = self
            .slot
            .flags
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        flags.active = false;

        while flags.running {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LsmError::ShutdownTimedOut);
            }
            let (guard, timeout) = self
                .slot
                .cond
                .wait_timeout(flags, remaining)
                .unwrap_or_else(|err| err.into_inner());
            flags = guard;
            if timeout.timed_out() && flags.running {
                return Err(LsmError::ShutdownTimedOut);
            }
        }
        drop(flags);

        if let Some(slots) = self.slots.upgrade() {
            let mut slots = slots.lock().unwrap_or_else(|err| err.into_inner());
            slots.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        }
        debug!("unregistered maintenance callback {}", self.slot.id);

        Ok(())
    }
}
