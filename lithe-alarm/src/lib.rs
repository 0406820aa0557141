//! Alarm service (spec.md §4 component 7).
//!
//! A one-shot timer backed by its own worker thread, following spec.md §4.10 to the
//! letter: the worker reads `wakeup_time` under a spinlock, sleeps the delta, and
//! re-reads; if `wakeup_time` moved while it slept (someone rearmed the alarm) it loops
//! instead of firing early or late. Cancellation (`unset_alarm`) and firing race on a
//! single atomic outcome so exactly one of "callback fires" / "`unset` returns `true`"
//! happens, per spec.md's testable property 6 and the `set_awaiter_inc` mechanism
//! described in the original `alarm.c`.

use lithe_sync::Spinlock;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

struct Inner {
    /// Guards `wakeup_time`; matches spec.md's "Alarm global spinlock serialises waiter
    /// wakeup-time updates against the worker's read-sleep-recheck loop" — scoped per
    /// alarm here rather than truly global, since each alarm owns its own worker.
    lock: Spinlock,
    wakeup_time: std::cell::UnsafeCell<Instant>,
    /// Bumped on every rearm (`set_awaiter_inc`); lets the worker tell "woken because the
    /// time arrived" apart from "woken because someone changed `wakeup_time`" without
    /// taking a fresh fire-vs-cancel decision each time it wakes.
    generation: AtomicUsize,
    outcome: AtomicU8,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// Safety: `wakeup_time` is only ever touched under `lock`.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// A handle to an armed alarm. Dropping it does not cancel the alarm — call
/// [`AlarmHandle::unset`] explicitly, matching spec.md's "cancellation is ... via
/// `unset_alarm`" rather than an implicit RAII cancel.
#[derive(Clone)]
pub struct AlarmHandle {
    inner: Arc<Inner>,
}

/// `set_alarm`: arm a one-shot timer that fires `callback` after `delay`, on a dedicated
/// worker thread.
pub fn set_alarm<F>(delay: Duration, callback: F) -> AlarmHandle
where
    F: FnOnce() + Send + 'static,
{
    let inner = Arc::new(Inner {
        lock: Spinlock::new(),
        wakeup_time: std::cell::UnsafeCell::new(Instant::now() + delay),
        generation: AtomicUsize::new(0),
        outcome: AtomicU8::new(PENDING),
        callback: Mutex::new(Some(Box::new(callback))),
    });

    log::debug!("alarm: armed for {:?}", delay);
    let worker_inner = inner.clone();
    thread::Builder::new()
        .name("lithe-alarm".into())
        .spawn(move || alarm_worker_main(worker_inner))
        .expect("failed to spawn alarm worker thread");

    AlarmHandle { inner }
}

impl AlarmHandle {
    /// `unset_alarm`: cancel the alarm. Returns `true` iff this call raced in ahead of the
    /// callback firing (i.e. the callback will now never run); returns `false` if the
    /// callback had already committed to firing (or had already fired).
    pub fn unset(&self) -> bool {
        let cancelled = self
            .inner
            .outcome
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        log::debug!("alarm: unset raced {}", if cancelled { "ahead of firing" } else { "behind firing" });
        cancelled
    }

    /// Rearm the alarm to fire `delay` from now instead, per spec.md's
    /// `set_awaiter_inc`-driven rearm path. Has no effect once the alarm has fired or been
    /// cancelled.
    pub fn rearm(&self, delay: Duration) {
        let _guard = self.inner.lock.lock();
        unsafe {
            *self.inner.wakeup_time.get() = Instant::now() + delay;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("alarm: rearmed for {:?} (generation {})", delay, generation);
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.load(Ordering::SeqCst) == FIRED
    }
}

fn alarm_worker_main(inner: Arc<Inner>) {
    loop {
        let (target, seen_generation) = {
            let _guard = inner.lock.lock();
            (
                unsafe { *inner.wakeup_time.get() },
                inner.generation.load(Ordering::SeqCst),
            )
        };

        let now = Instant::now();
        if target > now {
            thread::sleep(target - now);
        }

        if inner.generation.load(Ordering::SeqCst) != seen_generation {
            log::trace!("alarm: worker woke to a rearm, rechecking wakeup_time");
            continue;
        }

        match inner
            .outcome
            .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                log::debug!("alarm: fired");
                if let Some(callback) = inner.callback.lock().unwrap().take() {
                    callback();
                }
            }
            Err(_) => {
                log::debug!("alarm: worker woke to find it already cancelled");
            }
        }
        return;
    }
}
