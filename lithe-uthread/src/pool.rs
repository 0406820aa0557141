//! Backing-thread pool (spec.md §4 component 6).
//!
//! A bounded pool of ordinary OS threads that exist to do the one thing a uthread must
//! never do itself: block. The syscall wrapper (spec.md §4.9) hands a job here instead of
//! calling the blocking function inline; a worker picks it up, blocks on it, and posts the
//! result back through the originating vcore's [`EventChannel`].
//!
//! "Futex-gated" in spec.md terms is a parked condvar wait here — we're a userspace
//! library on top of `std::thread`, not the kernel primitive itself, so a `Mutex`/`Condvar`
//! pair plays the same role a raw futex would in the original.

use crate::event::{EventChannels, SyscallEvent, SyscallToken};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// A pending blocking call: which vcore to notify, what token to tag the result with, and
/// the closure that performs the (blocking) work.
pub struct BackingJob {
    pub origin_vcore: usize,
    pub token: SyscallToken,
    pub run: Box<dyn FnOnce() -> io::Result<usize> + Send + 'static>,
}

struct Shared {
    queue: Mutex<VecDeque<BackingJob>>,
    not_empty: Condvar,
    events: Arc<EventChannels>,
    shutdown: std::sync::atomic::AtomicBool,
}

/// Owns `size` parked worker threads; `submit` hands one a [`BackingJob`] and returns
/// immediately.
#[derive(Clone)]
pub struct BackingPool {
    shared: Arc<Shared>,
}

impl BackingPool {
    pub fn new(size: usize, events: Arc<EventChannels>) -> Self {
        assert!(size > 0, "a backing pool needs at least one worker");
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            events,
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });

        for i in 0..size {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("lithe-backing-{}", i))
                .spawn(move || backing_worker_main(shared))
                .expect("failed to spawn backing thread");
        }

        BackingPool { shared }
    }

    /// Queue `job`; one parked worker wakes, runs `job.run()`, and posts the result to
    /// `job.origin_vcore`'s event channel. Never blocks the caller (the whole point:
    /// this is called from vcore context, which must never block).
    pub fn submit(&self, job: BackingJob) {
        log::debug!(
            "backing pool: job {} submitted for vcore {}",
            job.token,
            job.origin_vcore
        );
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(job);
        self.shared.not_empty.notify_one();
    }

    pub fn shutdown(&self) {
        log::info!("backing pool: shutting down");
        self.shared
            .shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.shared.not_empty.notify_all();
    }
}

fn backing_worker_main(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    break None;
                }
                let (guard, _timeout) = shared
                    .not_empty
                    .wait_timeout(queue, std::time::Duration::from_millis(50))
                    .unwrap();
                queue = guard;
            }
        };

        let job = match job {
            Some(job) => job,
            None => return,
        };

        let result = (job.run)();
        log::debug!(
            "backing pool: job {} completed ({})",
            job.token,
            if result.is_ok() { "ok" } else { "err" }
        );
        shared.events.post(
            job.origin_vcore,
            SyscallEvent {
                token: job.token,
                result,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn submitted_job_completes_and_posts_event() {
        init();
        let events = Arc::new(EventChannels::new(1));
        let pool = BackingPool::new(2, events.clone());

        pool.submit(BackingJob {
            origin_vcore: 0,
            token: 42,
            run: Box::new(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(7)
            }),
        });

        let mut drained = Vec::new();
        for _ in 0..50 {
            drained = events.drain(0);
            if !drained.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].token, 42);
        assert_eq!(drained[0].result.as_ref().unwrap(), &7);
        pool.shutdown();
    }
}
