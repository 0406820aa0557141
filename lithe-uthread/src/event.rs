//! Event channel (spec.md §4 component 5).
//!
//! A lock-free post/drain channel carrying syscall-completion notices from backing
//! threads back to the vcore that originated the call. One [`EventChannel`] exists per
//! vcore (indexed by the vcore id passed to `EventChannels::new`); backing threads post
//! into whichever channel matches the `origin` they were handed, and a vcore drains only
//! its own on every dispatcher re-entry.

use crossbeam_queue::SegQueue;
use std::io;

/// A generic opaque handle the 2LS attaches to a syscall so it can match a completion
/// event back to the task that issued it, without the event channel needing to know
/// anything about tasks. The `lithe` crate uses the task's pointer address for this.
pub type SyscallToken = usize;

/// A single posted completion notice.
pub struct SyscallEvent {
    pub token: SyscallToken,
    pub result: io::Result<usize>,
}

/// One vcore's inbound event queue.
pub struct EventChannel {
    queue: SegQueue<SyscallEvent>,
}

impl EventChannel {
    pub fn new() -> Self {
        EventChannel {
            queue: SegQueue::new(),
        }
    }

    /// Post a completion event. Called from a backing thread; never blocks.
    pub fn post(&self, event: SyscallEvent) {
        self.queue.push(event);
    }

    /// Drain every currently-posted event. Called from the owning vcore's dispatcher;
    /// never blocks, and never observes an event posted after the drain started (a
    /// straggler simply waits for the next drain).
    pub fn drain(&self) -> Vec<SyscallEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.queue.pop() {
            drained.push(event);
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One event channel per vcore, indexed by vcore id.
pub struct EventChannels {
    channels: Vec<EventChannel>,
}

impl EventChannels {
    pub fn new(num_vcores: usize) -> Self {
        let mut channels = Vec::with_capacity(num_vcores);
        channels.resize_with(num_vcores, EventChannel::new);
        EventChannels { channels }
    }

    pub fn post(&self, vcore: usize, event: SyscallEvent) {
        self.channels[vcore].post(event);
    }

    pub fn drain(&self, vcore: usize) -> Vec<SyscallEvent> {
        self.channels[vcore].drain()
    }
}
