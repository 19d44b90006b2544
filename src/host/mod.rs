//! Headless host: owns the host state and serves dispatched jobs from a tick
//! loop on the calling thread.
//!
//! This is the host used by the CLI. The Bevy variant in `gen3d` does the
//! same thing from an exclusive system instead of a sleep loop.

pub mod scene;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::dispatch::HostQueue;

/// Runs on the host thread after the queue is drained, once per tick.
pub type TickHook<H> = Box<dyn FnMut(&mut H)>;

pub struct HeadlessHost<H> {
    state: H,
    queue: HostQueue<H>,
    interval: Duration,
    hooks: Vec<TickHook<H>>,
}

impl<H> HeadlessHost<H> {
    pub fn new(state: H, queue: HostQueue<H>, interval: Duration) -> Self {
        Self {
            state,
            queue,
            interval,
            hooks: Vec::new(),
        }
    }

    pub fn add_tick_hook(&mut self, hook: impl FnMut(&mut H) + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn state(&self) -> &H {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut H {
        &mut self.state
    }

    pub fn into_state(self) -> H {
        self.state
    }

    /// One scheduling tick: run every queued job, then the tick hooks.
    /// Returns the number of jobs executed.
    pub fn tick(&mut self) -> usize {
        let executed = self.queue.drain(&mut self.state);
        for hook in &mut self.hooks {
            hook(&mut self.state);
        }
        executed
    }

    /// Tick every interval until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("Host loop started (tick {:?})", self.interval);
        let mut total = 0usize;
        while !shutdown.load(Ordering::SeqCst) {
            total += self.tick();
            thread::sleep(self.interval);
        }
        debug!("Host loop executed {} jobs", total);
        info!("Host loop stopped");
    }
}
