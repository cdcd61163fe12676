//! Shared shutdown flags, observed by every stage's loop condition.
//!
//! The controller clears `run` to begin the ordered teardown; each stage
//! clears its own `*_active` flag as it exits so the stage downstream knows
//! when its input is truly done.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct ControlFlags {
    run: AtomicBool,
    capture_active: AtomicBool,
    transform_active: AtomicBool,
    persist_active: AtomicBool,
    broadcast_active: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self {
            run: AtomicBool::new(true),
            capture_active: AtomicBool::new(true),
            transform_active: AtomicBool::new(true),
            persist_active: AtomicBool::new(true),
            broadcast_active: AtomicBool::new(true),
        }
    }

    pub fn run(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    /// Begin the ordered shutdown
    pub fn halt(&self) {
        self.run.store(false, Ordering::Release);
    }

    pub fn capture_active(&self) -> bool {
        self.capture_active.load(Ordering::Acquire)
    }

    pub fn capture_done(&self) {
        self.capture_active.store(false, Ordering::Release);
    }

    pub fn transform_active(&self) -> bool {
        self.transform_active.load(Ordering::Acquire)
    }

    pub fn transform_done(&self) {
        self.transform_active.store(false, Ordering::Release);
    }

    pub fn persist_active(&self) -> bool {
        self.persist_active.load(Ordering::Acquire)
    }

    pub fn persist_done(&self) {
        self.persist_active.store(false, Ordering::Release);
    }

    pub fn broadcast_active(&self) -> bool {
        self.broadcast_active.load(Ordering::Acquire)
    }

    pub fn broadcast_done(&self) {
        self.broadcast_active.store(false, Ordering::Release);
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}
