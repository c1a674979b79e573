//! Single-writer gating and epoch stamping.
//!
//! Leader election lives outside this crate. The engine only asks the gate
//! two questions before each append: may this node write, and which epoch
//! should the event carry.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

pub trait WriteGate: Send + Sync {
    /// Current leadership term; 0 when no election is in play.
    fn epoch(&self) -> i64;

    fn can_write(&self) -> bool;
}

/// A gate for single-node deployments: always writable, fixed epoch.
#[derive(Debug, Default)]
pub struct StandaloneGate {
    epoch: i64,
}

impl StandaloneGate {
    pub const fn new(epoch: i64) -> Self {
        Self { epoch }
    }
}

impl WriteGate for StandaloneGate {
    fn epoch(&self) -> i64 {
        self.epoch
    }

    fn can_write(&self) -> bool {
        true
    }
}

/// A gate driven by an external elector that flips leadership at runtime.
#[derive(Debug, Default)]
pub struct LeaseGate {
    epoch: AtomicI64,
    leader: AtomicBool,
}

impl LeaseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that this node won `epoch`.
    pub fn promote(&self, epoch: i64) {
        self.epoch.store(epoch, Ordering::SeqCst);
        self.leader.store(true, Ordering::SeqCst);
    }

    pub fn demote(&self) {
        self.leader.store(false, Ordering::SeqCst);
    }
}

impl WriteGate for LeaseGate {
    fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn can_write(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
