//! Negative cache of capture targets whose GPU path recently failed

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

/// Default time a faulted target skips the GPU path
pub const DEFAULT_FAULT_TTL: Duration = Duration::from_secs(10);

/// Per-target fault records with expiry
///
/// Owned by one GPU backend instance, so faults never leak between sessions.
#[derive(Debug)]
pub struct FaultCache {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl Default for FaultCache {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_TTL)
    }
}

impl FaultCache {
    /// Creates an empty cache with the given TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns the TTL applied to new records
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records a fault for `name`, restarting its TTL
    pub fn insert(&mut self, name: &str) {
        self.insert_at(name, Instant::now());
    }

    /// Records a fault as of `now`
    pub fn insert_at(&mut self, name: &str, now: Instant) {
        debug!("Marking {} as faulted for {:?}", name, self.ttl);
        self.entries.insert(name.to_string(), now + self.ttl);
    }

    /// Returns true if `name` faulted within the TTL
    pub fn contains(&mut self, name: &str) -> bool {
        self.contains_at(name, Instant::now())
    }

    /// Returns true if `name` is faulted as of `now`; expired records are dropped
    pub fn contains_at(&mut self, name: &str, now: Instant) -> bool {
        match self.entries.get(name) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                self.entries.remove(name);
                false
            }
            None => false,
        }
    }

    /// Forgets every record
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of records, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cross-thread request to fault the current GPU target
///
/// Any thread may raise it; only the capture loop that owns the GPU handle
/// takes it, right before its next acquire, so the handle is never disposed
/// during an acquire.
#[derive(Debug, Clone, Default)]
pub struct FaultSignal {
    raised: Arc<AtomicBool>,
}

impl FaultSignal {
    /// Creates a lowered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Lowers the signal, returning true if it was raised
    pub fn take(&self) -> bool {
        self.raised
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true if raised, without lowering it
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}
