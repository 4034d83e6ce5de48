use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::{
    error::{EngineErr, ProcessingFailure, Result},
    increment::ModelIncrement,
};

/// Cache entries are addressed by (batch id, model name).
pub type CacheKey = (Uuid, String);

/// What a finished computation left behind: the increment, or the failure
/// every consumer of this key should see.
pub type CacheValue = std::result::Result<ModelIncrement, ProcessingFailure>;

/// Outcome of claiming a key for computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// The caller owns the computation for this key.
    Started,
    /// Another computation already owns the key, or its result is still
    /// awaiting consumption.
    AlreadyInFlight,
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(CacheValue),
}

/// Keyed at-most-once computation cache shared by the worker pool and the
/// iteration controller.
///
/// The key space is split across a fixed set of lock shards so operations
/// on unrelated keys do not contend. Entries carry an explicit
/// pending/ready tag; readers block on the owning shard's condvar.
#[derive(Debug)]
pub struct IncrementCache {
    shards: Vec<CacheShard>,
}

#[derive(Debug, Default)]
struct CacheShard {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    ready: Condvar,
}

const SHARD_COUNT: usize = 16;

impl Default for IncrementCache {
    fn default() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| CacheShard::default()).collect();
        Self { shards }
    }
}

impl IncrementCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, key: &CacheKey) -> &CacheShard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Claims `key` for computation.
    ///
    /// At most one claimant observes `Started` until the entry is either
    /// published-and-taken or disposed.
    pub fn try_begin(&self, key: &CacheKey) -> Begin {
        let shard = self.shard(key);
        let mut slots = shard.slots.lock();
        if slots.contains_key(key) {
            return Begin::AlreadyInFlight;
        }
        slots.insert(key.clone(), Slot::Pending);
        Begin::Started
    }

    /// Transitions a pending entry to ready and wakes waiting takers.
    ///
    /// Publishing a key that was never claimed, or claimed and already
    /// published, is a protocol violation.
    pub fn publish(&self, key: &CacheKey, value: CacheValue) -> Result<()> {
        let shard = self.shard(key);
        let mut slots = shard.slots.lock();
        match slots.get(key) {
            Some(Slot::Pending) => {
                slots.insert(key.clone(), Slot::Ready(value));
                shard.ready.notify_all();
                Ok(())
            }
            Some(Slot::Ready(_)) => Err(EngineErr::Protocol("publish on an already ready entry")),
            None => Err(EngineErr::Protocol("publish without a matching begin")),
        }
    }

    /// Blocks until the entry for `key` is ready, removes it and returns
    /// its value. Times out when `timeout` elapses first.
    pub fn wait_and_take(&self, key: &CacheKey, timeout: Duration) -> Result<CacheValue> {
        let deadline = Instant::now() + timeout;
        let shard = self.shard(key);
        let mut slots = shard.slots.lock();

        loop {
            if matches!(slots.get(key), Some(Slot::Ready(_))) {
                // SAFETY: checked above under the same lock.
                let Some(Slot::Ready(value)) = slots.remove(key) else {
                    unreachable!()
                };
                return Ok(value);
            }
            if shard.ready.wait_until(&mut slots, deadline).timed_out() {
                return Err(EngineErr::Timeout { waited: timeout });
            }
        }
    }

    /// Removes an entry regardless of state, re-arming the key.
    pub fn dispose(&self, key: &CacheKey) {
        let shard = self.shard(key);
        shard.slots.lock().remove(key);
    }

    /// Evicts every entry belonging to `model`, in any state. Used when a
    /// model is discarded mid-run.
    pub fn dispose_model(&self, model: &str) {
        for shard in &self.shards {
            shard.slots.lock().retain(|(_, name), _| name != model);
        }
    }

    /// How many ready entries `model` currently has.
    pub fn ready_count(&self, model: &str) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .slots
                    .lock()
                    .iter()
                    .filter(|((_, name), slot)| name == model && matches!(slot, Slot::Ready(_)))
                    .count()
            })
            .sum()
    }
}
