//! Shared experience replay store
//!
//! A fixed-capacity circular store. Each slot sits behind its own lock and is
//! stamped with the write index that filled it, so concurrent writers and
//! samplers never see a half-written transition. Samples are copies.
//!
//! Evicted experiences go back into a free pool; `add_transition` refills a
//! pooled allocation instead of allocating new vectors on every write.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;

use super::experience::{Experience, validate_transition};
use crate::config::ReplayConfig;
use crate::error::{AgentError, Result};

#[derive(Debug, Default)]
struct Slot {
    /// Write index that last filled this slot
    seq: u64,
    experience: Option<Experience>,
}

/// Counters describing store and pool health
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReplayStats {
    pub len: usize,
    pub capacity: usize,
    pub pooled: usize,
    pub total_writes: u64,
    pub rejected_writes: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub scan_fallbacks: u64,
}

#[derive(Debug)]
pub struct ReplayStore {
    config: ReplayConfig,
    slots: Vec<Mutex<Slot>>,
    write_index: AtomicU64,
    live: AtomicUsize,
    pool: Mutex<Vec<Experience>>,
    rejected: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    scan_fallbacks: AtomicU64,
    last_compaction: Mutex<Instant>,
}

impl ReplayStore {
    pub fn new(config: ReplayConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(AgentError::Config(
                "replay capacity must be non-zero".to_string(),
            ));
        }
        if config.state_size == 0 || config.action_size == 0 {
            return Err(AgentError::Config(
                "replay dimensions must be non-zero".to_string(),
            ));
        }

        let slots = (0..config.capacity)
            .map(|_| Mutex::new(Slot::default()))
            .collect();

        Ok(Self {
            config,
            slots,
            write_index: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            pool: Mutex::new(Vec::new()),
            rejected: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            scan_fallbacks: AtomicU64::new(0),
            last_compaction: Mutex::new(Instant::now()),
        })
    }

    pub fn with_capacity(state_size: usize, action_size: usize, capacity: usize) -> Result<Self> {
        Self::new(ReplayConfig {
            state_size,
            action_size,
            capacity,
            ..ReplayConfig::default()
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn state_size(&self) -> usize {
        self.config.state_size
    }

    pub fn action_size(&self) -> usize {
        self.config.action_size
    }

    /// Number of live experiences
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire).min(self.config.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an owned experience, overwriting the oldest slot when full
    pub fn add(&self, experience: Experience) -> Result<()> {
        if let Err(err) = experience.validate(self.config.state_size, self.config.action_size) {
            self.reject(&err);
            return Err(err);
        }
        self.store(experience);
        Ok(())
    }

    /// Insert a transition by copying into a pooled allocation
    pub fn add_transition(
        &self,
        state: &[f32],
        action: usize,
        reward: f32,
        next_state: &[f32],
        done: bool,
    ) -> Result<()> {
        if let Err(err) = validate_transition(
            state,
            action,
            reward,
            next_state,
            self.config.state_size,
            self.config.action_size,
        ) {
            self.reject(&err);
            return Err(err);
        }

        let mut experience = self.acquire();
        experience.refill(state, action, reward, next_state, done);
        self.store(experience);
        Ok(())
    }

    fn reject(&self, err: &AgentError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Rejected replay write: {}", err);
    }

    fn acquire(&self) -> Experience {
        if let Some(experience) = self.pool.lock().pop() {
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
            return experience;
        }
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
        Experience::with_capacity(self.config.state_size)
    }

    fn recycle(&self, experience: Experience) {
        let mut pool = self.pool.lock();
        if pool.len() < self.config.capacity {
            pool.push(experience);
        }
    }

    fn store(&self, experience: Experience) {
        let seq = self.write_index.fetch_add(1, Ordering::AcqRel);
        self.place(seq, experience);
    }

    /// Write into the slot owned by `seq`. A writer that was overtaken by one
    /// a full lap ahead leaves the newer entry in place.
    fn place(&self, seq: u64, experience: Experience) {
        let index = (seq % self.config.capacity as u64) as usize;

        let displaced = {
            let mut slot = self.slots[index].lock();
            if slot.experience.is_some() && slot.seq > seq {
                Some(experience)
            } else {
                let evicted = slot.experience.replace(experience);
                slot.seq = seq;
                if evicted.is_none() {
                    self.live.fetch_add(1, Ordering::AcqRel);
                }
                evicted
            }
        };

        if let Some(old) = displaced {
            self.recycle(old);
        }
    }

    /// Draw up to `batch_size` experiences uniformly at random (with replacement)
    pub fn sample(&self, batch_size: usize) -> Vec<Experience> {
        let live = self.len();
        if live == 0 || batch_size == 0 {
            return Vec::new();
        }

        let mut rng = rand::rng();
        let target = batch_size.min(live);
        let mut batch = Vec::with_capacity(target);

        for _ in 0..target {
            match self.draw(&mut rng) {
                Some(experience) => batch.push(experience),
                // Store was emptied underneath us
                None => break,
            }
        }

        batch
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> Option<Experience> {
        let capacity = self.config.capacity;

        for _ in 0..self.config.max_probe_attempts {
            let index = rng.random_range(0..capacity);
            let slot = self.slots[index].lock();
            if let Some(experience) = &slot.experience {
                return Some(experience.clone());
            }
        }

        // Sparse store: scan from a random start instead of probing forever
        self.scan_fallbacks.fetch_add(1, Ordering::Relaxed);
        let start = rng.random_range(0..capacity);
        (0..capacity).find_map(|offset| {
            let slot = self.slots[(start + offset) % capacity].lock();
            slot.experience.clone()
        })
    }

    /// Copies of all live experiences, oldest first
    pub fn snapshot(&self) -> Vec<Experience> {
        let mut stamped: Vec<(u64, Experience)> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                slot.experience.clone().map(|e| (slot.seq, e))
            })
            .collect();
        stamped.sort_by_key(|(seq, _)| *seq);
        stamped.into_iter().map(|(_, e)| e).collect()
    }

    /// Drop every live experience into the pool
    pub fn clear(&self) {
        for slot in &self.slots {
            let taken = {
                let mut slot = slot.lock();
                let taken = slot.experience.take();
                if taken.is_some() {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                }
                taken
            };
            if let Some(experience) = taken {
                self.recycle(experience);
            }
        }
        tracing::debug!("Replay store cleared");
    }

    /// Estimated bytes held by live and pooled experiences
    pub fn estimated_bytes(&self) -> usize {
        let per_experience = std::mem::size_of::<Experience>()
            + 2 * self.config.state_size * std::mem::size_of::<f32>();
        let pooled: usize = self.pool.lock().iter().map(|e| e.heap_bytes()).sum();
        self.len() * per_experience + pooled
    }

    /// Fraction of the configured memory ceiling in use
    pub fn memory_pressure(&self) -> f32 {
        if self.config.memory_ceiling_bytes == 0 {
            return 0.0;
        }
        self.estimated_bytes() as f32 / self.config.memory_ceiling_bytes as f32
    }

    /// Compact if the interval elapsed or memory pressure is high
    pub fn maybe_compact(&self) -> Option<usize> {
        let due = self.last_compaction.lock().elapsed() >= self.config.compaction_interval;
        if due || self.memory_pressure() > self.config.memory_pressure_ratio {
            Some(self.compact())
        } else {
            None
        }
    }

    /// Reclaim invalid slots and trim the free pool; returns the number reclaimed
    pub fn compact(&self) -> usize {
        let mut reclaimed = 0;

        for slot in &self.slots {
            let mut slot = slot.lock();
            let invalid = slot
                .experience
                .as_ref()
                .is_some_and(|e| e.validate(self.config.state_size, self.config.action_size).is_err());
            if invalid {
                slot.experience = None;
                self.live.fetch_sub(1, Ordering::AcqRel);
                reclaimed += 1;
            }
        }

        {
            let mut pool = self.pool.lock();
            if pool.len() > self.config.pool_retention {
                reclaimed += pool.len() - self.config.pool_retention;
                pool.truncate(self.config.pool_retention);
                pool.shrink_to_fit();
            }
        }

        *self.last_compaction.lock() = Instant::now();
        tracing::debug!("Replay compaction reclaimed {} entries", reclaimed);
        reclaimed
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            len: self.len(),
            capacity: self.config.capacity,
            pooled: self.pool.lock().len(),
            total_writes: self.write_index.load(Ordering::Acquire),
            rejected_writes: self.rejected.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            scan_fallbacks: self.scan_fallbacks.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn corrupt_slot(&self, index: usize) {
        let mut slot = self.slots[index].lock();
        if let Some(experience) = slot.experience.as_mut() {
            experience.state.push(0.0);
        }
    }
}
