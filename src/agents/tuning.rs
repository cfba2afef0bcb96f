//! Runtime-tunable parameters
//!
//! An external control surface may change these at any time from any thread.
//! Out-of-range writes are clamped, never rejected.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub const LEARNING_RATE_BOUNDS: RangeInclusive<f32> = 1e-4..=1e-1;
pub const EPSILON_BOUNDS: RangeInclusive<f32> = 0.0..=1.0;
pub const BATCH_SIZE_BOUNDS: RangeInclusive<usize> = 1..=1024;
pub const CLIP_RATIO_BOUNDS: RangeInclusive<f32> = 0.01..=0.5;
pub const DISCOUNT_BOUNDS: RangeInclusive<f32> = 0.0..=0.999;

/// `f32` stored as bits in an `AtomicU32`
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Apply `f` atomically, returning the new value
    pub fn update<F: Fn(f32) -> f32>(&self, f: F) -> f32 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(f32::from_bits(current));
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

fn clamp_f32(name: &str, value: f32, bounds: &RangeInclusive<f32>) -> f32 {
    let clamped = if value.is_nan() {
        *bounds.start()
    } else {
        value.clamp(*bounds.start(), *bounds.end())
    };
    if clamped != value {
        tracing::debug!("Clamped {} from {} to {}", name, value, clamped);
    }
    clamped
}

/// Parameters shared between an agent and its control surface
#[derive(Debug)]
pub struct Tunables {
    learning_rate: AtomicF32,
    epsilon: AtomicF32,
    batch_size: AtomicUsize,
    clip_ratio: AtomicF32,
    discount: AtomicF32,
}

impl Tunables {
    pub fn new(
        learning_rate: f32,
        epsilon: f32,
        batch_size: usize,
        clip_ratio: f32,
        discount: f32,
    ) -> Self {
        let tunables = Self {
            learning_rate: AtomicF32::new(0.0),
            epsilon: AtomicF32::new(0.0),
            batch_size: AtomicUsize::new(1),
            clip_ratio: AtomicF32::new(0.0),
            discount: AtomicF32::new(0.0),
        };
        tunables.set_learning_rate(learning_rate);
        tunables.set_epsilon(epsilon);
        tunables.set_batch_size(batch_size);
        tunables.set_clip_ratio(clip_ratio);
        tunables.set_discount(discount);
        tunables
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate.load()
    }

    pub fn set_learning_rate(&self, value: f32) {
        self.learning_rate
            .store(clamp_f32("learning rate", value, &LEARNING_RATE_BOUNDS));
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon.load()
    }

    pub fn set_epsilon(&self, value: f32) {
        self.epsilon.store(clamp_f32("epsilon", value, &EPSILON_BOUNDS));
    }

    /// Multiplicative decay toward `floor`; never increases epsilon
    pub fn decay_epsilon(&self, decay: f32, floor: f32) -> f32 {
        self.epsilon.update(|eps| {
            let next = (eps * decay).max(floor);
            next.min(eps)
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Acquire)
    }

    pub fn set_batch_size(&self, value: usize) {
        let clamped = value.clamp(*BATCH_SIZE_BOUNDS.start(), *BATCH_SIZE_BOUNDS.end());
        if clamped != value {
            tracing::debug!("Clamped batch size from {} to {}", value, clamped);
        }
        self.batch_size.store(clamped, Ordering::Release);
    }

    pub fn clip_ratio(&self) -> f32 {
        self.clip_ratio.load()
    }

    pub fn set_clip_ratio(&self, value: f32) {
        self.clip_ratio
            .store(clamp_f32("clip ratio", value, &CLIP_RATIO_BOUNDS));
    }

    pub fn discount(&self) -> f32 {
        self.discount.load()
    }

    pub fn set_discount(&self, value: f32) {
        self.discount
            .store(clamp_f32("discount", value, &DISCOUNT_BOUNDS));
    }
}
