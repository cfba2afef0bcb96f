//! Numerical stability guard
//!
//! Tracks gradient magnitudes, detects explosions, adapts the learning-rate
//! scale and clip threshold, and suspends learning for a cooldown window once
//! too many explosions pile up. The suspension resets itself lazily: the first
//! check after the deadline clears it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use super::tuning::AtomicF32;
use crate::config::StabilityConfig;

/// Outcome of inspecting a raw gradient
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientCheck {
    Normal,
    Exploded { magnitude: f32 },
}

/// Point-in-time view of the guard's counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilitySnapshot {
    pub clip_threshold: f32,
    pub learning_rate_scale: f32,
    pub last_gradient_norm: f32,
    pub explosions: u32,
    pub total_explosions: u64,
    pub consecutive_failures: u32,
    pub emergency_stop: bool,
    pub emergency_resets: u64,
}

#[derive(Debug)]
pub struct StabilityGuard {
    config: StabilityConfig,
    clip_threshold: AtomicF32,
    learning_rate_scale: AtomicF32,
    last_gradient_norm: AtomicF32,
    explosions: AtomicU32,
    total_explosions: AtomicU64,
    consecutive_failures: AtomicU32,
    emergency_stop: AtomicBool,
    emergency_until: Mutex<Option<Instant>>,
    emergency_resets: AtomicU64,
}

impl StabilityGuard {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            clip_threshold: AtomicF32::new(config.gradient_clip_threshold),
            learning_rate_scale: AtomicF32::new(1.0),
            last_gradient_norm: AtomicF32::new(0.0),
            explosions: AtomicU32::new(0),
            total_explosions: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            emergency_stop: AtomicBool::new(false),
            emergency_until: Mutex::new(None),
            emergency_resets: AtomicU64::new(0),
            config,
        }
    }

    pub fn clip_threshold(&self) -> f32 {
        self.clip_threshold.load()
    }

    pub fn learning_rate_scale(&self) -> f32 {
        self.learning_rate_scale.load()
    }

    pub fn last_gradient_norm(&self) -> f32 {
        self.last_gradient_norm.load()
    }

    /// Clamp a gradient to the current threshold
    pub fn clip(&self, gradient: f32) -> f32 {
        let threshold = self.clip_threshold();
        gradient.clamp(-threshold, threshold)
    }

    /// Record a raw gradient magnitude and react if it looks like an explosion
    pub fn check_gradient(&self, gradient: f32) -> GradientCheck {
        let magnitude = gradient.abs();
        let previous = self.last_gradient_norm.load();

        let exploded = !magnitude.is_finite()
            || magnitude > self.config.explosion_ceiling
            || (previous > 0.0
                && magnitude > previous * self.config.explosion_ratio
                && magnitude > 1.0);

        if magnitude.is_finite() {
            self.last_gradient_norm.store(magnitude);
        }

        if exploded {
            self.on_explosion(magnitude);
            GradientCheck::Exploded { magnitude }
        } else {
            GradientCheck::Normal
        }
    }

    fn on_explosion(&self, magnitude: f32) {
        let scale = self.learning_rate_scale.update(|s| s * 0.5);
        let min_clip = self.config.min_clip_threshold;
        let clip = self.clip_threshold.update(|c| (c * 0.8).max(min_clip));
        self.total_explosions.fetch_add(1, Ordering::Relaxed);
        let count = self.explosions.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::warn!(
            "Gradient explosion #{} (magnitude {}): lr scale {:.4}, clip {:.4}",
            count,
            magnitude,
            scale,
            clip
        );

        if count >= self.config.max_explosions && !self.emergency_stop.load(Ordering::Acquire) {
            self.trigger_emergency_stop();
        }
    }

    fn trigger_emergency_stop(&self) {
        let mut until = self.emergency_until.lock();
        *until = Some(Instant::now() + self.config.emergency_cooldown);
        self.emergency_stop.store(true, Ordering::Release);
        tracing::error!(
            "Emergency stop: learning suspended for {:?}",
            self.config.emergency_cooldown
        );
    }

    /// Whether learning is currently suspended; clears an expired stop
    pub fn is_learning_suspended(&self) -> bool {
        if !self.emergency_stop.load(Ordering::Acquire) {
            return false;
        }

        let mut until = self.emergency_until.lock();
        let expired = until.is_none_or(|deadline| Instant::now() >= deadline);
        if !expired {
            return true;
        }

        *until = None;
        self.explosions.store(0, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.learning_rate_scale
            .store(self.config.recovery_learning_rate_scale);
        self.clip_threshold.store(self.config.gradient_clip_threshold);
        self.last_gradient_norm.store(0.0);
        self.emergency_stop.store(false, Ordering::Release);
        self.emergency_resets.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Emergency stop lifted; resuming at {:.0}% learning rate",
            self.config.recovery_learning_rate_scale * 100.0
        );
        false
    }

    pub fn emergency_stop(&self) -> bool {
        self.emergency_stop.load(Ordering::Acquire)
    }

    /// Count a failed update; returns the consecutive failure count
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Failures have exceeded the configured threshold
    pub fn needs_reinitialization(&self) -> bool {
        self.consecutive_failures() > self.config.max_consecutive_failures
    }

    /// Back to construction defaults (after reinitialization)
    pub fn reset(&self) {
        let mut until = self.emergency_until.lock();
        *until = None;
        self.clip_threshold.store(self.config.gradient_clip_threshold);
        self.learning_rate_scale.store(1.0);
        self.last_gradient_norm.store(0.0);
        self.explosions.store(0, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.emergency_stop.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> StabilitySnapshot {
        StabilitySnapshot {
            clip_threshold: self.clip_threshold(),
            learning_rate_scale: self.learning_rate_scale(),
            last_gradient_norm: self.last_gradient_norm(),
            explosions: self.explosions.load(Ordering::Acquire),
            total_explosions: self.total_explosions.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            emergency_stop: self.emergency_stop(),
            emergency_resets: self.emergency_resets.load(Ordering::Relaxed),
        }
    }
}
