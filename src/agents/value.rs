//! DQN-style value agent
//!
//! Epsilon-greedy action selection over a primary approximator, Q-learning
//! updates bootstrapped from a lagged target copy, and a stability guard that
//! clips gradients, shrinks the step on exploding updates and suspends learning after
//! repeated explosions.
//!
//! Locking: the primary and target approximators each sit behind their own
//! `RwLock` and no code path holds both. A target sync clones the primary
//! under its read lock (so it never observes a half-applied update) and then
//! writes the target under the target lock.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;

use super::backend::Backend;
use super::experience::{validate_action, validate_state};
use super::linalg::{argmax, softmax};
use super::outcome::{Decision, LearnOutcome, SkipReason, TrainOutcome, TrainReport};
use super::persistence;
use super::replay::ReplayStore;
use super::stability::{GradientCheck, StabilityGuard, StabilitySnapshot};
use super::tuning::Tunables;
use crate::config::ValueAgentConfig;
use crate::error::{AgentError, Result};

/// Point-in-time view of a value agent
#[derive(Debug, Clone, PartialEq)]
pub struct ValueAgentStats {
    pub backend: &'static str,
    pub epsilon: f32,
    pub learning_rate: f32,
    pub total_updates: u64,
    pub target_syncs: u64,
    pub updates_since_sync: usize,
    pub stability: StabilitySnapshot,
}

pub struct ValueAgent {
    config: ValueAgentConfig,
    tunables: Tunables,
    primary: RwLock<Option<Backend>>,
    target: RwLock<Option<Backend>>,
    replay: Arc<ReplayStore>,
    stability: StabilityGuard,
    updates_since_sync: AtomicUsize,
    total_updates: AtomicU64,
    target_syncs: AtomicU64,
    shut_down: AtomicBool,
}

impl ValueAgent {
    pub fn new(config: ValueAgentConfig, replay: Arc<ReplayStore>) -> Result<Self> {
        if config.state_size == 0 || config.action_size == 0 {
            return Err(AgentError::Config(
                "state and action sizes must be non-zero".to_string(),
            ));
        }
        if config.bucket_count == 0 || config.target_sync_interval == 0 {
            return Err(AgentError::Config(
                "bucket count and sync interval must be non-zero".to_string(),
            ));
        }
        if replay.state_size() != config.state_size || replay.action_size() != config.action_size {
            return Err(AgentError::ShapeMismatch(format!(
                "replay store is {}x{}, agent is {}x{}",
                replay.state_size(),
                replay.action_size(),
                config.state_size,
                config.action_size
            )));
        }

        let primary = Backend::from_config(&config);
        let target = primary.clone();
        let tunables = Tunables::new(
            config.learning_rate,
            config.epsilon,
            config.batch_size,
            0.2,
            config.gamma,
        );

        tracing::info!(
            "Value agent ready: {} backend, {} states -> {} actions",
            primary.name(),
            config.state_size,
            config.action_size
        );

        Ok(Self {
            stability: StabilityGuard::new(config.stability.clone()),
            tunables,
            primary: RwLock::new(Some(primary)),
            target: RwLock::new(Some(target)),
            replay,
            updates_since_sync: AtomicUsize::new(0),
            total_updates: AtomicU64::new(0),
            target_syncs: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Runtime-tunable parameters (learning rate, epsilon, batch size, discount)
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn epsilon(&self) -> f32 {
        self.tunables.epsilon()
    }

    pub fn set_epsilon(&self, epsilon: f32) {
        self.tunables.set_epsilon(epsilon);
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.stability.emergency_stop()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn random_action(&self) -> usize {
        rand::rng().random_range(0..self.config.action_size)
    }

    /// Epsilon-greedy decision with an explicit fallback branch
    pub fn decide(&self, state: &[f32]) -> Decision {
        if self.is_shut_down() {
            return Decision::Fallback {
                action: self.random_action(),
                reason: AgentError::ShutDown,
            };
        }
        if let Err(reason) = validate_state(state, self.config.state_size) {
            tracing::debug!("Falling back to a random action: {}", reason);
            return Decision::Fallback {
                action: self.random_action(),
                reason,
            };
        }

        let mut rng = rand::rng();
        if rng.random::<f32>() < self.tunables.epsilon() {
            return Decision::Explore(rng.random_range(0..self.config.action_size));
        }

        match self.greedy_action(state) {
            Ok(action) => Decision::Exploit(action),
            Err(reason) => {
                tracing::warn!("Greedy selection failed, acting randomly: {}", reason);
                Decision::Fallback {
                    action: rng.random_range(0..self.config.action_size),
                    reason,
                }
            }
        }
    }

    /// Never fails; see `decide` for why an action was chosen
    pub fn select_action(&self, state: &[f32]) -> usize {
        self.decide(state).action()
    }

    fn greedy_action(&self, state: &[f32]) -> Result<usize> {
        let q = self.q_values(state)?;
        argmax(&q).ok_or(AgentError::NonFiniteOutput)
    }

    /// Primary Q-values for `state`
    pub fn q_values(&self, state: &[f32]) -> Result<Vec<f32>> {
        validate_state(state, self.config.state_size)?;
        let primary = self.primary.read();
        primary
            .as_ref()
            .ok_or(AgentError::ShutDown)?
            .q_values(state)
    }

    /// Softmax of the Q-values, in [0, 1]; 0 on invalid input
    pub fn evaluate_action_confidence(&self, state: &[f32], action: usize) -> f32 {
        if validate_action(action, self.config.action_size).is_err() {
            return 0.0;
        }
        match self.q_values(state) {
            Ok(q) => softmax(&q)[action],
            Err(err) => {
                tracing::debug!("Confidence unavailable: {}", err);
                0.0
            }
        }
    }

    /// Store the transition and take one online Q-learning step
    pub fn record_and_learn(
        &self,
        state: &[f32],
        action: usize,
        reward: f32,
        next_state: &[f32],
        done: bool,
    ) -> LearnOutcome {
        if self.is_shut_down() {
            return LearnOutcome::Skipped(SkipReason::ShutDown);
        }
        if let Err(err) = self
            .replay
            .add_transition(state, action, reward, next_state, done)
        {
            return LearnOutcome::Rejected(err);
        }
        if self.stability.is_learning_suspended() {
            return LearnOutcome::Skipped(SkipReason::EmergencyStop);
        }

        let outcome = self.learn(state, action, reward, next_state, done);
        if outcome.changed_weights() {
            self.after_update();
        }
        outcome
    }

    /// Batched update from the shared replay store
    pub fn train_step(&self) -> TrainOutcome {
        if self.is_shut_down() {
            return TrainOutcome::Skipped(SkipReason::ShutDown);
        }
        if self.stability.is_learning_suspended() {
            return TrainOutcome::Skipped(SkipReason::EmergencyStop);
        }

        let required = self.tunables.batch_size();
        let available = self.replay.len();
        if available < required {
            return TrainOutcome::Skipped(SkipReason::InsufficientData {
                available,
                required,
            });
        }

        let mut report = TrainReport::default();
        let mut abs_error_sum = 0.0;

        for exp in self.replay.sample(required) {
            report.samples += 1;
            match self.learn(&exp.state, exp.action, exp.reward, &exp.next_state, exp.done) {
                LearnOutcome::Applied { td_error, .. } => {
                    report.applied += 1;
                    abs_error_sum += td_error.abs();
                    self.after_update();
                }
                LearnOutcome::Exploded { step, .. } => {
                    report.exploded += 1;
                    if step != 0.0 {
                        self.after_update();
                    }
                    if self.stability.is_learning_suspended() {
                        break;
                    }
                }
                LearnOutcome::Failed(_) => report.failed += 1,
                LearnOutcome::Skipped(_) | LearnOutcome::Rejected(_) => {}
            }
        }

        if report.applied > 0 {
            report.mean_abs_error = abs_error_sum / report.applied as f32;
        }
        TrainOutcome::Trained(report)
    }

    fn learn(
        &self,
        state: &[f32],
        action: usize,
        reward: f32,
        next_state: &[f32],
        done: bool,
    ) -> LearnOutcome {
        let bootstrap = if done {
            0.0
        } else {
            match self.target_max(next_state) {
                Ok(value) => value,
                Err(err) => {
                    self.stability.record_failure();
                    tracing::warn!("Target evaluation failed: {}", err);
                    return LearnOutcome::Failed(err);
                }
            }
        };
        let td_target = reward + self.tunables.discount() * bootstrap;

        let mut primary = self.primary.write();
        let Some(backend) = primary.as_mut() else {
            return LearnOutcome::Skipped(SkipReason::ShutDown);
        };

        let current = match backend.q_values(state) {
            Ok(q) => q[action],
            Err(err) => {
                self.stability.record_failure();
                return LearnOutcome::Failed(err);
            }
        };

        let gradient = td_target - current;
        let check = self.stability.check_gradient(gradient);
        if let GradientCheck::Exploded { magnitude } = check {
            if !gradient.is_finite() || self.stability.emergency_stop() {
                return LearnOutcome::Exploded {
                    magnitude,
                    step: 0.0,
                };
            }
        }

        // An explosion has already tightened the scale and clip used here
        let learning_rate = self.tunables.learning_rate() * self.stability.learning_rate_scale();
        let step = learning_rate * self.stability.clip(gradient);
        let report = backend.apply_update(state, action, step);
        drop(primary);

        if report.rolled_back > 0 {
            let failures = self.stability.record_failure();
            tracing::warn!(
                "Rolled back {} non-finite entries ({} consecutive failures)",
                report.rolled_back,
                failures
            );
        } else {
            self.stability.record_success();
        }

        match check {
            GradientCheck::Exploded { magnitude } => LearnOutcome::Exploded { magnitude, step },
            GradientCheck::Normal => LearnOutcome::Applied {
                td_error: gradient,
                step,
            },
        }
    }

    fn target_max(&self, next_state: &[f32]) -> Result<f32> {
        let target = self.target.read();
        let q = target
            .as_ref()
            .ok_or(AgentError::ShutDown)?
            .q_values(next_state)?;
        q.into_iter()
            .reduce(f32::max)
            .ok_or(AgentError::NonFiniteOutput)
    }

    fn after_update(&self) {
        self.tunables
            .decay_epsilon(self.config.epsilon_decay, self.config.epsilon_floor);
        self.total_updates.fetch_add(1, Ordering::Relaxed);

        let since = self.updates_since_sync.fetch_add(1, Ordering::AcqRel) + 1;
        if since >= self.config.target_sync_interval {
            self.sync_target();
        }
    }

    /// Copy primary into target, skipping non-finite entries; returns the skip count
    pub fn sync_target(&self) -> usize {
        let snapshot = {
            let primary = self.primary.read();
            match primary.as_ref() {
                Some(backend) => backend.clone(),
                None => return 0,
            }
        };

        let mut target = self.target.write();
        let Some(target) = target.as_mut() else {
            return 0;
        };

        match target.sync_from(&snapshot) {
            Ok(skipped) => {
                if skipped > 0 {
                    tracing::warn!("Target sync kept {} stale entries (non-finite primary)", skipped);
                }
                self.updates_since_sync.store(0, Ordering::Release);
                let syncs = self.target_syncs.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!("Target synchronized (#{})", syncs);
                skipped
            }
            Err(err) => {
                tracing::error!("Target sync failed: {}", err);
                0
            }
        }
    }

    /// Copy of the target parameters
    pub fn target_parameters(&self) -> Vec<f32> {
        self.target
            .read()
            .as_ref()
            .map(|b| b.parameters().to_vec())
            .unwrap_or_default()
    }

    /// Copy of the primary parameters
    pub fn primary_parameters(&self) -> Vec<f32> {
        self.primary
            .read()
            .as_ref()
            .map(|b| b.parameters().to_vec())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ValueAgentStats {
        ValueAgentStats {
            backend: self
                .primary
                .read()
                .as_ref()
                .map(|b| b.name())
                .unwrap_or("none"),
            epsilon: self.tunables.epsilon(),
            learning_rate: self.tunables.learning_rate() * self.stability.learning_rate_scale(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            target_syncs: self.target_syncs.load(Ordering::Relaxed),
            updates_since_sync: self.updates_since_sync.load(Ordering::Acquire),
            stability: self.stability.snapshot(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        persistence::log_save("value-agent", path.as_ref(), self.primary_parameters().len());
        Ok(())
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        persistence::log_load("value-agent", path.as_ref());
        Ok(())
    }

    /// Drop both approximators; later calls fall back or skip. Idempotent.
    pub fn cleanup(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.primary.write().take();
        self.target.write().take();
        tracing::info!("Value agent cleaned up");
    }

    #[cfg(test)]
    fn corrupt_primary(&self, index: usize) {
        if let Some(backend) = self.primary.write().as_mut() {
            backend.parameters_mut()[index] = f32::NAN;
        }
    }
}
