//! PPO-style policy agent
//!
//! Linear policy (`[state_size][action_size]`) and value (`[state_size][1]`)
//! weights. Actions are sampled from a softmax over the policy logits; a
//! training pass drains the local rollout buffer, estimates advantages from
//! the value weights, and applies a clipped-surrogate update in which every
//! per-weight delta is bounded and every written weight is checked.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use super::experience::{Experience, validate_action, validate_state, validate_transition};
use super::linalg::{Matrix, l2_norm, sample_categorical, softmax};
use super::outcome::{Decision, SkipReason, TrainOutcome, TrainReport};
use super::persistence;
use super::replay::ReplayStore;
use super::stability::{GradientCheck, StabilityGuard, StabilitySnapshot};
use super::tuning::Tunables;
use crate::config::PolicyAgentConfig;
use crate::error::{AgentError, Result};

/// Smallest behaviour probability used as a ratio denominator
const MIN_PROBABILITY: f32 = 1e-8;

/// A buffered transition with the probability the policy gave its action
#[derive(Debug, Clone)]
struct Rollout {
    experience: Experience,
    old_prob: f32,
}

/// Point-in-time view of a policy agent
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyAgentStats {
    pub buffered: usize,
    pub train_steps: u64,
    pub rolled_back_weights: u64,
    pub reinitializations: u64,
    pub learning_rate: f32,
    pub clip_ratio: f32,
    pub stability: StabilitySnapshot,
}

pub struct PolicyAgent {
    config: PolicyAgentConfig,
    tunables: Tunables,
    policy: RwLock<Option<Matrix>>,
    value: RwLock<Option<Matrix>>,
    buffer: Mutex<VecDeque<Rollout>>,
    replay: Arc<ReplayStore>,
    stability: StabilityGuard,
    train_steps: AtomicU64,
    rolled_back_weights: AtomicU64,
    reinitializations: AtomicU64,
    shut_down: AtomicBool,
}

impl PolicyAgent {
    pub fn new(config: PolicyAgentConfig, replay: Arc<ReplayStore>) -> Result<Self> {
        if config.state_size == 0 || config.action_size == 0 {
            return Err(AgentError::Config(
                "state and action sizes must be non-zero".to_string(),
            ));
        }
        if config.buffer_capacity == 0 {
            return Err(AgentError::Config(
                "rollout buffer capacity must be non-zero".to_string(),
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

        let mut rng = rand::rng();
        let policy = Matrix::random(
            config.state_size,
            config.action_size,
            config.init_scale,
            &mut rng,
        );
        let value = Matrix::random(config.state_size, 1, config.init_scale, &mut rng);
        let tunables = Tunables::new(
            config.learning_rate,
            0.0,
            config.min_batch_size,
            config.clip_ratio,
            config.gamma,
        );

        tracing::info!(
            "Policy agent ready: {} states -> {} actions, clip {:.2}",
            config.state_size,
            config.action_size,
            tunables.clip_ratio()
        );

        Ok(Self {
            stability: StabilityGuard::new(config.stability.clone()),
            tunables,
            policy: RwLock::new(Some(policy)),
            value: RwLock::new(Some(value)),
            buffer: Mutex::new(VecDeque::with_capacity(config.buffer_capacity.min(4096))),
            replay,
            train_steps: AtomicU64::new(0),
            rolled_back_weights: AtomicU64::new(0),
            reinitializations: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    /// Learning rate, minimum batch, clip ratio and discount; epsilon is unused
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn random_action(&self) -> usize {
        rand::rng().random_range(0..self.config.action_size)
    }

    /// Sample from the policy, or fall back to a uniformly random action
    pub fn decide(&self, state: &[f32]) -> Decision {
        match self.action_probabilities(state) {
            Ok(probs) => Decision::Exploit(sample_categorical(&probs, &mut rand::rng())),
            Err(reason) => {
                tracing::debug!("Falling back to a random action: {}", reason);
                Decision::Fallback {
                    action: self.random_action(),
                    reason,
                }
            }
        }
    }

    pub fn select_action(&self, state: &[f32]) -> usize {
        self.decide(state).action()
    }

    /// Softmax over the policy logits; uniform when every logit is non-finite
    pub fn action_probabilities(&self, state: &[f32]) -> Result<Vec<f32>> {
        if self.is_shut_down() {
            return Err(AgentError::ShutDown);
        }
        validate_state(state, self.config.state_size)?;
        let policy = self.policy.read();
        let weights = policy.as_ref().ok_or(AgentError::ShutDown)?;
        Ok(softmax(&weights.project(state)))
    }

    /// Bounded state-value estimate; 0 on invalid input
    pub fn compute_value(&self, state: &[f32]) -> f32 {
        if validate_state(state, self.config.state_size).is_err() {
            return 0.0;
        }
        match self.value.read().as_ref() {
            Some(weights) => bounded_value(weights, state, self.config.value_clamp),
            None => 0.0,
        }
    }

    /// Policy probability of `action`, in [0, 1]; 0 on invalid input
    pub fn evaluate_action_confidence(&self, state: &[f32], action: usize) -> f32 {
        if validate_action(action, self.config.action_size).is_err() {
            return 0.0;
        }
        self.action_probabilities(state)
            .map(|probs| probs[action])
            .unwrap_or(0.0)
    }

    /// Buffer a transition for the next training pass and mirror it into the
    /// shared replay store
    pub fn record_experience(
        &self,
        state: &[f32],
        action: usize,
        reward: f32,
        next_state: &[f32],
        done: bool,
    ) -> Result<()> {
        validate_transition(
            state,
            action,
            reward,
            next_state,
            self.config.state_size,
            self.config.action_size,
        )?;
        let old_prob = self.action_probabilities(state)?[action].max(MIN_PROBABILITY);

        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.config.buffer_capacity {
                buffer.pop_front();
            }
            buffer.push_back(Rollout {
                experience: Experience::new(state.to_vec(), action, reward, next_state.to_vec(), done),
                old_prob,
            });
        }

        if let Err(err) = self
            .replay
            .add_transition(state, action, reward, next_state, done)
        {
            tracing::debug!("Replay store rejected a policy transition: {}", err);
        }
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// One clipped-surrogate update over the buffered rollouts
    pub fn train_step(&self) -> TrainOutcome {
        if self.is_shut_down() {
            return TrainOutcome::Skipped(SkipReason::ShutDown);
        }
        if self.stability.is_learning_suspended() {
            return TrainOutcome::Skipped(SkipReason::EmergencyStop);
        }

        let required = self.tunables.batch_size();
        let batch: Vec<Rollout> = {
            let mut buffer = self.buffer.lock();
            if buffer.len() < required {
                return TrainOutcome::Skipped(SkipReason::InsufficientData {
                    available: buffer.len(),
                    required,
                });
            }
            buffer.drain(..).collect()
        };

        // Gradients are computed against snapshots; the locks are only held
        // again for the write-back.
        let policy = self.policy.read().clone();
        let value = self.value.read().clone();
        let (Some(policy), Some(value)) = (policy, value) else {
            return TrainOutcome::Skipped(SkipReason::ShutDown);
        };

        let advantages = self.advantages(&batch, &value);
        let mut report = TrainReport {
            samples: batch.len(),
            ..TrainReport::default()
        };

        let scale = self.stability.learning_rate_scale();
        let learning_rate = self.tunables.learning_rate() * scale;
        let (mut policy_deltas, policy_loss) =
            self.policy_deltas(&batch, &advantages, &policy, learning_rate);
        let mut value_deltas = value_deltas(&batch, &advantages, &value, learning_rate);

        report.policy_loss = policy_loss;
        report.value_loss =
            0.5 * advantages.iter().map(|a| a * a).sum::<f32>() / batch.len() as f32;
        report.mean_abs_error =
            advantages.iter().map(|a| a.abs()).sum::<f32>() / batch.len() as f32;

        let mut update_norm = l2_norm(&policy_deltas);
        if let GradientCheck::Exploded { magnitude } = self.stability.check_gradient(update_norm) {
            report.exploded = 1;
            if self.stability.emergency_stop() {
                self.train_steps.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Policy update withheld (norm {}), learning suspended", magnitude);
                return TrainOutcome::Trained(report);
            }
            // Rescale to the learning rate the explosion just tightened
            let shrink = self.stability.learning_rate_scale() / scale;
            for delta in policy_deltas.iter_mut().chain(value_deltas.iter_mut()) {
                *delta *= shrink;
            }
            update_norm *= shrink;
        }

        let max_update = self.config.max_policy_update;
        if let Some(weights) = self.policy.write().as_mut() {
            report.rolled_back += apply_bounded_update(weights, &policy_deltas, max_update);
        }
        if let Some(weights) = self.value.write().as_mut() {
            report.rolled_back += apply_bounded_update(weights, &value_deltas, max_update);
        }

        if report.rolled_back > 0 {
            self.rolled_back_weights
                .fetch_add(report.rolled_back as u64, Ordering::Relaxed);
            let failures = self.stability.record_failure();
            report.failed = 1;
            tracing::warn!(
                "Rolled back {} non-finite weights ({} consecutive failures)",
                report.rolled_back,
                failures
            );
            if self.stability.needs_reinitialization() {
                self.reinitialize();
                report.reinitialized = true;
            }
        } else {
            self.stability.record_success();
            report.applied = batch.len();
        }

        let steps = self.train_steps.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            "Policy step {}: {} samples, policy loss {:.4}, value loss {:.4}, update norm {:.5}",
            steps,
            report.samples,
            report.policy_loss,
            report.value_loss,
            update_norm
        );

        TrainOutcome::Trained(report)
    }

    /// One-step TD errors, GAE-smoothed when `gae_lambda > 0`, clipped to
    /// `±max_gradient_norm`.
    ///
    /// Rollouts from concurrent callers interleave in the buffer, so the GAE
    /// trace only carries over when a transition's `next_state` is the state
    /// of the rollout buffered right after it.
    fn advantages(&self, batch: &[Rollout], value: &Matrix) -> Vec<f32> {
        let gamma = self.tunables.discount();
        let lambda = self.config.gae_lambda.clamp(0.0, 1.0);
        let clamp = self.config.value_clamp;
        let bound = self.config.max_gradient_norm.abs();

        let mut advantages = vec![0.0; batch.len()];
        let mut gae = 0.0;
        for t in (0..batch.len()).rev() {
            let exp = &batch[t].experience;
            let not_done = if exp.done { 0.0 } else { 1.0 };
            let next_value = bounded_value(value, &exp.next_state, clamp);
            let delta =
                exp.reward + gamma * next_value * not_done - bounded_value(value, &exp.state, clamp);
            let continues = !exp.done
                && batch
                    .get(t + 1)
                    .is_some_and(|next| next.experience.state == exp.next_state);
            let carry = if continues { 1.0 } else { 0.0 };
            gae = delta + gamma * lambda * carry * gae;
            advantages[t] = gae;
        }

        for advantage in advantages.iter_mut() {
            *advantage = if advantage.is_finite() {
                advantage.clamp(-bound, bound)
            } else {
                0.0
            };
        }
        advantages
    }

    /// Ascent step on the clipped surrogate; returns deltas and the surrogate loss
    fn policy_deltas(
        &self,
        batch: &[Rollout],
        advantages: &[f32],
        policy: &Matrix,
        learning_rate: f32,
    ) -> (Vec<f32>, f32) {
        let (rows, cols) = policy.shape();
        let clip = self.tunables.clip_ratio();
        let scale = learning_rate / batch.len() as f32;
        let mut deltas = vec![0.0; rows * cols];
        let mut loss = 0.0;

        for (rollout, &advantage) in batch.iter().zip(advantages) {
            let exp = &rollout.experience;
            let probs = softmax(&policy.project(&exp.state));
            let ratio = probs[exp.action] / rollout.old_prob;
            let clipped_ratio = ratio.clamp(1.0 - clip, 1.0 + clip);
            loss -= (ratio * advantage).min(clipped_ratio * advantage);

            // The clipped branch is flat in the weights
            let clipped = (advantage > 0.0 && ratio > 1.0 + clip)
                || (advantage < 0.0 && ratio < 1.0 - clip);
            if clipped || !ratio.is_finite() {
                continue;
            }

            for (k, &p) in probs.iter().enumerate() {
                let indicator = if k == exp.action { 1.0 } else { 0.0 };
                let logit_grad = advantage * ratio * (indicator - p);
                for (i, &s) in exp.state.iter().enumerate() {
                    deltas[i * cols + k] += scale * logit_grad * s;
                }
            }
        }

        (deltas, loss / batch.len() as f32)
    }

    fn reinitialize(&self) {
        let mut rng = rand::rng();
        let scale = self.config.init_scale;
        let (states, actions) = (self.config.state_size, self.config.action_size);

        if let Some(weights) = self.policy.write().as_mut() {
            *weights = Matrix::random(states, actions, scale, &mut rng);
        }
        if let Some(weights) = self.value.write().as_mut() {
            *weights = Matrix::random(states, 1, scale, &mut rng);
        }
        self.stability.reset();
        let count = self.reinitializations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            "Policy network unstable, reinitialized weights (#{}, scale {})",
            count,
            scale
        );
    }

    /// Copy of the policy weights
    pub fn policy_weights(&self) -> Option<Matrix> {
        self.policy.read().clone()
    }

    /// Copy of the value weights
    pub fn value_weights(&self) -> Option<Matrix> {
        self.value.read().clone()
    }

    pub fn stats(&self) -> PolicyAgentStats {
        PolicyAgentStats {
            buffered: self.buffered(),
            train_steps: self.train_steps.load(Ordering::Relaxed),
            rolled_back_weights: self.rolled_back_weights.load(Ordering::Relaxed),
            reinitializations: self.reinitializations.load(Ordering::Relaxed),
            learning_rate: self.tunables.learning_rate() * self.stability.learning_rate_scale(),
            clip_ratio: self.tunables.clip_ratio(),
            stability: self.stability.snapshot(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let parameters = self.policy_weights().map_or(0, |w| w.as_slice().len())
            + self.value_weights().map_or(0, |w| w.as_slice().len());
        persistence::log_save("policy-agent", path.as_ref(), parameters);
        Ok(())
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        persistence::log_load("policy-agent", path.as_ref());
        Ok(())
    }

    /// Drop weights and buffered rollouts. Idempotent.
    pub fn cleanup(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.policy.write().take();
        self.value.write().take();
        self.buffer.lock().clear();
        tracing::info!("Policy agent cleaned up");
    }

    #[cfg(test)]
    pub(crate) fn fill_policy(&self, value: f32) {
        if let Some(weights) = self.policy.write().as_mut() {
            weights.fill(value);
        }
    }

    #[cfg(test)]
    fn fill_value(&self, value: f32) {
        if let Some(weights) = self.value.write().as_mut() {
            weights.fill(value);
        }
    }

    #[cfg(test)]
    fn corrupt_policy(&self, index: usize) {
        if let Some(weights) = self.policy.write().as_mut() {
            weights.as_mut_slice()[index] = f32::NAN;
        }
    }
}

/// Linear value estimate clamped to `±clamp`; non-finite becomes 0
fn bounded_value(weights: &Matrix, state: &[f32], clamp: f32) -> f32 {
    let v = weights.project(state).first().copied().unwrap_or(0.0);
    if v.is_finite() { v.clamp(-clamp, clamp) } else { 0.0 }
}

/// Descent step on `0.5 * advantage^2` for the value weights
fn value_deltas(batch: &[Rollout], advantages: &[f32], value: &Matrix, learning_rate: f32) -> Vec<f32> {
    let scale = learning_rate / batch.len() as f32;
    let mut deltas = vec![0.0; value.as_slice().len()];
    for (rollout, &advantage) in batch.iter().zip(advantages) {
        for (delta, &s) in deltas.iter_mut().zip(&rollout.experience.state) {
            *delta += scale * advantage * s;
        }
    }
    deltas
}

/// Add each delta, clamped to `±max_update`; a weight whose result would be
/// non-finite keeps its previous value. Returns the number of reverted weights.
pub(crate) fn apply_bounded_update(weights: &mut Matrix, deltas: &[f32], max_update: f32) -> usize {
    let bound = max_update.abs();
    let mut rolled_back = 0;
    for (weight, &delta) in weights.as_mut_slice().iter_mut().zip(deltas) {
        let candidate = *weight + delta.clamp(-bound, bound);
        if candidate.is_finite() {
            *weight = candidate;
        } else {
            rolled_back += 1;
        }
    }
    rolled_back
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StabilityConfig;
    use proptest::prelude::*;

    const STATE: [f32; 4] = [0.5, 0.5, 0.5, 0.5];

    fn small_config() -> PolicyAgentConfig {
        PolicyAgentConfig {
            state_size: 4,
            action_size: 2,
            min_batch_size: 8,
            ..PolicyAgentConfig::default()
        }
    }

    fn agent_with(config: PolicyAgentConfig) -> PolicyAgent {
        let replay = Arc::new(ReplayStore::with_capacity(4, 2, 1000).unwrap());
        PolicyAgent::new(config, replay).unwrap()
    }

    fn max_abs_diff(a: &Matrix, b: &Matrix) -> f32 {
        a.as_slice()
            .iter()
            .zip(b.as_slice())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_initial_weights_are_small() {
        let agent = agent_with(small_config());
        let policy = agent.policy_weights().unwrap();
        assert_eq!(policy.shape(), (4, 2));
        assert!(policy.as_slice().iter().all(|w| w.abs() <= 0.01));
        assert_eq!(agent.value_weights().unwrap().shape(), (4, 1));
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let agent = agent_with(small_config());
        let probs = agent.action_probabilities(&STATE).unwrap();
        assert_eq!(probs.len(), 2);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(agent.select_action(&STATE) < 2);
    }

    #[test]
    fn test_non_finite_logits_give_uniform_distribution() {
        let agent = agent_with(small_config());
        agent.fill_policy(f32::NAN);

        let probs = agent.action_probabilities(&STATE).unwrap();
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_value_is_clamped() {
        let agent = agent_with(PolicyAgentConfig {
            value_clamp: 2.0,
            ..small_config()
        });
        if let Some(weights) = agent.value.write().as_mut() {
            weights.fill(100.0);
        }
        assert!((agent.compute_value(&STATE) - 2.0).abs() < 1e-6);
        assert_eq!(agent.compute_value(&[0.1]), 0.0);
    }

    #[test]
    fn test_record_rejects_malformed_input() {
        let agent = agent_with(small_config());
        assert!(agent.record_experience(&STATE, 3, 1.0, &STATE, false).is_err());
        assert!(
            agent
                .record_experience(&STATE, 0, f32::NAN, &STATE, false)
                .is_err()
        );
        assert_eq!(agent.buffered(), 0);

        agent.record_experience(&STATE, 1, 1.0, &STATE, true).unwrap();
        assert_eq!(agent.buffered(), 1);
        assert_eq!(agent.replay.len(), 1);
    }

    #[test]
    fn test_buffer_drops_oldest_at_capacity() {
        let agent = agent_with(PolicyAgentConfig {
            buffer_capacity: 3,
            ..small_config()
        });
        for _ in 0..5 {
            agent.record_experience(&STATE, 0, 0.0, &STATE, false).unwrap();
        }
        assert_eq!(agent.buffered(), 3);
    }

    #[test]
    fn test_train_requires_min_batch() {
        let agent = agent_with(small_config());
        for _ in 0..7 {
            agent.record_experience(&STATE, 0, 1.0, &STATE, true).unwrap();
        }
        assert_eq!(
            agent.train_step(),
            TrainOutcome::Skipped(SkipReason::InsufficientData {
                available: 7,
                required: 8
            })
        );
        assert_eq!(agent.buffered(), 7);

        agent.record_experience(&STATE, 0, 1.0, &STATE, true).unwrap();
        assert!(agent.train_step().report().is_some());
        assert_eq!(agent.buffered(), 0);
    }

    #[test]
    fn test_learns_preference_direction() {
        let agent = agent_with(PolicyAgentConfig {
            max_policy_update: 0.05,
            learning_rate: 0.1,
            ..small_config()
        });
        let before = agent.action_probabilities(&STATE).unwrap();

        for _ in 0..20 {
            for i in 0..8 {
                let (action, reward) = if i % 2 == 0 { (0, 1.0) } else { (1, -1.0) };
                agent
                    .record_experience(&STATE, action, reward, &STATE, true)
                    .unwrap();
            }
            let report = agent.train_step();
            assert_eq!(report.report().unwrap().rolled_back, 0);
        }

        let after = agent.action_probabilities(&STATE).unwrap();
        assert!(after[0] > before[0]);
        assert!(after[0] > after[1]);
        assert!(agent.evaluate_action_confidence(&STATE, 0) > 0.5);
    }

    #[test]
    fn test_update_norm_is_tracked() {
        let agent = agent_with(small_config());
        for _ in 0..8 {
            agent.record_experience(&STATE, 0, 1.0, &STATE, true).unwrap();
        }
        agent.train_step();

        let stats = agent.stats();
        assert!(stats.stability.last_gradient_norm > 0.0);
        assert_eq!(stats.stability.explosions, 0);
        assert!((stats.learning_rate - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_exploding_update_tightens_then_suspends() {
        let agent = agent_with(PolicyAgentConfig {
            stability: StabilityConfig {
                explosion_ceiling: 1e-9,
                max_explosions: 3,
                ..StabilityConfig::default()
            },
            ..small_config()
        });
        let fill = |agent: &PolicyAgent| {
            for i in 0..8 {
                let reward = if i % 2 == 0 { 1e6 } else { -1e6 };
                agent
                    .record_experience(&STATE, i % 2, reward, &STATE, true)
                    .unwrap();
            }
        };

        fill(&agent);
        let before = agent.policy_weights().unwrap();
        let report = agent.train_step().report().cloned().unwrap();
        assert_eq!(report.exploded, 1);
        assert_eq!(report.rolled_back, 0);
        assert_ne!(agent.policy_weights().unwrap(), before);

        let stats = agent.stats();
        assert_eq!(stats.stability.explosions, 1);
        assert!(stats.stability.last_gradient_norm > 0.0);
        assert!((stats.stability.learning_rate_scale - 0.5).abs() < 1e-6);
        assert!((stats.learning_rate - 0.005).abs() < 1e-6);

        fill(&agent);
        agent.train_step();

        // The third explosion stops learning before anything is written
        fill(&agent);
        let frozen = agent.policy_weights().unwrap();
        let report = agent.train_step().report().cloned().unwrap();
        assert_eq!(report.exploded, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(agent.policy_weights().unwrap(), frozen);
        assert!(agent.stats().stability.emergency_stop);

        fill(&agent);
        assert_eq!(
            agent.train_step(),
            TrainOutcome::Skipped(SkipReason::EmergencyStop)
        );
    }

    #[test]
    fn test_gae_trace_only_follows_linked_transitions() {
        let agent = agent_with(PolicyAgentConfig {
            gae_lambda: 0.9,
            ..small_config()
        });
        agent.fill_value(0.0);
        let value = agent.value_weights().unwrap();

        let a = vec![0.1, 0.0, 0.0, 0.0];
        let b = vec![0.0, 0.2, 0.0, 0.0];
        let c = vec![0.0, 0.0, 0.3, 0.0];
        let rollout = |state: &Vec<f32>, reward: f32, next: &Vec<f32>, done: bool| Rollout {
            experience: Experience::new(state.clone(), 0, reward, next.clone(), done),
            old_prob: 0.5,
        };

        // Another caller's transition sits between a -> b and its successor
        let interleaved = vec![rollout(&a, 0.2, &b, false), rollout(&c, 0.3, &a, true)];
        let advantages = agent.advantages(&interleaved, &value);
        assert!((advantages[0] - 0.2).abs() < 1e-6);
        assert!((advantages[1] - 0.3).abs() < 1e-6);

        let linked = vec![rollout(&a, 0.2, &b, false), rollout(&b, 0.3, &c, true)];
        let advantages = agent.advantages(&linked, &value);
        assert!((advantages[0] - (0.2 + 0.99 * 0.9 * 0.3)).abs() < 1e-6);
    }

    #[test]
    fn test_bounded_update_rolls_back_single_weight() {
        let mut weights = Matrix::zeros(2, 2);
        weights.set(0, 1, f32::MAX);

        let rolled_back = apply_bounded_update(&mut weights, &[0.5, f32::NAN, 0.005, -0.02], 0.01);
        assert_eq!(rolled_back, 1);
        assert!((weights.get(0, 0) - 0.01).abs() < 1e-6);
        assert_eq!(weights.get(0, 1), f32::MAX);
        assert!((weights.get(1, 0) - 0.005).abs() < 1e-6);
        assert!((weights.get(1, 1) + 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_failures_reinitialize() {
        let agent = agent_with(PolicyAgentConfig {
            min_batch_size: 4,
            ..small_config()
        });
        agent.corrupt_policy(0);

        let mut reinitialized = false;
        for step in 0..6 {
            for _ in 0..4 {
                agent.record_experience(&STATE, 0, 1.0, &STATE, true).unwrap();
            }
            let outcome = agent.train_step();
            let report = outcome.report().unwrap();
            assert!(report.rolled_back > 0);
            reinitialized = report.reinitialized;
            if step < 5 {
                assert!(!reinitialized);
            }
        }

        assert!(reinitialized);
        let stats = agent.stats();
        assert_eq!(stats.reinitializations, 1);
        assert_eq!(stats.stability.consecutive_failures, 0);
        assert!(agent.policy_weights().unwrap().is_finite());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let agent = agent_with(small_config());
        agent.record_experience(&STATE, 0, 1.0, &STATE, true).unwrap();
        agent.cleanup();
        agent.cleanup();

        assert!(agent.decide(&STATE).is_fallback());
        assert_eq!(agent.buffered(), 0);
        assert_eq!(agent.train_step(), TrainOutcome::Skipped(SkipReason::ShutDown));
        assert_eq!(agent.evaluate_action_confidence(&STATE, 0), 0.0);
        assert!(agent.record_experience(&STATE, 0, 1.0, &STATE, true).is_err());
    }

    #[test]
    fn test_concurrent_sampling_and_training() {
        let agent = Arc::new(agent_with(small_config()));

        std::thread::scope(|scope| {
            for t in 0..4 {
                let agent = Arc::clone(&agent);
                scope.spawn(move || {
                    for i in 0..1_000 {
                        let state = [((i + t) % 10) as f32 / 10.0, 0.2, 0.4, 0.8];
                        let action = agent.select_action(&state);
                        assert!(action < 2);
                        let reward = if action == 0 { 1.0 } else { -1.0 };
                        agent
                            .record_experience(&state, action, reward, &state, i % 10 == 0)
                            .unwrap();
                    }
                });
            }

            let trainer = Arc::clone(&agent);
            scope.spawn(move || {
                for _ in 0..200 {
                    trainer.train_step();
                }
            });
        });

        assert!(agent.policy_weights().unwrap().is_finite());
        assert!(agent.value_weights().unwrap().is_finite());
    }

    proptest! {
        #[test]
        fn prop_extreme_rewards_bound_each_weight_delta(
            rewards in proptest::collection::vec(-1e6f32..1e6f32, 8..40),
            feature in -1.0f32..1.0f32,
        ) {
            let agent = agent_with(small_config());
            let state = [feature, 1.0, -1.0, 0.5];
            for (i, reward) in rewards.iter().enumerate() {
                agent.record_experience(&state, i % 2, *reward, &state, i % 3 == 0).unwrap();
            }

            let policy_before = agent.policy_weights().unwrap();
            let value_before = agent.value_weights().unwrap();
            agent.train_step();
            let policy_after = agent.policy_weights().unwrap();
            let value_after = agent.value_weights().unwrap();

            prop_assert!(policy_after.is_finite());
            prop_assert!(value_after.is_finite());
            prop_assert!(max_abs_diff(&policy_before, &policy_after) <= 0.01 + 1e-6);
            prop_assert!(max_abs_diff(&value_before, &value_after) <= 0.01 + 1e-6);
        }
    }
}
