//! Toy target-seeking environment
//!
//! A 1-D track with the agent and a target on it. Action 0 moves left,
//! action 1 moves right, anything else waits. Used by the demo binary and the
//! end-to-end tests to stand in for a real game-state encoder.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Environment configuration
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Number of cells on the track
    pub track_length: usize,
    /// Maximum steps per episode
    pub max_steps: usize,
    /// Length of the emitted state vector (at least 3)
    pub state_size: usize,
    /// Added to every step
    pub step_penalty: f32,
    /// Reward for moving one cell closer (negated for moving away)
    pub progress_reward: f32,
    /// Reward for reaching the target. Kept so the final step's reward stays
    /// at or below 1.0, the floor of the growth-ratio explosion check.
    pub completion_bonus: f32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            track_length: 10,
            max_steps: 50,
            state_size: 16,
            step_penalty: -0.01,
            progress_reward: 0.1,
            completion_bonus: 0.9,
        }
    }
}

/// Step result from the environment
#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Vec<f32>,
    pub reward: f32,
    /// Target reached
    pub done: bool,
    /// Hit max steps
    pub truncated: bool,
    pub info: StepInfo,
}

#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    pub steps: usize,
    pub distance: usize,
    pub reached_target: bool,
}

pub struct TargetSeekEnv {
    config: EnvConfig,
    rng: StdRng,
    position: usize,
    target: usize,
    steps: usize,
}

impl TargetSeekEnv {
    pub fn new(config: EnvConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Reproducible episodes
    pub fn with_seed(config: EnvConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut config: EnvConfig, rng: StdRng) -> Self {
        config.track_length = config.track_length.max(2);
        config.state_size = config.state_size.max(3);
        let mut env = Self {
            config,
            rng,
            position: 0,
            target: 1,
            steps: 0,
        };
        env.reset();
        env
    }

    pub fn state_size(&self) -> usize {
        self.config.state_size
    }

    /// Start a new episode with the agent and target on distinct cells
    pub fn reset(&mut self) -> Vec<f32> {
        let len = self.config.track_length;
        self.position = self.rng.random_range(0..len);
        self.target = loop {
            let target = self.rng.random_range(0..len);
            if target != self.position {
                break target;
            }
        };
        self.steps = 0;
        self.observation()
    }

    fn distance(&self) -> usize {
        self.position.abs_diff(self.target)
    }

    /// `[position, target, signed offset, 0...]`, each in [-1, 1]
    pub fn observation(&self) -> Vec<f32> {
        let scale = (self.config.track_length - 1) as f32;
        let mut obs = vec![0.0; self.config.state_size];
        obs[0] = self.position as f32 / scale;
        obs[1] = self.target as f32 / scale;
        obs[2] = (self.target as f32 - self.position as f32) / scale;
        obs
    }

    /// Action that moves toward the target
    pub fn optimal_action(&self) -> usize {
        if self.target < self.position { 0 } else { 1 }
    }

    pub fn step(&mut self, action: usize) -> StepResult {
        self.steps += 1;
        let before = self.distance();

        match action {
            0 => self.position = self.position.saturating_sub(1),
            1 => self.position = (self.position + 1).min(self.config.track_length - 1),
            _ => {}
        }

        let after = self.distance();
        let mut reward = self.config.step_penalty;
        if after < before {
            reward += self.config.progress_reward;
        } else if after > before {
            reward -= self.config.progress_reward;
        }

        let done = after == 0;
        if done {
            reward += self.config.completion_bonus;
        }
        let truncated = !done && self.steps >= self.config.max_steps;

        StepResult {
            observation: self.observation(),
            reward,
            done,
            truncated,
            info: StepInfo {
                steps: self.steps,
                distance: after,
                reached_target: done,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::linalg::argmax;
    use crate::agents::{LearnOutcome, PolicyAgent, ReplayStore, ValueAgent};
    use crate::config::{BackendKind, PolicyAgentConfig, ValueAgentConfig};
    use std::sync::Arc;

    fn learning_env(seed: u64) -> TargetSeekEnv {
        TargetSeekEnv::with_seed(
            EnvConfig {
                track_length: 6,
                state_size: 4,
                ..EnvConfig::default()
            },
            seed,
        )
    }

    /// Fraction of fresh episodes where `choose` picks the optimal first move
    fn agreement(seed: u64, choose: impl Fn(&[f32]) -> usize) -> f32 {
        let mut env = learning_env(seed);
        let trials = 200;
        let hits = (0..trials)
            .filter(|_| {
                let obs = env.reset();
                choose(&obs) == env.optimal_action()
            })
            .count();
        hits as f32 / trials as f32
    }

    /// Run one episode; returns whether the target was reached
    fn run_episode(
        env: &mut TargetSeekEnv,
        mut act: impl FnMut(&[f32]) -> usize,
        mut learn: impl FnMut(&[f32], usize, &StepResult),
    ) -> bool {
        let mut state = env.reset();
        loop {
            let action = act(&state);
            let result = env.step(action);
            learn(&state, action, &result);
            if result.done || result.truncated {
                return result.done;
            }
            state = result.observation;
        }
    }

    #[test]
    fn test_value_agent_learns_to_seek_target() {
        let config = ValueAgentConfig {
            state_size: 4,
            action_size: 2,
            backend: BackendKind::Table,
            bucket_count: 1 << 18,
            quantization_levels: 32,
            learning_rate: 0.1,
            gamma: 0.5,
            epsilon_floor: 0.1,
            epsilon_decay: 0.99,
            target_sync_interval: 20,
            ..ValueAgentConfig::default()
        };
        let replay = Arc::new(ReplayStore::with_capacity(4, 2, 10_000).unwrap());
        let agent = ValueAgent::new(config, replay).unwrap();

        let baseline = {
            let epsilon = agent.epsilon();
            agent.set_epsilon(0.0);
            let score = agreement(99, |obs| agent.select_action(obs));
            agent.set_epsilon(epsilon);
            score
        };

        let mut env = learning_env(5);
        for _ in 0..300 {
            run_episode(
                &mut env,
                |state| agent.select_action(state),
                |state, action, result| {
                    let outcome = agent.record_and_learn(
                        state,
                        action,
                        result.reward,
                        &result.observation,
                        result.done,
                    );
                    assert!(!matches!(outcome, LearnOutcome::Exploded { .. }));
                },
            );
        }
        assert!(!agent.is_emergency_stopped());

        agent.set_epsilon(0.0);
        let trained = agreement(99, |obs| agent.select_action(obs));
        assert!(trained >= 0.8, "trained agreement {}", trained);
        assert!(trained > baseline, "{} vs baseline {}", trained, baseline);

        let successes = (0..20)
            .filter(|_| run_episode(&mut env, |s| agent.select_action(s), |_, _, _| {}))
            .count();
        assert!(successes >= 16, "{} of 20 episodes succeeded", successes);
    }

    #[test]
    fn test_policy_agent_learns_to_seek_target() {
        let config = PolicyAgentConfig {
            state_size: 4,
            action_size: 2,
            // Moving toward the target is also the myopic best move
            gamma: 0.0,
            learning_rate: 0.1,
            max_policy_update: 0.05,
            min_batch_size: 32,
            ..PolicyAgentConfig::default()
        };
        let replay = Arc::new(ReplayStore::with_capacity(4, 2, 10_000).unwrap());
        let agent = PolicyAgent::new(config, replay).unwrap();
        let greedy = |agent: &PolicyAgent, obs: &[f32]| {
            agent
                .action_probabilities(obs)
                .ok()
                .and_then(|probs| argmax(&probs))
                .unwrap_or(0)
        };

        // A zeroed policy is uniform and always picks the first action
        agent.fill_policy(0.0);
        let baseline = agreement(99, |obs| greedy(&agent, obs));

        let mut env = learning_env(5);
        for _ in 0..400 {
            run_episode(
                &mut env,
                |state| agent.select_action(state),
                |state, action, result| {
                    agent
                        .record_experience(
                            state,
                            action,
                            result.reward,
                            &result.observation,
                            result.done,
                        )
                        .unwrap();
                },
            );
            agent.train_step();
        }

        let stats = agent.stats();
        assert!(stats.train_steps > 0);
        assert_eq!(stats.stability.total_explosions, 0);
        assert_eq!(stats.reinitializations, 0);

        let trained = agreement(99, |obs| greedy(&agent, obs));
        assert!(trained >= 0.75, "trained agreement {}", trained);
        assert!(trained > baseline, "{} vs baseline {}", trained, baseline);
    }

    #[test]
    fn test_reset_separates_agent_and_target() {
        let mut env = TargetSeekEnv::with_seed(EnvConfig::default(), 7);
        for _ in 0..50 {
            let obs = env.reset();
            assert_eq!(obs.len(), 16);
            assert!(obs[2] != 0.0);
            assert!(obs.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_optimal_policy_reaches_target() {
        let mut env = TargetSeekEnv::with_seed(EnvConfig::default(), 3);
        env.reset();
        let start = env.distance();

        let mut total = 0.0;
        let mut last = None;
        for _ in 0..start {
            let result = env.step(env.optimal_action());
            total += result.reward;
            last = Some(result);
        }

        let last = last.unwrap();
        assert!(last.done);
        assert!(!last.truncated);
        assert!(last.info.reached_target);
        let expected = start as f32 * (0.1 - 0.01) + 0.9;
        assert!((total - expected).abs() < 1e-4);
    }

    #[test]
    fn test_episode_truncates() {
        let mut env = TargetSeekEnv::with_seed(
            EnvConfig {
                max_steps: 5,
                ..EnvConfig::default()
            },
            11,
        );
        env.reset();
        let mut result = env.step(2);
        for _ in 0..4 {
            result = env.step(2);
        }
        assert!(result.truncated);
        assert!(!result.done);
        assert!((result.reward + 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_walls_clamp_position() {
        let mut env = TargetSeekEnv::with_seed(EnvConfig::default(), 1);
        env.position = 0;
        env.target = 5;
        let result = env.step(0);
        assert_eq!(env.position, 0);
        assert!((result.reward + 0.01).abs() < 1e-6);
    }
}
