//! Rolling training metrics, logged through `tracing`

use std::collections::VecDeque;
use std::time::Instant;

use super::outcome::{LearnOutcome, TrainOutcome};

/// Windowed mean; non-finite samples are ignored
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Counters and moving averages for a coordinator loop
#[derive(Debug)]
pub struct TrainingMetrics {
    pub episode_rewards: MovingAverage,
    pub episode_lengths: MovingAverage,
    /// Absolute TD error of online value updates
    pub td_error: MovingAverage,
    pub policy_loss: MovingAverage,
    pub value_loss: MovingAverage,
    /// Fraction of episodes that reached the goal
    pub success_rate: MovingAverage,
    pub episodes: usize,
    pub total_steps: usize,
    pub train_steps: usize,
    pub explosions: usize,
    pub skipped: usize,
    start_time: Instant,
}

impl TrainingMetrics {
    pub fn new(window_size: usize) -> Self {
        Self {
            episode_rewards: MovingAverage::new(window_size),
            episode_lengths: MovingAverage::new(window_size),
            td_error: MovingAverage::new(window_size),
            policy_loss: MovingAverage::new(window_size),
            value_loss: MovingAverage::new(window_size),
            success_rate: MovingAverage::new(window_size),
            episodes: 0,
            total_steps: 0,
            train_steps: 0,
            explosions: 0,
            skipped: 0,
            start_time: Instant::now(),
        }
    }

    pub fn record_episode(&mut self, reward: f32, length: usize, succeeded: bool) {
        self.episodes += 1;
        self.episode_rewards.push(reward);
        self.episode_lengths.push(length as f32);
        self.success_rate.push(if succeeded { 1.0 } else { 0.0 });
    }

    /// Fold one online update into the averages
    pub fn record_learn(&mut self, outcome: &LearnOutcome) {
        self.total_steps += 1;
        match outcome {
            LearnOutcome::Applied { td_error, .. } => self.td_error.push(td_error.abs()),
            LearnOutcome::Exploded { .. } => self.explosions += 1,
            LearnOutcome::Skipped(_) => self.skipped += 1,
            LearnOutcome::Rejected(_) | LearnOutcome::Failed(_) => {}
        }
    }

    pub fn record_train(&mut self, outcome: &TrainOutcome) {
        let Some(report) = outcome.report() else {
            self.skipped += 1;
            return;
        };
        self.train_steps += 1;
        self.explosions += report.exploded;
        if report.policy_loss != 0.0 || report.value_loss != 0.0 {
            self.policy_loss.push(report.policy_loss);
            self.value_loss.push(report.value_loss);
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn steps_per_second(&self) -> f64 {
        let duration = self.duration_secs();
        if duration > 0.0 {
            self.total_steps as f64 / duration
        } else {
            0.0
        }
    }

    pub fn log_to_console(&self) {
        tracing::info!(
            "Episodes {} | Steps {} | SPS {:.1} | Train steps {}",
            self.episodes,
            self.total_steps,
            self.steps_per_second(),
            self.train_steps
        );
        tracing::info!(
            "  Episode: reward={:.2}, length={:.1}, success={:.1}%",
            self.episode_rewards.average(),
            self.episode_lengths.average(),
            self.success_rate.average() * 100.0
        );
        tracing::info!(
            "  Learning: td={:.4}, policy={:.4}, value={:.4}, explosions={}, skipped={}",
            self.td_error.average(),
            self.policy_loss.average(),
            self.value_loss.average(),
            self.explosions,
            self.skipped
        );
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::outcome::{SkipReason, TrainReport};

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(3);
        assert!(avg.is_empty());
        assert_eq!(avg.average(), 0.0);

        avg.push(1.0);
        avg.push(2.0);
        avg.push(3.0);
        assert!((avg.average() - 2.0).abs() < 1e-6);

        avg.push(4.0);
        assert_eq!(avg.len(), 3);
        assert!((avg.average() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_moving_average_ignores_non_finite() {
        let mut avg = MovingAverage::new(4);
        avg.push(2.0);
        avg.push(f32::NAN);
        avg.push(f32::INFINITY);
        assert_eq!(avg.len(), 1);
        assert!((avg.average() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_record_outcomes() {
        let mut metrics = TrainingMetrics::new(10);
        metrics.record_learn(&LearnOutcome::Applied {
            td_error: -0.5,
            step: -0.005,
        });
        metrics.record_learn(&LearnOutcome::Exploded {
            magnitude: 1e6,
            step: 0.0,
        });
        metrics.record_learn(&LearnOutcome::Skipped(SkipReason::EmergencyStop));
        assert_eq!(metrics.total_steps, 3);
        assert_eq!(metrics.explosions, 1);
        assert_eq!(metrics.skipped, 1);
        assert!((metrics.td_error.average() - 0.5).abs() < 1e-6);

        metrics.record_train(&TrainOutcome::Trained(TrainReport {
            policy_loss: 0.2,
            value_loss: 0.4,
            ..TrainReport::default()
        }));
        metrics.record_train(&TrainOutcome::Skipped(SkipReason::ShutDown));
        assert_eq!(metrics.train_steps, 1);
        assert_eq!(metrics.skipped, 2);
        assert!((metrics.value_loss.average() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_record_episode() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_episode(5.0, 10, true);
        metrics.record_episode(-1.0, 20, false);
        assert_eq!(metrics.episodes, 2);
        assert!((metrics.episode_rewards.average() - 2.0).abs() < 1e-6);
        assert!((metrics.episode_lengths.average() - 15.0).abs() < 1e-6);
        assert!((metrics.success_rate.average() - 0.5).abs() < 1e-6);
    }
}
