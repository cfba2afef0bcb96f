//! Explicit results of the public agent entry points
//!
//! Agents never return errors from their hot-path calls. Every failure is
//! folded into one of these variants so the caller's loop stays alive.

use crate::error::AgentError;

/// Result of action selection
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Greedy / policy action from the approximator
    Exploit(usize),
    /// Uniformly random exploration
    Explore(usize),
    /// Random action substituted after a failure
    Fallback { action: usize, reason: AgentError },
}

impl Decision {
    pub fn action(&self) -> usize {
        match self {
            Decision::Exploit(action) | Decision::Explore(action) => *action,
            Decision::Fallback { action, .. } => *action,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Decision::Fallback { .. })
    }
}

/// Why a learning call did nothing
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    EmergencyStop,
    InsufficientData { available: usize, required: usize },
    ShutDown,
}

/// Result of a single online update
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    Applied { td_error: f32, step: f32 },
    /// Gradient looked like an explosion; `step` was applied with the
    /// tightened learning rate and clip (0 once learning is suspended)
    Exploded { magnitude: f32, step: f32 },
    Skipped(SkipReason),
    /// Malformed input, nothing stored
    Rejected(AgentError),
    /// Approximator failure, nothing applied
    Failed(AgentError),
}

impl LearnOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, LearnOutcome::Applied { .. })
    }

    /// Whether the primary approximator was written
    pub fn changed_weights(&self) -> bool {
        match self {
            LearnOutcome::Applied { .. } => true,
            LearnOutcome::Exploded { step, .. } => *step != 0.0,
            _ => false,
        }
    }
}

/// Summary of one batched training pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub samples: usize,
    pub applied: usize,
    pub exploded: usize,
    pub failed: usize,
    /// Weights reverted because their update was non-finite
    pub rolled_back: usize,
    /// Mean absolute TD error / advantage over the batch
    pub mean_abs_error: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub reinitialized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Trained(TrainReport),
    Skipped(SkipReason),
}

impl TrainOutcome {
    pub fn report(&self) -> Option<&TrainReport> {
        match self {
            TrainOutcome::Trained(report) => Some(report),
            TrainOutcome::Skipped(_) => None,
        }
    }
}
