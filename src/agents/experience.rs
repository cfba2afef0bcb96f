//! A single (state, action, reward, next_state, done) transition

use crate::error::{AgentError, Result};

/// Transition recorded by an agent and owned by a replay slot
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub state: Vec<f32>,
    pub action: usize,
    pub reward: f32,
    pub next_state: Vec<f32>,
    pub done: bool,
}

impl Experience {
    pub fn new(
        state: Vec<f32>,
        action: usize,
        reward: f32,
        next_state: Vec<f32>,
        done: bool,
    ) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
            done,
        }
    }

    /// Empty allocation with room for `state_size` features per vector
    pub(crate) fn with_capacity(state_size: usize) -> Self {
        Self {
            state: Vec::with_capacity(state_size),
            action: 0,
            reward: 0.0,
            next_state: Vec::with_capacity(state_size),
            done: false,
        }
    }

    /// Overwrite in place, reusing the existing vector allocations
    pub(crate) fn refill(
        &mut self,
        state: &[f32],
        action: usize,
        reward: f32,
        next_state: &[f32],
        done: bool,
    ) {
        self.state.clear();
        self.state.extend_from_slice(state);
        self.next_state.clear();
        self.next_state.extend_from_slice(next_state);
        self.action = action;
        self.reward = reward;
        self.done = done;
    }

    /// Check the transition against the store's dimensions
    pub fn validate(&self, state_size: usize, action_size: usize) -> Result<()> {
        validate_transition(
            &self.state,
            self.action,
            self.reward,
            &self.next_state,
            state_size,
            action_size,
        )
    }

    /// Rough heap footprint, used for compaction pressure estimates
    pub(crate) fn heap_bytes(&self) -> usize {
        (self.state.capacity() + self.next_state.capacity()) * std::mem::size_of::<f32>()
    }
}

/// Validate a state vector's length and finiteness
pub fn validate_state(state: &[f32], state_size: usize) -> Result<()> {
    if state.len() != state_size {
        return Err(AgentError::StateLength {
            expected: state_size,
            actual: state.len(),
        });
    }
    if !state.iter().all(|v| v.is_finite()) {
        return Err(AgentError::NonFiniteState);
    }
    Ok(())
}

pub fn validate_action(action: usize, action_size: usize) -> Result<()> {
    if action >= action_size {
        return Err(AgentError::ActionOutOfRange {
            action,
            action_size,
        });
    }
    Ok(())
}

pub(crate) fn validate_transition(
    state: &[f32],
    action: usize,
    reward: f32,
    next_state: &[f32],
    state_size: usize,
    action_size: usize,
) -> Result<()> {
    validate_state(state, state_size)?;
    validate_state(next_state, state_size)?;
    validate_action(action, action_size)?;
    if !reward.is_finite() {
        return Err(AgentError::NonFiniteReward(reward));
    }
    Ok(())
}
