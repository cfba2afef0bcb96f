//! Error types for the learning core
//!
//! Nothing in here escapes a public agent entry point: agents turn these into
//! fallback decisions or skipped learning steps. They still surface from
//! construction, configuration and the replay store.

use thiserror::Error;

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("state vector has {actual} features, expected {expected}")]
    StateLength { expected: usize, actual: usize },

    #[error("state vector contains non-finite values")]
    NonFiniteState,

    #[error("action {action} out of range for {action_size} actions")]
    ActionOutOfRange { action: usize, action_size: usize },

    #[error("reward {0} is not finite")]
    NonFiniteReward(f32),

    #[error("approximator produced non-finite output")]
    NonFiniteOutput,

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("agent has been shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(String),
}
