pub mod agents;
pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use agents::{
    Decision, Experience, LearnOutcome, PolicyAgent, ReplayStore, TrainOutcome, ValueAgent,
};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
