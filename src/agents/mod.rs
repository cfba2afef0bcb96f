//! Reinforcement-learning decision core
//!
//! A shared experience-replay store feeding two learners that map fixed-size
//! state vectors to discrete actions:
//! - `ValueAgent`: DQN-style epsilon-greedy learner with a lagged target copy
//! - `PolicyAgent`: PPO-style linear policy with a clipped-surrogate update
//!
//! # Architecture
//!
//! ```text
//! state vector (external encoder)
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ValueAgent / PolicyAgent                                   │
//! │  - decide(): Exploit | Explore | Fallback                   │
//! │  - record_and_learn() / record_experience()                 │
//! └─────────────────────────────────────────────────────────────┘
//!     │                                   │
//!     ▼                                   ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  ReplayStore             │   │  StabilityGuard              │
//! │  - pooled circular slots │   │  - clipping, explosions      │
//! │  - sampling, compaction  │   │  - emergency stop, failures  │
//! └──────────────────────────┘   └──────────────────────────────┘
//!     │
//!     ▼
//! train_step() / sync_target() on the coordinator's cadence
//! ```

pub mod backend;
pub mod env;
pub mod experience;
pub mod linalg;
pub mod metrics;
pub mod outcome;
pub mod persistence;
pub mod policy;
pub mod replay;
pub mod stability;
pub mod tuning;
pub mod value;

pub use backend::{Backend, LinearModel, ValueTable};
pub use env::{EnvConfig, StepResult, TargetSeekEnv};
pub use experience::Experience;
pub use metrics::{MovingAverage, TrainingMetrics};
pub use outcome::{Decision, LearnOutcome, SkipReason, TrainOutcome, TrainReport};
pub use policy::{PolicyAgent, PolicyAgentStats};
pub use replay::{ReplayStats, ReplayStore};
pub use stability::{GradientCheck, StabilityGuard, StabilitySnapshot};
pub use tuning::Tunables;
pub use value::{ValueAgent, ValueAgentStats};
