//! Agent configuration
//!
//! Defaults are tuned for small hand-encoded state vectors. `AgentConfig::load`
//! layers a `.env` file and `PLAYMIND_*` environment variables on top.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Which approximator a value agent is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Hashed lookup table over quantized states
    Table,
    /// Linear model over the raw state features
    Linear,
}

impl FromStr for BackendKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(BackendKind::Table),
            "linear" => Ok(BackendKind::Linear),
            other => Err(AgentError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Configuration for the shared replay store
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub state_size: usize,
    pub action_size: usize,
    /// Number of slots in the circular store
    pub capacity: usize,
    /// Recycled experiences kept in the pool after compaction
    pub pool_retention: usize,
    /// Random probes per draw before falling back to a linear scan
    pub max_probe_attempts: usize,
    /// Minimum time between compaction passes
    pub compaction_interval: Duration,
    /// Estimated memory ceiling for stored + pooled experiences
    pub memory_ceiling_bytes: usize,
    /// Fraction of the ceiling that triggers an early compaction
    pub memory_pressure_ratio: f32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            state_size: 16,
            action_size: 4,
            capacity: 10_000,
            pool_retention: 256,
            max_probe_attempts: 8,
            compaction_interval: Duration::from_secs(300),
            memory_ceiling_bytes: 64 * 1024 * 1024,
            memory_pressure_ratio: 0.7,
        }
    }
}

/// Numerical safety envelope shared by both agents
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Initial bound on a single TD gradient
    pub gradient_clip_threshold: f32,
    /// Floor the clip threshold never tightens below
    pub min_clip_threshold: f32,
    /// Absolute gradient magnitude treated as an explosion
    pub explosion_ceiling: f32,
    /// Growth over the previous gradient treated as an explosion
    pub explosion_ratio: f32,
    /// Explosions before learning is suspended
    pub max_explosions: u32,
    /// How long learning stays suspended
    pub emergency_cooldown: Duration,
    /// Learning-rate scale applied after an emergency reset
    pub recovery_learning_rate_scale: f32,
    /// Consecutive failed updates before weights are reinitialized
    pub max_consecutive_failures: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            gradient_clip_threshold: 1.0,
            min_clip_threshold: 0.01,
            explosion_ceiling: 100.0,
            explosion_ratio: 5.0,
            max_explosions: 10,
            emergency_cooldown: Duration::from_secs(60),
            recovery_learning_rate_scale: 0.1,
            max_consecutive_failures: 5,
        }
    }
}

/// Configuration for the DQN-style value agent
#[derive(Debug, Clone)]
pub struct ValueAgentConfig {
    pub state_size: usize,
    pub action_size: usize,
    pub backend: BackendKind,
    /// Rows in the fallback lookup table
    pub bucket_count: usize,
    /// Quantization levels per feature when hashing states into buckets
    pub quantization_levels: u32,
    pub learning_rate: f32,
    /// Discount factor
    pub gamma: f32,
    /// Initial exploration probability
    pub epsilon: f32,
    pub epsilon_floor: f32,
    /// Multiplicative decay applied after each successful update
    pub epsilon_decay: f32,
    /// Replay batch size for `train_step`
    pub batch_size: usize,
    /// Online updates between target synchronizations
    pub target_sync_interval: usize,
    pub stability: StabilityConfig,
}

impl Default for ValueAgentConfig {
    fn default() -> Self {
        Self {
            state_size: 16,
            action_size: 4,
            backend: BackendKind::Table,
            bucket_count: 4096,
            quantization_levels: 8,
            learning_rate: 0.01,
            gamma: 0.95,
            epsilon: 1.0,
            epsilon_floor: 0.05,
            epsilon_decay: 0.995,
            batch_size: 32,
            target_sync_interval: 100,
            stability: StabilityConfig::default(),
        }
    }
}

/// Configuration for the PPO-style policy agent
#[derive(Debug, Clone)]
pub struct PolicyAgentConfig {
    pub state_size: usize,
    pub action_size: usize,
    pub learning_rate: f32,
    /// Discount factor
    pub gamma: f32,
    /// GAE smoothing; 0 gives the plain one-step TD advantage
    pub gae_lambda: f32,
    /// PPO clip parameter
    pub clip_ratio: f32,
    /// Bound on a single advantage / value error
    pub max_gradient_norm: f32,
    /// Bound on any single weight delta
    pub max_policy_update: f32,
    /// Value estimates are clamped to +/- this
    pub value_clamp: f32,
    /// Buffered transitions required before `train_step` runs
    pub min_batch_size: usize,
    /// Local transition buffer cap (oldest dropped)
    pub buffer_capacity: usize,
    /// Half-width of the uniform weight initialization
    pub init_scale: f32,
    pub stability: StabilityConfig,
}

impl Default for PolicyAgentConfig {
    fn default() -> Self {
        Self {
            state_size: 16,
            action_size: 4,
            learning_rate: 0.01,
            gamma: 0.99,
            gae_lambda: 0.0,
            clip_ratio: 0.2,
            max_gradient_norm: 1.0,
            max_policy_update: 0.01,
            value_clamp: 10.0,
            min_batch_size: 32,
            buffer_capacity: 2048,
            init_scale: 0.01,
            stability: StabilityConfig::default(),
        }
    }
}

/// Top-level configuration for the store and both agents
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub replay: ReplayConfig,
    pub value: ValueAgentConfig,
    pub policy: PolicyAgentConfig,
}

impl AgentConfig {
    /// Defaults with the same state/action dimensions everywhere
    pub fn with_dimensions(state_size: usize, action_size: usize) -> Self {
        let mut cfg = Self::default();
        cfg.set_dimensions(state_size, action_size);
        cfg
    }

    fn set_dimensions(&mut self, state_size: usize, action_size: usize) {
        self.replay.state_size = state_size;
        self.replay.action_size = action_size;
        self.value.state_size = state_size;
        self.value.action_size = action_size;
        self.policy.state_size = state_size;
        self.policy.action_size = action_size;
    }

    /// Load configuration from `.env` and the process environment
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();
        let cfg = Self::from_lookup(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let state_size = parse_var(&lookup, "PLAYMIND_STATE_SIZE").unwrap_or(cfg.value.state_size);
        let action_size =
            parse_var(&lookup, "PLAYMIND_ACTION_SIZE").unwrap_or(cfg.value.action_size);
        cfg.set_dimensions(state_size, action_size);

        if let Some(v) = parse_var(&lookup, "PLAYMIND_REPLAY_CAPACITY") {
            cfg.replay.capacity = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "PLAYMIND_COMPACTION_INTERVAL_SECS") {
            cfg.replay.compaction_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_BACKEND") {
            cfg.value.backend = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_LEARNING_RATE") {
            cfg.value.learning_rate = v;
            cfg.policy.learning_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_GAMMA") {
            cfg.value.gamma = v;
            cfg.policy.gamma = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_EPSILON") {
            cfg.value.epsilon = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_BATCH_SIZE") {
            cfg.value.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_TARGET_SYNC_INTERVAL") {
            cfg.value.target_sync_interval = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_CLIP_RATIO") {
            cfg.policy.clip_ratio = v;
        }
        if let Some(v) = parse_var(&lookup, "PLAYMIND_GAE_LAMBDA") {
            cfg.policy.gae_lambda = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "PLAYMIND_EMERGENCY_COOLDOWN_SECS") {
            cfg.value.stability.emergency_cooldown = Duration::from_secs(v);
            cfg.policy.stability.emergency_cooldown = Duration::from_secs(v);
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.value.state_size == 0 || self.value.action_size == 0 {
            return Err(AgentError::Config(
                "state and action sizes must be non-zero".to_string(),
            ));
        }
        if self.replay.capacity == 0 {
            return Err(AgentError::Config(
                "replay capacity must be non-zero".to_string(),
            ));
        }
        if self.value.bucket_count == 0 {
            return Err(AgentError::Config("bucket count must be non-zero".to_string()));
        }
        if self.value.target_sync_interval == 0 {
            return Err(AgentError::Config(
                "target sync interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AgentConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.value.stability.max_explosions, 10);
        assert_eq!(cfg.policy.min_batch_size, 32);
        assert!((cfg.replay.memory_pressure_ratio - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let cfg = AgentConfig::from_lookup(lookup_from(&[
            ("PLAYMIND_STATE_SIZE", "4"),
            ("PLAYMIND_ACTION_SIZE", "2"),
            ("PLAYMIND_BACKEND", "linear"),
            ("PLAYMIND_LEARNING_RATE", "0.05"),
            ("PLAYMIND_REPLAY_CAPACITY", "100"),
        ]));

        assert_eq!(cfg.replay.state_size, 4);
        assert_eq!(cfg.policy.action_size, 2);
        assert_eq!(cfg.value.backend, BackendKind::Linear);
        assert!((cfg.policy.learning_rate - 0.05).abs() < 1e-6);
        assert_eq!(cfg.replay.capacity, 100);
    }

    #[test]
    fn test_unparseable_values_are_ignored() {
        let cfg = AgentConfig::from_lookup(lookup_from(&[
            ("PLAYMIND_STATE_SIZE", "lots"),
            ("PLAYMIND_BACKEND", "transformer"),
        ]));
        assert_eq!(cfg.value.state_size, 16);
        assert_eq!(cfg.value.backend, BackendKind::Table);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let cfg = AgentConfig::with_dimensions(0, 2);
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = AgentConfig::with_dimensions(4, 2);
        cfg.replay.capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
