//! Q-value approximators
//!
//! The value agent picks one backend at construction and dispatches by match.
//! Both expose their parameters as one flat slice so the target copy can be
//! synchronized entry by entry.

use super::linalg::{Matrix, all_finite};
use crate::config::{BackendKind, ValueAgentConfig};
use crate::error::{AgentError, Result};

/// Hashed lookup table shaped `[bucket_count][action_size]`
#[derive(Debug, Clone, PartialEq)]
pub struct ValueTable {
    state_size: usize,
    levels: u32,
    table: Matrix,
}

impl ValueTable {
    pub fn new(state_size: usize, action_size: usize, bucket_count: usize, levels: u32) -> Self {
        Self {
            state_size,
            levels: levels.max(2),
            table: Matrix::zeros(bucket_count, action_size),
        }
    }

    /// Quantize features in [-1, 1] and hash them into a row (FNV-1a)
    pub fn bucket(&self, state: &[f32]) -> usize {
        let steps = (self.levels - 1) as f32;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for &v in state.iter().take(self.state_size) {
            let unit = (v.clamp(-1.0, 1.0) + 1.0) * 0.5;
            let level = (unit * steps).round() as u64;
            hash ^= level;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % self.table.rows() as u64) as usize
    }

    pub fn row(&self, state: &[f32]) -> &[f32] {
        self.table.row(self.bucket(state))
    }

    fn apply(&mut self, state: &[f32], action: usize, step: f32) -> UpdateReport {
        let bucket = self.bucket(state);
        let old = self.table.get(bucket, action);
        let new = old + step;
        if new.is_finite() {
            self.table.set(bucket, action, new);
            UpdateReport {
                applied: 1,
                rolled_back: 0,
                max_delta: step.abs(),
            }
        } else {
            UpdateReport {
                applied: 0,
                rolled_back: 1,
                max_delta: 0.0,
            }
        }
    }
}

/// Linear Q-model: `q = [state, 1] · W`, with `W` shaped `[state_size + 1][action_size]`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    weights: Matrix,
}

impl LinearModel {
    pub fn new(state_size: usize, action_size: usize) -> Self {
        Self {
            weights: Matrix::zeros(state_size + 1, action_size),
        }
    }

    fn state_size(&self) -> usize {
        self.weights.rows() - 1
    }

    pub fn forward(&self, state: &[f32]) -> Vec<f32> {
        let mut q = self.weights.project(state);
        let bias = self.weights.row(self.state_size());
        for (q, b) in q.iter_mut().zip(bias) {
            *q += b;
        }
        q
    }

    fn apply(&mut self, state: &[f32], action: usize, step: f32) -> UpdateReport {
        let mut report = UpdateReport::default();
        let bias_row = self.state_size();

        for row in 0..=bias_row {
            let input = if row == bias_row { 1.0 } else { state[row] };
            let delta = step * input;
            if delta == 0.0 {
                continue;
            }
            let old = self.weights.get(row, action);
            let new = old + delta;
            if new.is_finite() {
                self.weights.set(row, action, new);
                report.applied += 1;
                report.max_delta = report.max_delta.max(delta.abs());
            } else {
                report.rolled_back += 1;
            }
        }

        report
    }
}

/// Result of applying a single TD step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpdateReport {
    /// Entries written
    pub applied: usize,
    /// Entries left at their previous value because the result was non-finite
    pub rolled_back: usize,
    /// Largest absolute change written
    pub max_delta: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Learned(LinearModel),
    TableFallback(ValueTable),
}

impl Backend {
    pub fn from_config(config: &ValueAgentConfig) -> Self {
        match config.backend {
            BackendKind::Linear => {
                Backend::Learned(LinearModel::new(config.state_size, config.action_size))
            }
            BackendKind::Table => Backend::TableFallback(ValueTable::new(
                config.state_size,
                config.action_size,
                config.bucket_count,
                config.quantization_levels,
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Learned(_) => "linear",
            Backend::TableFallback(_) => "table",
        }
    }

    /// `(rows, action_size)` of the underlying parameter matrix
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Backend::Learned(model) => model.weights.shape(),
            Backend::TableFallback(table) => table.table.shape(),
        }
    }

    pub fn parameters(&self) -> &[f32] {
        match self {
            Backend::Learned(model) => model.weights.as_slice(),
            Backend::TableFallback(table) => table.table.as_slice(),
        }
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut [f32] {
        match self {
            Backend::Learned(model) => model.weights.as_mut_slice(),
            Backend::TableFallback(table) => table.table.as_mut_slice(),
        }
    }

    /// Q-values for every action; errors if any is non-finite
    pub fn q_values(&self, state: &[f32]) -> Result<Vec<f32>> {
        let q = match self {
            Backend::Learned(model) => model.forward(state),
            Backend::TableFallback(table) => table.row(state).to_vec(),
        };
        if !all_finite(&q) {
            return Err(AgentError::NonFiniteOutput);
        }
        Ok(q)
    }

    /// Move `Q(state, action)` by `step`, rolling back non-finite entries
    pub fn apply_update(&mut self, state: &[f32], action: usize, step: f32) -> UpdateReport {
        match self {
            Backend::Learned(model) => model.apply(state, action, step),
            Backend::TableFallback(table) => table.apply(state, action, step),
        }
    }

    /// Copy `source` entry by entry, keeping the old value where the source is
    /// non-finite. Returns the number of skipped entries.
    pub fn sync_from(&mut self, source: &Backend) -> Result<usize> {
        let same_kind = matches!(
            (&*self, source),
            (Backend::Learned(_), Backend::Learned(_))
                | (Backend::TableFallback(_), Backend::TableFallback(_))
        );
        if !same_kind || self.shape() != source.shape() {
            return Err(AgentError::ShapeMismatch(format!(
                "cannot sync {} {:?} from {} {:?}",
                self.name(),
                self.shape(),
                source.name(),
                source.shape()
            )));
        }

        let mut skipped = 0;
        for (dst, &src) in self.parameters_mut().iter_mut().zip(source.parameters()) {
            if src.is_finite() {
                *dst = src;
            } else {
                skipped += 1;
            }
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_config() -> ValueAgentConfig {
        ValueAgentConfig {
            state_size: 4,
            action_size: 2,
            bucket_count: 64,
            ..ValueAgentConfig::default()
        }
    }

    #[test]
    fn test_table_bucket_is_deterministic() {
        let table = ValueTable::new(4, 2, 64, 8);
        let state = [0.1, 0.5, -0.3, 0.9];
        assert_eq!(table.bucket(&state), table.bucket(&state));
        assert!(table.bucket(&state) < 64);
    }

    #[test]
    fn test_table_update_moves_single_entry() {
        let mut backend = Backend::from_config(&table_config());
        let state = [0.2; 4];

        let report = backend.apply_update(&state, 1, 0.5);
        assert_eq!(report.applied, 1);

        let q = backend.q_values(&state).unwrap();
        assert_eq!(q, vec![0.0, 0.5]);
    }

    #[test]
    fn test_linear_update_and_forward() {
        let mut backend = Backend::from_config(&ValueAgentConfig {
            backend: BackendKind::Linear,
            ..table_config()
        });
        let state = [1.0, 0.0, 0.5, 0.0];

        backend.apply_update(&state, 0, 0.1);
        let q = backend.q_values(&state).unwrap();
        // w0 = 0.1, w2 = 0.05, bias = 0.1
        assert!((q[0] - (0.1 + 0.025 + 0.1)).abs() < 1e-6);
        assert_eq!(q[1], 0.0);
    }

    #[test]
    fn test_non_finite_update_rolls_back() {
        let mut backend = Backend::from_config(&table_config());
        let state = [0.2; 4];
        backend.apply_update(&state, 0, f32::MAX);

        let report = backend.apply_update(&state, 0, f32::MAX);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(backend.q_values(&state).unwrap()[0], f32::MAX);
    }

    #[test]
    fn test_sync_skips_non_finite_entries() {
        let mut primary = Backend::from_config(&table_config());
        let mut target = primary.clone();

        primary.parameters_mut()[0] = 3.0;
        primary.parameters_mut()[1] = f32::NAN;
        target.parameters_mut()[1] = 7.0;

        let skipped = target.sync_from(&primary).unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(target.parameters()[0], 3.0);
        assert_eq!(target.parameters()[1], 7.0);
    }

    #[test]
    fn test_sync_rejects_mismatched_backends() {
        let mut table = Backend::from_config(&table_config());
        let linear = Backend::from_config(&ValueAgentConfig {
            backend: BackendKind::Linear,
            ..table_config()
        });
        assert!(matches!(
            table.sync_from(&linear),
            Err(AgentError::ShapeMismatch(_))
        ));
    }
}
