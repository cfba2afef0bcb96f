//! Small dense helpers for the built-in approximators

use rand::Rng;

/// Row-major dense matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Uniform initialization in `[-scale, scale]`
    pub fn random<R: Rng>(rows: usize, cols: usize, scale: f32, rng: &mut R) -> Self {
        let scale = scale.abs();
        let data = (0..rows * cols)
            .map(|_| {
                if scale > 0.0 {
                    rng.random_range(-scale..=scale)
                } else {
                    0.0
                }
            })
            .collect();
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// `input · self`, where `input.len() == rows`
    pub fn project(&self, input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.cols];
        for (i, &x) in input.iter().enumerate().take(self.rows) {
            if x == 0.0 {
                continue;
            }
            for (o, &w) in out.iter_mut().zip(self.row(i)) {
                *o += x * w;
            }
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        all_finite(&self.data)
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }
}

pub fn all_finite(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite())
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Index of the largest finite value; first index wins ties
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Softmax with max-subtraction; uniform when no logit is finite
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }

    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }

    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Draw an index from a categorical distribution
pub fn sample_categorical<R: Rng>(probs: &[f32], rng: &mut R) -> usize {
    let total: f32 = probs.iter().filter(|p| p.is_finite() && **p > 0.0).sum();
    if !(total > 0.0) {
        return rng.random_range(0..probs.len().max(1));
    }

    let mut threshold = rng.random::<f32>() * total;
    for (i, &p) in probs.iter().enumerate() {
        if !(p.is_finite() && p > 0.0) {
            continue;
        }
        if threshold < p {
            return i;
        }
        threshold -= p;
    }

    // Rounding left a sliver at the end
    probs
        .iter()
        .rposition(|p| p.is_finite() && *p > 0.0)
        .unwrap_or(0)
}
