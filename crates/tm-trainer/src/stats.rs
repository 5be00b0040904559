//! Welford online mean + cross second-moment accumulator.
//!
//! Grounded on `examples/original_source/src/training/pca_trainer.cpp`'s
//! `RunningStats::update`: single-pass, numerically stable mean and
//! covariance accumulation without ever materializing the sample matrix.

use tm_math::Matrix;

pub struct RunningStats {
    pub n: usize,
    pub mean: Vec<f64>,
    /// Sum of cross products of deviations (`M2`); `m2[i][j] / (n-1)` is the
    /// sample covariance.
    pub m2: Matrix,
    dim: usize,
}

impl RunningStats {
    pub fn new(dim: usize) -> Self {
        Self {
            n: 0,
            mean: vec![0.0; dim],
            m2: Matrix::zeros(dim, dim),
            dim,
        }
    }

    pub fn update(&mut self, x: &[f64]) {
        debug_assert_eq!(x.len(), self.dim);
        self.n += 1;
        let n = self.n as f64;
        let mut delta = vec![0.0; self.dim];
        for i in 0..self.dim {
            delta[i] = x[i] - self.mean[i];
            self.mean[i] += delta[i] / n;
        }
        let mut delta2 = vec![0.0; self.dim];
        for i in 0..self.dim {
            delta2[i] = x[i] - self.mean[i];
        }
        for i in 0..self.dim {
            for j in 0..self.dim {
                let prev = self.m2.get(i, j);
                self.m2.set(i, j, prev + delta[i] * delta2[j]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_matches_arithmetic_mean() {
        let mut s = RunningStats::new(1);
        for x in [1.0, 2.0, 3.0, 4.0] {
            s.update(&[x]);
        }
        assert!((s.mean[0] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn variance_matches_sample_variance() {
        let mut s = RunningStats::new(1);
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.update(&[x]);
        }
        // Known population: sample variance = 4.571428..., (n=8)
        let sample_var = s.m2.get(0, 0) / (s.n as f64 - 1.0);
        assert!((sample_var - 4.571428571428571).abs() < 1e-9);
    }
}
