//! Dense row-major matrix/vector kernel (spec section 4.1).
//!
//! Grounded line-for-line on `examples/original_source/src/linalg/matrix.{h,cpp}`:
//! same storage layout, same `eigen_sym_jacobi` rotation formula and
//! termination rule, same `argsort_desc` index tie-break. Implementers may
//! substitute any backend satisfying the same contract (spec note); this one
//! is dependency-free so the rest of the workspace doesn't pull in a BLAS.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Vector = Vec<f64>;

#[derive(Debug, Error)]
pub enum MathError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Row-major dense matrix of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MathError> {
        let r = rows.len();
        let c = rows.first().map(|row| row.len()).unwrap_or(0);
        if rows.iter().any(|row| row.len() != c) {
            return Err(MathError::DimensionMismatch(
                "from_rows: ragged row lengths".into(),
            ));
        }
        let mut m = Matrix::zeros(r, c);
        for (i, row) in rows.into_iter().enumerate() {
            for (j, v) in row.into_iter().enumerate() {
                m.set(i, j, v);
            }
        }
        Ok(m)
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Matrix::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_vec(&self, r: usize) -> Vector {
        self.row(r).to_vec()
    }

    pub fn transpose(&self) -> Matrix {
        let mut t = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                t.set(c, r, self.get(r, c));
            }
        }
        t
    }

    pub fn matmul(&self, other: &Matrix) -> Result<Matrix, MathError> {
        if self.cols != other.rows {
            return Err(MathError::DimensionMismatch(format!(
                "matmul: ({}x{}) * ({}x{})",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let av = self.get(i, k);
                if av == 0.0 {
                    continue;
                }
                for j in 0..other.cols {
                    let prev = out.get(i, j);
                    out.set(i, j, prev + av * other.get(k, j));
                }
            }
        }
        Ok(out)
    }

    pub fn matvec(&self, x: &[f64]) -> Result<Vector, MathError> {
        if self.cols != x.len() {
            return Err(MathError::DimensionMismatch(format!(
                "matvec: matrix has {} cols, vector has {} entries",
                self.cols,
                x.len()
            )));
        }
        let mut out = vec![0.0; self.rows];
        for i in 0..self.rows {
            let mut sum = 0.0;
            for j in 0..self.cols {
                sum += self.get(i, j) * x[j];
            }
            out[i] = sum;
        }
        Ok(out)
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> Result<f64, MathError> {
    if a.len() != b.len() {
        return Err(MathError::DimensionMismatch(format!(
            "dot: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

pub fn vec_sub(a: &[f64], b: &[f64]) -> Result<Vector, MathError> {
    if a.len() != b.len() {
        return Err(MathError::DimensionMismatch(format!(
            "vec_sub: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x - y).collect())
}

pub fn vec_add(a: &[f64], b: &[f64]) -> Result<Vector, MathError> {
    if a.len() != b.len() {
        return Err(MathError::DimensionMismatch(format!(
            "vec_add: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x + y).collect())
}

pub fn vec_div(a: &[f64], b: &[f64]) -> Result<Vector, MathError> {
    if a.len() != b.len() {
        return Err(MathError::DimensionMismatch(format!(
            "vec_div: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x / y).collect())
}

pub fn vec_scale(a: &[f64], s: f64) -> Vector {
    a.iter().map(|x| x * s).collect()
}

/// Stable descending argsort: ties break by ascending index, matching
/// `argsort_desc` in the original.
pub fn argsort_desc(v: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..v.len()).collect();
    idx.sort_by(|&a, &b| {
        if v[a] == v[b] {
            a.cmp(&b)
        } else {
            v[b].partial_cmp(&v[a]).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
    idx
}

#[derive(Debug, Clone)]
pub struct EigenSymResult {
    pub eigenvalues: Vector,
    /// Columns are eigenvectors.
    pub eigenvectors: Matrix,
}

fn max_offdiag(a: &Matrix) -> (f64, usize, usize) {
    let mut max_val = 0.0;
    let mut p = 0;
    let mut q = 0;
    for i in 0..a.rows {
        for j in (i + 1)..a.cols {
            let val = a.get(i, j).abs();
            if val > max_val {
                max_val = val;
                p = i;
                q = j;
            }
        }
    }
    (max_val, p, q)
}

/// Cyclic-with-max-pivot Jacobi eigendecomposition of a real symmetric
/// matrix (spec section 4.1). Repeatedly zeros the largest-magnitude
/// off-diagonal entry via a Givens rotation until `max|a_pq| < eps` or
/// `max_iter` sweeps have elapsed. Returns `(eigenvalues, V)` such that
/// `V * diag(eigenvalues) * V^T ≈ A`.
pub fn eigen_sym_jacobi(a: &Matrix, max_iter: usize, eps: f64) -> Result<EigenSymResult, MathError> {
    if a.rows != a.cols {
        return Err(MathError::DimensionMismatch(
            "eigen_sym_jacobi requires a square matrix".into(),
        ));
    }
    let n = a.rows;
    let mut v = Matrix::identity(n);
    let mut d = a.clone();

    for _ in 0..max_iter {
        let (off, p, q) = max_offdiag(&d);
        if off < eps {
            break;
        }

        let app = d.get(p, p);
        let aqq = d.get(q, q);
        let apq = d.get(p, q);

        let phi = 0.5 * (2.0 * apq).atan2(aqq - app);
        let c = phi.cos();
        let s = phi.sin();

        for k in 0..n {
            let dpk = d.get(p, k);
            let dqk = d.get(q, k);
            d.set(p, k, c * dpk - s * dqk);
            d.set(q, k, s * dpk + c * dqk);
        }
        for k in 0..n {
            let dkp = d.get(k, p);
            let dkq = d.get(k, q);
            d.set(k, p, c * dkp - s * dkq);
            d.set(k, q, s * dkp + c * dkq);
        }

        d.set(p, p, c * c * app - 2.0 * s * c * apq + s * s * aqq);
        d.set(q, q, s * s * app + 2.0 * s * c * apq + c * c * aqq);
        d.set(p, q, 0.0);
        d.set(q, p, 0.0);

        for k in 0..n {
            let vkp = v.get(k, p);
            let vkq = v.get(k, q);
            v.set(k, p, c * vkp - s * vkq);
            v.set(k, q, s * vkp + c * vkq);
        }
    }

    let eigenvalues = (0..n).map(|i| d.get(i, i)).collect();
    Ok(EigenSymResult {
        eigenvalues,
        eigenvectors: v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matvec_dimension_mismatch_is_an_error() {
        let m = Matrix::zeros(2, 3);
        let x = vec![1.0, 2.0];
        assert!(matches!(m.matvec(&x), Err(MathError::DimensionMismatch(_))));
    }

    #[test]
    fn identity_matvec_is_identity() {
        let m = Matrix::identity(3);
        let x = vec![1.0, 2.0, 3.0];
        assert_eq!(m.matvec(&x).unwrap(), x);
    }

    #[test]
    fn argsort_desc_breaks_ties_ascending() {
        let v = vec![1.0, 3.0, 3.0, 2.0];
        assert_eq!(argsort_desc(&v), vec![1, 2, 3, 0]);
    }

    #[test]
    fn l2_norm_matches_euclidean_length() {
        assert!((l2_norm(&[3.0, 4.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn eigen_sym_jacobi_diagonal_matrix_returns_input_eigenvalues() {
        let mut a = Matrix::zeros(3, 3);
        a.set(0, 0, 2.0);
        a.set(1, 1, 5.0);
        a.set(2, 2, 1.0);
        let result = eigen_sym_jacobi(&a, 100, 1e-12).unwrap();
        let mut sorted = result.eigenvalues.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((sorted[0] - 1.0).abs() < 1e-9);
        assert!((sorted[1] - 2.0).abs() < 1e-9);
        assert!((sorted[2] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn eigen_sym_jacobi_reconstructs_symmetric_matrix() {
        // A = [[4,1],[1,3]]
        let mut a = Matrix::zeros(2, 2);
        a.set(0, 0, 4.0);
        a.set(0, 1, 1.0);
        a.set(1, 0, 1.0);
        a.set(1, 1, 3.0);

        let result = eigen_sym_jacobi(&a, 100, 1e-14).unwrap();
        // Reconstruct V * diag(lambda) * V^T and compare to A.
        let mut recon = Matrix::zeros(2, 2);
        for i in 0..2 {
            for j in 0..2 {
                let mut sum = 0.0;
                for k in 0..2 {
                    sum += result.eigenvectors.get(i, k) * result.eigenvalues[k] * result.eigenvectors.get(j, k);
                }
                recon.set(i, j, sum);
            }
        }
        for i in 0..2 {
            for j in 0..2 {
                assert!((recon.get(i, j) - a.get(i, j)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn eigen_sym_jacobi_rejects_non_square() {
        let a = Matrix::zeros(2, 3);
        assert!(eigen_sym_jacobi(&a, 10, 1e-9).is_err());
    }
}
