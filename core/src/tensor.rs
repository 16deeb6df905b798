//! Minimal tensor utilities for the EQL layers.
//!
//! A `Tensor` is a flat f32 buffer plus shape metadata. Every layer boundary is
//! a 2-D `[batch, width]` tensor in row-major layout. The math is done by free
//! functions on flat slices with explicit dimensions, so backward passes can
//! reuse the same kernels as the forward pass.

use serde::{Deserialize, Serialize};

use crate::error::EqlError;

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    /// Wrap an existing buffer. Fails if `data.len()` disagrees with the shape.
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self, EqlError> {
        let n: usize = shape.iter().product();
        if data.len() != n {
            return Err(EqlError::Shape {
                expected: shape.to_vec(),
                found: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape: shape.to_vec() })
    }

    /// Build a `[rows.len(), width]` matrix from row slices.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, EqlError> {
        let width = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(EqlError::Shape {
                    expected: vec![rows.len(), width],
                    found: vec![rows.len(), row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Tensor { data, shape: vec![rows.len(), width] })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Leading dimension (batch size) of a 2-D tensor.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Trailing dimension (feature width) of a 2-D tensor.
    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(0)
    }

    /// Require a 2-D shape, returning `(rows, cols)`.
    pub fn dims2(&self) -> Result<(usize, usize), EqlError> {
        match self.shape.as_slice() {
            &[r, c] => Ok((r, c)),
            other => Err(EqlError::Shape {
                expected: vec![self.data.len(), 1],
                found: other.to_vec(),
            }),
        }
    }

    pub fn row(&self, r: usize) -> &[f32] {
        let c = self.cols();
        &self.data[r * c..(r + 1) * c]
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols() + c]
    }

    pub fn set(&mut self, r: usize, c: usize, value: f32) {
        let cols = self.cols();
        self.data[r * cols + c] = value;
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// out[M,N] = a[M,K] · b[K,N], row-major, `out` overwritten.
///
/// i-p-j order: each row of `b` is streamed once per (i, p) and added
/// into the output row, so the inner loop is contiguous on both sides.
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!((a.len(), b.len(), out.len()), (m * k, k * n, m * n));
    out.fill(0.0);
    for (a_row, out_row) in a.chunks_exact(k.max(1)).zip(out.chunks_exact_mut(n.max(1))).take(m) {
        for (&a_ip, b_row) in a_row.iter().zip(b.chunks_exact(n.max(1))) {
            for (o, &b_pj) in out_row.iter_mut().zip(b_row) {
                *o += a_ip * b_pj;
            }
        }
    }
}

/// out[K,M] = a[M,K]ᵀ.
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!((a.len(), out.len()), (m * k, k * m));
    for (i, row) in a.chunks_exact(k.max(1)).take(m).enumerate() {
        for (j, &v) in row.iter().enumerate() {
            out[j * m + i] = v;
        }
    }
}

/// Broadcast a bias row over every row: out[r, c] += bias[c].
pub fn add_row_bias_f32(out: &mut [f32], bias: &[f32], rows: usize) {
    let cols = bias.len();
    debug_assert_eq!(out.len(), rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] += bias[c];
        }
    }
}

/// Column sums of A[M,N] into out[N] (overwritten).
pub fn col_sum_f32(a: &[f32], out: &mut [f32], m: usize, n: usize) {
    debug_assert_eq!(a.len(), m * n);
    debug_assert_eq!(out.len(), n);
    out.fill(0.0);
    for i in 0..m {
        for j in 0..n {
            out[j] += a[i * n + j];
        }
    }
}

/// Element-wise multiply in place: a[i] *= b[i].
pub fn mul_assign_f32(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, &y) in a.iter_mut().zip(b) {
        *x *= y;
    }
}

/// L1 norm: sum(|a[i]|).
pub fn l1_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x.abs()).sum()
}

/// Sign with sign(0) = 0, the subgradient used for L1 penalties.
#[inline]
pub fn sign_f32(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Logistic function. Branches on the sign of x so `exp` only ever sees a
/// non-positive argument.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
