//! EQL division layer, the final stage of an EQL-div network.
//!
//! The dense transform has width `2 * output_width`. Even columns are
//! numerators, odd columns denominators. For each quotient channel:
//!
//!   gate  = 1 if d > threshold else 0          (signed d)
//!   out   = n / (|d| + DIV_EPS) if gate else 0  (absolute d)
//!
//! Negative denominators are always gated, however large their magnitude.
//! A gated channel is exactly 0 and means "undefined", not a quotient.
//!
//! Registered losses: the inherited L1 term, the hinge penalty
//! sum(max(threshold - d, 0)) over every denominator in the batch, and the
//! optional caller-supplied output loss.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dense::{DenseCache, DenseConfig, DenseGrads, DenseMasked, DenseOptions};
use crate::error::EqlError;
use crate::layer::{EqlLayer, DENOMINATOR_PENALTY, OUTPUT_LOSS};
use crate::tensor::{sign_f32, Tensor};

/// Added to |d| before the reciprocal.
pub const DIV_EPS: f32 = 1e-10;

pub const DEFAULT_THRESHOLD: f32 = 0.001;

/// Caller-supplied loss on the layer's final output.
pub trait OutputLoss: Send + Sync {
    fn loss(&self, output: &Tensor) -> f32;

    /// dL/d(output). Defaults to central differences.
    fn gradient(&self, output: &Tensor) -> Tensor {
        let eps = 1e-3f32;
        let mut probe = output.clone();
        let mut grad = Tensor::zeros(&output.shape);
        for i in 0..output.numel() {
            let orig = probe.data[i];
            probe.data[i] = orig + eps;
            let plus = self.loss(&probe);
            probe.data[i] = orig - eps;
            let minus = self.loss(&probe);
            probe.data[i] = orig;
            grad.data[i] = (plus - minus) / (2.0 * eps);
        }
        grad
    }
}

impl<F> OutputLoss for F
where
    F: Fn(&Tensor) -> f32 + Send + Sync,
{
    fn loss(&self, output: &Tensor) -> f32 {
        self(output)
    }
}

/// coefficient * sum(out^2), with an analytic gradient.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SquaredOutputPenalty {
    pub coefficient: f32,
}

impl OutputLoss for SquaredOutputPenalty {
    fn loss(&self, output: &Tensor) -> f32 {
        self.coefficient * output.data.iter().map(|x| x * x).sum::<f32>()
    }

    fn gradient(&self, output: &Tensor) -> Tensor {
        let data = output.data.iter().map(|x| 2.0 * self.coefficient * x).collect();
        Tensor { data, shape: output.shape.clone() }
    }
}

#[derive(Clone)]
struct AttachedLoss(Arc<dyn OutputLoss>);

impl fmt::Debug for AttachedLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputLoss")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DivisionConfig {
    /// Number of final quotients.
    pub output_width: usize,
    /// Mutable between passes via `DivisionLayer::set_threshold`.
    pub threshold: f32,
    pub options: DenseOptions,
}

impl DivisionConfig {
    pub fn new(output_width: usize) -> Self {
        DivisionConfig {
            output_width,
            threshold: DEFAULT_THRESHOLD,
            options: DenseOptions::default(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_options(mut self, options: DenseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), EqlError> {
        if self.output_width == 0 {
            return Err(EqlError::config("output_width must be positive"));
        }
        validate_threshold(self.threshold)
    }
}

fn validate_threshold(t: f32) -> Result<(), EqlError> {
    if !t.is_finite() || t <= 0.0 {
        return Err(EqlError::config(format!("threshold must be positive and finite, got {t}")));
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "DivisionState")]
pub struct DivisionLayer {
    output_width: usize,
    threshold: f32,
    dense: DenseMasked,
    #[serde(skip)]
    output_loss: Option<AttachedLoss>,
}

#[derive(Deserialize)]
struct DivisionState {
    output_width: usize,
    threshold: f32,
    dense: DenseMasked,
}

impl TryFrom<DivisionState> for DivisionLayer {
    type Error = EqlError;

    fn try_from(state: DivisionState) -> Result<Self, EqlError> {
        if state.output_width == 0 {
            return Err(EqlError::config("output_width must be positive"));
        }
        validate_threshold(state.threshold)?;
        if state.dense.output_width() != 2 * state.output_width {
            return Err(EqlError::Shape {
                expected: vec![2 * state.output_width],
                found: vec![state.dense.output_width()],
            });
        }
        Ok(DivisionLayer {
            output_width: state.output_width,
            threshold: state.threshold,
            dense: state.dense,
            output_loss: None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct DivisionCache {
    pub dense: DenseCache,
    /// Dense output, `[batch, 2 * output_width]`, interleaved n/d.
    pub lin_out: Tensor,
    pub output: Tensor,
}

impl DivisionLayer {
    pub fn new(config: DivisionConfig) -> Result<Self, EqlError> {
        config.validate()?;
        let dense = DenseMasked::new(DenseConfig::with_options(2 * config.output_width, config.options))?;
        Ok(DivisionLayer {
            output_width: config.output_width,
            threshold: config.threshold,
            dense,
            output_loss: None,
        })
    }

    pub fn with_output_loss(mut self, loss: impl OutputLoss + 'static) -> Self {
        self.output_loss = Some(AttachedLoss(Arc::new(loss)));
        self
    }

    pub fn set_output_loss(&mut self, loss: impl OutputLoss + 'static) {
        self.output_loss = Some(AttachedLoss(Arc::new(loss)));
    }

    pub fn clear_output_loss(&mut self) {
        self.output_loss = None;
    }

    pub fn has_output_loss(&self) -> bool {
        self.output_loss.is_some()
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) -> Result<(), EqlError> {
        validate_threshold(threshold)?;
        self.threshold = threshold;
        Ok(())
    }

    /// Gated quotients plus the hinge penalty for a `[batch, 2 * output_width]`
    /// linear output.
    pub fn divide(&self, lin_out: &Tensor) -> Result<(Tensor, f32), EqlError> {
        let (rows, lin_w) = lin_out.dims2()?;
        let ow = self.output_width;
        if lin_w != 2 * ow {
            return Err(EqlError::Shape { expected: vec![rows, 2 * ow], found: lin_out.shape.clone() });
        }
        let t = self.threshold;
        let mut out = Tensor::zeros(&[rows, ow]);
        let mut penalty = 0.0f32;
        let mut gated = 0usize;
        for r in 0..rows {
            let lin = lin_out.row(r);
            for k in 0..ow {
                let (n, d) = (lin[2 * k], lin[2 * k + 1]);
                // Gated channels stay exactly 0 for any finite n.
                if d > t {
                    out.data[r * ow + k] = n / (d.abs() + DIV_EPS);
                } else {
                    gated += 1;
                }
                penalty += (t - d).max(0.0);
            }
        }
        log::trace!("division: {gated}/{} channels gated, penalty={penalty}", rows * ow);
        Ok((out, penalty))
    }
}

impl EqlLayer for DivisionLayer {
    type Cache = DivisionCache;

    fn dense(&self) -> &DenseMasked {
        &self.dense
    }

    fn dense_mut(&mut self) -> &mut DenseMasked {
        &mut self.dense
    }

    fn forward_with_cache(&mut self, x: &Tensor) -> Result<(Tensor, DivisionCache), EqlError> {
        let (lin_out, dense) = self.dense.forward_with_cache(x)?;
        let (out, penalty) = self.divide(&lin_out)?;
        self.dense.push_loss(DENOMINATOR_PENALTY, penalty);
        if let Some(AttachedLoss(loss)) = &self.output_loss {
            let value = loss.loss(&out);
            self.dense.push_loss(OUTPUT_LOSS, value);
        }
        Ok((out.clone(), DivisionCache { dense, lin_out, output: out }))
    }

    fn backward(&self, cache: &DivisionCache, d_out: &Tensor) -> Result<(Tensor, DenseGrads), EqlError> {
        let (rows, lin_w) = cache.lin_out.dims2()?;
        let ow = self.output_width;
        if d_out.shape != [rows, ow] {
            return Err(EqlError::Shape { expected: vec![rows, ow], found: d_out.shape.clone() });
        }
        let mut g_out = d_out.clone();
        if let Some(AttachedLoss(loss)) = &self.output_loss {
            let extra = loss.gradient(&cache.output);
            for (g, e) in g_out.data.iter_mut().zip(&extra.data) {
                *g += e;
            }
        }

        let t = self.threshold;
        let mut d_lin = Tensor::zeros(&[rows, lin_w]);
        for r in 0..rows {
            let lin = cache.lin_out.row(r);
            for k in 0..ow {
                let (n, d) = (lin[2 * k], lin[2 * k + 1]);
                let g = g_out.data[r * ow + k];
                let hinge = if t - d > 0.0 { -1.0 } else { 0.0 };
                // Closed gate: no gradient through the quotient.
                let (d_n, d_d) = if d > t {
                    let inv = 1.0 / (d.abs() + DIV_EPS);
                    (g * inv, -g * n * sign_f32(d) * inv * inv)
                } else {
                    (0.0, 0.0)
                };
                d_lin.data[r * lin_w + 2 * k] = d_n;
                d_lin.data[r * lin_w + 2 * k + 1] = d_d + hinge;
            }
        }
        self.dense.backward(&cache.dense, &d_lin)
    }
}
