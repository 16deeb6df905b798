//! Dense masked affine layer: y = xW + b.
//!
//! W and b each carry a binary trimmer mask. The forward pass reads the stored
//! parameters directly; the masks are enforced only by `apply_constraints`,
//! which the training driver must call after every optimizer update. An L1
//! penalty `c * (sum|W| + sum|b|)` is registered on every forward pass.
//!
//! Layout (row-major):
//!   w:      [input_width, output_width]
//!   b:      [output_width]
//!   w_mask: same as w, entries in {0, 1}
//!   b_mask: same as b, entries in {0, 1}

use serde::{Deserialize, Serialize};

use crate::error::EqlError;
use crate::init::{seeded_rng, Initializer};
use crate::layer::{EqlLayer, LossTerm, REGULARIZATION_LOSS};
use crate::tensor::{
    add_row_bias_f32, col_sum_f32, l1_norm_f32, matmul_f32, mul_assign_f32, sign_f32,
    transpose_f32, Tensor,
};

/// Initialization and regularization settings shared by every layer kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseOptions {
    pub kernel_init: Initializer,
    pub bias_init: Initializer,
    /// L1 coefficient. Mutable between training phases via `set_regularization`.
    pub regularization: f32,
    pub seed: u64,
}

impl Default for DenseOptions {
    fn default() -> Self {
        DenseOptions {
            kernel_init: Initializer::default_kernel(),
            bias_init: Initializer::Zeros,
            regularization: 0.0,
            seed: 42,
        }
    }
}

impl DenseOptions {
    pub fn with_regularization(mut self, regularization: f32) -> Self {
        self.regularization = regularization;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_initializers(mut self, kernel_init: Initializer, bias_init: Initializer) -> Self {
        self.kernel_init = kernel_init;
        self.bias_init = bias_init;
        self
    }

    pub fn validate(&self) -> Result<(), EqlError> {
        validate_regularization(self.regularization)?;
        self.kernel_init.validate()?;
        self.bias_init.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub output_width: usize,
    pub options: DenseOptions,
}

impl DenseConfig {
    pub fn new(output_width: usize) -> Self {
        DenseConfig { output_width, options: DenseOptions::default() }
    }

    pub fn with_options(output_width: usize, options: DenseOptions) -> Self {
        DenseConfig { output_width, options }
    }

    pub fn validate(&self) -> Result<(), EqlError> {
        if self.output_width == 0 {
            return Err(EqlError::config("output_width must be positive"));
        }
        self.options.validate()
    }
}

fn check_binary_mask(mask: &[f32]) -> Result<(), EqlError> {
    match mask.iter().find(|&&m| m != 0.0 && m != 1.0) {
        Some(m) => Err(EqlError::config(format!("mask entries must be 0 or 1, got {m}"))),
        None => Ok(()),
    }
}

fn validate_regularization(c: f32) -> Result<(), EqlError> {
    if !c.is_finite() || c < 0.0 {
        return Err(EqlError::config(format!(
            "regularization must be finite and non-negative, got {c}"
        )));
    }
    Ok(())
}

/// Learnable parameters plus trimmer masks, allocated at build time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseParams {
    pub input_width: usize,
    pub output_width: usize,
    pub w: Vec<f32>,
    pub b: Vec<f32>,
    pub w_mask: Vec<f32>,
    pub b_mask: Vec<f32>,
}

impl DenseParams {
    pub fn init(input_width: usize, output_width: usize, options: &DenseOptions) -> Result<Self, EqlError> {
        let mut rng = seeded_rng(options.seed);
        let mut w = vec![0.0f32; input_width * output_width];
        options.kernel_init.fill(&mut w, input_width, output_width, &mut rng)?;
        let mut b = vec![0.0f32; output_width];
        options.bias_init.fill(&mut b, input_width, output_width, &mut rng)?;
        Ok(DenseParams {
            input_width,
            output_width,
            w,
            b,
            w_mask: vec![1.0; input_width * output_width],
            b_mask: vec![1.0; output_width],
        })
    }

    /// Total number of parameters (masked or not).
    pub fn num_params(&self) -> usize {
        self.w.len() + self.b.len()
    }

    /// Number of parameters whose mask entry is still set.
    pub fn active_params(&self) -> usize {
        self.w_mask.iter().chain(&self.b_mask).filter(|&&m| m != 0.0).count()
    }

    /// param ← param ∘ mask. Idempotent.
    pub fn apply_constraints(&mut self) {
        mul_assign_f32(&mut self.w, &self.w_mask);
        mul_assign_f32(&mut self.b, &self.b_mask);
    }

    /// sum|W| + sum|b|.
    pub fn l1(&self) -> f32 {
        l1_norm_f32(&self.w) + l1_norm_f32(&self.b)
    }

    fn weight_index(&self, row: usize, col: usize) -> Result<usize, EqlError> {
        if row >= self.input_width {
            return Err(EqlError::Index { index: row, len: self.input_width });
        }
        if col >= self.output_width {
            return Err(EqlError::Index { index: col, len: self.output_width });
        }
        Ok(row * self.output_width + col)
    }
}

/// Parameter gradients, same layout as `DenseParams::w` / `b`.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseGrads {
    pub d_w: Vec<f32>,
    pub d_b: Vec<f32>,
}

impl DenseGrads {
    pub fn zeros_like(params: &DenseParams) -> Self {
        DenseGrads {
            d_w: vec![0.0; params.w.len()],
            d_b: vec![0.0; params.b.len()],
        }
    }
}

#[derive(Clone, Debug)]
pub struct DenseCache {
    pub input: Tensor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "DenseMaskedState")]
pub struct DenseMasked {
    config: DenseConfig,
    params: Option<DenseParams>,
    #[serde(skip)]
    losses: Vec<LossTerm>,
}

/// Persisted form of `DenseMasked`, checked by the same rules as `new` and
/// `set_params` before a layer is handed out.
#[derive(Deserialize)]
struct DenseMaskedState {
    config: DenseConfig,
    params: Option<DenseParams>,
}

impl TryFrom<DenseMaskedState> for DenseMasked {
    type Error = EqlError;

    fn try_from(state: DenseMaskedState) -> Result<Self, EqlError> {
        let mut layer = DenseMasked::new(state.config)?;
        if let Some(params) = state.params {
            layer.set_params(params)?;
        }
        Ok(layer)
    }
}

impl DenseMasked {
    pub fn new(config: DenseConfig) -> Result<Self, EqlError> {
        config.validate()?;
        Ok(DenseMasked { config, params: None, losses: Vec::new() })
    }

    pub fn config(&self) -> &DenseConfig {
        &self.config
    }

    pub fn output_width(&self) -> usize {
        self.config.output_width
    }

    pub fn input_width(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.input_width)
    }

    pub fn is_built(&self) -> bool {
        self.params.is_some()
    }

    pub fn regularization(&self) -> f32 {
        self.config.options.regularization
    }

    /// Called by the regularization-schedule driver between training phases.
    pub fn set_regularization(&mut self, coefficient: f32) -> Result<(), EqlError> {
        validate_regularization(coefficient)?;
        self.config.options.regularization = coefficient;
        Ok(())
    }

    /// Allocate W, b and all-ones masks for `input_width`. A second call with
    /// the same width is a no-op; a different width is a shape error.
    pub fn build(&mut self, input_width: usize) -> Result<(), EqlError> {
        if let Some(p) = &self.params {
            if p.input_width != input_width {
                return Err(EqlError::Shape {
                    expected: vec![p.input_width],
                    found: vec![input_width],
                });
            }
            return Ok(());
        }
        if input_width == 0 {
            return Err(EqlError::config("input_width must be positive"));
        }
        let params = DenseParams::init(input_width, self.config.output_width, &self.config.options)?;
        log::debug!(
            "dense layer built: [{input_width}, {}], regularization={}",
            self.config.output_width,
            self.config.options.regularization,
        );
        self.params = Some(params);
        Ok(())
    }

    pub fn params(&self) -> Result<&DenseParams, EqlError> {
        self.params.as_ref().ok_or_else(|| EqlError::config("layer has not been built"))
    }

    pub fn params_mut(&mut self) -> Result<&mut DenseParams, EqlError> {
        self.params.as_mut().ok_or_else(|| EqlError::config("layer has not been built"))
    }

    /// Replace the parameters wholesale (e.g. hand-set weights in tests or a
    /// driver restoring from its own format). Output width must match and
    /// mask entries must be 0 or 1.
    pub fn set_params(&mut self, params: DenseParams) -> Result<(), EqlError> {
        if params.input_width == 0
            || params.output_width != self.config.output_width
            || params.w.len() != params.input_width * params.output_width
            || params.b.len() != params.output_width
            || params.w_mask.len() != params.w.len()
            || params.b_mask.len() != params.b.len()
        {
            return Err(EqlError::Shape {
                expected: vec![params.input_width, self.config.output_width],
                found: vec![params.w.len(), params.b.len()],
            });
        }
        check_binary_mask(&params.w_mask)?;
        check_binary_mask(&params.b_mask)?;
        self.params = Some(params);
        Ok(())
    }

    pub fn set_weight_mask(&mut self, row: usize, col: usize, keep: bool) -> Result<(), EqlError> {
        let p = self.params_mut()?;
        let idx = p.weight_index(row, col)?;
        p.w_mask[idx] = if keep { 1.0 } else { 0.0 };
        Ok(())
    }

    pub fn set_bias_mask(&mut self, col: usize, keep: bool) -> Result<(), EqlError> {
        let p = self.params_mut()?;
        if col >= p.output_width {
            return Err(EqlError::Index { index: col, len: p.output_width });
        }
        p.b_mask[col] = if keep { 1.0 } else { 0.0 };
        Ok(())
    }

    /// Replace both trimmer masks at once. Lengths must match W and b and
    /// every entry must be 0 or 1; on error neither mask is changed.
    pub fn set_masks(&mut self, w_mask: &[f32], b_mask: &[f32]) -> Result<(), EqlError> {
        let p = self.params_mut()?;
        if w_mask.len() != p.w.len() || b_mask.len() != p.b.len() {
            return Err(EqlError::Shape {
                expected: vec![p.w.len(), p.b.len()],
                found: vec![w_mask.len(), b_mask.len()],
            });
        }
        check_binary_mask(w_mask)?;
        check_binary_mask(b_mask)?;
        p.w_mask.copy_from_slice(w_mask);
        p.b_mask.copy_from_slice(b_mask);
        Ok(())
    }

    /// Raw trimmer mask for W, `[input_width, output_width]`. Unchecked: the
    /// caller must write only 0 or 1, since `apply_constraints` multiplies by
    /// the entry as stored. Use `set_masks` for a validated write.
    pub fn weight_mask_mut(&mut self) -> Result<&mut [f32], EqlError> {
        Ok(self.params_mut()?.w_mask.as_mut_slice())
    }

    /// Raw trimmer mask for b. Same contract as `weight_mask_mut`.
    pub fn bias_mask_mut(&mut self) -> Result<&mut [f32], EqlError> {
        Ok(self.params_mut()?.b_mask.as_mut_slice())
    }

    /// Mask entries still set, 0 before build.
    pub fn active_parameters(&self) -> usize {
        self.params.as_ref().map_or(0, DenseParams::active_params)
    }

    /// Clear the mask entry of every still-active parameter with |p| < threshold.
    /// Returns how many entries were newly cleared. Parameters themselves are
    /// zeroed by the next `apply_constraints`.
    pub fn trim_below(&mut self, threshold: f32) -> Result<usize, EqlError> {
        if !(threshold >= 0.0) {
            return Err(EqlError::config(format!("trim threshold must be non-negative, got {threshold}")));
        }
        let p = self.params_mut()?;
        let mut trimmed = 0;
        for (v, m) in p.w.iter().zip(p.w_mask.iter_mut()).chain(p.b.iter().zip(p.b_mask.iter_mut())) {
            if *m != 0.0 && v.abs() < threshold {
                *m = 0.0;
                trimmed += 1;
            }
        }
        log::debug!("trimmed {trimmed} parameters below {threshold}, {} active", p.active_params());
        Ok(trimmed)
    }

    /// No-op before build.
    pub fn apply_constraints(&mut self) {
        if let Some(p) = self.params.as_mut() {
            p.apply_constraints();
        }
    }

    pub fn losses(&self) -> &[LossTerm] {
        &self.losses
    }

    pub(crate) fn push_loss(&mut self, name: &'static str, value: f32) {
        self.losses.push(LossTerm { name, value });
    }

    pub fn apply_gradients(&mut self, grads: &DenseGrads, lr: f32) -> Result<(), EqlError> {
        let p = self.params_mut()?;
        if grads.d_w.len() != p.w.len() || grads.d_b.len() != p.b.len() {
            return Err(EqlError::Shape {
                expected: vec![p.w.len(), p.b.len()],
                found: vec![grads.d_w.len(), grads.d_b.len()],
            });
        }
        for (param, g) in p.w.iter_mut().zip(&grads.d_w) {
            *param -= lr * g;
        }
        for (param, g) in p.b.iter_mut().zip(&grads.d_b) {
            *param -= lr * g;
        }
        Ok(())
    }

    /// Check a 2-D input against the built width, building first if needed.
    fn prepare_input(&mut self, x: &Tensor) -> Result<(usize, usize), EqlError> {
        let (rows, cols) = x.dims2()?;
        match self.input_width() {
            Some(w) if w != cols => Err(EqlError::Shape {
                expected: vec![rows, w],
                found: x.shape.clone(),
            }),
            Some(_) => Ok((rows, cols)),
            None => {
                self.build(cols)?;
                Ok((rows, cols))
            }
        }
    }
}

impl EqlLayer for DenseMasked {
    type Cache = DenseCache;

    fn dense(&self) -> &DenseMasked {
        self
    }

    fn dense_mut(&mut self) -> &mut DenseMasked {
        self
    }

    fn forward_with_cache(&mut self, x: &Tensor) -> Result<(Tensor, DenseCache), EqlError> {
        let (rows, in_w) = self.prepare_input(x)?;
        let c = self.config.options.regularization;
        let p = self.params()?;
        let out_w = p.output_width;

        let mut out = Tensor::zeros(&[rows, out_w]);
        matmul_f32(&x.data, &p.w, &mut out.data, rows, in_w, out_w);
        add_row_bias_f32(&mut out.data, &p.b, rows);

        let reg = c * p.l1();
        self.losses.clear();
        self.push_loss(REGULARIZATION_LOSS, reg);

        Ok((out, DenseCache { input: x.clone() }))
    }

    fn backward(&self, cache: &DenseCache, d_out: &Tensor) -> Result<(Tensor, DenseGrads), EqlError> {
        let p = self.params()?;
        let (rows, in_w) = cache.input.dims2()?;
        let out_w = p.output_width;
        if d_out.shape != [rows, out_w] {
            return Err(EqlError::Shape { expected: vec![rows, out_w], found: d_out.shape.clone() });
        }
        let c = self.config.options.regularization;

        // d_input = d_out[B,O] @ W^T[O,I]
        let mut w_t = vec![0.0f32; out_w * in_w];
        transpose_f32(&p.w, &mut w_t, in_w, out_w);
        let mut d_input = Tensor::zeros(&[rows, in_w]);
        matmul_f32(&d_out.data, &w_t, &mut d_input.data, rows, out_w, in_w);

        // d_W = x^T[I,B] @ d_out[B,O] + c * sign(W)
        let mut grads = DenseGrads::zeros_like(p);
        let mut x_t = vec![0.0f32; in_w * rows];
        transpose_f32(&cache.input.data, &mut x_t, rows, in_w);
        matmul_f32(&x_t, &d_out.data, &mut grads.d_w, in_w, rows, out_w);
        col_sum_f32(&d_out.data, &mut grads.d_b, rows, out_w);

        if c != 0.0 {
            for (g, &w) in grads.d_w.iter_mut().zip(&p.w) {
                *g += c * sign_f32(w);
            }
            for (g, &b) in grads.d_b.iter_mut().zip(&p.b) {
                *g += c * sign_f32(b);
            }
        }
        Ok((d_input, grads))
    }
}
