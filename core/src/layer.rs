//! The seam between the EQL layers and an external training driver.
//!
//! Every layer wraps one `DenseMasked` and exposes the same cycle:
//! `forward_with_cache` → read `losses()` → `backward` → driver update →
//! `apply_constraints`. The driver owns the order; the layers own the math.

use crate::dense::{DenseGrads, DenseMasked};
use crate::error::EqlError;
use crate::tensor::Tensor;

/// Named scalar loss contribution registered by a forward pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossTerm {
    pub name: &'static str,
    pub value: f32,
}

pub const REGULARIZATION_LOSS: &str = "regularization";
pub const DENOMINATOR_PENALTY: &str = "denominator_penalty";
pub const OUTPUT_LOSS: &str = "output_loss";
pub const ENERGY_CONSERVATION: &str = "energy_conservation";

pub trait EqlLayer {
    /// Activations the backward pass needs from the matching forward pass.
    type Cache;

    fn dense(&self) -> &DenseMasked;

    fn dense_mut(&mut self) -> &mut DenseMasked;

    /// Forward pass. Builds the layer on first use and replaces the
    /// registered losses with this pass's contributions.
    fn forward_with_cache(&mut self, x: &Tensor) -> Result<(Tensor, Self::Cache), EqlError>;

    /// Backward pass for `d_out = dL/d(output)`. Returns `dL/d(input)` and the
    /// parameter gradients, including the gradients of this layer's own
    /// registered loss terms.
    fn backward(&self, cache: &Self::Cache, d_out: &Tensor) -> Result<(Tensor, DenseGrads), EqlError>;

    fn forward(&mut self, x: &Tensor) -> Result<Tensor, EqlError> {
        self.forward_with_cache(x).map(|(out, _)| out)
    }

    fn losses(&self) -> &[LossTerm] {
        self.dense().losses()
    }

    /// Sum of the losses registered by the most recent forward pass.
    fn total_loss(&self) -> f32 {
        self.losses().iter().map(|l| l.value).sum()
    }

    /// Post-update hook: re-applies the trimmer masks to W and b.
    fn apply_constraints(&mut self) {
        self.dense_mut().apply_constraints();
    }

    fn set_regularization(&mut self, coefficient: f32) -> Result<(), EqlError> {
        self.dense_mut().set_regularization(coefficient)
    }

    /// Plain SGD step, p -= lr * g. Does not constrain.
    fn apply_gradients(&mut self, grads: &DenseGrads, lr: f32) -> Result<(), EqlError> {
        self.dense_mut().apply_gradients(grads, lr)
    }
}
