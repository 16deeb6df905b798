//! Energy conservation regularizer.
//!
//! Penalizes `coefficient * Σ_rows |E(row) - E_true|` where `E` maps one
//! predicted state vector to a scalar conserved quantity (e.g. a Hamiltonian).
//! Only meaningful when the true quantity is constant across the batch, as in
//! a trajectory of a conservative system. That is not checked.

use crate::error::EqlError;
use crate::layer::{LossTerm, ENERGY_CONSERVATION};
use crate::tensor::{sign_f32, Tensor};

/// Scalar conserved quantity of a single predicted state.
pub trait ConservedQuantity {
    fn energy(&self, state: &[f32]) -> f32;

    /// ∇E written into `out` (same length as `state`). Defaults to central
    /// differences.
    fn energy_grad(&self, state: &[f32], out: &mut [f32]) {
        debug_assert_eq!(state.len(), out.len());
        let eps = 1e-3f32;
        let mut probe = state.to_vec();
        for i in 0..state.len() {
            let orig = probe[i];
            probe[i] = orig + eps;
            let plus = self.energy(&probe);
            probe[i] = orig - eps;
            let minus = self.energy(&probe);
            probe[i] = orig;
            out[i] = (plus - minus) / (2.0 * eps);
        }
    }
}

impl<F> ConservedQuantity for F
where
    F: Fn(&[f32]) -> f32,
{
    fn energy(&self, state: &[f32]) -> f32 {
        self(state)
    }
}

/// E(x) = Σ wᵢ xᵢ². With state `[q, p]` and weights `[k/2, 1/(2m)]` this is
/// the harmonic oscillator Hamiltonian.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadraticEnergy {
    pub weights: Vec<f32>,
}

impl QuadraticEnergy {
    pub fn new(weights: Vec<f32>) -> Self {
        QuadraticEnergy { weights }
    }

    /// H = k q²/2 + p²/(2m) for state `[q, p]`.
    pub fn harmonic_oscillator(stiffness: f32, mass: f32) -> Self {
        QuadraticEnergy { weights: vec![0.5 * stiffness, 0.5 / mass] }
    }
}

impl ConservedQuantity for QuadraticEnergy {
    fn energy(&self, state: &[f32]) -> f32 {
        self.weights.iter().zip(state).map(|(w, x)| w * x * x).sum()
    }

    fn energy_grad(&self, state: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        for ((o, w), x) in out.iter_mut().zip(&self.weights).zip(state) {
            *o = 2.0 * w * x;
        }
    }
}

pub struct EnergyConservation<Q> {
    quantity: Q,
    true_energy: f32,
    coefficient: f32,
}

impl<Q: ConservedQuantity> EnergyConservation<Q> {
    /// `coefficient` is conventionally around 1e-5; it is not validated.
    pub fn new(quantity: Q, true_energy: f32, coefficient: f32) -> Self {
        EnergyConservation { quantity, true_energy, coefficient }
    }

    pub fn true_energy(&self) -> f32 {
        self.true_energy
    }

    pub fn coefficient(&self) -> f32 {
        self.coefficient
    }

    pub fn set_coefficient(&mut self, coefficient: f32) {
        self.coefficient = coefficient;
    }

    pub fn quantity(&self) -> &Q {
        &self.quantity
    }

    /// Per-row predicted energy.
    pub fn energies(&self, prediction: &Tensor) -> Result<Vec<f32>, EqlError> {
        let (rows, _) = prediction.dims2()?;
        Ok((0..rows).map(|r| self.quantity.energy(prediction.row(r))).collect())
    }

    pub fn loss(&self, prediction: &Tensor) -> Result<f32, EqlError> {
        let err: f32 = self
            .energies(prediction)?
            .iter()
            .map(|e| (e - self.true_energy).abs())
            .sum();
        Ok(self.coefficient * err)
    }

    pub fn term(&self, prediction: &Tensor) -> Result<LossTerm, EqlError> {
        Ok(LossTerm { name: ENERGY_CONSERVATION, value: self.loss(prediction)? })
    }

    /// d(loss)/d(prediction), row r = coefficient * sign(E_r - E_true) * ∇E(row r).
    pub fn gradient(&self, prediction: &Tensor) -> Result<Tensor, EqlError> {
        let (rows, cols) = prediction.dims2()?;
        let mut grad = Tensor::zeros(&[rows, cols]);
        for r in 0..rows {
            let state = prediction.row(r);
            let scale = self.coefficient * sign_f32(self.quantity.energy(state) - self.true_energy);
            if scale == 0.0 {
                continue;
            }
            let dst = &mut grad.data[r * cols..(r + 1) * cols];
            self.quantity.energy_grad(state, dst);
            for g in dst.iter_mut() {
                *g *= scale;
            }
        }
        Ok(grad)
    }
}
