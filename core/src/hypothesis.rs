//! Hypothesis set: the fixed menu of unary functions a symbolic layer may
//! place in each unary slot.
//!
//! Functions are a closed tagged variant rather than closures so a checkpoint
//! can record exactly which function each slot uses.

use serde::{Deserialize, Serialize};

use crate::error::EqlError;
use crate::tensor::sigmoid_f32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryFn {
    Identity,
    Sin,
    Cos,
    Sigmoid,
    Tanh,
    Square,
    Exp,
}

impl UnaryFn {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryFn::Identity => x,
            UnaryFn::Sin => x.sin(),
            UnaryFn::Cos => x.cos(),
            UnaryFn::Sigmoid => sigmoid_f32(x),
            UnaryFn::Tanh => x.tanh(),
            UnaryFn::Square => x * x,
            UnaryFn::Exp => x.exp(),
        }
    }

    /// d/dx of `apply`.
    #[inline]
    pub fn derivative(self, x: f32) -> f32 {
        match self {
            UnaryFn::Identity => 1.0,
            UnaryFn::Sin => x.cos(),
            UnaryFn::Cos => -x.sin(),
            UnaryFn::Sigmoid => {
                let s = sigmoid_f32(x);
                s * (1.0 - s)
            }
            UnaryFn::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            UnaryFn::Square => 2.0 * x,
            UnaryFn::Exp => x.exp(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryFn::Identity => "id",
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Sigmoid => "sigm",
            UnaryFn::Tanh => "tanh",
            UnaryFn::Square => "sq",
            UnaryFn::Exp => "exp",
        }
    }
}

/// Ordered, non-empty list of unary functions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<UnaryFn>", into = "Vec<UnaryFn>")]
pub struct HypothesisSet {
    fns: Vec<UnaryFn>,
}

impl HypothesisSet {
    pub fn new(fns: Vec<UnaryFn>) -> Result<Self, EqlError> {
        if fns.is_empty() {
            return Err(EqlError::config("hypothesis set must not be empty"));
        }
        Ok(HypothesisSet { fns })
    }

    /// `[identity, sin, cos, sigmoid]`, the classic EQL base set.
    pub fn eql_default() -> Self {
        HypothesisSet {
            fns: vec![UnaryFn::Identity, UnaryFn::Sin, UnaryFn::Cos, UnaryFn::Sigmoid],
        }
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<UnaryFn, EqlError> {
        self.fns
            .get(index)
            .copied()
            .ok_or(EqlError::Index { index, len: self.fns.len() })
    }

    pub fn as_slice(&self) -> &[UnaryFn] {
        &self.fns
    }

    /// Resolve an assignment vector to the function used by each slot.
    pub fn resolve(&self, assignment: &[usize]) -> Result<Vec<UnaryFn>, EqlError> {
        assignment.iter().map(|&i| self.get(i)).collect()
    }
}

impl TryFrom<Vec<UnaryFn>> for HypothesisSet {
    type Error = EqlError;

    fn try_from(fns: Vec<UnaryFn>) -> Result<Self, EqlError> {
        HypothesisSet::new(fns)
    }
}

impl From<HypothesisSet> for Vec<UnaryFn> {
    fn from(set: HypothesisSet) -> Self {
        set.fns
    }
}
