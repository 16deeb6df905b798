//! Differentiable building blocks for Equation Learner (EQL) networks.
//!
//! Hidden units are restricted to interpretable unary functions and pairwise
//! products so a trained, pruned network reads back as a closed-form
//! expression. The training driver (optimizer, data, pruning schedule) lives
//! outside this crate and talks to the layers through `layer::EqlLayer`.

pub mod tensor;
pub mod error;
pub mod init;
pub mod layer;
pub mod dense;
pub mod hypothesis;
pub mod symbolic;
pub mod division;
pub mod energy;
pub mod checkpoint;

pub use dense::{DenseConfig, DenseGrads, DenseMasked, DenseOptions, DenseParams};
pub use division::{DivisionConfig, DivisionLayer, OutputLoss};
pub use energy::{ConservedQuantity, EnergyConservation, QuadraticEnergy};
pub use error::EqlError;
pub use hypothesis::{HypothesisSet, UnaryFn};
pub use init::Initializer;
pub use layer::{EqlLayer, LossTerm};
pub use symbolic::{NodeCounts, SymbolicLayer};
pub use tensor::Tensor;
