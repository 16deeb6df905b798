//! EQL linear-nonlinear layer.
//!
//! A dense transform of width `u + 2v` followed by:
//!   - `u` unary slots: column i → hypotheses[assignment[i]](lin[:, i])
//!   - `v` product slots: columns (u+2j, u+2j+1) → lin[:, u+2j] * lin[:, u+2j+1]
//! Output is `[batch, u + v]`, unary block first.

use serde::{Deserialize, Serialize};

use crate::dense::{DenseCache, DenseConfig, DenseGrads, DenseMasked, DenseOptions};
use crate::error::EqlError;
use crate::hypothesis::{HypothesisSet, UnaryFn};
use crate::layer::EqlLayer;
use crate::tensor::Tensor;

/// Node counts: `unary` function slots and `binary` product slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    pub unary: usize,
    pub binary: usize,
}

impl NodeCounts {
    pub fn new(unary: usize, binary: usize) -> Self {
        NodeCounts { unary, binary }
    }

    /// Width of the dense transform feeding the nonlinearity.
    pub fn linear_width(&self) -> usize {
        self.unary + 2 * self.binary
    }

    /// Width emitted by the layer.
    pub fn output_width(&self) -> usize {
        self.unary + self.binary
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolicLayer {
    nodes: NodeCounts,
    hypotheses: HypothesisSet,
    assignment: Vec<usize>,
    dense: DenseMasked,
}

#[derive(Clone, Debug)]
pub struct SymbolicCache {
    pub dense: DenseCache,
    /// Dense output before the nonlinearity, `[batch, u + 2v]`.
    pub lin_out: Tensor,
}

fn check_assignment(nodes: NodeCounts, hypotheses: &HypothesisSet, assignment: &[usize]) -> Result<(), EqlError> {
    if assignment.len() != nodes.unary {
        return Err(EqlError::config(format!(
            "assignment has {} entries, expected {} unary slots",
            assignment.len(),
            nodes.unary
        )));
    }
    hypotheses.resolve(assignment).map(|_| ())
}

impl SymbolicLayer {
    pub fn new(
        nodes: NodeCounts,
        hypotheses: HypothesisSet,
        assignment: Vec<usize>,
        options: DenseOptions,
    ) -> Result<Self, EqlError> {
        if nodes.output_width() == 0 {
            return Err(EqlError::config("symbolic layer needs at least one unary or binary node"));
        }
        check_assignment(nodes, &hypotheses, &assignment)?;
        let dense = DenseMasked::new(DenseConfig::with_options(nodes.linear_width(), options))?;
        Ok(SymbolicLayer { nodes, hypotheses, assignment, dense })
    }

    pub fn nodes(&self) -> NodeCounts {
        self.nodes
    }

    pub fn hypotheses(&self) -> &HypothesisSet {
        &self.hypotheses
    }

    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    pub fn set_assignment(&mut self, assignment: Vec<usize>) -> Result<(), EqlError> {
        check_assignment(self.nodes, &self.hypotheses, &assignment)?;
        self.assignment = assignment;
        Ok(())
    }

    pub fn output_width(&self) -> usize {
        self.nodes.output_width()
    }

    pub fn linear_width(&self) -> usize {
        self.nodes.linear_width()
    }

    /// Function used by each unary slot. Re-validates the assignment, which
    /// may have come from an untrusted checkpoint.
    fn slot_fns(&self) -> Result<Vec<UnaryFn>, EqlError> {
        check_assignment(self.nodes, &self.hypotheses, &self.assignment)?;
        self.hypotheses.resolve(&self.assignment)
    }

    /// Apply the nonlinearity to a `[batch, u + 2v]` linear output.
    pub fn activate(&self, lin_out: &Tensor) -> Result<Tensor, EqlError> {
        let fns = self.slot_fns()?;
        let (rows, lin_w) = lin_out.dims2()?;
        if lin_w != self.nodes.linear_width() {
            return Err(EqlError::Shape {
                expected: vec![rows, self.nodes.linear_width()],
                found: lin_out.shape.clone(),
            });
        }
        let u = self.nodes.unary;
        let out_w = self.nodes.output_width();
        let mut out = Tensor::zeros(&[rows, out_w]);
        for r in 0..rows {
            let lin = lin_out.row(r);
            let dst = &mut out.data[r * out_w..(r + 1) * out_w];
            for (i, f) in fns.iter().enumerate() {
                dst[i] = f.apply(lin[i]);
            }
            for j in 0..self.nodes.binary {
                dst[u + j] = lin[u + 2 * j] * lin[u + 2 * j + 1];
            }
        }
        Ok(out)
    }
}

impl EqlLayer for SymbolicLayer {
    type Cache = SymbolicCache;

    fn dense(&self) -> &DenseMasked {
        &self.dense
    }

    fn dense_mut(&mut self) -> &mut DenseMasked {
        &mut self.dense
    }

    fn forward_with_cache(&mut self, x: &Tensor) -> Result<(Tensor, SymbolicCache), EqlError> {
        // Fail before touching the dense layer so no loss is registered.
        self.slot_fns()?;
        let (lin_out, dense) = self.dense.forward_with_cache(x)?;
        let out = self.activate(&lin_out)?;
        Ok((out, SymbolicCache { dense, lin_out }))
    }

    fn backward(&self, cache: &SymbolicCache, d_out: &Tensor) -> Result<(Tensor, DenseGrads), EqlError> {
        let fns = self.slot_fns()?;
        let (rows, lin_w) = cache.lin_out.dims2()?;
        let out_w = self.nodes.output_width();
        if d_out.shape != [rows, out_w] {
            return Err(EqlError::Shape { expected: vec![rows, out_w], found: d_out.shape.clone() });
        }
        let u = self.nodes.unary;
        let mut d_lin = Tensor::zeros(&[rows, lin_w]);
        for r in 0..rows {
            let lin = cache.lin_out.row(r);
            let g = d_out.row(r);
            let dst = &mut d_lin.data[r * lin_w..(r + 1) * lin_w];
            for (i, f) in fns.iter().enumerate() {
                dst[i] = g[i] * f.derivative(lin[i]);
            }
            for j in 0..self.nodes.binary {
                let (a, b) = (u + 2 * j, u + 2 * j + 1);
                dst[a] = g[u + j] * lin[b];
                dst[b] = g[u + j] * lin[a];
            }
        }
        self.dense.backward(&cache.dense, &d_lin)
    }
}
