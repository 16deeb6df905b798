//! JSON persistence for layer state.
//!
//! Parameters, masks, regularization coefficient, threshold, hypothesis set
//! and assignment all round-trip. Registered losses are recomputed on the next
//! forward pass; an attached `OutputLoss` is caller code and must be
//! re-attached after loading.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dense::DenseMasked;
use crate::division::DivisionLayer;
use crate::symbolic::SymbolicLayer;

/// Serialize any layer (or a tuple/Vec of layers) to a JSON file.
pub fn save_layer<T: Serialize>(path: &Path, layer: &T) -> std::io::Result<()> {
    let json = serde_json::to_string(layer)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)?;
    log::debug!("saved layer checkpoint to {}", path.display());
    Ok(())
}

/// Load a layer previously written by `save_layer`.
pub fn load_layer<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Every layer of a symbolic → division network, in forward order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkCheckpoint {
    pub symbolic: Vec<SymbolicLayer>,
    pub division: Option<DivisionLayer>,
    /// Bare dense layers, for drivers that use them directly.
    #[serde(default)]
    pub dense: Vec<DenseMasked>,
}
