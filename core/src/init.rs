//! Parameter initializers.
//!
//! Sampling is seeded so a layer built twice from the same config holds
//! identical weights.

use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::EqlError;

/// How a weight or bias buffer is filled at build time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Zeros,
    Constant(f32),
    RandomNormal { mean: f32, std: f32 },
    /// Uniform in [-scale, scale].
    RandomUniform { scale: f32 },
    /// Uniform in [-limit, limit] with limit = sqrt(6 / (fan_in + fan_out)).
    GlorotUniform,
}

impl Initializer {
    /// Keras' `RandomNormal()` default.
    pub fn default_kernel() -> Self {
        Initializer::RandomNormal { mean: 0.0, std: 0.05 }
    }

    pub fn validate(&self) -> Result<(), EqlError> {
        match *self {
            Initializer::Constant(v) if !v.is_finite() => {
                Err(EqlError::config(format!("constant initializer must be finite, got {v}")))
            }
            Initializer::RandomNormal { mean, std } if !mean.is_finite() || !(std >= 0.0) || !std.is_finite() => {
                Err(EqlError::config(format!("invalid normal initializer: mean={mean}, std={std}")))
            }
            Initializer::RandomUniform { scale } if !(scale >= 0.0) || !scale.is_finite() => {
                Err(EqlError::config(format!("uniform scale must be non-negative, got {scale}")))
            }
            _ => Ok(()),
        }
    }

    /// Fill `buf` in place. `fan_in`/`fan_out` only matter for Glorot.
    pub fn fill(&self, buf: &mut [f32], fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Result<(), EqlError> {
        match *self {
            Initializer::Zeros => buf.fill(0.0),
            Initializer::Constant(v) => buf.fill(v),
            Initializer::RandomNormal { mean, std } => {
                let dist = Normal::new(mean, std)
                    .map_err(|e| EqlError::config(format!("normal initializer: {e}")))?;
                for x in buf.iter_mut() {
                    *x = dist.sample(rng);
                }
            }
            Initializer::RandomUniform { scale } => fill_uniform(buf, scale, rng)?,
            Initializer::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                fill_uniform(buf, limit, rng)?;
            }
        }
        Ok(())
    }
}

fn fill_uniform(buf: &mut [f32], scale: f32, rng: &mut StdRng) -> Result<(), EqlError> {
    if scale == 0.0 {
        buf.fill(0.0);
        return Ok(());
    }
    let dist = Uniform::new_inclusive(-scale, scale)
        .map_err(|e| EqlError::config(format!("uniform initializer: {e}")))?;
    for x in buf.iter_mut() {
        *x = dist.sample(rng);
    }
    Ok(())
}

/// Seeded generator used at build time.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
