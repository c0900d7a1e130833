//! Synthetic noisy quadratic objective.
//!
//! `L(w; ξ) = ½ (w − w*)ᵀ H (w − w*) + ξ·w` with a fixed symmetric `H`. The
//! batch is the noise vector `ξ`, so the per-batch gradient is
//! `H (w − w*) + ξ` and the true Hessian is `H` on every batch.

use crate::operator::{DenseOperator, GradientOracle, LinearOperator};
use crate::sampler::BatchSource;
use crate::subspace::SubspaceBasis;
use crate::types::InstrumentError;
use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

pub struct NoisyQuadratic {
    hessian: DenseOperator,
    optimum: Array1<f64>,
}

impl NoisyQuadratic {
    pub fn new(hessian: Array2<f64>, optimum: Array1<f64>) -> Result<Self, InstrumentError> {
        let hessian = DenseOperator::new(hessian)?;
        if optimum.len() != hessian.dim() {
            return Err(InstrumentError::DimensionMismatch(format!(
                "optimum has length {}, Hessian is {}x{}",
                optimum.len(),
                hessian.dim(),
                hessian.dim()
            )));
        }
        Ok(Self { hessian, optimum })
    }

    /// Axis-aligned curvature `diag(spectrum)` with the optimum at the origin.
    pub fn diagonal(spectrum: &[f64]) -> Self {
        Self {
            hessian: DenseOperator::from_diagonal(spectrum),
            optimum: Array1::zeros(spectrum.len()),
        }
    }

    /// `Q diag(spectrum) Qᵀ` for a seeded random orthogonal `Q`.
    pub fn rotated(spectrum: &[f64], seed: u64) -> Result<Self, InstrumentError> {
        let dim = spectrum.len();
        let q = SubspaceBasis::random(dim, dim, seed)?.into_inner();
        let scaled = &q * &Array1::from(spectrum.to_vec());
        let h = scaled.dot(&q.t());
        // Exact symmetry; the product above is only symmetric up to rounding.
        let h = (&h + &h.t()) * 0.5;
        Self::new(h, Array1::zeros(dim))
    }

    pub fn hessian(&self) -> &DenseOperator {
        &self.hessian
    }

    pub fn optimum(&self) -> &Array1<f64> {
        &self.optimum
    }
}

impl GradientOracle for NoisyQuadratic {
    type Batch = Array1<f64>;

    fn dim(&self) -> usize {
        self.optimum.len()
    }

    fn loss(&self, params: ArrayView1<'_, f64>, batch: &Array1<f64>) -> f64 {
        let centered = &params - &self.optimum;
        let h_c = self.hessian.apply(centered.view());
        0.5 * centered.dot(&h_c) + batch.dot(&params)
    }

    fn loss_and_grad(&self, params: ArrayView1<'_, f64>, batch: &Array1<f64>) -> (f64, Array1<f64>) {
        let centered = &params - &self.optimum;
        let h_c = self.hessian.apply(centered.view());
        let loss = 0.5 * centered.dot(&h_c) + batch.dot(&params);
        (loss, h_c + batch)
    }
}

fn default_batches_per_epoch() -> usize {
    64
}

fn default_noise_std() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseStreamConfig {
    #[serde(default = "default_batches_per_epoch")]
    pub batches_per_epoch: usize,
    #[serde(default = "default_noise_std")]
    pub noise_std: f64,
    #[serde(default)]
    pub seed: u64,
}

impl Default for NoiseStreamConfig {
    fn default() -> Self {
        Self {
            batches_per_epoch: default_batches_per_epoch(),
            noise_std: default_noise_std(),
            seed: 0,
        }
    }
}

/// A finite epoch of Gaussian noise batches. Restarting replays the same
/// epoch, like re-iterating an unshuffled dataset.
pub struct NoiseBatches {
    dim: usize,
    config: NoiseStreamConfig,
    noise: Normal<f64>,
    rng: StdRng,
    drawn: usize,
}

impl NoiseBatches {
    pub fn new(dim: usize, config: NoiseStreamConfig) -> Result<Self, InstrumentError> {
        if !(config.noise_std.is_finite() && config.noise_std >= 0.0) {
            return Err(InstrumentError::InvalidInput(format!(
                "noise_std must be finite and non-negative, got {}",
                config.noise_std
            )));
        }
        let noise = Normal::new(0.0, config.noise_std).map_err(|err| {
            InstrumentError::InvalidInput(format!("noise_std {}: {err}", config.noise_std))
        })?;
        Ok(Self {
            dim,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            noise,
            drawn: 0,
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.config.batches_per_epoch
    }
}

impl BatchSource for NoiseBatches {
    type Batch = Array1<f64>;

    fn restart(&mut self) {
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.drawn = 0;
    }

    fn next_batch(&mut self) -> Option<Array1<f64>> {
        if self.drawn >= self.config.batches_per_epoch {
            return None;
        }
        self.drawn += 1;
        let noise = self.noise;
        Some(Array1::from_shape_simple_fn(self.dim, || noise.sample(&mut self.rng)))
    }
}
