//! Matrix-free power iteration for the leading curvature eigenpairs.
//!
//! Two solvers share the same Rayleigh-quotient stopping rule
//! `|λ_t - λ_{t-1}| < tol * max(1, |λ_t|)`:
//!
//! * [`topk_power`] extracts `k` pairs sequentially with deflation against the
//!   vectors already found; the last retained value is the curvature floor `mu`.
//! * [`power_max_eig`] tracks a single `lambda_max` for the edge-of-stability
//!   check `eta * lambda_max < 2`.
//!
//! Neither solver signals non-convergence; the iteration budget is a hard cap
//! and the best estimate so far is returned.

use crate::linalg::utils::{NORM_FLOOR, norm};
use crate::operator::{LinearOperator, check_operator_dim};
use crate::subspace::SubspaceBasis;
use crate::types::InstrumentError;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Order in which eigenpairs are reported.
///
/// Deflated power iteration does not guarantee that extraction order is
/// non-increasing in eigenvalue under loose tolerances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EigenOrdering {
    #[default]
    Extraction,
    Descending,
}

fn default_k() -> usize {
    1
}

fn default_eigen_iters() -> usize {
    50
}

fn default_eigen_tol() -> f64 {
    1e-3
}

fn default_refresh_every() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_eigen_iters")]
    pub iters: usize,
    #[serde(default = "default_eigen_tol")]
    pub tol: f64,
    /// Refresh cadence in steps; `0` disables curvature tracking entirely.
    #[serde(default = "default_refresh_every")]
    pub refresh_every: usize,
    #[serde(default)]
    pub ordering: EigenOrdering,
}

impl Default for EigenConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            iters: default_eigen_iters(),
            tol: default_eigen_tol(),
            refresh_every: default_refresh_every(),
            ordering: EigenOrdering::default(),
        }
    }
}

impl EigenConfig {
    pub fn enabled(&self) -> bool {
        self.refresh_every > 0
    }

    pub fn due(&self, step: usize) -> bool {
        self.enabled() && step % self.refresh_every == 0
    }
}

/// Result of [`topk_power`].
#[derive(Debug, Clone)]
pub struct EigenPairs {
    pub values: Array1<f64>,
    basis: SubspaceBasis,
    /// Power iterations spent on each pair, in extraction order.
    pub iterations: Vec<usize>,
}

impl EigenPairs {
    /// Curvature floor: the last entry of the reported ordering.
    pub fn mu(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    pub fn basis(&self) -> &SubspaceBasis {
        &self.basis
    }

    pub fn into_basis(self) -> SubspaceBasis {
        self.basis
    }

    pub fn vectors(&self) -> &Array2<f64> {
        &self.basis
    }
}

fn deflate(w: &mut Array1<f64>, found: &[Array1<f64>]) {
    for q in found {
        let c = q.dot(&*w);
        w.scaled_add(-c, q);
    }
}

fn floored_unit(v: &Array1<f64>) -> Array1<f64> {
    let denom = norm(v) + NORM_FLOOR;
    v.mapv(|x| x / denom)
}

#[inline]
fn converged(lam: f64, last: Option<f64>, tol: f64) -> bool {
    last.is_some_and(|prev| (lam - prev).abs() < tol * lam.abs().max(1.0))
}

/// Top-`k` eigenpairs of a symmetric operator by sequential deflated power
/// iteration.
///
/// Start vectors come from one seeded Gaussian stream, drawn in extraction
/// order. Each operator output is projected orthogonal to the earlier vectors
/// before the Rayleigh quotient is taken. After the loop the quotient is
/// recomputed once at the final vector.
pub fn topk_power<O: LinearOperator>(
    op: &O,
    dim: usize,
    config: &EigenConfig,
    seed: u64,
) -> Result<EigenPairs, InstrumentError> {
    check_operator_dim(op, dim, "topk_power")?;
    if config.k == 0 || config.k > dim {
        return Err(InstrumentError::InvalidInput(format!(
            "k must be in 1..={dim}, got {}",
            config.k
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut found: Vec<Array1<f64>> = Vec::with_capacity(config.k);
    let mut values = Vec::with_capacity(config.k);
    let mut iterations = Vec::with_capacity(config.k);

    for j in 0..config.k {
        let mut v: Array1<f64> = Array1::from_shape_simple_fn(dim, || StandardNormal.sample(&mut rng));
        deflate(&mut v, &found);
        v = floored_unit(&v);

        let mut last: Option<f64> = None;
        let mut used = 0;
        for _ in 0..config.iters {
            used += 1;
            let mut w = op.apply(v.view());
            deflate(&mut w, &found);
            let lam = v.dot(&w);
            let next = floored_unit(&w);
            if converged(lam, last, config.tol) {
                break;
            }
            v = next;
            last = Some(lam);
        }

        let mut w = op.apply(v.view());
        deflate(&mut w, &found);
        let lam = v.dot(&w);
        if !lam.is_finite() {
            return Err(InstrumentError::OperatorFailure(format!(
                "eigenvalue {j} is not finite"
            )));
        }
        log::debug!("topk_power: pair {j} lambda={lam:.6e} after {used} iterations");
        found.push(floored_unit(&v));
        values.push(lam);
        iterations.push(used);
    }

    if config.ordering == EigenOrdering::Descending {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
        found = order.iter().map(|&i| found[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();
        iterations = order.iter().map(|&i| iterations[i]).collect();
    }

    Ok(EigenPairs {
        values: Array1::from(values),
        basis: SubspaceBasis::from_columns(&found, dim)?,
        iterations,
    })
}

fn default_sharpness_enabled() -> bool {
    true
}

fn default_sharpness_iters() -> usize {
    30
}

fn default_seed_offset() -> u64 {
    42
}

/// Settings for the `lambda_max` monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharpnessConfig {
    #[serde(default = "default_sharpness_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sharpness_iters")]
    pub iters: usize,
    #[serde(default = "default_eigen_tol")]
    pub tol: f64,
    #[serde(default = "default_seed_offset")]
    pub seed_offset: u64,
}

impl Default for SharpnessConfig {
    fn default() -> Self {
        Self {
            enabled: default_sharpness_enabled(),
            iters: default_sharpness_iters(),
            tol: default_eigen_tol(),
            seed_offset: default_seed_offset(),
        }
    }
}

/// Largest-magnitude eigenvalue estimate and its vector.
pub fn power_max_eig<O: LinearOperator>(
    op: &O,
    dim: usize,
    iters: usize,
    tol: f64,
    seed: u64,
) -> Result<(f64, Array1<f64>), InstrumentError> {
    check_operator_dim(op, dim, "power_max_eig")?;
    let mut rng = StdRng::seed_from_u64(seed);
    let start: Array1<f64> = Array1::from_shape_simple_fn(dim, || StandardNormal.sample(&mut rng));
    let mut v = floored_unit(&start);
    let mut last: Option<f64> = None;
    for _ in 0..iters {
        let w = op.apply(v.view());
        let lam = v.dot(&w);
        v = floored_unit(&w);
        if converged(lam, last, tol) {
            break;
        }
        last = Some(lam);
    }
    let lam = v.dot(&op.apply(v.view()));
    if !lam.is_finite() {
        return Err(InstrumentError::OperatorFailure(
            "lambda_max estimate is not finite".to_string(),
        ));
    }
    Ok((lam, v))
}
