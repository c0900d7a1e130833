//! Cross-block coupling `gamma = ||P_S H P_B||_2` and the drift-corrected
//! curvature floor built from it.

use crate::faer_ndarray::{FaerSvd, fast_atb};
use crate::linalg::utils::{NORM_FLOOR, norm};
use crate::operator::{LinearOperator, check_operator_dim};
use crate::snr::applicability_threshold;
use crate::subspace::SubspaceBasis;
use crate::types::InstrumentError;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

fn default_gamma_iters() -> usize {
    10
}

fn default_gamma_tol() -> f64 {
    1e-6
}

fn default_gamma_every() -> usize {
    1
}

fn default_gamma_seed_offset() -> u64 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GammaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gamma_iters")]
    pub iters: usize,
    #[serde(default = "default_gamma_tol")]
    pub tol: f64,
    /// Estimate gamma every this many steps; the last estimate is reused between.
    #[serde(default = "default_gamma_every")]
    pub every: usize,
    #[serde(default = "default_gamma_seed_offset")]
    pub seed_offset: u64,
}

impl Default for GammaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            iters: default_gamma_iters(),
            tol: default_gamma_tol(),
            every: default_gamma_every(),
            seed_offset: default_gamma_seed_offset(),
        }
    }
}

impl GammaConfig {
    pub fn due(&self, step: usize) -> bool {
        self.enabled && step % self.every.max(1) == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GammaEstimate {
    pub gamma: f64,
    /// Clamped (non-negative) top eigenvalue of `P_S H P_B H P_S`.
    pub lambda: f64,
    pub iters_used: usize,
}

/// Either a usable gamma or the reason it is missing.
///
/// Consumers fall back to the uncorrected threshold on `Unavailable`.
#[derive(Debug, Clone, PartialEq)]
pub enum GammaOutcome {
    Available(GammaEstimate),
    Unavailable { reason: String },
}

impl GammaOutcome {
    pub fn estimate(&self) -> Option<&GammaEstimate> {
        match self {
            GammaOutcome::Available(est) => Some(est),
            GammaOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, GammaOutcome::Available(_))
    }
}

/// Power iteration on `z -> P_S H P_B H P_S z`, started inside S.
///
/// Costs two operator applications per iteration. The stopping rule compares
/// against the previous estimate: `|λ - λ_prev| <= tol * max(1, |λ_prev|)`,
/// with `λ_prev` starting at zero. At least one iteration always runs.
pub fn gamma_power<O: LinearOperator>(
    op: &O,
    basis: &SubspaceBasis,
    iters: usize,
    tol: f64,
    seed: u64,
) -> Result<GammaEstimate, InstrumentError> {
    check_operator_dim(op, basis.dim(), "gamma_power")?;
    let mut rng = StdRng::seed_from_u64(seed);
    let start: Array1<f64> =
        Array1::from_shape_simple_fn(basis.dim(), || StandardNormal.sample(&mut rng));
    let z0 = basis.project_s(&start);
    let mut z = &z0 / (norm(&z0) + NORM_FLOOR);

    let mut lam_prev = 0.0_f64;
    let mut used = 0;
    for t in 0..iters.max(1) {
        used = t + 1;
        let s = basis.project_s(&z);
        let hs = op.apply(s.view());
        let pb_hs = basis.project_b(&hs);
        let h_pb_hs = op.apply(pb_hs.view());
        let y = basis.project_s(&h_pb_hs);

        let lam = z.dot(&y);
        z = &y / (norm(&y) + NORM_FLOOR);
        let done = (lam - lam_prev).abs() <= tol * lam_prev.abs().max(1.0);
        lam_prev = lam;
        if done {
            break;
        }
    }

    if !lam_prev.is_finite() {
        return Err(InstrumentError::OperatorFailure(format!(
            "gamma power iteration produced non-finite eigenvalue {lam_prev}"
        )));
    }
    let lambda = lam_prev.max(0.0);
    Ok(GammaEstimate {
        gamma: lambda.sqrt(),
        lambda,
        iters_used: used,
    })
}

/// Runs [`gamma_power`] and folds every failure into `Unavailable`.
///
/// The closed-form correction downstream is only valid for a single tracked
/// direction, so ranks other than one are reported as unavailable too.
pub fn estimate_gamma<O: LinearOperator>(
    op: &O,
    basis: &SubspaceBasis,
    config: &GammaConfig,
    seed: u64,
) -> GammaOutcome {
    if basis.rank() != 1 {
        return GammaOutcome::Unavailable {
            reason: format!("gamma correction requires k=1, basis has rank {}", basis.rank()),
        };
    }
    match gamma_power(op, basis, config.iters, config.tol, seed) {
        Ok(est) => GammaOutcome::Available(est),
        Err(err) => GammaOutcome::Unavailable {
            reason: err.to_string(),
        },
    }
}

/// Largest principal angle, in radians, between `span(v_ref)` and `span(v_hat)`.
///
/// `arccos(clamp(σ_min(V_hatᵀ V_ref), 0, 1))`. Returns `0.0` when either basis
/// is absent, the shapes disagree, or the SVD fails.
pub fn principal_angle_max(v_ref: Option<&SubspaceBasis>, v_hat: Option<&SubspaceBasis>) -> f64 {
    let (Some(v_ref), Some(v_hat)) = (v_ref, v_hat) else {
        return 0.0;
    };
    if v_ref.dim() != v_hat.dim() || v_ref.rank() == 0 || v_hat.rank() == 0 {
        return 0.0;
    }
    let overlap = fast_atb(&**v_hat, &**v_ref);
    let svals = match overlap.singular_values() {
        Ok(s) => s,
        Err(err) => {
            log::debug!("principal angle fell back to 0: {err}");
            return 0.0;
        }
    };
    let s_min = svals.iter().copied().fold(f64::INFINITY, f64::min);
    let eps = s_min.clamp(0.0, 1.0).acos();
    if eps.is_finite() { eps } else { 0.0 }
}

/// `max(0, mu_S cos²ε - gamma sin 2ε)` with `mu_S` clamped at zero.
pub fn mu_eff_gamma_k1(mu_s: f64, eps: f64, gamma: f64) -> f64 {
    let mu_s = mu_s.max(0.0);
    let val = mu_s * eps.cos().powi(2) - gamma * (2.0 * eps).sin();
    val.max(0.0)
}

/// Threshold formula applied to `mu_eff`; `+inf` when it does not apply.
pub fn corrected_threshold(eta: f64, mu_eff: f64) -> f64 {
    applicability_threshold(eta, mu_eff).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::DenseOperator;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn gamma_matches_off_diagonal_block_norm() {
        // H = [[3, 0.5], [0.5, 1]], S = e1: P_S H P_B = 0.5 e1 e2ᵀ.
        let op = DenseOperator::new(array![[3.0, 0.5], [0.5, 1.0]]).unwrap();
        let basis = SubspaceBasis::from_orthonormal(array![[1.0], [0.0]]).unwrap();
        let est = gamma_power(&op, &basis, 10, 1e-6, 0).unwrap();
        assert_abs_diff_eq!(est.gamma, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(est.lambda, 0.25, epsilon = 1e-9);
        assert!(est.iters_used <= 2);
    }

    #[test]
    fn gamma_is_zero_for_block_diagonal_operator() {
        let op = DenseOperator::from_diagonal(&[4.0, 1.0, 2.0]);
        let basis = SubspaceBasis::from_orthonormal(array![[1.0], [0.0], [0.0]]).unwrap();
        let est = gamma_power(&op, &basis, 10, 1e-6, 3).unwrap();
        assert_eq!(est.gamma, 0.0);
    }

    #[test]
    fn estimate_gamma_reports_rank_restriction() {
        let op = DenseOperator::from_diagonal(&[4.0, 1.0, 2.0]);
        let basis = SubspaceBasis::random(3, 2, 5).unwrap();
        let outcome = estimate_gamma(&op, &basis, &GammaConfig::default(), 0);
        assert!(!outcome.is_available());
        assert!(outcome.estimate().is_none());
    }

    #[test]
    fn principal_angle_of_rotated_line() {
        let theta: f64 = 0.3;
        let a = SubspaceBasis::from_orthonormal(array![[1.0], [0.0]]).unwrap();
        let b = SubspaceBasis::from_orthonormal(array![[theta.cos()], [theta.sin()]]).unwrap();
        assert_abs_diff_eq!(principal_angle_max(Some(&a), Some(&b)), theta, epsilon = 1e-10);
        assert_abs_diff_eq!(principal_angle_max(Some(&a), Some(&a)), 0.0, epsilon = 1e-7);
        assert_eq!(principal_angle_max(None, Some(&a)), 0.0);
    }

    #[test]
    fn mu_eff_reduces_with_drift_and_clamps() {
        assert_eq!(mu_eff_gamma_k1(10.0, 0.0, 5.0), 10.0);
        let drifted = mu_eff_gamma_k1(10.0, 0.1, 1.0);
        let expected = 10.0 * 0.1f64.cos().powi(2) - 0.2f64.sin();
        assert_abs_diff_eq!(drifted, expected, epsilon = 1e-12);
        assert_eq!(mu_eff_gamma_k1(1.0, 0.7, 100.0), 0.0);
        assert_eq!(mu_eff_gamma_k1(-3.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn corrected_threshold_degenerates_to_infinity() {
        assert!(corrected_threshold(0.1, 0.0).is_infinite());
        assert!(corrected_threshold(0.1, 20.0).is_infinite());
        assert_abs_diff_eq!(corrected_threshold(0.1, 10.0), 1.0, epsilon = 1e-12);
    }
}
