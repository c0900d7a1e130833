//! Signal/noise statistic `r` and its applicability threshold `r_th`.

use crate::faer_ndarray::fast_atb;
use crate::linalg::utils::{KahanSum, NORM_FLOOR};
use crate::subspace::SubspaceBasis;
use crate::types::InstrumentError;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1};

/// `||Vᵀg||²`, the gradient energy inside S.
pub fn signal_ps_grad_sq<S: Data<Elem = f64>>(grad: &ArrayBase<S, Ix1>, basis: &SubspaceBasis) -> f64 {
    let coeffs = basis.coefficients(grad);
    coeffs.dot(&coeffs)
}

pub fn grad_norm_sq<S: Data<Elem = f64>>(grad: &ArrayBase<S, Ix1>) -> f64 {
    grad.dot(grad)
}

fn stack_samples(samples: &[Array1<f64>]) -> Result<Array2<f64>, InstrumentError> {
    if samples.len() < 2 {
        return Err(InstrumentError::DegenerateInput(format!(
            "need at least 2 gradient samples to estimate a covariance trace, got {}",
            samples.len()
        )));
    }
    let dim = samples[0].len();
    let mut g = Array2::<f64>::zeros((dim, samples.len()));
    for (j, s) in samples.iter().enumerate() {
        if s.len() != dim {
            return Err(InstrumentError::DimensionMismatch(format!(
                "gradient sample {j} has length {}, expected {dim}",
                s.len()
            )));
        }
        g.column_mut(j).assign(s);
    }
    Ok(g)
}

/// Sum over rows of the unbiased (M-1) variance across columns.
fn trace_of_row_covariance(coords: &Array2<f64>) -> f64 {
    let m = coords.ncols() as f64;
    let mut total = KahanSum::default();
    for row in coords.axis_iter(Axis(0)) {
        let mean = row.sum() / m;
        let ss: f64 = row.iter().map(|x| (x - mean) * (x - mean)).sum();
        total.add(ss / (m - 1.0));
    }
    total.sum()
}

/// `tr(Cov(Vᵀg_i))` over `M >= 2` gradient samples taken at the same point.
///
/// Fewer than two samples is [`InstrumentError::DegenerateInput`]; the trace
/// is never silently reported as zero.
pub fn noise_trace_ps_sigma(
    samples: &[Array1<f64>],
    basis: &SubspaceBasis,
) -> Result<f64, InstrumentError> {
    let g = stack_samples(samples)?;
    if g.nrows() != basis.dim() {
        return Err(InstrumentError::DimensionMismatch(format!(
            "gradient dimension {} does not match basis dimension {}",
            g.nrows(),
            basis.dim()
        )));
    }
    let coeffs = fast_atb(&**basis, &g);
    Ok(trace_of_row_covariance(&coeffs))
}

/// `tr(Cov(g_i))` in the full parameter space.
pub fn noise_trace_full(samples: &[Array1<f64>]) -> Result<f64, InstrumentError> {
    let g = stack_samples(samples)?;
    Ok(trace_of_row_covariance(&g))
}

/// `r_th = ημ/(2 - ημ)` with `μ` clamped at zero.
///
/// Returns `(+inf, false)` when `μ <= 0` or `ημ >= 2`: the descent bound does
/// not hold there and the step must be excluded from evaluation.
pub fn applicability_threshold(eta: f64, mu: f64) -> (f64, bool) {
    let mu_clip = mu.max(0.0);
    let eta_mu = eta * mu_clip;
    if !(mu_clip > 0.0) || !(eta_mu < 2.0) {
        return (f64::INFINITY, false);
    }
    (eta_mu / (2.0 - eta_mu).max(NORM_FLOOR), true)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdOutcome {
    pub r: f64,
    pub r_th: f64,
    pub mask_applicable: bool,
}

/// `r = signal / max(noise, 1e-12)` together with the applicability threshold.
pub fn r_and_threshold(eta: f64, mu: f64, signal_sq: f64, noise_trace: f64) -> ThresholdOutcome {
    let r = signal_sq / noise_trace.max(NORM_FLOOR);
    let (r_th, mask_applicable) = applicability_threshold(eta, mu);
    ThresholdOutcome {
        r,
        r_th,
        mask_applicable,
    }
}

/// `scale * base`, where `base` is the gamma-corrected threshold when correction
/// is enabled and it is finite, otherwise the uncorrected `r_th`.
pub fn effective_threshold(
    scale: f64,
    r_th: f64,
    r_th_gamma: Option<f64>,
    gamma_enabled: bool,
) -> f64 {
    scale * base_threshold(r_th, r_th_gamma, gamma_enabled)
}

pub fn base_threshold(r_th: f64, r_th_gamma: Option<f64>, gamma_enabled: bool) -> f64 {
    match r_th_gamma {
        Some(corrected) if gamma_enabled && corrected.is_finite() => corrected,
        _ => r_th,
    }
}
