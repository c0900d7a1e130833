//! Ground-truth loss change of virtual candidate updates.
//!
//! Nothing here mutates the parameters: each candidate is evaluated at
//! `w + delta` on a copy.

use crate::operator::GradientOracle;
use crate::sampler::{BatchSource, CyclicSampler};
use crate::subspace::SubspaceBasis;
use crate::types::InstrumentError;
use ndarray::{Array1, ArrayBase, ArrayView1, Data, Ix1};
use serde::{Deserialize, Serialize};

/// Which part of the gradient a virtual step follows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Candidate {
    /// `-eta P_S g`
    Dominant,
    /// `-eta P_B g`
    Bulk,
    /// `-eta g`
    Full,
    /// `-eta (alpha P_S + (1 - alpha) P_B) g`
    Mix(f64),
}

pub fn candidate_update<S: Data<Elem = f64>>(
    basis: &SubspaceBasis,
    grad: &ArrayBase<S, Ix1>,
    eta: f64,
    candidate: Candidate,
) -> Array1<f64> {
    let direction = match candidate {
        Candidate::Dominant => basis.project_s(grad),
        Candidate::Bulk => basis.project_b(grad),
        Candidate::Full => grad.to_owned(),
        Candidate::Mix(alpha) => basis.mix(alpha, grad),
    };
    direction * -eta
}

/// `L(w + delta) - L(w)` on one batch.
pub fn delta_loss<O: GradientOracle>(
    oracle: &O,
    params: ArrayView1<'_, f64>,
    batch: &O::Batch,
    delta: ArrayView1<'_, f64>,
) -> f64 {
    let moved = &params + &delta;
    oracle.loss(moved.view(), batch) - oracle.loss(params, batch)
}

/// Mean ΔL over the base batch plus `eval_m - 1` batches from `sampler`.
///
/// `eval_m` below one is treated as one.
pub fn delta_loss_multi_batch<O, S>(
    oracle: &O,
    params: ArrayView1<'_, f64>,
    base_batch: &O::Batch,
    delta: ArrayView1<'_, f64>,
    sampler: &mut CyclicSampler<S>,
    eval_m: usize,
) -> Result<f64, InstrumentError>
where
    O: GradientOracle,
    S: BatchSource<Batch = O::Batch>,
{
    let mut total = delta_loss(oracle, params, base_batch, delta);
    let extra = eval_m.max(1) - 1;
    for _ in 0..extra {
        let batch = sampler.draw()?;
        total += delta_loss(oracle, params, &batch, delta);
    }
    Ok(total / (extra + 1) as f64)
}

/// ΔL for the three logged candidates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InterventionDeltas {
    pub dom: f64,
    pub bulk: f64,
    pub full: f64,
}

impl InterventionDeltas {
    pub fn skipped() -> Self {
        Self {
            dom: f64::NAN,
            bulk: f64::NAN,
            full: f64::NAN,
        }
    }
}

/// Evaluates the dominant, bulk and full candidates. Each candidate draws its
/// own extra batches, so the sampler advances `3 * (eval_m - 1)` times.
#[allow(clippy::too_many_arguments)]
pub fn measure_interventions<O, S>(
    oracle: &O,
    params: ArrayView1<'_, f64>,
    base_batch: &O::Batch,
    grad: ArrayView1<'_, f64>,
    basis: &SubspaceBasis,
    eta: f64,
    sampler: &mut CyclicSampler<S>,
    eval_m: usize,
) -> Result<InterventionDeltas, InstrumentError>
where
    O: GradientOracle,
    S: BatchSource<Batch = O::Batch>,
{
    let mut eval = |cand: Candidate| -> Result<f64, InstrumentError> {
        let delta = candidate_update(basis, &grad, eta, cand);
        delta_loss_multi_batch(oracle, params, base_batch, delta.view(), sampler, eval_m)
    };
    Ok(InterventionDeltas {
        dom: eval(Candidate::Dominant)?,
        bulk: eval(Candidate::Bulk)?,
        full: eval(Candidate::Full)?,
    })
}
