//! Matrix-free linear operators and the gradient-oracle seam.
//!
//! The curvature operator is only ever touched through [`LinearOperator::apply`];
//! eigensolvers and the gamma estimator never see a materialized Hessian.

use crate::linalg::utils::norm;
use crate::types::InstrumentError;
use ndarray::{Array1, Array2, ArrayView1};
use std::cell::Cell;

/// A symmetric linear map `R^D -> R^D`, applied one vector at a time.
pub trait LinearOperator {
    fn dim(&self) -> usize;

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64>;
}

impl<T: LinearOperator + ?Sized> LinearOperator for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        (**self).apply(v)
    }
}

/// Loss/gradient oracle for a model at a parameter point.
///
/// Repeated calls with the same parameters and batch must be deterministic.
pub trait GradientOracle {
    type Batch;

    fn dim(&self) -> usize;

    fn loss(&self, params: ArrayView1<'_, f64>, batch: &Self::Batch) -> f64;

    fn loss_and_grad(&self, params: ArrayView1<'_, f64>, batch: &Self::Batch)
    -> (f64, Array1<f64>);
}

/// Wraps a closure as an operator.
pub struct FnOperator<F> {
    dim: usize,
    f: F,
}

impl<F> FnOperator<F>
where
    F: Fn(ArrayView1<'_, f64>) -> Array1<f64>,
{
    pub fn new(dim: usize, f: F) -> Self {
        Self { dim, f }
    }
}

impl<F> LinearOperator for FnOperator<F>
where
    F: Fn(ArrayView1<'_, f64>) -> Array1<f64>,
{
    fn dim(&self) -> usize {
        self.dim
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        (self.f)(v)
    }
}

/// Explicit symmetric matrix.
#[derive(Debug, Clone)]
pub struct DenseOperator {
    matrix: Array2<f64>,
}

impl DenseOperator {
    pub fn new(matrix: Array2<f64>) -> Result<Self, InstrumentError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(InstrumentError::DimensionMismatch(format!(
                "operator matrix must be square, got {rows}x{cols}"
            )));
        }
        Ok(Self { matrix })
    }

    pub fn from_diagonal(diag: &[f64]) -> Self {
        Self {
            matrix: Array2::from_diag(&Array1::from(diag.to_vec())),
        }
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }
}

impl LinearOperator for DenseOperator {
    fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        self.matrix.dot(&v)
    }
}

/// Hessian-vector product from central differences of the gradient:
/// `Hv ≈ (∇L(w + h v̂) − ∇L(w − h v̂)) ‖v‖ / 2h` with `v̂ = v/‖v‖`.
///
/// Exact for quadratic losses up to rounding. Costs two gradient evaluations
/// per application, matching the two backward passes of an autodiff HVP.
pub struct FiniteDifferenceHvp<'o, 'p, 'b, O: GradientOracle> {
    oracle: &'o O,
    params: ArrayView1<'p, f64>,
    batch: &'b O::Batch,
    step: f64,
}

impl<'o, 'p, 'b, O: GradientOracle> FiniteDifferenceHvp<'o, 'p, 'b, O> {
    pub const DEFAULT_STEP: f64 = 1e-4;

    pub fn new(oracle: &'o O, params: ArrayView1<'p, f64>, batch: &'b O::Batch) -> Self {
        Self {
            oracle,
            params,
            batch,
            step: Self::DEFAULT_STEP,
        }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step.abs().max(f64::EPSILON);
        self
    }
}

impl<O: GradientOracle> LinearOperator for FiniteDifferenceHvp<'_, '_, '_, O> {
    fn dim(&self) -> usize {
        self.params.len()
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        let scale = norm(&v);
        if scale == 0.0 || !scale.is_finite() {
            return Array1::zeros(v.len());
        }
        let h = self.step;
        let dir = v.mapv(|x| x / scale);
        let plus = &self.params + &(h * &dir);
        let minus = &self.params - &(h * &dir);
        let (_, g_plus) = self.oracle.loss_and_grad(plus.view(), self.batch);
        let (_, g_minus) = self.oracle.loss_and_grad(minus.view(), self.batch);
        (g_plus - g_minus) * (scale / (2.0 * h))
    }
}

/// Counts operator applications; used to report solver cost.
pub struct CountingOperator<T> {
    inner: T,
    calls: Cell<usize>,
}

impl<T: LinearOperator> CountingOperator<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<T: LinearOperator> LinearOperator for CountingOperator<T> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        self.calls.set(self.calls.get() + 1);
        self.inner.apply(v)
    }
}

pub(crate) fn check_operator_dim(
    op: &impl LinearOperator,
    dim: usize,
    label: &str,
) -> Result<(), InstrumentError> {
    if op.dim() != dim {
        return Err(InstrumentError::DimensionMismatch(format!(
            "{label}: operator dimension {} does not match {dim}",
            op.dim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// `0.5 * w·w`: the Hessian is the identity everywhere.
    struct HalfSquaredNorm;

    impl GradientOracle for HalfSquaredNorm {
        type Batch = ();

        fn dim(&self) -> usize {
            2
        }

        fn loss(&self, params: ArrayView1<'_, f64>, _batch: &()) -> f64 {
            0.5 * params.dot(&params)
        }

        fn loss_and_grad(&self, params: ArrayView1<'_, f64>, batch: &()) -> (f64, Array1<f64>) {
            (self.loss(params, batch), params.to_owned())
        }
    }

    #[test]
    fn finite_difference_hvp_is_identity_and_symmetric_for_half_squared_norm() {
        let params = array![1.0, -2.0];
        let hvp = FiniteDifferenceHvp::new(&HalfSquaredNorm, params.view(), &());
        let v = array![0.7, -0.3];
        let w = array![-0.2, 0.9];
        let hv = hvp.apply(v.view());
        let hw = hvp.apply(w.view());
        for i in 0..2 {
            assert!((hv[i] - v[i]).abs() < 1e-6, "Hv[{i}]={}", hv[i]);
            assert!((hw[i] - w[i]).abs() < 1e-6, "Hw[{i}]={}", hw[i]);
        }
        assert!((v.dot(&hw) - w.dot(&hv)).abs() < 1e-6);
    }

    fn hvp_with_local_params<O: GradientOracle>(
        oracle: &O,
        params: ArrayView1<'_, f64>,
        batch: &O::Batch,
        v: ArrayView1<'_, f64>,
    ) -> Array1<f64> {
        let shifted = params.mapv(|x| x + 0.5);
        let hvp = FiniteDifferenceHvp::new(oracle, shifted.view(), batch);
        hvp.apply(v)
    }

    #[test]
    fn finite_difference_hvp_borrows_oracle_params_and_batch_independently() {
        let params = array![0.4, -1.1];
        let v = array![2.0, 0.5];
        let hv = hvp_with_local_params(&HalfSquaredNorm, params.view(), &(), v.view());
        for i in 0..2 {
            assert!((hv[i] - v[i]).abs() < 1e-6, "Hv[{i}]={}", hv[i]);
        }
    }

    #[test]
    fn finite_difference_hvp_of_zero_vector_is_zero() {
        let params = array![0.3, 0.1];
        let hvp = FiniteDifferenceHvp::new(&HalfSquaredNorm, params.view(), &());
        let out = hvp.apply(array![0.0, 0.0].view());
        assert!(out.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn counting_operator_tracks_applications() {
        let op = CountingOperator::new(DenseOperator::from_diagonal(&[2.0, 1.0]));
        let _ = op.apply(array![1.0, 0.0].view());
        let out = op.apply(array![0.0, 3.0].view());
        assert_eq!(op.calls(), 2);
        assert_eq!(out, array![0.0, 3.0]);
    }

    #[test]
    fn dense_operator_rejects_rectangular_matrix() {
        assert!(DenseOperator::new(Array2::zeros((2, 3))).is_err());
    }
}
