use dyn_stack::{MemBuffer, MemStack};
use faer::diag::Diag;
use faer::linalg::matmul::matmul;
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Accum, Mat, MatRef, Par, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Matrix contains non-finite entries")]
    NonFinite,
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Tall parameter-space bases go through faer; the tiny k x k products
    // that dominate the gamma and angle paths stay on ndarray.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
fn parallelism_for(dims: &[usize]) -> Par {
    if dims.iter().any(|&d| d < 128) {
        Par::Seq
    } else {
        get_global_parallelism()
    }
}

/// Copies a faer matrix into an owned ndarray.
fn mat_to_array(m: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// `lhs * rhs` through faer's blocked kernel.
fn faer_product(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Array2<f64> {
    let (m, k) = lhs.shape();
    let n = rhs.ncols();
    let mut out = Mat::<f64>::zeros(m, n);
    matmul(out.as_mut(), Accum::Replace, lhs, rhs, 1.0, parallelism_for(&[m, n, k]));
    mat_to_array(out.as_ref())
}

/// Compute A^T * B. For A of shape (n, p) and B of shape (n, q) the result is (p, q).
///
/// Used for `V^T G` (projected gradient coefficients) and `V_hat^T V_ref`
/// (principal-angle overlap).
#[inline]
pub fn fast_atb<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n, p) = a.dim();
    let q = b.ncols();
    debug_assert_eq!(n, b.nrows(), "A and B must have same number of rows");
    if !should_use_faer_matmul(p, q, n) {
        return a.t().dot(b);
    }
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    faer_product(a_view.as_ref().transpose(), b_view.as_ref())
}

/// Compute A^T * v, the coefficients of `v` in the columns of A.
#[inline]
pub fn fast_atv<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    v: &ArrayBase<S2, Ix1>,
) -> Array1<f64> {
    let (n, p) = a.dim();
    debug_assert_eq!(n, v.len(), "A rows must match v length");
    if !should_use_faer_matmul(p, 1, n) {
        return a.t().dot(v);
    }
    let col = v.view().insert_axis(Axis(1));
    let a_view = FaerArrayView::new(a);
    let v_view = FaerArrayView::new(&col);
    faer_product(a_view.as_ref().transpose(), v_view.as_ref()).column(0).to_owned()
}

/// Compute A * c, the vector spanned by coefficients `c` over the columns of A.
#[inline]
pub fn fast_av<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    c: &ArrayBase<S2, Ix1>,
) -> Array1<f64> {
    let (n, p) = a.dim();
    debug_assert_eq!(p, c.len(), "A cols must match c length");
    if !should_use_faer_matmul(n, 1, p) {
        return a.dot(c);
    }
    let col = c.view().insert_axis(Axis(1));
    let a_view = FaerArrayView::new(a);
    let c_view = FaerArrayView::new(&col);
    faer_product(a_view.as_ref(), c_view.as_ref()).column(0).to_owned()
}

/// Borrowed faer view of an ndarray matrix. Layouts faer cannot address
/// (negative strides, or zero strides on a non-trivial axis) are copied.
pub struct FaerArrayView<'a> {
    view: ArrayView2<'a, f64>,
    owned: Option<Array2<f64>>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let addressable = array
            .strides()
            .iter()
            .zip(array.shape())
            .all(|(&stride, &len)| stride > 0 || (stride == 0 && len <= 1));
        Self {
            view: array.view(),
            owned: (!addressable).then(|| array.as_standard_layout().into_owned()),
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let view = self.owned.as_ref().map_or(self.view.view(), |owned| owned.view());
        let strides = view.strides();
        // SAFETY: the pointer, shape and strides describe either the borrowed
        // view (alive for 'a) or the owned copy held by self; both outlive the
        // returned reference, and every stride is positive or spans one element.
        unsafe {
            MatRef::from_raw_parts(view.as_ptr(), view.nrows(), view.ncols(), strides[0], strides[1])
        }
    }
}

pub trait FaerSvd {
    /// Singular values only, in non-increasing order.
    fn singular_values(&self) -> Result<Array1<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn singular_values(&self) -> Result<Array1<f64>, FaerLinalgError> {
        if self.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();
        let (rows, cols) = faer_mat.shape();
        let mut singular = Diag::<f64>::zeros(rows.min(cols));
        let par = Par::Seq;
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::No,
            ComputeSvdVectors::No,
            par,
            Default::default(),
        ));
        let stack = MemStack::new(&mut mem);
        svd::svd(
            faer_mat,
            singular.as_mut(),
            None,
            None,
            par,
            stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;
        Ok(mat_to_array(singular.as_ref().column_vector().as_mat()).column(0).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    #[test]
    fn singular_values_of_diagonal_matrix_are_sorted_magnitudes() {
        let a = array![[0.5, 0.0], [0.0, -2.0], [0.0, 0.0]];
        let s = a.singular_values().expect("svd should succeed");
        assert_eq!(s.len(), 2);
        assert!((s[0] - 2.0).abs() < 1e-12);
        assert!((s[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn singular_values_reject_non_finite_input() {
        let a = array![[1.0, f64::NAN], [0.0, 1.0]];
        assert!(matches!(
            a.singular_values(),
            Err(FaerLinalgError::NonFinite)
        ));
    }

    #[test]
    fn faer_products_match_ndarray_for_tall_operands() {
        let n = 300;
        let a = Array2::from_shape_fn((n, 16), |(i, j)| ((i * 7 + j * 3) % 11) as f64 - 5.0);
        let b = Array2::from_shape_fn((n, 2), |(i, j)| ((i + 2 * j) % 5) as f64 * 0.25);
        let v = Array1::from_shape_fn(n, |i| (i % 13) as f64 / 13.0);
        let c = Array1::from_shape_fn(16, |j| j as f64 * 0.1 - 0.7);
        assert!(should_use_faer_matmul(16, 2, n));
        assert!(should_use_faer_matmul(16, 1, n));

        let atb = fast_atb(&a, &b);
        let atv = fast_atv(&a, &v);
        let av = fast_av(&a, &c);
        assert_eq!(atb.dim(), (16, 2));
        assert_eq!(atv.len(), 16);
        assert_eq!(av.len(), n);
        let max_err = (&atb - &a.t().dot(&b))
            .iter()
            .chain((&atv - &a.t().dot(&v)).iter())
            .chain((&av - &a.dot(&c)).iter())
            .fold(0.0f64, |acc, &x| acc.max(x.abs()));
        assert!(max_err < 1e-9, "faer/ndarray mismatch {max_err:e}");
    }

    #[test]
    fn reversed_views_are_copied_before_multiplying() {
        let n = 256;
        let a = Array2::from_shape_fn((n, 16), |(i, j)| ((3 * i + j) % 7) as f64 - 3.0);
        let v = Array1::from_shape_fn(n, |i| ((i * 5) % 9) as f64);
        let flipped = a.slice(s![..;-1, ..]);
        let v_flipped = v.slice(s![..;-1]);
        let got = fast_atv(&flipped, &v_flipped);
        let want = flipped.t().dot(&v_flipped);
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() < 1e-9);
        }
    }

    #[test]
    fn mat_to_array_keeps_row_major_positions() {
        let m = Mat::<f64>::from_fn(2, 3, |i, j| (10 * i + j) as f64);
        let out = mat_to_array(m.as_ref());
        assert_eq!(out, array![[0.0, 1.0, 2.0], [10.0, 11.0, 12.0]]);
        let t = mat_to_array(m.as_ref().transpose());
        assert_eq!(t, out.t());
    }
}
