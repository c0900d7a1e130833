use crate::faer_ndarray::{fast_atb, fast_atv, fast_av};
use crate::linalg::utils::norm;
use crate::operator::LinearOperator;
use crate::types::InstrumentError;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use std::ops::Deref;

/// Tolerance used when accepting a caller-supplied basis as orthonormal.
const ORTHONORMAL_TOL: f64 = 1e-6;
/// Columns shorter than this after Gram-Schmidt are treated as collapsed.
const COLLAPSE_TOL: f64 = 1e-10;

/// A `D x k` basis with orthonormal columns spanning the dominant subspace S.
///
/// Replaced wholesale on every eigen-refresh; never edited column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct SubspaceBasis(Array2<f64>);

impl Deref for SubspaceBasis {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SubspaceBasis {
    /// Accepts `v` as-is after checking `VᵀV ≈ I`.
    pub fn from_orthonormal(v: Array2<f64>) -> Result<Self, InstrumentError> {
        let basis = Self(v);
        let err = basis.max_orthonormality_error();
        if !(err <= ORTHONORMAL_TOL) {
            return Err(InstrumentError::InvalidInput(format!(
                "basis columns are not orthonormal (max |VᵀV - I| = {err:.3e})"
            )));
        }
        Ok(basis)
    }

    /// Modified Gram-Schmidt over the columns of `v`, in column order.
    pub fn orthonormalize(v: Array2<f64>) -> Result<Self, InstrumentError> {
        let mut q = v;
        let k = q.ncols();
        for j in 0..k {
            let mut col = q.column(j).to_owned();
            for i in 0..j {
                let qi = q.column(i);
                let proj = qi.dot(&col);
                col.scaled_add(-proj, &qi);
            }
            let n = norm(&col);
            if !(n > COLLAPSE_TOL) {
                return Err(InstrumentError::DegenerateInput(format!(
                    "basis column {j} is linearly dependent on earlier columns"
                )));
            }
            col.mapv_inplace(|x| x / n);
            q.column_mut(j).assign(&col);
        }
        Ok(Self(q))
    }

    /// Stacks already-orthonormal vectors as columns.
    pub fn from_columns(columns: &[Array1<f64>], dim: usize) -> Result<Self, InstrumentError> {
        let mut v = Array2::<f64>::zeros((dim, columns.len()));
        for (j, col) in columns.iter().enumerate() {
            if col.len() != dim {
                return Err(InstrumentError::DimensionMismatch(format!(
                    "column {j} has length {}, expected {dim}",
                    col.len()
                )));
            }
            v.column_mut(j).assign(col);
        }
        Ok(Self(v))
    }

    /// Seeded Gaussian basis, orthonormalized.
    pub fn random(dim: usize, k: usize, seed: u64) -> Result<Self, InstrumentError> {
        if k > dim {
            return Err(InstrumentError::InvalidInput(format!(
                "cannot build a rank-{k} basis in dimension {dim}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let v = Array2::from_shape_simple_fn((dim, k), || StandardNormal.sample(&mut rng));
        Self::orthonormalize(v)
    }

    pub fn dim(&self) -> usize {
        self.0.nrows()
    }

    pub fn rank(&self) -> usize {
        self.0.ncols()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.0
    }

    /// `Vᵀx`, the coordinates of `x` inside S.
    pub fn coefficients<S: Data<Elem = f64>>(&self, x: &ArrayBase<S, Ix1>) -> Array1<f64> {
        fast_atv(&self.0, x)
    }

    /// `P_S x = V Vᵀ x`.
    pub fn project_s<S: Data<Elem = f64>>(&self, x: &ArrayBase<S, Ix1>) -> Array1<f64> {
        fast_av(&self.0, &self.coefficients(x))
    }

    /// `P_B x = x - P_S x`.
    pub fn project_b<S: Data<Elem = f64>>(&self, x: &ArrayBase<S, Ix1>) -> Array1<f64> {
        x.to_owned() - self.project_s(x)
    }

    /// `alpha P_S x + (1 - alpha) P_B x`.
    pub fn mix<S: Data<Elem = f64>>(&self, alpha: f64, x: &ArrayBase<S, Ix1>) -> Array1<f64> {
        let ps = self.project_s(x);
        let pb = x.to_owned() - &ps;
        ps * alpha + pb * (1.0 - alpha)
    }

    /// `max |VᵀV - I|` entrywise.
    pub fn max_orthonormality_error(&self) -> f64 {
        let gram = fast_atb(&self.0, &self.0);
        let mut worst = 0.0_f64;
        for ((i, j), g) in gram.indexed_iter() {
            let target = if i == j { 1.0 } else { 0.0 };
            let diff = (g - target).abs();
            if diff.is_nan() {
                return f64::NAN;
            }
            worst = worst.max(diff);
        }
        worst
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectorKind {
    Dominant,
    Bulk,
    Mix(f64),
}

/// One of the subspace projectors as a matrix-free operator.
#[derive(Debug, Clone, Copy)]
pub struct Projector<'a> {
    basis: &'a SubspaceBasis,
    kind: ProjectorKind,
}

impl<'a> Projector<'a> {
    pub fn new(basis: &'a SubspaceBasis, kind: ProjectorKind) -> Self {
        Self { basis, kind }
    }
}

impl LinearOperator for Projector<'_> {
    fn dim(&self) -> usize {
        self.basis.dim()
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        match self.kind {
            ProjectorKind::Dominant => self.basis.project_s(&v),
            ProjectorKind::Bulk => self.basis.project_b(&v),
            ProjectorKind::Mix(alpha) => self.basis.mix(alpha, &v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn orthonormalize_produces_orthonormal_columns() {
        let v = array![[1.0, 1.0], [0.0, 1.0], [1.0, 0.0]];
        let basis = SubspaceBasis::orthonormalize(v).expect("independent columns");
        assert!(basis.max_orthonormality_error() < 1e-12);
        assert_eq!(basis.rank(), 2);
    }

    #[test]
    fn orthonormalize_rejects_dependent_columns() {
        let v = array![[1.0, 2.0], [1.0, 2.0]];
        assert!(matches!(
            SubspaceBasis::orthonormalize(v),
            Err(InstrumentError::DegenerateInput(_))
        ));
    }

    #[test]
    fn from_orthonormal_rejects_scaled_columns() {
        assert!(SubspaceBasis::from_orthonormal(array![[2.0], [0.0]]).is_err());
        assert!(SubspaceBasis::from_orthonormal(array![[0.0], [1.0]]).is_ok());
    }

    #[test]
    fn mix_interpolates_between_projectors() {
        let basis = SubspaceBasis::from_orthonormal(array![[1.0], [0.0], [0.0]]).unwrap();
        let x = array![2.0, 3.0, -1.0];
        assert_eq!(basis.mix(1.0, &x), basis.project_s(&x));
        assert_eq!(basis.mix(0.0, &x), basis.project_b(&x));
        let half = basis.mix(0.5, &x);
        assert!((half[0] - 1.0).abs() < 1e-15);
        assert!((half[1] - 1.5).abs() < 1e-15);
    }

    #[test]
    fn projector_operator_matches_direct_calls() {
        let basis = SubspaceBasis::random(6, 2, 11).unwrap();
        let x = Array1::from(vec![0.3, -1.0, 2.0, 0.1, 0.0, 0.7]);
        let op = Projector::new(&basis, ProjectorKind::Bulk);
        assert_eq!(op.dim(), 6);
        let direct = basis.project_b(&x);
        let via_op = op.apply(x.view());
        for (a, b) in direct.iter().zip(via_op.iter()) {
            assert!((a - b).abs() < 1e-14);
        }
    }
}
