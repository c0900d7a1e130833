use ndarray::{Array1, ArrayBase, Data, Ix1};

/// Denominator floor shared by every normalization in the crate.
pub const NORM_FLOOR: f64 = 1e-12;

#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

pub(crate) fn kahan_mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut acc = KahanSum::default();
    let mut n = 0usize;
    for v in values {
        acc.add(v);
        n += 1;
    }
    (n > 0).then(|| acc.sum() / n as f64)
}

#[inline]
pub fn norm<S: Data<Elem = f64>>(v: &ArrayBase<S, Ix1>) -> f64 {
    v.dot(v).sqrt()
}

/// `v / (||v|| + 1e-12)`; a zero vector stays zero instead of producing NaN.
#[inline]
pub fn normalize_floored<S: Data<Elem = f64>>(v: &ArrayBase<S, Ix1>) -> Array1<f64> {
    let denom = norm(v) + NORM_FLOOR;
    v.mapv(|x| x / denom)
}

/// Trapezoidal integral of `y` over `x`, taken in the order given.
pub(crate) fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    let mut acc = KahanSum::default();
    for i in 1..x.len().min(y.len()) {
        acc.add((x[i] - x[i - 1]) * (y[i] + y[i - 1]) * 0.5);
    }
    acc.sum()
}

/// Trapezoidal integral after a stable re-sort of the points by increasing `x`.
pub(crate) fn trapezoid_sorted(x: &[f64], y: &[f64]) -> f64 {
    let mut order: Vec<usize> = (0..x.len().min(y.len())).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    trapezoid(&xs, &ys)
}

/// Linear-interpolation quantile of already sorted values (`q` clamped to [0, 1]).
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub(crate) fn linspace(lo: f64, hi: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![lo],
        _ => {
            let step = (hi - lo) / (num - 1) as f64;
            (0..num)
                .map(|i| if i + 1 == num { hi } else { lo + step * i as f64 })
                .collect()
        }
    }
}

/// Geometric spacing; both endpoints must be strictly positive.
pub(crate) fn geomspace(lo: f64, hi: f64, num: usize) -> Vec<f64> {
    let (llo, lhi) = (lo.ln(), hi.ln());
    let mut out: Vec<f64> = linspace(llo, lhi, num).into_iter().map(f64::exp).collect();
    if let Some(first) = out.first_mut() {
        *first = lo;
    }
    if num > 1
        && let Some(last) = out.last_mut()
    {
        *last = hi;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn trapezoid_sorted_reorders_points() {
        let x = [1.0, 0.0, 0.5];
        let y = [1.0, 1.0, 1.0];
        assert!((trapezoid_sorted(&x, &y) - 1.0).abs() < 1e-15);
        // Unsorted integration traverses backwards and cancels.
        assert!(trapezoid(&x, &y).abs() < 1.0);
    }

    #[test]
    fn quantile_matches_linear_interpolation() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&v, 0.0), Some(1.0));
        assert_eq!(quantile_sorted(&v, 1.0), Some(4.0));
        assert!((quantile_sorted(&v, 0.5).unwrap() - 2.5).abs() < 1e-15);
        assert_eq!(quantile_sorted(&[], 0.5), None);
    }

    #[test]
    fn normalize_floored_keeps_zero_vector_finite() {
        let z = normalize_floored(&array![0.0, 0.0]);
        assert!(z.iter().all(|v| *v == 0.0));
        let u = normalize_floored(&array![3.0, 4.0]);
        assert!((norm(&u) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn geomspace_hits_endpoints() {
        let g = geomspace(1e-3, 10.0, 5);
        assert_eq!(g.len(), 5);
        assert_eq!(g[0], 1e-3);
        assert_eq!(g[4], 10.0);
        assert!(g.windows(2).all(|w| w[1] > w[0]));
    }
}
