//! Detection-quality metrics for a score against a binary ground truth.
//!
//! Curves are built by sweeping a threshold grid over the score. Ratio-style
//! scores (smaller is safer) predict positive when `score <= t`; margin-style
//! scores predict positive when `score >= t`. Precision and recall use
//! `max(1, ·)` denominators so they stay defined at the ends of the sweep.

use crate::linalg::utils::{NORM_FLOOR, geomspace, linspace, quantile_sorted, trapezoid, trapezoid_sorted};
use crate::types::InstrumentError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepDirection {
    /// Positive iff `score <= threshold`.
    #[default]
    AtMost,
    /// Positive iff `score >= threshold`.
    AtLeast,
}

impl SweepDirection {
    #[inline]
    pub fn predicts(self, score: f64, threshold: f64) -> bool {
        match self {
            SweepDirection::AtMost => score <= threshold,
            SweepDirection::AtLeast => score >= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridSpacing {
    Linear,
    #[default]
    Log,
}

/// How the threshold grid is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridSpec {
    Explicit {
        values: Vec<f64>,
    },
    /// Span `[quantile(q_lo), quantile(q_hi)]` of the finite scores.
    Quantile {
        q_lo: f64,
        q_hi: f64,
        points: usize,
        spacing: GridSpacing,
        /// Used when the quantile and min/max spans both degenerate.
        fallback: (f64, f64),
    },
}

impl Default for GridSpec {
    fn default() -> Self {
        GridSpec::Quantile {
            q_lo: 0.001,
            q_hi: 0.999,
            points: 600,
            spacing: GridSpacing::Log,
            fallback: (1e-4, 10.0),
        }
    }
}

const MIN_SPAN: f64 = 1e-6;

pub fn build_threshold_grid(spec: &GridSpec, scores: &[f64]) -> Vec<f64> {
    let (q_lo, q_hi, points, spacing, fallback) = match spec {
        GridSpec::Explicit { values } => return values.clone(),
        GridSpec::Quantile {
            q_lo,
            q_hi,
            points,
            spacing,
            fallback,
        } => (*q_lo, *q_hi, *points, *spacing, *fallback),
    };

    let mut finite: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
    finite.sort_by(f64::total_cmp);

    let span_ok = |lo: f64, hi: f64| lo.is_finite() && hi.is_finite() && hi > lo;
    let (mut lo, mut hi) = match (
        quantile_sorted(&finite, q_lo.clamp(0.0, 1.0)),
        quantile_sorted(&finite, q_hi.clamp(0.0, 1.0)),
    ) {
        (Some(a), Some(b)) => (a, b),
        _ => (f64::NAN, f64::NAN),
    };
    if !span_ok(lo, hi)
        && let (Some(&first), Some(&last)) = (finite.first(), finite.last())
    {
        lo = first;
        hi = last;
    }
    if !span_ok(lo, hi) || hi - lo <= MIN_SPAN {
        log::debug!("threshold grid span degenerate ({lo}, {hi}); using fallback {fallback:?}");
        (lo, hi) = fallback;
    }

    let n = points.max(2);
    match spacing {
        GridSpacing::Linear => linspace(lo, hi, n),
        GridSpacing::Log => {
            let lo = lo.max(NORM_FLOOR);
            let hi = hi.max(lo * (1.0 + 1e-6));
            geomspace(lo, hi, n)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Confusion {
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub tn: usize,
}

impl Confusion {
    pub fn tally(labels: &[bool], predicted: impl IntoIterator<Item = bool>) -> Self {
        let mut cm = Confusion::default();
        for (&y, yhat) in labels.iter().zip(predicted) {
            match (yhat, y) {
                (true, true) => cm.tp += 1,
                (true, false) => cm.fp += 1,
                (false, true) => cm.fn_ += 1,
                (false, false) => cm.tn += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.fn_ + self.tn
    }

    pub fn precision(&self) -> f64 {
        self.tp as f64 / (self.tp + self.fp).max(1) as f64
    }

    pub fn recall(&self) -> f64 {
        self.tp as f64 / (self.tp + self.fn_).max(1) as f64
    }

    pub fn false_positive_rate(&self) -> f64 {
        self.fp as f64 / (self.fp + self.tn).max(1) as f64
    }

    pub fn accuracy(&self) -> f64 {
        (self.tp + self.tn) as f64 / self.total().max(1) as f64
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    pub fn report(&self) -> ConfusionReport {
        ConfusionReport {
            tp: self.tp,
            fp: self.fp,
            fn_: self.fn_,
            tn: self.tn,
            precision: self.precision(),
            recall: self.recall(),
            accuracy: self.accuracy(),
            f1: self.f1(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfusionReport {
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub tn: usize,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub f1: f64,
}

pub fn confusion_at(
    labels: &[bool],
    scores: &[f64],
    threshold: f64,
    direction: SweepDirection,
) -> Confusion {
    Confusion::tally(labels, scores.iter().map(|&s| direction.predicts(s, threshold)))
}

/// Raw sweep points (in loosening-threshold order) plus the two areas.
#[derive(Debug, Clone, PartialEq)]
pub struct PrRocCurve {
    pub thresholds: Vec<f64>,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub pr_auc: f64,
    pub roc_auc: f64,
}

fn check_parallel(labels: &[bool], scores: &[f64]) -> Result<(), InstrumentError> {
    if labels.len() != scores.len() {
        return Err(InstrumentError::DimensionMismatch(format!(
            "{} labels vs {} scores",
            labels.len(),
            scores.len()
        )));
    }
    Ok(())
}

fn stable_order_by(keys: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
    order
}

/// PR and ROC curves from a threshold sweep.
///
/// Thresholds are visited from strictest to loosest, so among points with equal
/// recall the most precise comes first after the stable recall sort. When the
/// strictest point already has positive recall, a `(0, precision)` anchor is
/// prepended to the PR curve; the ROC curve is anchored at `(0, 0)` and `(1, 1)`.
pub fn pr_roc_sweep(
    labels: &[bool],
    scores: &[f64],
    grid: &[f64],
    direction: SweepDirection,
) -> Result<PrRocCurve, InstrumentError> {
    check_parallel(labels, scores)?;
    if grid.is_empty() {
        return Err(InstrumentError::InvalidInput(
            "threshold grid is empty".to_string(),
        ));
    }

    let mut thresholds: Vec<f64> = grid.to_vec();
    thresholds.sort_by(f64::total_cmp);
    if direction == SweepDirection::AtLeast {
        thresholds.reverse();
    }

    let n = thresholds.len();
    let mut precision = Vec::with_capacity(n);
    let mut recall = Vec::with_capacity(n);
    let mut fpr = Vec::with_capacity(n);
    for &t in &thresholds {
        let cm = confusion_at(labels, scores, t, direction);
        precision.push(cm.precision());
        recall.push(cm.recall());
        fpr.push(cm.false_positive_rate());
    }
    let tpr = recall.clone();

    let pr_order = stable_order_by(&recall);
    let mut rx: Vec<f64> = pr_order.iter().map(|&i| recall[i]).collect();
    let mut py: Vec<f64> = pr_order.iter().map(|&i| precision[i]).collect();
    if let (Some(&r0), Some(&p0)) = (rx.first(), py.first())
        && r0 > 0.0
    {
        rx.insert(0, 0.0);
        py.insert(0, p0);
    }
    let pr_auc = trapezoid(&rx, &py);

    let roc_order = stable_order_by(&fpr);
    let mut fx = vec![0.0];
    let mut ty = vec![0.0];
    fx.extend(roc_order.iter().map(|&i| fpr[i]));
    ty.extend(roc_order.iter().map(|&i| tpr[i]));
    fx.push(1.0);
    ty.push(1.0);
    let roc_auc = trapezoid(&fx, &ty);

    Ok(PrRocCurve {
        thresholds,
        precision,
        recall,
        fpr,
        tpr,
        pr_auc,
        roc_auc,
    })
}

/// Fraction of positive labels; NaN when there are none at all.
pub fn prevalence(labels: &[bool]) -> f64 {
    if labels.is_empty() {
        return f64::NAN;
    }
    labels.iter().filter(|&&y| y).count() as f64 / labels.len() as f64
}

/// `(AUPRC - p) / (1 - p)`: 0 for a random ranking, 1 for a perfect one.
///
/// Defined as 0 when `p >= 1`, since nothing can beat a saturated base rate.
pub fn normalized_auprc(pr_auc: f64, prevalence: f64) -> f64 {
    if !prevalence.is_finite() || !pr_auc.is_finite() {
        return f64::NAN;
    }
    if prevalence >= 1.0 {
        return 0.0;
    }
    (pr_auc - prevalence) / (1.0 - prevalence).max(NORM_FLOOR)
}

/// Area under the precision-recall-gain curve.
///
/// Precision and recall are clipped to `[1e-12, 1]` before the gain transform.
/// Needs at least two finite gain points; otherwise NaN.
pub fn auprg(recall: &[f64], precision: &[f64], prevalence: f64) -> f64 {
    if !prevalence.is_finite() {
        return f64::NAN;
    }
    let denom = (1.0 - prevalence).max(NORM_FLOOR);
    let gain = |v: f64| {
        let v = v.clamp(NORM_FLOOR, 1.0);
        (v - prevalence) / (denom * v)
    };
    let (mut rg, mut pg) = (Vec::new(), Vec::new());
    for (&r, &p) in recall.iter().zip(precision) {
        let (x, y) = (gain(r), gain(p));
        if x.is_finite() && y.is_finite() {
            rg.push(x);
            pg.push(y);
        }
    }
    if rg.len() < 2 {
        return f64::NAN;
    }
    trapezoid_sorted(&rg, &pg)
}

/// Fractional ranks `rank / (n + 1)`, ties broken by position.
pub fn rank01(scores: &[f64]) -> Vec<f64> {
    let n = scores.len();
    let order = stable_order_by(scores);
    let mut ranks = vec![0.0; n];
    for (pos, &i) in order.iter().enumerate() {
        ranks[i] = (pos + 1) as f64 / (n as f64 + 1.0);
    }
    ranks
}

/// Rank-based expected calibration error.
///
/// Bins are rank quantiles with duplicate edges collapsed; the last bin is
/// closed on both ends. Each non-empty bin contributes
/// `|mean positive rate - mean rank|` weighted by its share of samples.
pub fn ece_rank(scores: &[f64], labels: &[bool], bins: usize) -> f64 {
    if scores.is_empty() || scores.len() != labels.len() {
        return f64::NAN;
    }
    let rank = rank01(scores);
    let mut sorted = rank.clone();
    sorted.sort_by(f64::total_cmp);
    let mut edges: Vec<f64> = linspace(0.0, 1.0, bins.max(2) + 1)
        .into_iter()
        .filter_map(|q| quantile_sorted(&sorted, q))
        .collect();
    edges.sort_by(f64::total_cmp);
    edges.dedup();

    let n = rank.len() as f64;
    let mut total = 0.0;
    let mut weight = 0usize;
    let n_bins = edges.len().saturating_sub(1);
    for b in 0..n_bins {
        let (lo, hi) = (edges[b], edges[b + 1]);
        let last = b + 1 == n_bins;
        let mut cnt = 0usize;
        let mut rank_sum = 0.0;
        let mut pos = 0usize;
        for (&r, &y) in rank.iter().zip(labels) {
            let inside = r >= lo && if last { r <= hi } else { r < hi };
            if inside {
                cnt += 1;
                rank_sum += r;
                pos += usize::from(y);
            }
        }
        if cnt == 0 {
            continue;
        }
        let mean_rank = rank_sum / cnt as f64;
        let mean_pos = pos as f64 / cnt as f64;
        total += (cnt as f64 / n) * (mean_pos - mean_rank).abs();
        weight += cnt;
    }
    if weight > 0 { total } else { f64::NAN }
}

/// Step-sweep PR area over distinct scores, larger score = more positive.
///
/// Tied scores enter together. The curve starts at `(0, first precision)`.
/// Zero positives gives 0; empty input gives NaN.
pub fn precision_recall_auc_exact(labels: &[bool], scores: &[f64]) -> f64 {
    let n = labels.len().min(scores.len());
    if n == 0 {
        return f64::NAN;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    let total_pos = labels[..n].iter().filter(|&&y| y).count();
    if total_pos == 0 {
        return 0.0;
    }

    let mut precisions = Vec::with_capacity(n + 1);
    let mut recalls = Vec::with_capacity(n + 1);
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut prev: Option<f64> = None;
    for &i in &order {
        let s = scores[i];
        if let Some(p) = prev
            && s != p
            && tp + fp > 0
        {
            precisions.push(tp as f64 / (tp + fp) as f64);
            recalls.push(tp as f64 / total_pos as f64);
        }
        if labels[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        prev = Some(s);
    }
    precisions.push(tp as f64 / (tp + fp) as f64);
    recalls.push(tp as f64 / total_pos as f64);

    let anchor = precisions[0];
    precisions.insert(0, anchor);
    recalls.insert(0, 0.0);
    trapezoid(&recalls, &precisions)
}

pub fn normalized_auprc_exact(labels: &[bool], scores: &[f64]) -> f64 {
    if labels.is_empty() {
        return f64::NAN;
    }
    let auc = precision_recall_auc_exact(labels, scores);
    normalized_auprc(auc, prevalence(labels))
}

fn default_reliability_bins() -> usize {
    20
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub grid: GridSpec,
    #[serde(default = "default_reliability_bins")]
    pub reliability_bins: usize,
    /// Score rows against `r_th_eff` (falling back to `r_th`) instead of `r_th`.
    #[serde(default = "default_true")]
    pub use_effective_threshold: bool,
    /// Keep only rows with finite `lambda_max < 2/eta`.
    #[serde(default = "default_true")]
    pub drop_eos: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            grid: GridSpec::default(),
            reliability_bins: default_reliability_bins(),
            use_effective_threshold: true,
            drop_eos: true,
        }
    }
}

/// Per-run summary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub pr_auc: f64,
    pub roc_auc: f64,
    pub prevalence: f64,
    pub normalized_auprc: f64,
    pub auprg: f64,
    pub ece_rank: f64,
    pub cm_at_threshold_1: ConfusionReport,
    pub c_grid: Vec<f64>,
}

/// Summarizes a ratio score `z` (positive iff `z <= c`) against its labels.
///
/// Rank calibration is measured on `-z` so that larger means more positive.
pub fn evaluate_scores(
    labels: &[bool],
    z: &[f64],
    config: &EvaluationConfig,
) -> Result<EvaluationSummary, InstrumentError> {
    check_parallel(labels, z)?;
    if labels.is_empty() {
        return Err(InstrumentError::DegenerateInput(
            "no scored rows to evaluate".to_string(),
        ));
    }
    let grid = build_threshold_grid(&config.grid, z);
    let curve = pr_roc_sweep(labels, z, &grid, SweepDirection::AtMost)?;
    let p = prevalence(labels);
    let neg_z: Vec<f64> = z.iter().map(|v| -v).collect();
    Ok(EvaluationSummary {
        pr_auc: curve.pr_auc,
        roc_auc: curve.roc_auc,
        prevalence: p,
        normalized_auprc: normalized_auprc(curve.pr_auc, p),
        auprg: auprg(&curve.recall, &curve.precision, p),
        ece_rank: ece_rank(&neg_z, labels, config.reliability_bins.max(5)),
        cm_at_threshold_1: confusion_at(labels, z, 1.0, SweepDirection::AtMost).report(),
        c_grid: grid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn perfect_ratio_score_has_unit_areas() {
        let labels = [true, true, false, false];
        let z = [0.1, 0.2, 0.8, 0.9];
        let curve = pr_roc_sweep(&labels, &z, &[0.1, 0.2, 0.8, 0.9], SweepDirection::AtMost).unwrap();
        assert_abs_diff_eq!(curve.pr_auc, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(curve.roc_auc, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn inverted_score_has_low_roc() {
        let labels = [true, true, false, false];
        let z = [0.9, 0.8, 0.2, 0.1];
        let curve = pr_roc_sweep(&labels, &z, &[0.1, 0.2, 0.8, 0.9], SweepDirection::AtMost).unwrap();
        assert!(curve.roc_auc < 0.5);
    }

    #[test]
    fn normalized_auprc_saturated_prevalence_is_zero() {
        assert_eq!(normalized_auprc(1.0, 1.0), 0.0);
        assert!(normalized_auprc(0.5, f64::NAN).is_nan());
        assert_abs_diff_eq!(normalized_auprc(0.5, 0.5), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn quantile_grid_falls_back_when_span_collapses() {
        let grid = build_threshold_grid(&GridSpec::default(), &[2.0, 2.0, 2.0]);
        assert_eq!(grid.len(), 600);
        assert_eq!(grid[0], 1e-4);
        assert_eq!(grid[599], 10.0);

        let linear = GridSpec::Quantile {
            q_lo: 0.0,
            q_hi: 1.0,
            points: 3,
            spacing: GridSpacing::Linear,
            fallback: (-1.0, 1.0),
        };
        assert_eq!(build_threshold_grid(&linear, &[0.0, f64::NAN, 4.0]), vec![0.0, 2.0, 4.0]);
        assert_eq!(build_threshold_grid(&linear, &[]), vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn rank01_breaks_ties_by_position() {
        let r = rank01(&[0.5, 0.1, 0.5]);
        assert_eq!(r, vec![0.5, 0.25, 0.75]);
    }

    #[test]
    fn ece_rank_weights_bin_gaps_by_size() {
        // Ranks 0.2, 0.4 | 0.6, 0.8 with positive rates 0 | 1.
        let scores: Vec<f64> = (0..4).map(f64::from).collect();
        let labels = [false, false, true, true];
        assert_abs_diff_eq!(ece_rank(&scores, &labels, 2), 0.3, epsilon = 1e-12);
        assert!(ece_rank(&[], &[], 5).is_nan());
    }

    #[test]
    fn exact_auprc_handles_ties_and_degenerate_labels() {
        assert_abs_diff_eq!(
            precision_recall_auc_exact(&[true, false, true, false], &[0.9, 0.8, 0.7, 0.1]),
            0.5 * 1.0 + 0.5 * (0.5 + 2.0 / 3.0) * 0.5,
            epsilon = 1e-12
        );
        assert_eq!(precision_recall_auc_exact(&[false, false], &[1.0, 2.0]), 0.0);
        assert!(precision_recall_auc_exact(&[], &[]).is_nan());
        // All tied: one step at prevalence.
        assert_abs_diff_eq!(
            precision_recall_auc_exact(&[true, false], &[1.0, 1.0]),
            0.5,
            epsilon = 1e-12
        );
        assert_eq!(normalized_auprc_exact(&[true, true], &[0.3, 0.4]), 0.0);
    }

    #[test]
    fn auprg_needs_two_points() {
        assert!(auprg(&[0.5], &[0.5], 0.5).is_nan());
        let v = auprg(&[0.5, 1.0], &[1.0, 1.0], 0.5);
        assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn evaluate_scores_rejects_empty_input() {
        assert!(matches!(
            evaluate_scores(&[], &[], &EvaluationConfig::default()),
            Err(InstrumentError::DegenerateInput(_))
        ));
    }
}
