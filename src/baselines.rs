//! Competing per-step scores evaluated against the same `deltaL_dom >= 0`
//! labels as `z`.

use crate::evaluate::{GridSpacing, GridSpec, SweepDirection, build_threshold_grid, normalized_auprc, prevalence, pr_roc_sweep};
use crate::linalg::utils::NORM_FLOOR;
use crate::records::MetricsRow;
use crate::types::InstrumentError;
use serde::Serialize;

/// A named score and the side of the threshold that predicts "no harm".
#[derive(Debug, Clone, Copy)]
pub struct BaselineSpec {
    pub name: &'static str,
    pub direction: SweepDirection,
    score: fn(&MetricsRow, f64) -> f64,
}

impl BaselineSpec {
    /// `threshold` is `r_th_eff`, falling back to `r_th` when it is NaN.
    pub fn score(&self, row: &MetricsRow, threshold: f64) -> f64 {
        (self.score)(row, threshold)
    }
}

pub const BASELINES: [BaselineSpec; 8] = [
    BaselineSpec {
        name: "z_eff",
        direction: SweepDirection::AtMost,
        score: |row, th| row.r / th.max(NORM_FLOOR),
    },
    BaselineSpec {
        name: "eos_margin",
        direction: SweepDirection::AtLeast,
        score: |row, _| row.lambda_max - row.two_over_lr,
    },
    BaselineSpec {
        name: "ps_grad",
        direction: SweepDirection::AtMost,
        score: |row, _| row.ps_grad_sq,
    },
    BaselineSpec {
        name: "r_only",
        direction: SweepDirection::AtMost,
        score: |row, _| row.r,
    },
    BaselineSpec {
        name: "lam_max",
        direction: SweepDirection::AtLeast,
        score: |row, _| row.lambda_max,
    },
    BaselineSpec {
        name: "grad_norm",
        direction: SweepDirection::AtMost,
        score: |row, _| row.grad_norm_sq,
    },
    BaselineSpec {
        name: "r_full",
        direction: SweepDirection::AtMost,
        score: |row, _| row.grad_norm_sq / row.tr_sigma_full.max(NORM_FLOOR),
    },
    BaselineSpec {
        name: "sam1_full",
        direction: SweepDirection::AtLeast,
        score: |row, _| row.delta_l_full,
    },
];

pub fn baseline_grid() -> GridSpec {
    GridSpec::Quantile {
        q_lo: 0.001,
        q_hi: 0.999,
        points: 600,
        spacing: GridSpacing::Linear,
        fallback: (-1.0, 1.0),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BaselineScore {
    pub name: &'static str,
    pub direction: SweepDirection,
    pub n: usize,
    pub pr_auc: f64,
    pub normalized_auprc: f64,
}

fn row_threshold(row: &MetricsRow) -> f64 {
    if row.r_th_eff.is_nan() { row.r_th } else { row.r_th_eff }
}

/// Scores one baseline over rows with finite `r`, threshold and
/// `deltaL_dom`, further restricted to rows where this score is finite.
pub fn evaluate_baseline(rows: &[MetricsRow], spec: &BaselineSpec) -> Result<BaselineScore, InstrumentError> {
    let mut labels = Vec::new();
    let mut scores = Vec::new();
    for row in rows {
        let th = row_threshold(row);
        if !(row.r.is_finite() && th.is_finite() && row.delta_l_dom.is_finite()) {
            continue;
        }
        let s = spec.score(row, th);
        if !s.is_finite() {
            continue;
        }
        labels.push(row.delta_l_dom >= 0.0);
        scores.push(s);
    }
    if labels.is_empty() {
        return Ok(BaselineScore {
            name: spec.name,
            direction: spec.direction,
            n: 0,
            pr_auc: f64::NAN,
            normalized_auprc: f64::NAN,
        });
    }
    let grid = build_threshold_grid(&baseline_grid(), &scores);
    let curve = pr_roc_sweep(&labels, &scores, &grid, spec.direction)?;
    Ok(BaselineScore {
        name: spec.name,
        direction: spec.direction,
        n: labels.len(),
        pr_auc: curve.pr_auc,
        normalized_auprc: normalized_auprc(curve.pr_auc, prevalence(&labels)),
    })
}

pub fn compare_baselines(rows: &[MetricsRow]) -> Result<Vec<BaselineScore>, InstrumentError> {
    BASELINES.iter().map(|spec| evaluate_baseline(rows, spec)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn row(step: usize, r: f64, lam: f64, d_dom: f64) -> MetricsRow {
        MetricsRow {
            step,
            r,
            r_th: 1.0,
            r_th_eff: f64::NAN,
            lambda_max: lam,
            two_over_lr: 20.0,
            delta_l_dom: d_dom,
            ..MetricsRow::default()
        }
    }

    #[test]
    fn directions_follow_score_semantics() {
        // Small r and large lambda_max both mark the positive steps.
        let rows: Vec<MetricsRow> = (0..40)
            .map(|i| {
                let pos = i % 2 == 0;
                let r = if pos { 0.1 + 0.001 * i as f64 } else { 2.0 + 0.001 * i as f64 };
                let lam = if pos { 15.0 } else { 5.0 };
                row(i, r, lam, if pos { 0.5 } else { -0.5 })
            })
            .collect();
        let results = compare_baselines(&rows).unwrap();
        let by_name = |n: &str| results.iter().find(|b| b.name == n).unwrap();
        assert_abs_diff_eq!(by_name("z_eff").normalized_auprc, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(by_name("r_only").normalized_auprc, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(by_name("lam_max").normalized_auprc, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(by_name("eos_margin").normalized_auprc, 1.0, epsilon = 1e-9);
        assert_eq!(by_name("z_eff").n, 40);
    }

    #[test]
    fn rows_without_the_score_are_skipped() {
        let mut rows = vec![row(0, 0.1, 3.0, 1.0), row(1, 0.2, 4.0, -1.0)];
        rows[1].delta_l_full = f64::NAN;
        rows[0].delta_l_full = 0.3;
        let sam = evaluate_baseline(&rows, &BASELINES[7]).unwrap();
        assert_eq!(sam.n, 1);
        let none = evaluate_baseline(&[], &BASELINES[0]).unwrap();
        assert!(none.pr_auc.is_nan());
    }
}
