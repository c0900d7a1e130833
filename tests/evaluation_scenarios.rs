use approx::assert_abs_diff_eq;
use domsnr::calibration::{CalibrationRecord, TieBreak, compute_best_c_scale};
use domsnr::evaluate::{
    EvaluationConfig, SweepDirection, evaluate_scores, normalized_auprc, normalized_auprc_exact,
    pr_roc_sweep, prevalence,
};
use domsnr::types::InstrumentError;

#[test]
fn separable_scores_reach_unit_areas() {
    let labels = [true, true, false, false];
    let scores = [0.9, 0.8, 0.3, 0.2];
    let grid = [0.2, 0.3, 0.8, 0.9];
    let curve = pr_roc_sweep(&labels, &scores, &grid, SweepDirection::AtLeast).unwrap();
    assert_abs_diff_eq!(curve.pr_auc, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(curve.roc_auc, 1.0, epsilon = 1e-12);
    let p = prevalence(&labels);
    assert_abs_diff_eq!(p, 0.5, epsilon = 1e-12);
    assert_abs_diff_eq!(normalized_auprc(curve.pr_auc, p), 1.0, epsilon = 1e-12);
}

#[test]
fn normalized_auprc_bounds() {
    assert_abs_diff_eq!(normalized_auprc(1.0, 1.0), 0.0, epsilon = 1e-15);
    assert_abs_diff_eq!(normalized_auprc(0.3, 0.3), 0.0, epsilon = 1e-15);
    assert!(normalized_auprc(f64::NAN, 0.3).is_nan());

    let labels = [true, false, true, false, false, true];
    let perfect = [0.9, 0.1, 0.8, 0.2, 0.3, 0.7];
    assert_abs_diff_eq!(normalized_auprc_exact(&labels, &perfect), 1.0, epsilon = 1e-12);
    let all_pos = [true; 4];
    assert_abs_diff_eq!(normalized_auprc_exact(&all_pos, &[0.1, 0.2, 0.3, 0.4]), 0.0, epsilon = 1e-15);
}

#[test]
fn ratio_scores_below_one_are_positive() {
    // z <= 1 marks the safe steps; summary uses the default log grid.
    let labels: Vec<bool> = (0..50).map(|i| i % 3 != 0).collect();
    let z: Vec<f64> = labels
        .iter()
        .enumerate()
        .map(|(i, &pos)| if pos { 0.2 + 0.01 * i as f64 } else { 2.0 + 0.01 * i as f64 })
        .collect();
    let summary = evaluate_scores(&labels, &z, &EvaluationConfig::default()).unwrap();
    assert!(summary.normalized_auprc > 0.95);
    assert!(summary.roc_auc > 0.95);
    assert_eq!(summary.cm_at_threshold_1.fp, 0);
    assert_eq!(summary.cm_at_threshold_1.fn_, 0);
    assert_eq!(summary.c_grid.len(), 600);
}

#[test]
fn empty_evaluation_is_degenerate() {
    assert!(matches!(
        evaluate_scores(&[], &[], &EvaluationConfig::default()),
        Err(InstrumentError::DegenerateInput(_))
    ));
}

#[test]
fn calibration_picks_scale_that_separates_records() {
    let mut records = Vec::new();
    for i in 0..6 {
        records.push(CalibrationRecord {
            ema_r: 0.4 + 0.01 * i as f64,
            threshold: 1.0,
            delta_l: 0.1,
        });
        records.push(CalibrationRecord {
            ema_r: 0.6 + 0.02 * i as f64,
            threshold: 1.0,
            delta_l: -0.1,
        });
    }
    let grid = [0.1, 0.25, 0.5, 0.75, 1.0];
    let sel = compute_best_c_scale(&records, &grid, TieBreak::FirstMax).unwrap();
    assert_abs_diff_eq!(sel.c, 0.5, epsilon = 1e-15);
    assert_abs_diff_eq!(sel.f1, 1.0, epsilon = 1e-12);
    assert_eq!((sel.tp, sel.fp, sel.fn_, sel.tn), (6, 0, 0, 6));
}
