//! Empirical threshold scale `c*`.
//!
//! For each candidate `c` the rule "no harm iff `ema_r <= c * threshold`" is
//! scored against the observed label `deltaL_dom >= 0`, and the F1-best scale
//! is kept. The calibrator either fits once at the end of a warmup window or
//! refits periodically over a bounded sliding window.

use crate::evaluate::Confusion;
use crate::linalg::utils::{NORM_FLOOR, geomspace, quantile_sorted};
use crate::records::MetricsRow;
use crate::types::InstrumentError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One `(ema_r, threshold, deltaL_dom)` observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub ema_r: f64,
    pub threshold: f64,
    pub delta_l: f64,
}

/// How equal-F1 candidates are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the first maximum in grid order.
    #[default]
    FirstMax,
    /// Prefer the scale nearest 1.0, the least aggressive correction.
    ClosestToOne,
}

/// Winning scale with its confusion counts; also the `cstar.json` artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleSelection {
    pub c: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub tn: usize,
}

impl ScaleSelection {
    fn from_confusion(c: f64, cm: &Confusion) -> Self {
        Self {
            c,
            f1: cm.f1(),
            precision: cm.precision(),
            recall: cm.recall(),
            tp: cm.tp,
            fp: cm.fp,
            fn_: cm.fn_,
            tn: cm.tn,
        }
    }
}

/// Grid search for the F1-maximizing scale.
pub fn compute_best_c_scale(
    records: &[CalibrationRecord],
    c_grid: &[f64],
    tie_break: TieBreak,
) -> Result<ScaleSelection, InstrumentError> {
    if c_grid.is_empty() {
        return Err(InstrumentError::InvalidInput(
            "calibration grid is empty".to_string(),
        ));
    }
    let labels: Vec<bool> = records.iter().map(|rec| rec.delta_l >= 0.0).collect();
    let mut best: Option<ScaleSelection> = None;
    for &c in c_grid {
        let cm = Confusion::tally(
            &labels,
            records.iter().map(|rec| rec.ema_r <= c * rec.threshold),
        );
        let candidate = ScaleSelection::from_confusion(c, &cm);
        let replace = match &best {
            None => true,
            Some(cur) if candidate.f1 > cur.f1 => true,
            Some(cur) => {
                tie_break == TieBreak::ClosestToOne
                    && candidate.f1 == cur.f1
                    && (c - 1.0).abs() < (cur.c - 1.0).abs()
            }
        };
        if replace {
            best = Some(candidate);
        }
    }
    best.ok_or_else(|| InstrumentError::InvalidInput("calibration grid is empty".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CalibrationMode {
    /// Fixed scale for the whole run.
    Off,
    /// Fit once when step `warmup_steps - 1` completes, then freeze.
    Warmup { warmup_steps: usize },
    /// Refit every `update_every` steps from the warmup boundary onward, over
    /// the most recent `window` records.
    Sliding {
        warmup_steps: usize,
        window: usize,
        update_every: usize,
    },
}

impl Default for CalibrationMode {
    fn default() -> Self {
        CalibrationMode::Off
    }
}

fn default_fixed_scale() -> f64 {
    1.0
}

fn default_c_grid() -> Vec<f64> {
    vec![0.1, 0.25, 0.5, 0.75, 1.0]
}

fn default_min_records() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub mode: CalibrationMode,
    #[serde(default = "default_fixed_scale")]
    pub fixed_scale: f64,
    #[serde(default = "default_c_grid")]
    pub c_grid: Vec<f64>,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default = "default_min_records")]
    pub min_records: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            mode: CalibrationMode::default(),
            fixed_scale: default_fixed_scale(),
            c_grid: default_c_grid(),
            tie_break: TieBreak::default(),
            min_records: default_min_records(),
        }
    }
}

/// One refit, as appended to the history log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationEvent {
    pub step: usize,
    #[serde(flatten)]
    pub selection: ScaleSelection,
}

/// Owns the calibration buffer and the active scale.
#[derive(Debug, Clone)]
pub struct ScaleCalibrator {
    config: CalibrationConfig,
    records: VecDeque<CalibrationRecord>,
    selection: Option<ScaleSelection>,
    history: Vec<CalibrationEvent>,
}

impl ScaleCalibrator {
    pub fn new(config: CalibrationConfig) -> Result<Self, InstrumentError> {
        if config.mode != CalibrationMode::Off && config.c_grid.is_empty() {
            return Err(InstrumentError::InvalidInput(
                "calibration grid is empty".to_string(),
            ));
        }
        if let CalibrationMode::Sliding {
            window,
            update_every,
            ..
        } = config.mode
            && (window == 0 || update_every == 0)
        {
            return Err(InstrumentError::InvalidInput(
                "sliding calibration needs window > 0 and update_every > 0".to_string(),
            ));
        }
        Ok(Self {
            config,
            records: VecDeque::new(),
            selection: None,
            history: Vec::new(),
        })
    }

    /// Scale to apply to this step's threshold.
    pub fn active_scale(&self) -> f64 {
        self.selection.map_or(self.config.fixed_scale, |s| s.c)
    }

    pub fn cstar(&self) -> Option<f64> {
        self.selection.map(|s| s.c)
    }

    pub fn selection(&self) -> Option<&ScaleSelection> {
        self.selection.as_ref()
    }

    pub fn history(&self) -> &[CalibrationEvent] {
        &self.history
    }

    pub fn buffered(&self) -> usize {
        self.records.len()
    }

    /// Feeds one step. `record` is `None` when no ground truth was measured.
    ///
    /// Returns the new selection when a fit happened on this step.
    pub fn observe(
        &mut self,
        step: usize,
        record: Option<CalibrationRecord>,
    ) -> Result<Option<ScaleSelection>, InstrumentError> {
        let record = record.filter(|rec| !rec.delta_l.is_nan());
        match self.config.mode.clone() {
            CalibrationMode::Off => Ok(None),
            CalibrationMode::Warmup { warmup_steps } => {
                if step >= warmup_steps || self.selection.is_some() {
                    return Ok(None);
                }
                // The fit fires only on a step that contributed a record.
                if let Some(rec) = record {
                    self.records.push_back(rec);
                    if step + 1 == warmup_steps {
                        return self.refit(step);
                    }
                }
                Ok(None)
            }
            CalibrationMode::Sliding {
                warmup_steps,
                window,
                update_every,
            } => {
                if let Some(rec) = record {
                    self.records.push_back(rec);
                    while self.records.len() > window {
                        self.records.pop_front();
                    }
                }
                let done = step + 1;
                if done >= warmup_steps && (done - warmup_steps) % update_every == 0 {
                    return self.refit(step);
                }
                Ok(None)
            }
        }
    }

    fn refit(&mut self, step: usize) -> Result<Option<ScaleSelection>, InstrumentError> {
        if self.records.len() < self.config.min_records {
            log::warn!(
                "c* calibration at step {step} skipped: {} records < {} required",
                self.records.len(),
                self.config.min_records
            );
            return Ok(None);
        }
        let records: Vec<CalibrationRecord> = self.records.iter().copied().collect();
        let best = compute_best_c_scale(&records, &self.config.c_grid, self.config.tie_break)?;
        log::info!(
            "selected c*={:.3} with F1={:.3} at step {step} from {} records",
            best.c,
            best.f1,
            records.len()
        );
        self.selection = Some(best);
        self.history.push(CalibrationEvent {
            step,
            selection: best,
        });
        Ok(Some(best))
    }
}

/// `c*` fitted offline from a run's logged warmup rows.
///
/// Uses rows with `step < warmup_steps` and finite `r`, `r_th`, `deltaL_dom`;
/// needs at least 5. The score is `z = r / max(base, 1e-12)` with `base` the
/// gamma-corrected threshold when finite, else `r_th`. Candidates are 200
/// geometric points over the `[1%, 99%]` quantile range of finite `z`.
pub fn cstar_from_warmup_rows(rows: &[MetricsRow], warmup_steps: usize) -> Option<f64> {
    let usable: Vec<&MetricsRow> = rows
        .iter()
        .filter(|row| {
            row.step < warmup_steps
                && row.r.is_finite()
                && row.r_th.is_finite()
                && row.delta_l_dom.is_finite()
        })
        .collect();
    if usable.len() < 5 {
        return None;
    }
    let (z, labels): (Vec<f64>, Vec<bool>) = usable
        .iter()
        .map(|row| {
            let base = if row.r_th_gamma_eff.is_finite() {
                row.r_th_gamma_eff
            } else {
                row.r_th
            };
            (row.r / base.max(NORM_FLOOR), row.delta_l_dom >= 0.0)
        })
        .unzip();

    let mut finite: Vec<f64> = z.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(f64::total_cmp);
    let mut qmin = quantile_sorted(&finite, 0.01)?;
    let mut qmax = quantile_sorted(&finite, 0.99)?;
    if !(qmax > qmin) {
        qmin = *finite.first()?;
        qmax = *finite.last()?;
    }
    if !(qmax > qmin) {
        return None;
    }

    let lo = qmin.max(1e-8);
    let hi = qmax.max(qmin * (1.0 + 1e-6));
    let mut best_f1 = -1.0;
    let mut best_c = None;
    for c in geomspace(lo, hi, 200) {
        let cm = Confusion::tally(&labels, z.iter().map(|&zi| zi <= c));
        let f1 = cm.f1();
        if f1 > best_f1 {
            best_f1 = f1;
            best_c = Some(c);
        }
    }
    best_c
}

/// Point metrics of a fixed `c*` applied to another run's rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointMetrics {
    pub confusion: Confusion,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub prevalence: f64,
}

/// Applies `cstar` to `z = r / max(r_th_eff, 1e-12)` (falling back to `r_th`
/// when `r_th_eff` is NaN). Only rows with finite `lambda_max < 2/eta` count.
pub fn point_metrics(rows: &[MetricsRow], cstar: f64) -> Option<PointMetrics> {
    if !(cstar.is_finite() && cstar > 0.0) {
        return None;
    }
    let mut z = Vec::new();
    let mut labels = Vec::new();
    for row in rows {
        let th = if row.r_th_eff.is_nan() { row.r_th } else { row.r_th_eff };
        let ok = row.r.is_finite()
            && th.is_finite()
            && row.delta_l_dom.is_finite()
            && row.lambda_max.is_finite()
            && row.two_over_lr.is_finite()
            && row.lambda_max < row.two_over_lr;
        if ok {
            z.push(row.r / th.max(NORM_FLOOR));
            labels.push(row.delta_l_dom >= 0.0);
        }
    }
    if z.is_empty() {
        return None;
    }
    let cm = Confusion::tally(&labels, z.iter().map(|&zi| zi <= cstar));
    Some(PointMetrics {
        confusion: cm,
        precision: cm.precision(),
        recall: cm.recall(),
        f1: cm.f1(),
        prevalence: labels.iter().filter(|&&y| y).count() as f64 / labels.len() as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ema_r: f64, delta_l: f64) -> CalibrationRecord {
        CalibrationRecord {
            ema_r,
            threshold: 1.0,
            delta_l,
        }
    }

    #[test]
    fn empty_records_pick_first_grid_entry() {
        let best = compute_best_c_scale(&[], &[0.3, 0.6], TieBreak::FirstMax).unwrap();
        assert_eq!(best.c, 0.3);
        assert_eq!(best.f1, 0.0);
    }

    #[test]
    fn closest_to_one_tie_break() {
        // Every positive has ema_r 0.05, so all scales tie at F1 = 1.
        let records = vec![rec(0.05, 1.0), rec(0.05, 2.0), rec(3.0, -1.0)];
        let grid = [0.1, 0.5, 0.75];
        let first = compute_best_c_scale(&records, &grid, TieBreak::FirstMax).unwrap();
        let near_one = compute_best_c_scale(&records, &grid, TieBreak::ClosestToOne).unwrap();
        assert_eq!(first.c, 0.1);
        assert_eq!(near_one.c, 0.75);
        assert_eq!(near_one.f1, 1.0);
    }

    #[test]
    fn warmup_fits_once_then_freezes() {
        let cfg = CalibrationConfig {
            mode: CalibrationMode::Warmup { warmup_steps: 12 },
            ..CalibrationConfig::default()
        };
        let mut cal = ScaleCalibrator::new(cfg).unwrap();
        for step in 0..11 {
            let r = if step % 2 == 0 { 0.3 } else { 0.9 };
            let d = if step % 2 == 0 { 1.0 } else { -1.0 };
            assert!(cal.observe(step, Some(rec(r, d))).unwrap().is_none());
            assert_eq!(cal.active_scale(), 1.0);
        }
        let fitted = cal.observe(11, Some(rec(0.3, 1.0))).unwrap().expect("fit at boundary");
        assert_eq!(fitted.c, 0.5);
        assert_eq!(cal.active_scale(), 0.5);
        assert!(cal.observe(12, Some(rec(5.0, 1.0))).unwrap().is_none());
        assert_eq!(cal.history().len(), 1);
    }

    #[test]
    fn warmup_does_not_fit_when_last_step_lacks_ground_truth() {
        let cfg = CalibrationConfig {
            mode: CalibrationMode::Warmup { warmup_steps: 12 },
            ..CalibrationConfig::default()
        };
        let mut cal = ScaleCalibrator::new(cfg).unwrap();
        for step in 0..11 {
            let r = if step % 2 == 0 { 0.3 } else { 0.9 };
            let d = if step % 2 == 0 { 1.0 } else { -1.0 };
            cal.observe(step, Some(rec(r, d))).unwrap();
        }
        assert!(cal.observe(11, Some(rec(0.3, f64::NAN))).unwrap().is_none());
        assert_eq!(cal.buffered(), 11);
        assert_eq!(cal.cstar(), None);
        assert!(cal.history().is_empty());
        assert!(cal.observe(12, Some(rec(0.3, 1.0))).unwrap().is_none());
        assert_eq!(cal.active_scale(), 1.0);
    }

    #[test]
    fn warmup_with_too_few_records_keeps_fixed_scale() {
        let cfg = CalibrationConfig {
            mode: CalibrationMode::Warmup { warmup_steps: 5 },
            fixed_scale: 0.8,
            ..CalibrationConfig::default()
        };
        let mut cal = ScaleCalibrator::new(cfg).unwrap();
        for step in 0..5 {
            cal.observe(step, Some(rec(0.1, 1.0))).unwrap();
        }
        assert_eq!(cal.cstar(), None);
        assert_eq!(cal.active_scale(), 0.8);
    }

    #[test]
    fn sliding_window_is_bounded_and_refits_periodically() {
        let cfg = CalibrationConfig {
            mode: CalibrationMode::Sliding {
                warmup_steps: 10,
                window: 10,
                update_every: 5,
            },
            ..CalibrationConfig::default()
        };
        let mut cal = ScaleCalibrator::new(cfg).unwrap();
        let mut fits = Vec::new();
        for step in 0..30 {
            let r = if step % 2 == 0 { 0.2 } else { 0.9 };
            let d = if step % 2 == 0 { 1.0 } else { -1.0 };
            if cal.observe(step, Some(rec(r, d))).unwrap().is_some() {
                fits.push(step);
            }
            assert!(cal.buffered() <= 10);
        }
        assert_eq!(fits, vec![9, 14, 19, 24, 29]);
        assert_eq!(cal.history().len(), 5);
    }

    #[test]
    fn nan_ground_truth_is_not_recorded() {
        let cfg = CalibrationConfig {
            mode: CalibrationMode::Sliding {
                warmup_steps: 0,
                window: 4,
                update_every: 100,
            },
            ..CalibrationConfig::default()
        };
        let mut cal = ScaleCalibrator::new(cfg).unwrap();
        cal.observe(0, Some(rec(0.1, f64::NAN))).unwrap();
        cal.observe(1, None).unwrap();
        assert_eq!(cal.buffered(), 0);
    }
}
