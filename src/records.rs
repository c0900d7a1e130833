//! Per-step metrics log: the CSV schema shared by the monitor and every
//! offline analysis, plus the row filter and score construction applied
//! before evaluation.

use crate::types::InstrumentError;
use csv::StringRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const METRICS_COLUMNS: [&str; 25] = [
    "step",
    "epoch",
    "batch",
    "loss",
    "r",
    "r_th",
    "r_th_eff",
    "r_th_gamma_eff",
    "mu",
    "ps_grad_sq",
    "tr_ps_sigma",
    "tr_sigma_full",
    "grad_norm_sq",
    "deltaL_dom",
    "deltaL_bulk",
    "deltaL_full",
    "lambda_max",
    "two_over_lr",
    "trigger",
    "cstar",
    "mask_applicable",
    "eps_current",
    "gamma_val",
    "gamma_iters_used",
    "gamma_ok",
];

/// One logged training step. Missing or unparsable numeric cells read as NaN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRow {
    pub step: usize,
    pub epoch: usize,
    pub batch: usize,
    pub loss: f64,
    /// Smoothed `r` (the EMA value the trigger compares).
    pub r: f64,
    pub r_th: f64,
    pub r_th_eff: f64,
    pub r_th_gamma_eff: f64,
    pub mu: f64,
    pub ps_grad_sq: f64,
    pub tr_ps_sigma: f64,
    pub tr_sigma_full: f64,
    pub grad_norm_sq: f64,
    pub delta_l_dom: f64,
    pub delta_l_bulk: f64,
    pub delta_l_full: f64,
    pub lambda_max: f64,
    pub two_over_lr: f64,
    pub trigger: bool,
    pub cstar: f64,
    pub mask_applicable: bool,
    pub eps_current: f64,
    pub gamma_val: f64,
    pub gamma_iters_used: Option<usize>,
    pub gamma_ok: bool,
}

impl Default for MetricsRow {
    /// Step 0 with every measurement NaN, as a reader sees an all-blank row.
    fn default() -> Self {
        Self {
            step: 0,
            epoch: 0,
            batch: 0,
            loss: f64::NAN,
            r: f64::NAN,
            r_th: f64::NAN,
            r_th_eff: f64::NAN,
            r_th_gamma_eff: f64::NAN,
            mu: f64::NAN,
            ps_grad_sq: f64::NAN,
            tr_ps_sigma: f64::NAN,
            tr_sigma_full: f64::NAN,
            grad_norm_sq: f64::NAN,
            delta_l_dom: f64::NAN,
            delta_l_bulk: f64::NAN,
            delta_l_full: f64::NAN,
            lambda_max: f64::NAN,
            two_over_lr: f64::NAN,
            trigger: false,
            cstar: f64::NAN,
            mask_applicable: true,
            eps_current: f64::NAN,
            gamma_val: f64::NAN,
            gamma_iters_used: None,
            gamma_ok: false,
        }
    }
}

fn fmt_f64(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v == f64::INFINITY {
        "inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{v}")
    }
}

fn fmt_flag(v: bool) -> String {
    if v { "1" } else { "0" }.to_string()
}

impl MetricsRow {
    fn to_record(&self) -> Vec<String> {
        vec![
            self.step.to_string(),
            self.epoch.to_string(),
            self.batch.to_string(),
            fmt_f64(self.loss),
            fmt_f64(self.r),
            fmt_f64(self.r_th),
            fmt_f64(self.r_th_eff),
            fmt_f64(self.r_th_gamma_eff),
            fmt_f64(self.mu),
            fmt_f64(self.ps_grad_sq),
            fmt_f64(self.tr_ps_sigma),
            fmt_f64(self.tr_sigma_full),
            fmt_f64(self.grad_norm_sq),
            fmt_f64(self.delta_l_dom),
            fmt_f64(self.delta_l_bulk),
            fmt_f64(self.delta_l_full),
            fmt_f64(self.lambda_max),
            fmt_f64(self.two_over_lr),
            fmt_flag(self.trigger),
            fmt_f64(self.cstar),
            fmt_flag(self.mask_applicable),
            fmt_f64(self.eps_current),
            fmt_f64(self.gamma_val),
            self.gamma_iters_used
                .map(|n| n.to_string())
                .unwrap_or_default(),
            fmt_flag(self.gamma_ok),
        ]
    }

    /// Builds a row from a CSV record by header name.
    ///
    /// Columns absent from older logs (the gamma fields, `mask_applicable`,
    /// `tr_sigma_full`, ...) are tolerated: numbers become NaN, the
    /// applicability mask defaults to true and `gamma_ok` to false. Returns
    /// `None` only when `step` is missing or not an integer.
    fn from_record(columns: &HashMap<String, usize>, record: &StringRecord) -> Option<Self> {
        let cell = |name: &str| columns.get(name).and_then(|&i| record.get(i)).map(str::trim);
        let num = |name: &str| cell(name).map_or(f64::NAN, parse_f64);
        let index = |name: &str| cell(name).and_then(parse_index);
        let flag = |name: &str, default: bool| {
            cell(name)
                .map(parse_f64)
                .filter(|v| !v.is_nan())
                .map_or(default, |v| v >= 0.5)
        };

        Some(Self {
            step: index("step")?,
            epoch: index("epoch").unwrap_or(0),
            batch: index("batch").unwrap_or(0),
            loss: num("loss"),
            r: num("r"),
            r_th: num("r_th"),
            r_th_eff: num("r_th_eff"),
            r_th_gamma_eff: num("r_th_gamma_eff"),
            mu: num("mu"),
            ps_grad_sq: num("ps_grad_sq"),
            tr_ps_sigma: num("tr_ps_sigma"),
            tr_sigma_full: num("tr_sigma_full"),
            grad_norm_sq: num("grad_norm_sq"),
            delta_l_dom: num("deltaL_dom"),
            delta_l_bulk: num("deltaL_bulk"),
            delta_l_full: num("deltaL_full"),
            lambda_max: num("lambda_max"),
            two_over_lr: num("two_over_lr"),
            trigger: flag("trigger", false),
            cstar: num("cstar"),
            mask_applicable: flag("mask_applicable", true),
            eps_current: num("eps_current"),
            gamma_val: num("gamma_val"),
            gamma_iters_used: index("gamma_iters_used"),
            gamma_ok: flag("gamma_ok", false),
        })
    }
}

fn parse_f64(s: &str) -> f64 {
    match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" => f64::INFINITY,
        "-inf" | "-infinity" => f64::NEG_INFINITY,
        other => other.parse().unwrap_or(f64::NAN),
    }
}

/// Integer cell, accepting float spellings such as `12.0`.
fn parse_index(s: &str) -> Option<usize> {
    if let Ok(v) = s.parse::<usize>() {
        return Some(v);
    }
    let v = s.parse::<f64>().ok()?;
    (v.is_finite() && v >= 0.0 && v.fract() == 0.0).then_some(v as usize)
}

/// Streaming writer for `metrics.csv`.
pub struct MetricsWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl MetricsWriter<File> {
    pub fn create(path: &Path) -> Result<Self, InstrumentError> {
        Self::from_writer(File::create(path)?)
    }
}

impl<W: Write> MetricsWriter<W> {
    pub fn from_writer(writer: W) -> Result<Self, InstrumentError> {
        let mut inner = csv::Writer::from_writer(writer);
        inner.write_record(METRICS_COLUMNS)?;
        Ok(Self { inner })
    }

    pub fn write_row(&mut self, row: &MetricsRow) -> Result<(), InstrumentError> {
        self.inner.write_record(row.to_record())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), InstrumentError> {
        self.inner.flush()?;
        Ok(())
    }
}

pub fn read_metrics<R: std::io::Read>(reader: R) -> Result<Vec<MetricsRow>, InstrumentError> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let columns: HashMap<String, usize> = rdr
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), i))
        .collect();
    if !columns.contains_key("step") {
        return Err(InstrumentError::InvalidInput(
            "metrics log has no 'step' column".to_string(),
        ));
    }
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for record in rdr.records() {
        match MetricsRow::from_record(&columns, &record?) {
            Some(row) => rows.push(row),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        log::debug!("skipped {skipped} metrics rows without a valid step");
    }
    Ok(rows)
}

/// Reads a metrics log; a missing file is [`InstrumentError::MissingArtifact`].
pub fn read_metrics_csv(path: &Path) -> Result<Vec<MetricsRow>, InstrumentError> {
    if !path.is_file() {
        return Err(InstrumentError::MissingArtifact {
            path: path.to_path_buf(),
        });
    }
    read_metrics(File::open(path)?)
}

/// Rows the descent bound applies to.
///
/// Drops rows whose applicability mask is off, and rows where both
/// `lambda_max` and `2/eta` are finite but `lambda_max < 2/eta` fails.
pub fn passes_analysis_filter(row: &MetricsRow) -> bool {
    if !row.mask_applicable {
        return false;
    }
    if row.lambda_max.is_finite() && row.two_over_lr.is_finite() {
        return row.lambda_max < row.two_over_lr;
    }
    true
}

pub fn filter_analysis_rows(rows: &[MetricsRow]) -> Vec<MetricsRow> {
    rows.iter().filter(|r| passes_analysis_filter(r)).cloned().collect()
}

/// Labels `deltaL_dom >= 0` and ratio scores `z`, aligned by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledScores {
    pub labels: Vec<bool>,
    pub scores: Vec<f64>,
}

impl LabeledScores {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn truncate(&mut self, n: usize) {
        self.labels.truncate(n);
        self.scores.truncate(n);
    }

    /// `-z`, so that larger means more likely positive.
    pub fn negated_scores(&self) -> Vec<f64> {
        self.scores.iter().map(|z| -z).collect()
    }

    pub fn select(&self, idx: &[usize]) -> LabeledScores {
        LabeledScores {
            labels: idx.iter().map(|&i| self.labels[i]).collect(),
            scores: idx.iter().map(|&i| self.scores[i]).collect(),
        }
    }
}

fn finite_positive(v: f64) -> Option<f64> {
    (v.is_finite() && v > 0.0).then_some(v)
}

/// `z = r / denom` with the first finite positive of `r_th_gamma_eff`,
/// `r_th_eff`, `r_th`. Rows with a non-finite `deltaL_dom`, `r`, or `z`, or no
/// usable denominator, are skipped.
pub fn labels_and_scores(rows: &[MetricsRow]) -> LabeledScores {
    let mut out = LabeledScores::default();
    for row in rows {
        if !row.delta_l_dom.is_finite() {
            continue;
        }
        let Some(denom) = finite_positive(row.r_th_gamma_eff)
            .or_else(|| finite_positive(row.r_th_eff))
            .or_else(|| finite_positive(row.r_th))
        else {
            continue;
        };
        let z = row.r / denom;
        if !row.r.is_finite() || !z.is_finite() {
            continue;
        }
        out.labels.push(row.delta_l_dom >= 0.0);
        out.scores.push(z);
    }
    out
}

/// Labels and `z = r / max(threshold, 1e-12)` for single-run evaluation.
///
/// `threshold` is `r_th_eff` when requested and not NaN, else `r_th`. Rows need
/// finite `r`, threshold, and `deltaL_dom` plus the applicability mask; with
/// `drop_eos` they must also pass [`passes_analysis_filter`], the same row
/// filter the paired procedures use.
pub fn evaluation_inputs(rows: &[MetricsRow], use_effective: bool, drop_eos: bool) -> LabeledScores {
    let mut out = LabeledScores::default();
    for row in rows {
        let threshold = if use_effective && !row.r_th_eff.is_nan() {
            row.r_th_eff
        } else {
            row.r_th
        };
        if !(row.r.is_finite() && threshold.is_finite() && row.delta_l_dom.is_finite()) {
            continue;
        }
        if !row.mask_applicable {
            continue;
        }
        if drop_eos && !passes_analysis_filter(row) {
            continue;
        }
        out.labels.push(row.delta_l_dom >= 0.0);
        out.scores
            .push(row.r / threshold.max(crate::linalg::utils::NORM_FLOOR));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(step: usize) -> MetricsRow {
        MetricsRow {
            step,
            epoch: 0,
            batch: step,
            loss: 1.0,
            r: 0.5,
            r_th: 1.0,
            r_th_eff: 1.0,
            r_th_gamma_eff: f64::NAN,
            mu: 10.0,
            ps_grad_sq: 1.0,
            tr_ps_sigma: 2.0,
            tr_sigma_full: 4.0,
            grad_norm_sq: 3.0,
            delta_l_dom: 0.1,
            delta_l_bulk: -0.1,
            delta_l_full: 0.0,
            lambda_max: 10.0,
            two_over_lr: 20.0,
            trigger: true,
            cstar: f64::NAN,
            mask_applicable: true,
            eps_current: 0.0,
            gamma_val: f64::NAN,
            gamma_iters_used: None,
            gamma_ok: false,
        }
    }

    #[test]
    fn writer_output_reads_back() {
        let mut buf = Vec::new();
        {
            let mut w = MetricsWriter::from_writer(&mut buf).unwrap();
            let mut a = row(0);
            a.r_th = f64::INFINITY;
            a.mask_applicable = false;
            w.write_row(&a).unwrap();
            let mut b = row(1);
            b.gamma_iters_used = Some(3);
            b.gamma_ok = true;
            w.write_row(&b).unwrap();
            w.flush().unwrap();
        }
        let rows = read_metrics(buf.as_slice()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].r_th.is_infinite());
        assert!(!rows[0].mask_applicable);
        assert!(rows[0].r_th_gamma_eff.is_nan());
        assert_eq!(rows[1].gamma_iters_used, Some(3));
        assert!(rows[1].gamma_ok);
    }

    #[test]
    fn legacy_log_without_gamma_columns_is_tolerated() {
        let csv_text = "step,epoch,batch,r,r_th,r_th_eff,deltaL_dom,trigger\n0,0,0,0.2,1.0,1.0,0.5,1\n1.0,0,1,0.3,oops,1.0,-0.5,0\nx,0,2,0.3,1.0,1.0,0.1,0\n";
        let rows = read_metrics(csv_text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].mask_applicable);
        assert!(rows[0].gamma_val.is_nan());
        assert!(rows[1].r_th.is_nan());
        assert_eq!(rows[1].step, 1);
    }

    #[test]
    fn filter_drops_inapplicable_and_unstable_rows() {
        let mut masked = row(0);
        masked.mask_applicable = false;
        let mut unstable = row(1);
        unstable.lambda_max = 25.0;
        let mut untracked = row(2);
        untracked.lambda_max = f64::NAN;
        let kept = filter_analysis_rows(&[masked, unstable, untracked, row(3)]);
        assert_eq!(kept.iter().map(|r| r.step).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn score_denominator_prefers_gamma_then_effective() {
        let mut a = row(0);
        a.r_th_gamma_eff = 0.25;
        let mut b = row(1);
        b.r_th_eff = f64::INFINITY;
        b.r_th = 2.0;
        let mut c = row(2);
        c.r_th_gamma_eff = 0.0;
        c.r_th_eff = 0.0;
        c.r_th = 0.0;
        let ls = labels_and_scores(&[a, b, c]);
        assert_eq!(ls.scores, vec![2.0, 0.25]);
        assert_eq!(ls.labels, vec![true, true]);
    }

    #[test]
    fn evaluation_inputs_honour_drop_eos() {
        let mut unstable = row(0);
        unstable.lambda_max = 25.0;
        assert_eq!(evaluation_inputs(&[unstable.clone()], true, true).len(), 0);
        assert_eq!(evaluation_inputs(&[unstable], true, false).len(), 1);
    }

    #[test]
    fn evaluation_and_analysis_filters_keep_the_same_rows() {
        let mut masked = row(0);
        masked.mask_applicable = false;
        let mut unstable = row(1);
        unstable.lambda_max = 25.0;
        let mut untracked = row(2);
        untracked.lambda_max = f64::NAN;
        let mut no_bound = row(3);
        no_bound.two_over_lr = f64::NAN;
        let rows = [masked, unstable, untracked, no_bound, row(4)];

        let analysis = labels_and_scores(&filter_analysis_rows(&rows));
        let evaluation = evaluation_inputs(&rows, true, true);
        assert_eq!(evaluation.len(), 3);
        assert_eq!(evaluation, analysis);
    }
}
