//! Resampling tests for paired on/off comparisons.
//!
//! Every procedure seeds its own `StdRng` so results depend only on the seed
//! and the order of the inputs.

use crate::evaluate::normalized_auprc_exact;
use crate::linalg::utils::{KahanSum, kahan_mean};
use crate::records::{LabeledScores, MetricsRow, filter_analysis_rows, labels_and_scores};
use crate::types::InstrumentError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

fn default_bootstrap_b() -> usize {
    10_000
}

fn default_bootstrap_seed() -> u64 {
    1337
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_bootstrap_b")]
    pub b: usize,
    #[serde(default = "default_bootstrap_seed")]
    pub seed: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            b: default_bootstrap_b(),
            seed: default_bootstrap_seed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairedBootstrap {
    pub n_pairs: usize,
    pub mean_diff: f64,
    pub ci_lo: f64,
    pub ci_hi: f64,
    pub p_value: f64,
}

/// Percentile bootstrap of the mean paired difference `on - off`.
///
/// The interval is `[boots[floor(0.025 B)], boots[floor(0.975 B)]]` of the
/// sorted resampled means. The two-sided p-value is twice the share of means
/// on the far side of zero from the observed mean, floored at `1/B` and capped
/// at 1.
pub fn paired_bootstrap(
    on: &[f64],
    off: &[f64],
    config: &BootstrapConfig,
) -> Result<PairedBootstrap, InstrumentError> {
    if on.len() != off.len() {
        return Err(InstrumentError::DimensionMismatch(format!(
            "paired bootstrap needs equal-length inputs, got {} and {}",
            on.len(),
            off.len()
        )));
    }
    if on.is_empty() {
        return Err(InstrumentError::DegenerateInput(
            "paired bootstrap needs at least one pair".to_string(),
        ));
    }
    if config.b == 0 {
        return Err(InstrumentError::InvalidInput(
            "bootstrap replicate count must be positive".to_string(),
        ));
    }
    let diffs: Vec<f64> = on.iter().zip(off).map(|(a, b)| a - b).collect();
    let n = diffs.len();
    let mean_diff = kahan_mean(diffs.iter().copied()).unwrap_or(f64::NAN);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut boots = Vec::with_capacity(config.b);
    for _ in 0..config.b {
        let mut acc = KahanSum::default();
        for _ in 0..n {
            acc.add(diffs[rng.random_range(0..n)]);
        }
        boots.push(acc.sum() / n as f64);
    }
    boots.sort_by(f64::total_cmp);

    let b = config.b;
    let lo_idx = ((0.025 * b as f64) as usize).min(b - 1);
    let hi_idx = ((0.975 * b as f64) as usize).min(b - 1);
    let opposite = if mean_diff >= 0.0 {
        boots.iter().filter(|&&m| m <= 0.0).count()
    } else {
        boots.iter().filter(|&&m| m >= 0.0).count()
    };
    let frac = opposite as f64 / b as f64;
    let p_value = (frac.max(1.0 / b as f64) * 2.0).min(1.0);

    Ok(PairedBootstrap {
        n_pairs: n,
        mean_diff,
        ci_lo: boots[lo_idx],
        ci_hi: boots[hi_idx],
        p_value,
    })
}

fn default_block_len() -> usize {
    10
}

fn default_block_b() -> usize {
    2000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBootstrapConfig {
    #[serde(default = "default_block_len")]
    pub block_len: usize,
    #[serde(default = "default_block_b")]
    pub b: usize,
    #[serde(default = "default_bootstrap_seed")]
    pub seed: u64,
}

impl Default for BlockBootstrapConfig {
    fn default() -> Self {
        Self {
            block_len: default_block_len(),
            b: default_block_b(),
            seed: default_bootstrap_seed(),
        }
    }
}

/// `ceil(n / L)` circular blocks of length `L` with uniform starts, truncated
/// to `n` indices. Empty when `n == 0` or `L == 0`.
pub fn circular_block_indices<R: Rng + ?Sized>(n: usize, block_len: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || block_len == 0 {
        return Vec::new();
    }
    let blocks = n.div_ceil(block_len);
    let mut idx = Vec::with_capacity(blocks * block_len);
    for _ in 0..blocks {
        let start = rng.random_range(0..n);
        idx.extend((0..block_len).map(|b| (start + b) % n));
    }
    idx.truncate(n);
    idx
}

/// Lower and upper percentile bounds at `floor((α/2)(n-1))` and
/// `ceil((1-α/2)(n-1))` of the sorted samples. NaN pair when empty.
pub fn percentile_ci(samples: &[f64], alpha: f64) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mut xs = samples.to_vec();
    xs.sort_by(f64::total_cmp);
    let last = (xs.len() - 1) as f64;
    let lo = ((alpha / 2.0) * last).floor() as usize;
    let hi = ((1.0 - alpha / 2.0) * last).ceil() as usize;
    (xs[lo.min(xs.len() - 1)], xs[hi.min(xs.len() - 1)])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockBootstrap {
    pub n: usize,
    pub obs_diff: f64,
    pub ci_lo: f64,
    pub ci_hi: f64,
    #[serde(skip)]
    pub diffs: Vec<f64>,
}

fn norm_auprc(scores: &LabeledScores) -> f64 {
    normalized_auprc_exact(&scores.labels, &scores.negated_scores())
}

/// Moving-block bootstrap of the normalized-AUPRC difference between two
/// aligned per-step sequences. The same block indices are applied to both
/// sides. Sequences are truncated to their common length first.
pub fn moving_block_bootstrap(
    on: &LabeledScores,
    off: &LabeledScores,
    config: &BlockBootstrapConfig,
) -> BlockBootstrap {
    let n = on.len().min(off.len());
    let mut on = on.clone();
    let mut off = off.clone();
    on.truncate(n);
    off.truncate(n);
    if n == 0 {
        return BlockBootstrap {
            n,
            obs_diff: f64::NAN,
            ci_lo: f64::NAN,
            ci_hi: f64::NAN,
            diffs: Vec::new(),
        };
    }
    let obs_diff = norm_auprc(&on) - norm_auprc(&off);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let diffs: Vec<f64> = (0..config.b)
        .map(|_| {
            let idx = circular_block_indices(n, config.block_len, &mut rng);
            norm_auprc(&on.select(&idx)) - norm_auprc(&off.select(&idx))
        })
        .collect();
    let finite: Vec<f64> = diffs.iter().copied().filter(|d| d.is_finite()).collect();
    let (ci_lo, ci_hi) = percentile_ci(&finite, 0.05);
    BlockBootstrap {
        n,
        obs_diff,
        ci_lo,
        ci_hi,
        diffs,
    }
}

/// Aligned per-step scores of a pair: shared filter, truncate to the common
/// length, build labels and scores, truncate again.
pub fn aligned_pair_scores(on_rows: &[MetricsRow], off_rows: &[MetricsRow]) -> (LabeledScores, LabeledScores) {
    let mut on_f = filter_analysis_rows(on_rows);
    let mut off_f = filter_analysis_rows(off_rows);
    let n = on_f.len().min(off_f.len());
    on_f.truncate(n);
    off_f.truncate(n);
    let mut on = labels_and_scores(&on_f);
    let mut off = labels_and_scores(&off_f);
    let m = on.len().min(off.len());
    on.truncate(m);
    off.truncate(m);
    (on, off)
}

/// Normalized AUPRC of one whole run under the shared row filter; the
/// per-run statistic of the across-run bootstrap.
pub fn run_norm_auprc(rows: &[MetricsRow]) -> Result<f64, InstrumentError> {
    let scores = labels_and_scores(&filter_analysis_rows(rows));
    if scores.is_empty() {
        return Err(InstrumentError::DegenerateInput(
            "no scored rows after filtering".to_string(),
        ));
    }
    let value = norm_auprc(&scores);
    if !value.is_finite() {
        return Err(InstrumentError::DegenerateInput(format!(
            "normalized AUPRC is {value}"
        )));
    }
    Ok(value)
}

/// Everything the paired analysis needs from one matched on/off pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairStatistics {
    pub norm_auprc_on: f64,
    pub norm_auprc_off: f64,
    /// Normalized-AUPRC difference over the aligned per-step rows.
    pub step_diff: f64,
    pub block: BlockBootstrap,
}

/// Per-run and per-step statistics of one pair, all built from rows that
/// passed [`filter_analysis_rows`]. A side with nothing left to score is a
/// `DegenerateInput` error so callers can skip the pair.
pub fn pair_statistics(
    on_rows: &[MetricsRow],
    off_rows: &[MetricsRow],
    block: &BlockBootstrapConfig,
) -> Result<PairStatistics, InstrumentError> {
    let norm_auprc_on = run_norm_auprc(on_rows)?;
    let norm_auprc_off = run_norm_auprc(off_rows)?;
    let (on, off) = aligned_pair_scores(on_rows, off_rows);
    if on.is_empty() {
        return Err(InstrumentError::DegenerateInput(
            "no aligned rows shared by the on and off runs".to_string(),
        ));
    }
    let step_diff = norm_auprc(&on) - norm_auprc(&off);
    let block = moving_block_bootstrap(&on, &off, block);
    Ok(PairStatistics {
        norm_auprc_on,
        norm_auprc_off,
        step_diff,
        block,
    })
}

fn default_permutation_r() -> usize {
    20_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationConfig {
    #[serde(default = "default_permutation_r")]
    pub r: usize,
    #[serde(default = "default_bootstrap_seed")]
    pub seed: u64,
}

impl Default for PermutationConfig {
    fn default() -> Self {
        Self {
            r: default_permutation_r(),
            seed: default_bootstrap_seed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PermutationResult {
    pub n_pairs: usize,
    pub observed_mean: f64,
    pub p_value: f64,
}

/// Two-sided sign-flip test on the mean paired difference, `(count+1)/(R+1)`.
///
/// Non-finite differences are dropped; with none left the result is NaN.
pub fn sign_flip_permutation(diffs: &[f64], config: &PermutationConfig) -> PermutationResult {
    let finite: Vec<f64> = diffs.iter().copied().filter(|d| d.is_finite()).collect();
    let Some(obs) = kahan_mean(finite.iter().copied()) else {
        return PermutationResult {
            n_pairs: 0,
            observed_mean: f64::NAN,
            p_value: f64::NAN,
        };
    };
    let n = finite.len() as f64;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut count = 0usize;
    for _ in 0..config.r {
        let mut acc = KahanSum::default();
        for &d in &finite {
            acc.add(if rng.random_bool(0.5) { d } else { -d });
        }
        if (acc.sum() / n).abs() >= obs.abs() {
            count += 1;
        }
    }
    PermutationResult {
        n_pairs: finite.len(),
        observed_mean: obs,
        p_value: (count + 1) as f64 / (config.r + 1) as f64,
    }
}

/// Benjamini-Hochberg q-values, returned in input order and capped at 1.
pub fn bh_fdr(pvals: &[f64]) -> Vec<f64> {
    let m = pvals.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| pvals[a].total_cmp(&pvals[b]));
    let mut q = vec![0.0; m];
    let mut running = 1.0_f64;
    for (pos, &i) in order.iter().enumerate().rev() {
        let rank = (pos + 1) as f64;
        running = running.min(pvals[i] * m as f64 / rank);
        q[i] = running.min(1.0);
    }
    q
}
