//! Run directories, their `meta.txt` metadata, and on/off pairing.
//!
//! A run directory is named `20YYMMDD-HHMMSS` and holds `meta.txt` plus a
//! `metrics.csv` log, either at the top level or under `holdout/`.

use crate::records::{MetricsRow, read_metrics_csv};
use crate::types::{InstrumentError, MetaDiff, Variant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta.txt";
pub const METRICS_FILE: &str = "metrics.csv";
pub const SUMMARY_FILE: &str = "metrics_summary.json";
const HOLDOUT_DIR: &str = "holdout";

/// Keys that must agree between the two sides of a pair when both carry them.
pub const REQUIRED_SAME_KEYS: [&str; 6] = ["dataset", "k", "eig_freq", "eval_M", "noise_M", "max_steps"];

/// `key=value` metadata of one run, kept in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    entries: BTreeMap<String, String>,
}

impl RunMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parse_int<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn seed(&self) -> Option<i64> {
        self.parse_int("seed")
    }

    pub fn k(&self) -> Option<usize> {
        self.parse_int("k")
    }

    pub fn gamma_iters(&self) -> Option<usize> {
        self.parse_int("gamma_iters")
    }

    pub fn dataset(&self) -> Option<&str> {
        self.get("dataset")
    }

    pub fn variant(&self) -> Option<Variant> {
        self.get("variant").and_then(|v| v.parse().ok())
    }

    /// Parses `key=value` lines. Blank lines, `#` comments, and lines without
    /// `=` are ignored; keys and values are trimmed.
    pub fn parse(text: &str) -> Self {
        let mut meta = RunMeta::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                meta.insert(k.trim(), v.trim());
            }
        }
        meta
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in self.iter() {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out
    }
}

pub fn read_meta(path: &Path) -> Result<RunMeta, InstrumentError> {
    if !path.is_file() {
        return Err(InstrumentError::MissingArtifact {
            path: path.to_path_buf(),
        });
    }
    Ok(RunMeta::parse(&fs::read_to_string(path)?))
}

pub fn write_meta(path: &Path, meta: &RunMeta) -> Result<(), InstrumentError> {
    fs::write(path, meta.render())?;
    Ok(())
}

/// `20` followed by six digits, `-`, six digits.
pub fn is_run_key(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 15
        && name.starts_with("20")
        && bytes[8] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunDir {
    pub key: String,
    pub path: PathBuf,
    pub meta: RunMeta,
}

impl RunDir {
    /// Directory holding the metrics log: `holdout/` when present.
    pub fn metrics_dir(&self) -> PathBuf {
        let holdout = self.path.join(HOLDOUT_DIR);
        if holdout.join(METRICS_FILE).is_file() {
            holdout
        } else {
            self.path.clone()
        }
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.metrics_dir().join(METRICS_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.metrics_dir().join(SUMMARY_FILE)
    }

    fn has_metrics(&self) -> bool {
        self.metrics_path().is_file()
    }
}

/// Run directories under `root`, newest key first.
///
/// Directories without `meta.txt` or a metrics log are skipped with a warning.
/// A missing root yields no runs.
pub fn discover_runs(root: &Path) -> Result<Vec<RunDir>, InstrumentError> {
    if !root.is_dir() {
        log::warn!("results root {} does not exist", root.display());
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_dir() || !is_run_key(name) {
            continue;
        }
        let meta = match read_meta(&path.join(META_FILE)) {
            Ok(meta) if !meta.is_empty() => meta,
            Ok(_) => {
                log::warn!("skipping {}: empty {META_FILE}", path.display());
                continue;
            }
            Err(err) => {
                log::warn!("skipping {}: {err}", path.display());
                continue;
            }
        };
        let run = RunDir {
            key: name.to_string(),
            path: path.clone(),
            meta,
        };
        if !run.has_metrics() {
            let err = InstrumentError::MissingArtifact {
                path: run.metrics_path(),
            };
            log::warn!("skipping {}: {err}", path.display());
            continue;
        }
        runs.push(run);
    }
    runs.sort_by(|a, b| b.key.cmp(&a.key));
    Ok(runs)
}

/// Which "on" runs are eligible with respect to `gamma_iters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GammaItersPolicy {
    #[default]
    Ignore,
    Exact(usize),
    /// Exact match on `prefer`; runs with no recorded `gamma_iters` are
    /// accepted only when `prefer == legacy`.
    ExactOrLegacy { prefer: usize, legacy: usize },
}

impl GammaItersPolicy {
    fn accepts(&self, variant: Variant, gamma_iters: Option<usize>) -> bool {
        match (self, variant) {
            (GammaItersPolicy::Ignore, _) => true,
            // Off runs never record gamma_iters once a constraint is active.
            (_, Variant::Off) => gamma_iters.is_none(),
            (GammaItersPolicy::Exact(n), Variant::On) => gamma_iters == Some(*n),
            (GammaItersPolicy::ExactOrLegacy { prefer, legacy }, Variant::On) => match gamma_iters {
                Some(g) => g == *prefer,
                None => prefer == legacy,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairFilter {
    pub dataset: Option<String>,
    pub k: Option<usize>,
    /// Restrict to these seeds, in this order. Empty means every seed seen.
    pub seeds: Vec<i64>,
}

impl PairFilter {
    fn admits(&self, meta: &RunMeta) -> bool {
        if let Some(ds) = &self.dataset
            && meta.dataset() != Some(ds.as_str())
        {
            return false;
        }
        if let Some(k) = self.k
            && meta.k() != Some(k)
        {
            return false;
        }
        true
    }
}

/// Required-same keys present on both sides with different values.
pub fn meta_mismatches(on: &RunMeta, off: &RunMeta) -> Vec<MetaDiff> {
    REQUIRED_SAME_KEYS
        .iter()
        .filter_map(|&key| match (on.get(key), off.get(key)) {
            (Some(a), Some(b)) if a != b => Some(MetaDiff {
                key: key.to_string(),
                on: a.to_string(),
                off: b.to_string(),
            }),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunPair {
    pub seed: i64,
    pub on: RunDir,
    pub off: RunDir,
}

impl RunPair {
    /// `k` of the pair, read from the "on" side.
    pub fn k(&self) -> Option<usize> {
        self.on.meta.k()
    }

    /// Logged rows of the "on" and "off" runs.
    pub fn read_rows(&self) -> Result<(Vec<MetricsRow>, Vec<MetricsRow>), InstrumentError> {
        Ok((
            read_metrics_csv(&self.on.metrics_path())?,
            read_metrics_csv(&self.off.metrics_path())?,
        ))
    }
}

#[derive(Debug)]
pub struct SkippedPair {
    pub seed: i64,
    pub reason: InstrumentError,
}

#[derive(Debug, Default)]
pub struct PairingReport {
    pub pairs: Vec<RunPair>,
    pub skipped: Vec<SkippedPair>,
}

fn newest_matching<'a>(
    runs: &'a [RunDir],
    seed: i64,
    variant: Variant,
    filter: &PairFilter,
    policy: &GammaItersPolicy,
) -> Option<&'a RunDir> {
    runs.iter().find(|run| {
        run.meta.variant() == Some(variant)
            && run.meta.seed() == Some(seed)
            && filter.admits(&run.meta)
            && policy.accepts(variant, run.meta.gamma_iters())
    })
}

/// Pairs the newest eligible "on" and "off" runs for each seed.
///
/// `runs` must be newest first, as returned by [`discover_runs`]. Pairs whose
/// required-same metadata disagree are reported in `skipped` with a
/// [`InstrumentError::MetaMismatch`] naming every differing key.
pub fn pair_runs(runs: &[RunDir], filter: &PairFilter, policy: &GammaItersPolicy) -> PairingReport {
    let seeds: Vec<i64> = if filter.seeds.is_empty() {
        let mut seen: Vec<i64> = runs.iter().filter_map(|r| r.meta.seed()).collect();
        seen.sort_unstable();
        seen.dedup();
        seen
    } else {
        filter.seeds.clone()
    };

    let mut report = PairingReport::default();
    for seed in seeds {
        let (Some(on), Some(off)) = (
            newest_matching(runs, seed, Variant::On, filter, policy),
            newest_matching(runs, seed, Variant::Off, filter, policy),
        ) else {
            log::debug!("seed {seed}: no complete on/off pair");
            continue;
        };
        let diffs = meta_mismatches(&on.meta, &off.meta);
        if !diffs.is_empty() {
            let reason = InstrumentError::MetaMismatch { diffs };
            log::warn!(
                "skipping seed {seed} pair ({} vs {}): {reason}",
                on.path.display(),
                off.path.display()
            );
            report.skipped.push(SkippedPair { seed, reason });
            continue;
        }
        report.pairs.push(RunPair {
            seed,
            on: on.clone(),
            off: off.clone(),
        });
    }
    report
}
