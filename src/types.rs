use crate::faer_ndarray::FaerLinalgError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Crate-wide error type for the instrumentation and analysis pipeline.
///
/// Numeric degeneracies (near-zero denominators, inapplicable thresholds) are
/// not errors; they resolve to floors or explicit infinities at the call site.
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operator produced an unusable result: {0}")]
    OperatorFailure(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("Missing artifact: {}", .path.display())]
    MissingArtifact { path: PathBuf },

    #[error("Run metadata mismatch: {}", describe_mismatches(.diffs))]
    MetaMismatch { diffs: Vec<MetaDiff> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One metadata key whose value differs between the two sides of a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDiff {
    pub key: String,
    pub on: String,
    pub off: String,
}

fn describe_mismatches(diffs: &[MetaDiff]) -> String {
    diffs
        .iter()
        .map(|d| format!("{} (on={}, off={})", d.key, d.on, d.off))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Gamma-correction arm of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    On,
    Off,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::On => "on",
            Variant::Off => "off",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "on" => Ok(Variant::On),
            "off" => Ok(Variant::Off),
            other => Err(InstrumentError::InvalidInput(format!(
                "variant must be 'on' or 'off', got '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_mismatch_message_names_every_key() {
        let err = InstrumentError::MetaMismatch {
            diffs: vec![
                MetaDiff {
                    key: "k".into(),
                    on: "1".into(),
                    off: "2".into(),
                },
                MetaDiff {
                    key: "noise_M".into(),
                    on: "8".into(),
                    off: "4".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("k (on=1, off=2)"));
        assert!(msg.contains("noise_M (on=8, off=4)"));
    }

    #[test]
    fn variant_parses_and_rejects_unknown() {
        assert_eq!("on".parse::<Variant>().unwrap(), Variant::On);
        assert_eq!(" off ".parse::<Variant>().unwrap(), Variant::Off);
        assert!("both".parse::<Variant>().is_err());
    }
}
