pub mod linalg {
    pub mod faer_ndarray;
    pub mod utils;
}

pub mod baselines;
pub mod calibration;
pub mod eigen;
pub mod ema;
pub mod evaluate;
pub mod gamma;
pub mod intervene;
pub mod monitor;
pub mod operator;
pub mod quadratic;
pub mod records;
pub mod runs;
pub mod sampler;
pub mod snr;
pub mod stats;
pub mod subspace;
pub mod types;

pub use linalg::faer_ndarray;

pub use baselines::{BASELINES, BaselineScore, BaselineSpec, compare_baselines, evaluate_baseline};
pub use calibration::{
    CalibrationConfig, CalibrationMode, CalibrationRecord, PointMetrics, ScaleCalibrator,
    ScaleSelection, TieBreak, compute_best_c_scale, cstar_from_warmup_rows, point_metrics,
};
pub use eigen::{EigenConfig, EigenOrdering, EigenPairs, SharpnessConfig, power_max_eig, topk_power};
pub use ema::{Ema, trigger_decision};
pub use evaluate::{
    Confusion, EvaluationConfig, EvaluationSummary, GridSpacing, GridSpec, PrRocCurve,
    SweepDirection, evaluate_scores, normalized_auprc, normalized_auprc_exact, pr_roc_sweep,
    precision_recall_auc_exact,
};
pub use gamma::{
    GammaConfig, GammaEstimate, GammaOutcome, estimate_gamma, gamma_power, mu_eff_gamma_k1,
    principal_angle_max,
};
pub use intervene::{Candidate, InterventionDeltas, candidate_update, delta_loss, delta_loss_multi_batch};
pub use monitor::{GammaFailure, Monitor, MonitorConfig, StepIndex, StepOutcome};
pub use operator::{
    CountingOperator, DenseOperator, FiniteDifferenceHvp, FnOperator, GradientOracle, LinearOperator,
};
pub use quadratic::{NoiseBatches, NoiseStreamConfig, NoisyQuadratic};
pub use records::{LabeledScores, MetricsRow, MetricsWriter, read_metrics, read_metrics_csv};
pub use runs::{GammaItersPolicy, PairFilter, RunDir, RunMeta, RunPair, discover_runs, pair_runs};
pub use sampler::{BatchSource, CyclicSampler, VecSource};
pub use snr::{ThresholdOutcome, applicability_threshold, r_and_threshold};
pub use stats::{
    BlockBootstrapConfig, BootstrapConfig, PairStatistics, PermutationConfig, bh_fdr,
    moving_block_bootstrap, pair_statistics, paired_bootstrap, run_norm_auprc, sign_flip_permutation,
};
pub use subspace::{Projector, ProjectorKind, SubspaceBasis};
pub use types::{InstrumentError, MetaDiff, Variant};
