use chrono::{Duration, Local};
use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use domsnr::calibration::{
    CalibrationEvent, CalibrationMode, TieBreak, cstar_from_warmup_rows, point_metrics,
};
use domsnr::evaluate::{EvaluationConfig, EvaluationSummary, GridSpacing, GridSpec, evaluate_scores};
use domsnr::monitor::{Monitor, MonitorConfig, StepIndex};
use domsnr::quadratic::{NoiseBatches, NoiseStreamConfig, NoisyQuadratic};
use domsnr::records::{MetricsRow, MetricsWriter, evaluation_inputs, read_metrics_csv};
use domsnr::runs::{GammaItersPolicy, PairFilter, RunPair, discover_runs, pair_runs, write_meta};
use domsnr::sampler::CyclicSampler;
use domsnr::stats::{
    BlockBootstrapConfig, BootstrapConfig, PermutationConfig, bh_fdr, pair_statistics, paired_bootstrap,
    sign_flip_permutation,
};
use domsnr::{baselines, runs};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "domsnr")]
#[command(about = "Dominant-subspace SNR instrumentation and analysis", long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("DOMSNR_BUILD_TIMESTAMP"), ")"))]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Instrument SGD on a synthetic noisy quadratic and log a run directory.
    #[command(alias = "train")]
    Simulate(SimulateArgs),
    /// Summarize one metrics log as PR/ROC/calibration metrics.
    Evaluate(EvaluateArgs),
    /// Compare competing per-step scores on one metrics log.
    Baselines(BaselinesArgs),
    /// Fit c* on one run's warmup and apply it to another run.
    Transfer(TransferArgs),
    /// Paired on/off significance tests across run directories.
    Paired(PairedArgs),
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TieBreakArg {
    FirstMax,
    ClosestToOne,
}

impl From<TieBreakArg> for TieBreak {
    fn from(value: TieBreakArg) -> Self {
        match value {
            TieBreakArg::FirstMax => TieBreak::FirstMax,
            TieBreakArg::ClosestToOne => TieBreak::ClosestToOne,
        }
    }
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// JSON `MonitorConfig`; flags below override its fields.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    #[arg(long = "logdir", default_value = "results")]
    logdir: PathBuf,
    #[arg(long = "steps", default_value_t = 400)]
    steps: usize,
    #[arg(long = "dim", default_value_t = 32)]
    dim: usize,
    /// Largest Hessian eigenvalue; the rest decay geometrically.
    #[arg(long = "top-curvature", default_value_t = 10.0)]
    top_curvature: f64,
    #[arg(long = "decay", default_value_t = 0.7)]
    decay: f64,
    /// Rotate the spectrum by a seeded random orthogonal matrix.
    #[arg(long = "rotate", default_value_t = false)]
    rotate: bool,
    #[arg(long = "noise-std", default_value_t = 0.1)]
    noise_std: f64,
    #[arg(long = "batches-per-epoch", default_value_t = 64)]
    batches_per_epoch: usize,
    #[arg(long = "lr")]
    lr: Option<f64>,
    #[arg(long = "k")]
    k: Option<usize>,
    #[arg(long = "eig-freq")]
    eig_freq: Option<usize>,
    #[arg(long = "noise-m")]
    noise_m: Option<usize>,
    #[arg(long = "eval-m")]
    eval_m: Option<usize>,
    #[arg(long = "ema")]
    ema: Option<f64>,
    #[arg(long = "seed")]
    seed: Option<u64>,
    #[arg(long = "dataset")]
    dataset: Option<String>,
    /// Enable the gamma-corrected threshold ("on" variant).
    #[arg(long = "gamma", default_value_t = false)]
    gamma: bool,
    #[arg(long = "gamma-iters")]
    gamma_iters: Option<usize>,
    #[arg(long = "gamma-freq")]
    gamma_freq: Option<usize>,
    /// Fixed threshold scale used until (or instead of) calibration.
    #[arg(long = "rth-scale")]
    rth_scale: Option<f64>,
    /// Fit c* once over this many warmup steps.
    #[arg(long = "warmup")]
    warmup: Option<usize>,
    /// With --warmup: keep refitting over this many most recent steps.
    #[arg(long = "sliding-window")]
    sliding_window: Option<usize>,
    #[arg(long = "sliding-every", default_value_t = 50)]
    sliding_every: usize,
    /// Comma-separated candidate scales.
    #[arg(long = "c-grid")]
    c_grid: Option<String>,
    #[arg(long = "tie-break", value_enum)]
    tie_break: Option<TieBreakArg>,
    #[arg(long = "skip-intervene", default_value_t = false)]
    skip_intervene: bool,
    #[arg(long = "skip-eos", default_value_t = false)]
    skip_eos: bool,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    metrics: PathBuf,
    /// Output directory for `metrics_summary.json`; defaults to the log's directory.
    #[arg(long = "outdir")]
    outdir: Option<PathBuf>,
    /// Score against `r_th` instead of `r_th_eff`.
    #[arg(long = "no-eff", default_value_t = false)]
    no_eff: bool,
    /// Keep rows at or beyond the edge of stability.
    #[arg(long = "keep-eos", default_value_t = false)]
    keep_eos: bool,
    #[arg(long = "grid-points", default_value_t = 600)]
    grid_points: usize,
    #[arg(long = "grid-qmin", default_value_t = 0.001)]
    grid_qmin: f64,
    #[arg(long = "grid-qmax", default_value_t = 0.999)]
    grid_qmax: f64,
    #[arg(long = "linear-grid", default_value_t = false)]
    linear_grid: bool,
    #[arg(long = "bins", default_value_t = 20)]
    bins: usize,
}

#[derive(Args, Debug)]
struct BaselinesArgs {
    metrics: PathBuf,
    /// JSON output; defaults to `baselines_compare.json` beside the log.
    #[arg(long = "out")]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TransferArgs {
    /// Run whose warmup rows fit c*.
    #[arg(long = "from")]
    from: PathBuf,
    /// Run the fitted c* is applied to.
    #[arg(long = "to")]
    to: PathBuf,
    #[arg(long = "warmup", default_value_t = 200)]
    warmup: usize,
}

#[derive(Args, Debug)]
struct PairedArgs {
    #[arg(long = "root", default_value = "results")]
    root: PathBuf,
    #[arg(long = "dataset")]
    dataset: Option<String>,
    #[arg(long = "k")]
    k: Option<usize>,
    /// Comma-separated seeds; all seeds found when omitted.
    #[arg(long = "seeds")]
    seeds: Option<String>,
    /// Required `gamma_iters` of "on" runs; omitted means any.
    #[arg(long = "prefer-gamma-iters")]
    prefer_gamma_iters: Option<usize>,
    /// Value treated as implied by "on" runs that predate `gamma_iters` logging.
    #[arg(long = "legacy-gamma-iters", default_value_t = 20)]
    legacy_gamma_iters: usize,
    /// Group pairs by k and control the FDR across groups.
    #[arg(long = "by-k", default_value_t = false)]
    by_k: bool,
    #[arg(long = "B", default_value_t = 10_000)]
    b: usize,
    #[arg(long = "boot-seed", default_value_t = 1337)]
    boot_seed: u64,
    #[arg(long = "block-len", default_value_t = 10)]
    block_len: usize,
    #[arg(long = "block-B", default_value_t = 2000)]
    block_b: usize,
    #[arg(long = "R", default_value_t = 20_000)]
    r: usize,
    /// JSON report path; defaults to `<root>/paired_report.json`.
    #[arg(long = "out")]
    out: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => run_simulate(args),
        Command::Evaluate(args) => run_evaluate(args),
        Command::Baselines(args) => run_baselines(args),
        Command::Transfer(args) => run_transfer(args),
        Command::Paired(args) => run_paired(args),
    }
}

fn parse_list<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>, String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().map_err(|_| format!("invalid {what} entry '{s}'")))
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let payload =
        serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode {}: {e}", path.display()))?;
    fs::write(path, payload).map_err(|e| format!("failed to write {}: {e}", path.display()))
}

fn fmt4(v: f64) -> String {
    if v.is_finite() { format!("{v:.4}") } else { "nan".to_string() }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

// ---------------------------------------------------------------- simulate

fn build_monitor_config(args: &SimulateArgs) -> Result<MonitorConfig, String> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
            serde_json::from_str::<MonitorConfig>(&text)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => MonitorConfig::default(),
    };
    if let Some(v) = args.lr {
        cfg.lr = v;
    }
    if let Some(v) = args.k {
        cfg.eigen.k = v;
    }
    if let Some(v) = args.eig_freq {
        cfg.eigen.refresh_every = v;
    }
    if let Some(v) = args.noise_m {
        cfg.noise_samples = v;
    }
    if let Some(v) = args.eval_m {
        cfg.eval_samples = v;
    }
    if let Some(v) = args.ema {
        cfg.ema_beta = v;
    }
    if let Some(v) = args.seed {
        cfg.seed = v;
    }
    if let Some(v) = &args.dataset {
        cfg.dataset = v.clone();
    }
    if args.gamma {
        cfg.gamma.enabled = true;
    }
    if let Some(v) = args.gamma_iters {
        cfg.gamma.iters = v;
    }
    if let Some(v) = args.gamma_freq {
        cfg.gamma.every = v;
    }
    if let Some(v) = args.rth_scale {
        cfg.calibration.fixed_scale = v;
    }
    if let Some(text) = &args.c_grid {
        cfg.calibration.c_grid = parse_list(text, "c grid")?;
    }
    if let Some(v) = args.tie_break {
        cfg.calibration.tie_break = v.into();
    }
    if let Some(warmup_steps) = args.warmup {
        cfg.calibration.mode = match args.sliding_window {
            Some(window) => CalibrationMode::Sliding {
                warmup_steps,
                window,
                update_every: args.sliding_every,
            },
            None => CalibrationMode::Warmup { warmup_steps },
        };
    }
    if args.skip_intervene {
        cfg.intervene = false;
    }
    if args.skip_eos {
        cfg.sharpness.enabled = false;
    }
    Ok(cfg)
}

/// Creates `<logdir>/<YYYYmmdd-HHMMSS>`, bumping the timestamp past any
/// directory that already exists.
fn create_run_dir(logdir: &Path) -> Result<PathBuf, String> {
    fs::create_dir_all(logdir).map_err(|e| format!("failed to create {}: {e}", logdir.display()))?;
    let mut when = Local::now();
    loop {
        let candidate = logdir.join(when.format("%Y%m%d-%H%M%S").to_string());
        if !candidate.exists() {
            fs::create_dir_all(&candidate)
                .map_err(|e| format!("failed to create {}: {e}", candidate.display()))?;
            return Ok(candidate);
        }
        when += Duration::seconds(1);
    }
}

fn write_history(path: &Path, history: &[CalibrationEvent]) -> Result<(), String> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| format!("failed to create {}: {e}", path.display()))?;
    let err = |e: csv::Error| format!("failed to write {}: {e}", path.display());
    wtr.write_record(["step", "c", "f1", "precision", "recall", "tp", "fp", "fn", "tn"])
        .map_err(err)?;
    for ev in history {
        let s = &ev.selection;
        wtr.write_record([
            ev.step.to_string(),
            s.c.to_string(),
            s.f1.to_string(),
            s.precision.to_string(),
            s.recall.to_string(),
            s.tp.to_string(),
            s.fp.to_string(),
            s.fn_.to_string(),
            s.tn.to_string(),
        ])
        .map_err(err)?;
    }
    wtr.flush().map_err(|e| format!("failed to flush {}: {e}", path.display()))
}

fn run_simulate(args: SimulateArgs) -> Result<(), String> {
    let cfg = build_monitor_config(&args)?;
    if args.dim == 0 {
        return Err("--dim must be positive".to_string());
    }
    let spectrum: Vec<f64> = (0..args.dim)
        .map(|i| args.top_curvature * args.decay.powi(i as i32))
        .collect();
    let objective = if args.rotate {
        NoisyQuadratic::rotated(&spectrum, cfg.seed).map_err(|e| format!("failed to build objective: {e}"))?
    } else {
        NoisyQuadratic::diagonal(&spectrum)
    };
    let stream = NoiseStreamConfig {
        batches_per_epoch: args.batches_per_epoch,
        noise_std: args.noise_std,
        seed: cfg.seed,
    };
    let batches_per_epoch = args.batches_per_epoch.max(1);
    let mut data = CyclicSampler::new(
        NoiseBatches::new(args.dim, stream).map_err(|e| format!("invalid noise stream: {e}"))?,
    );
    let mut monitor =
        Monitor::new(cfg.clone(), args.dim).map_err(|e| format!("invalid monitor config: {e}"))?;

    let run_dir = create_run_dir(&args.logdir)?;
    write_meta(&run_dir.join(runs::META_FILE), &cfg.run_meta(args.steps))
        .map_err(|e| format!("failed to write meta: {e}"))?;
    write_json(&run_dir.join("config.json"), &cfg)?;
    let mut writer = MetricsWriter::create(&run_dir.join(runs::METRICS_FILE))
        .map_err(|e| format!("failed to open metrics log: {e}"))?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut w: Array1<f64> = Array1::from_shape_simple_fn(args.dim, || StandardNormal.sample(&mut rng));
    let mut triggers = 0usize;
    for step in 0..args.steps {
        let batch = data.draw().map_err(|e| format!("data stream failed: {e}"))?;
        let index = StepIndex {
            epoch: step / batches_per_epoch,
            batch: step % batches_per_epoch,
        };
        let outcome = monitor
            .observe_step(&objective, w.view(), &batch, &mut data, index)
            .map_err(|e| format!("step {step} failed: {e}"))?;
        if let Some(sel) = outcome.calibration {
            println!("[auto r_th scale] step {step}: c*={:.3} with F1={:.3}", sel.c, sel.f1);
        }
        triggers += usize::from(outcome.row.trigger);
        writer
            .write_row(&outcome.row)
            .map_err(|e| format!("failed to log step {step}: {e}"))?;
        w.scaled_add(-cfg.lr, &outcome.grad);
    }
    writer.flush().map_err(|e| format!("failed to flush metrics log: {e}"))?;

    if let Some(sel) = monitor.calibrator().selection() {
        write_json(&run_dir.join("cstar.json"), sel)?;
    }
    let history = monitor.calibrator().history();
    if matches!(cfg.calibration.mode, CalibrationMode::Sliding { .. }) && !history.is_empty() {
        write_history(&run_dir.join("cstar_history.csv"), history)?;
    }
    let failures = monitor.gamma_failures();
    if !failures.is_empty() {
        let path = run_dir.join("gamma_failures.csv");
        let mut wtr =
            csv::Writer::from_path(&path).map_err(|e| format!("failed to create {}: {e}", path.display()))?;
        for f in failures {
            wtr.serialize(f)
                .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        }
        wtr.flush().map_err(|e| format!("failed to flush {}: {e}", path.display()))?;
    }

    println!(
        "{} steps, {} triggers, {} gamma failures (logs: {})",
        args.steps,
        triggers,
        failures.len(),
        run_dir.display()
    );
    Ok(())
}

// ---------------------------------------------------------------- evaluate

fn summarize_rows(rows: &[MetricsRow], config: &EvaluationConfig) -> Result<EvaluationSummary, String> {
    let inputs = evaluation_inputs(rows, config.use_effective_threshold, config.drop_eos);
    evaluate_scores(&inputs.labels, &inputs.scores, config).map_err(|e| format!("evaluation failed: {e}"))
}

fn print_summary(summary: &EvaluationSummary) {
    let mut table = new_table(vec!["metric", "value"]);
    for (name, value) in [
        ("PR-AUC", summary.pr_auc),
        ("ROC-AUC", summary.roc_auc),
        ("prevalence", summary.prevalence),
        ("normalized AUPRC", summary.normalized_auprc),
        ("AUPRG", summary.auprg),
        ("ECE (rank)", summary.ece_rank),
        ("precision @ z<=1", summary.cm_at_threshold_1.precision),
        ("recall @ z<=1", summary.cm_at_threshold_1.recall),
    ] {
        table.add_row(Row::from(vec![Cell::new(name), Cell::new(fmt4(value))]));
    }
    println!("{table}");
}

fn run_evaluate(args: EvaluateArgs) -> Result<(), String> {
    let rows = read_metrics_csv(&args.metrics).map_err(|e| e.to_string())?;
    let config = EvaluationConfig {
        grid: GridSpec::Quantile {
            q_lo: args.grid_qmin,
            q_hi: args.grid_qmax,
            points: args.grid_points,
            spacing: if args.linear_grid {
                GridSpacing::Linear
            } else {
                GridSpacing::Log
            },
            fallback: (1e-4, 10.0),
        },
        reliability_bins: args.bins,
        use_effective_threshold: !args.no_eff,
        drop_eos: !args.keep_eos,
    };
    let summary = summarize_rows(&rows, &config)?;
    let outdir = args
        .outdir
        .or_else(|| args.metrics.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&outdir).map_err(|e| format!("failed to create {}: {e}", outdir.display()))?;
    let out = outdir.join(runs::SUMMARY_FILE);
    write_json(&out, &summary)?;
    print_summary(&summary);
    println!("WROTE {}", out.display());
    Ok(())
}

// ---------------------------------------------------------------- baselines

fn run_baselines(args: BaselinesArgs) -> Result<(), String> {
    let rows = read_metrics_csv(&args.metrics).map_err(|e| e.to_string())?;
    let results = baselines::compare_baselines(&rows).map_err(|e| format!("baseline comparison failed: {e}"))?;
    let mut table = new_table(vec!["score", "direction", "n", "AUPRC", "normAUPRC"]);
    for b in &results {
        table.add_row(Row::from(vec![
            Cell::new(b.name),
            Cell::new(format!("{:?}", b.direction)),
            Cell::new(b.n),
            Cell::new(fmt4(b.pr_auc)),
            Cell::new(fmt4(b.normalized_auprc)),
        ]));
    }
    println!("{table}");
    let out = args.out.unwrap_or_else(|| {
        args.metrics
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
            .join("baselines_compare.json")
    });
    write_json(&out, &results)?;
    println!("WROTE {}", out.display());
    Ok(())
}

// ---------------------------------------------------------------- transfer

fn run_transfer(args: TransferArgs) -> Result<(), String> {
    let from_rows = read_metrics_csv(&args.from).map_err(|e| e.to_string())?;
    let to_rows = read_metrics_csv(&args.to).map_err(|e| e.to_string())?;
    let Some(cstar) = cstar_from_warmup_rows(&from_rows, args.warmup) else {
        println!("No usable warmup rows in {} (need at least 5).", args.from.display());
        return Ok(());
    };
    let Some(pm) = point_metrics(&to_rows, cstar) else {
        println!("No scorable rows in {}.", args.to.display());
        return Ok(());
    };
    let mut table = new_table(vec!["c*", "precision", "recall", "F1", "prevalence", "tp", "fp", "fn", "tn"]);
    table.add_row(Row::from(vec![
        Cell::new(fmt4(cstar)),
        Cell::new(fmt4(pm.precision)),
        Cell::new(fmt4(pm.recall)),
        Cell::new(fmt4(pm.f1)),
        Cell::new(fmt4(pm.prevalence)),
        Cell::new(pm.confusion.tp),
        Cell::new(pm.confusion.fp),
        Cell::new(pm.confusion.fn_),
        Cell::new(pm.confusion.tn),
    ]));
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------- paired

#[derive(Debug, Serialize)]
struct PairRecord {
    seed: i64,
    k: Option<usize>,
    on_dir: String,
    off_dir: String,
    norm_auprc_on: f64,
    norm_auprc_off: f64,
    /// Normalized-AUPRC difference over the aligned per-step rows.
    step_diff: f64,
    block_ci_lo: f64,
    block_ci_hi: f64,
}

#[derive(Debug, Serialize)]
struct SkipRecord {
    seed: i64,
    k: Option<usize>,
    reason: String,
}

#[derive(Debug, Serialize)]
struct GroupReport {
    k: Option<usize>,
    n_pairs: usize,
    mean_on: f64,
    mean_off: f64,
    mean_diff: f64,
    ci_lo: f64,
    ci_hi: f64,
    p_boot: f64,
    q_bh: Option<f64>,
    p_perm: f64,
    pairs: Vec<PairRecord>,
}

/// Statistics of every pair that can be scored; the rest land in `skipped`.
fn analyze_pairs(
    k: Option<usize>,
    pairs: &[RunPair],
    args: &PairedArgs,
    skipped: &mut Vec<SkipRecord>,
) -> Result<Option<GroupReport>, String> {
    let block_cfg = BlockBootstrapConfig {
        block_len: args.block_len,
        b: args.block_b,
        seed: args.boot_seed,
    };
    let mut records = Vec::new();
    for pair in pairs {
        let stats = match pair
            .read_rows()
            .and_then(|(on_rows, off_rows)| pair_statistics(&on_rows, &off_rows, &block_cfg))
        {
            Ok(stats) => stats,
            Err(err) => {
                log::warn!("seed {}: pair skipped: {err}", pair.seed);
                println!("SKIP seed {}: {err}", pair.seed);
                skipped.push(SkipRecord {
                    seed: pair.seed,
                    k: pair.k(),
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if (stats.norm_auprc_on - stats.norm_auprc_off).abs() < 1e-6 {
            log::warn!("seed {}: on/off normalized AUPRC are identical; check the pairing", pair.seed);
        }
        records.push(PairRecord {
            seed: pair.seed,
            k: pair.k(),
            on_dir: pair.on.path.display().to_string(),
            off_dir: pair.off.path.display().to_string(),
            norm_auprc_on: stats.norm_auprc_on,
            norm_auprc_off: stats.norm_auprc_off,
            step_diff: stats.step_diff,
            block_ci_lo: stats.block.ci_lo,
            block_ci_hi: stats.block.ci_hi,
        });
    }
    if records.is_empty() {
        return Ok(None);
    }
    let vals_on: Vec<f64> = records.iter().map(|r| r.norm_auprc_on).collect();
    let vals_off: Vec<f64> = records.iter().map(|r| r.norm_auprc_off).collect();
    let step_diffs: Vec<f64> = records.iter().map(|r| r.step_diff).collect();
    let boot = paired_bootstrap(
        &vals_on,
        &vals_off,
        &BootstrapConfig {
            b: args.b,
            seed: args.boot_seed,
        },
    )
    .map_err(|e| format!("paired bootstrap failed: {e}"))?;
    let perm = sign_flip_permutation(
        &step_diffs,
        &PermutationConfig {
            r: args.r,
            seed: args.boot_seed,
        },
    );
    let n = records.len() as f64;
    Ok(Some(GroupReport {
        k,
        n_pairs: records.len(),
        mean_on: vals_on.iter().sum::<f64>() / n,
        mean_off: vals_off.iter().sum::<f64>() / n,
        mean_diff: boot.mean_diff,
        ci_lo: boot.ci_lo,
        ci_hi: boot.ci_hi,
        p_boot: boot.p_value,
        q_bh: None,
        p_perm: perm.p_value,
        pairs: records,
    }))
}

#[derive(Debug, Serialize)]
struct PairedReport {
    groups: Vec<GroupReport>,
    skipped: Vec<SkipRecord>,
}

fn run_paired(args: PairedArgs) -> Result<(), String> {
    let runs = discover_runs(&args.root).map_err(|e| format!("failed to scan {}: {e}", args.root.display()))?;
    let seeds = match &args.seeds {
        Some(text) => parse_list::<i64>(text, "seed")?,
        None => Vec::new(),
    };
    let policy = match args.prefer_gamma_iters {
        Some(prefer) => GammaItersPolicy::ExactOrLegacy {
            prefer,
            legacy: args.legacy_gamma_iters,
        },
        None => GammaItersPolicy::Ignore,
    };
    let ks: Vec<Option<usize>> = if args.by_k {
        let found: BTreeSet<usize> = runs
            .iter()
            .filter(|r| args.dataset.as_deref().is_none_or(|ds| r.meta.dataset() == Some(ds)))
            .filter_map(|r| r.meta.k())
            .filter(|k| args.k.is_none_or(|want| want == *k))
            .collect();
        found.into_iter().map(Some).collect()
    } else {
        vec![args.k]
    };

    let mut groups = Vec::new();
    let mut skipped = Vec::new();
    for k in ks {
        let filter = PairFilter {
            dataset: args.dataset.clone(),
            k,
            seeds: seeds.clone(),
        };
        let report = pair_runs(&runs, &filter, &policy);
        for skip in report.skipped {
            println!("SKIP seed {}: {}", skip.seed, skip.reason);
            skipped.push(SkipRecord {
                seed: skip.seed,
                k,
                reason: skip.reason.to_string(),
            });
        }
        if let Some(group) = analyze_pairs(k, &report.pairs, &args, &mut skipped)? {
            groups.push(group);
        }
    }

    if groups.is_empty() {
        println!("No matched pairs found.");
        return Ok(());
    }

    if args.by_k {
        let pvals: Vec<f64> = groups.iter().map(|g| g.p_boot).collect();
        for (group, q) in groups.iter_mut().zip(bh_fdr(&pvals)) {
            group.q_bh = Some(q);
        }
    }

    let mut table = new_table(vec![
        "k", "pairs", "mean on", "mean off", "mean(on-off)", "95% CI", "p_boot", "q_BH", "p_perm",
    ]);
    for g in &groups {
        table.add_row(Row::from(vec![
            Cell::new(g.k.map_or("all".to_string(), |k| k.to_string())),
            Cell::new(g.n_pairs),
            Cell::new(fmt4(g.mean_on)),
            Cell::new(fmt4(g.mean_off)),
            Cell::new(format!("{:+.4}", g.mean_diff)),
            Cell::new(format!("[{:+.4}, {:+.4}]", g.ci_lo, g.ci_hi)),
            Cell::new(fmt4(g.p_boot)),
            Cell::new(g.q_bh.map_or("-".to_string(), fmt4)),
            Cell::new(fmt4(g.p_perm)),
        ]));
    }
    println!("{table}");

    let mut pair_table = new_table(vec!["k", "seed", "on", "off", "diff", "step diff", "block 95% CI"]);
    for g in &groups {
        for p in &g.pairs {
            pair_table.add_row(Row::from(vec![
                Cell::new(p.k.map_or("-".to_string(), |k| k.to_string())),
                Cell::new(p.seed),
                Cell::new(fmt4(p.norm_auprc_on)),
                Cell::new(fmt4(p.norm_auprc_off)),
                Cell::new(format!("{:+.4}", p.norm_auprc_on - p.norm_auprc_off)),
                Cell::new(format!("{:+.4}", p.step_diff)),
                Cell::new(format!("[{:+.4}, {:+.4}]", p.block_ci_lo, p.block_ci_hi)),
            ]));
        }
    }
    println!("{pair_table}");
    if !skipped.is_empty() {
        println!("{} pair(s) skipped", skipped.len());
    }

    let out = args.out.clone().unwrap_or_else(|| args.root.join("paired_report.json"));
    write_json(&out, &PairedReport { groups, skipped })?;
    println!("WROTE {}", out.display());
    Ok(())
}
