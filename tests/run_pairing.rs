use domsnr::records::{MetricsRow, MetricsWriter};
use domsnr::runs::{
    GammaItersPolicy, META_FILE, METRICS_FILE, PairFilter, discover_runs, pair_runs, read_meta,
};
use domsnr::stats::{BlockBootstrapConfig, BootstrapConfig, pair_statistics, paired_bootstrap};
use domsnr::types::InstrumentError;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_metrics(dir: &Path, steps: usize) {
    write_metrics_with(dir, steps, true);
}

fn write_metrics_with(dir: &Path, steps: usize, applicable: bool) {
    fs::create_dir_all(dir).unwrap();
    let mut writer = MetricsWriter::create(&dir.join(METRICS_FILE)).unwrap();
    for step in 0..steps {
        let row = MetricsRow {
            step,
            r: 0.1 * step as f64,
            r_th: 1.0,
            r_th_eff: 1.0,
            delta_l_dom: if step % 2 == 0 { 0.01 } else { -0.01 },
            mask_applicable: applicable,
            ..MetricsRow::default()
        };
        writer.write_row(&row).unwrap();
    }
    writer.flush().unwrap();
}

fn make_run(root: &Path, key: &str, meta: &str) {
    let dir = root.join(key);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(META_FILE), meta).unwrap();
    write_metrics(&dir, 6);
}

#[test]
fn discovery_orders_newest_first_and_skips_incomplete_dirs() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    make_run(root, "20240101-000000", "seed=1\nvariant=on\n");
    make_run(root, "20240301-000000", "seed=1\nvariant=off\n");
    // No meta.txt.
    write_metrics(&root.join("20240201-000000"), 3);
    // Not a run key.
    make_run(root, "scratch", "seed=1\nvariant=on\n");
    // Meta but no metrics log.
    fs::create_dir_all(root.join("20240401-000000")).unwrap();
    fs::write(root.join("20240401-000000").join(META_FILE), "seed=9\n").unwrap();

    let runs = discover_runs(root).unwrap();
    let keys: Vec<&str> = runs.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["20240301-000000", "20240101-000000"]);
    assert!(discover_runs(&root.join("missing")).unwrap().is_empty());
}

#[test]
fn holdout_metrics_take_precedence() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    make_run(root, "20240101-000000", "seed=1\nvariant=on\n");
    write_metrics(&root.join("20240101-000000").join("holdout"), 2);
    let runs = discover_runs(root).unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].metrics_path().ends_with("holdout/metrics.csv"));
    assert!(runs[0].summary_path().ends_with("holdout/metrics_summary.json"));
}

#[test]
fn pairs_newest_runs_and_reports_mismatched_metadata() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let common = "dataset=cifar10\nk=1\neig_freq=50\neval_M=1\nnoise_M=8\nmax_steps=100\n";
    make_run(root, "20240101-000000", &format!("seed=1\nvariant=on\ngamma_iters=20\n{common}"));
    make_run(root, "20240102-000000", &format!("seed=1\nvariant=on\ngamma_iters=20\n{common}"));
    make_run(root, "20240103-000000", &format!("seed=1\nvariant=off\n{common}"));
    // Seed 2: off side ran with a different eval_M.
    make_run(root, "20240104-000000", &format!("seed=2\nvariant=on\ngamma_iters=20\n{common}"));
    make_run(
        root,
        "20240105-000000",
        "seed=2\nvariant=off\ndataset=cifar10\nk=1\neig_freq=50\neval_M=4\nnoise_M=8\nmax_steps=100\n",
    );
    // Seed 3 has no off run.
    make_run(root, "20240106-000000", &format!("seed=3\nvariant=on\n{common}"));

    let runs = discover_runs(root).unwrap();
    let report = pair_runs(&runs, &PairFilter::default(), &GammaItersPolicy::Ignore);
    assert_eq!(report.pairs.len(), 1);
    let pair = &report.pairs[0];
    assert_eq!(pair.seed, 1);
    assert_eq!(pair.on.key, "20240102-000000");
    assert_eq!(pair.off.key, "20240103-000000");
    assert_eq!(pair.k(), Some(1));

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].seed, 2);
    match &report.skipped[0].reason {
        InstrumentError::MetaMismatch { diffs } => {
            assert_eq!(diffs.len(), 1);
            assert_eq!(diffs[0].key, "eval_M");
            assert_eq!(diffs[0].on, "1");
            assert_eq!(diffs[0].off, "4");
        }
        other => panic!("expected a metadata mismatch, got {other:?}"),
    }
}

#[test]
fn gamma_iters_policy_and_filters_restrict_pairs() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    make_run(root, "20240101-000000", "seed=1\nvariant=on\nk=1\ndataset=a\n");
    make_run(root, "20240102-000000", "seed=1\nvariant=off\nk=1\ndataset=a\n");
    make_run(root, "20240103-000000", "seed=2\nvariant=on\nk=2\ndataset=a\ngamma_iters=10\n");
    make_run(root, "20240104-000000", "seed=2\nvariant=off\nk=2\ndataset=a\n");
    let runs = discover_runs(root).unwrap();

    let legacy = GammaItersPolicy::ExactOrLegacy { prefer: 20, legacy: 20 };
    let report = pair_runs(&runs, &PairFilter::default(), &legacy);
    assert_eq!(report.pairs.iter().map(|p| p.seed).collect::<Vec<_>>(), vec![1]);

    let report = pair_runs(&runs, &PairFilter::default(), &GammaItersPolicy::Exact(10));
    assert_eq!(report.pairs.iter().map(|p| p.seed).collect::<Vec<_>>(), vec![2]);

    let by_k = PairFilter {
        k: Some(2),
        ..PairFilter::default()
    };
    let report = pair_runs(&runs, &by_k, &GammaItersPolicy::Ignore);
    assert_eq!(report.pairs.len(), 1);
    assert_eq!(report.pairs[0].seed, 2);

    let other_dataset = PairFilter {
        dataset: Some("b".to_string()),
        ..PairFilter::default()
    };
    assert!(pair_runs(&runs, &other_dataset, &GammaItersPolicy::Ignore).pairs.is_empty());

    let seeds_only = PairFilter {
        seeds: vec![1],
        ..PairFilter::default()
    };
    assert_eq!(pair_runs(&runs, &seeds_only, &GammaItersPolicy::Ignore).pairs.len(), 1);
}

#[test]
fn missing_meta_is_reported() {
    let tmp = tempdir().unwrap();
    assert!(matches!(
        read_meta(&tmp.path().join(META_FILE)),
        Err(InstrumentError::MissingArtifact { .. })
    ));
}

#[test]
fn unscorable_pair_is_skipped_while_others_are_analysed() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    make_run(root, "20240101-000000", "seed=1\nvariant=on\nk=1\n");
    make_run(root, "20240102-000000", "seed=1\nvariant=off\nk=1\n");
    make_run(root, "20240103-000000", "seed=2\nvariant=on\nk=1\n");
    make_run(root, "20240104-000000", "seed=2\nvariant=off\nk=1\n");
    // Seed 2's "on" run logged no step where the bound applies.
    write_metrics_with(&root.join("20240103-000000"), 6, false);

    let runs = discover_runs(root).unwrap();
    let report = pair_runs(&runs, &PairFilter::default(), &GammaItersPolicy::Ignore);
    assert_eq!(report.pairs.len(), 2);

    let cfg = BlockBootstrapConfig {
        block_len: 2,
        b: 20,
        seed: 3,
    };
    let mut kept = Vec::new();
    let mut skipped = Vec::new();
    for pair in &report.pairs {
        match pair
            .read_rows()
            .and_then(|(on, off)| pair_statistics(&on, &off, &cfg))
        {
            Ok(stats) => kept.push((pair.seed, stats)),
            Err(err) => skipped.push((pair.seed, err)),
        }
    }
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].0, 1);
    assert_eq!(kept[0].1.block.n, 6);
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].0, 2);
    assert!(matches!(skipped[0].1, InstrumentError::DegenerateInput(_)));

    let on: Vec<f64> = kept.iter().map(|(_, s)| s.norm_auprc_on).collect();
    let off: Vec<f64> = kept.iter().map(|(_, s)| s.norm_auprc_off).collect();
    let boot = paired_bootstrap(&on, &off, &BootstrapConfig { b: 100, seed: 1 }).unwrap();
    assert_eq!(boot.n_pairs, 1);
    assert_eq!(boot.mean_diff, 0.0);
}
