use approx::assert_abs_diff_eq;
use domsnr::records::LabeledScores;
use domsnr::stats::{
    BlockBootstrapConfig, BootstrapConfig, PermutationConfig, bh_fdr, moving_block_bootstrap,
    paired_bootstrap, sign_flip_permutation,
};

#[test]
fn consistent_improvement_has_positive_interval() {
    let on = [0.5, 0.6, 0.55];
    let off = [0.4, 0.4, 0.45];
    let res = paired_bootstrap(&on, &off, &BootstrapConfig::default()).unwrap();
    assert_eq!(res.n_pairs, 3);
    assert_abs_diff_eq!(res.mean_diff, 0.4 / 3.0, epsilon = 1e-12);
    assert!(res.ci_lo > 0.0);
    assert!(res.ci_hi <= 0.2 + 1e-12);
    // No resample can reach zero, so the p-value sits at its floor.
    assert_abs_diff_eq!(res.p_value, 2.0 / 10_000.0, epsilon = 1e-15);
}

#[test]
fn resampling_is_reproducible_for_a_seed() {
    let on = [0.31, 0.52, 0.47, 0.12, 0.66];
    let off = [0.29, 0.55, 0.40, 0.20, 0.61];
    let cfg = BootstrapConfig { b: 500, seed: 99 };
    let a = paired_bootstrap(&on, &off, &cfg).unwrap();
    let b = paired_bootstrap(&on, &off, &cfg).unwrap();
    assert_eq!(a, b);

    let diffs: Vec<f64> = on.iter().zip(&off).map(|(x, y)| x - y).collect();
    let pcfg = PermutationConfig { r: 400, seed: 5 };
    assert_eq!(sign_flip_permutation(&diffs, &pcfg), sign_flip_permutation(&diffs, &pcfg));

    let seq = LabeledScores {
        labels: (0..40).map(|i| i % 4 == 0).collect(),
        scores: (0..40).map(|i| ((i * 37) % 11) as f64 / 10.0).collect(),
    };
    let other = LabeledScores {
        labels: seq.labels.clone(),
        scores: seq.scores.iter().map(|s| s * 0.5 + 0.1).collect(),
    };
    let bcfg = BlockBootstrapConfig {
        block_len: 5,
        b: 50,
        seed: 1,
    };
    let x = moving_block_bootstrap(&seq, &other, &bcfg);
    let y = moving_block_bootstrap(&seq, &other, &bcfg);
    assert_eq!(x.diffs, y.diffs);
    assert_eq!(x.n, 40);
    // A monotone transform leaves the ranking, and so every statistic, unchanged.
    assert_abs_diff_eq!(x.obs_diff, 0.0, epsilon = 1e-12);
}

#[test]
fn bh_qvalues_dominate_and_preserve_order() {
    let p = [0.04, 0.001, 0.03, 0.2, 0.012];
    let q = bh_fdr(&p);
    assert_eq!(q.len(), p.len());
    for (pi, qi) in p.iter().zip(&q) {
        assert!(qi >= pi);
        assert!(*qi <= 1.0);
    }
    let mut idx: Vec<usize> = (0..p.len()).collect();
    idx.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
    for w in idx.windows(2) {
        assert!(q[w[0]] <= q[w[1]] + 1e-15);
    }
    assert!(bh_fdr(&[]).is_empty());
}
