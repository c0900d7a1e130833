//! Training-loop-owned instrumentation state and the per-step pipeline.
//!
//! The caller owns the parameters, the data stream and the optimizer; the
//! monitor only reads them. Each call to [`Monitor::observe_step`] measures one
//! step to completion and returns its log row together with the gradient it
//! computed, so the caller can apply the SGD update without a second pass.

use crate::calibration::{CalibrationConfig, CalibrationRecord, ScaleCalibrator, ScaleSelection};
use crate::ema::{Ema, trigger_decision};
use crate::eigen::{EigenConfig, SharpnessConfig, power_max_eig, topk_power};
use crate::gamma::{
    GammaConfig, GammaEstimate, GammaOutcome, corrected_threshold, estimate_gamma, mu_eff_gamma_k1,
    principal_angle_max,
};
use crate::intervene::{InterventionDeltas, measure_interventions};
use crate::operator::{FiniteDifferenceHvp, GradientOracle};
use crate::records::MetricsRow;
use crate::runs::RunMeta;
use crate::sampler::{BatchSource, CyclicSampler};
use crate::snr::{base_threshold, grad_norm_sq, noise_trace_full, noise_trace_ps_sigma, r_and_threshold, signal_ps_grad_sq};
use crate::subspace::SubspaceBasis;
use crate::types::{InstrumentError, Variant};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

fn default_lr() -> f64 {
    0.1
}

fn default_noise_samples() -> usize {
    8
}

fn default_eval_samples() -> usize {
    1
}

fn default_ema_beta() -> f64 {
    0.9
}

fn default_intervene() -> bool {
    true
}

fn default_seed() -> u64 {
    123
}

fn default_dataset() -> String {
    "synthetic".to_string()
}

/// Every option of the instrumented run, with the reference defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// SGD step size `eta`.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Gradient samples per noise-trace estimate, the current one included.
    #[serde(default = "default_noise_samples")]
    pub noise_samples: usize,
    /// Batches averaged per ΔL measurement, the current one included.
    #[serde(default = "default_eval_samples")]
    pub eval_samples: usize,
    #[serde(default = "default_ema_beta")]
    pub ema_beta: f64,
    #[serde(default)]
    pub eigen: EigenConfig,
    #[serde(default)]
    pub sharpness: SharpnessConfig,
    #[serde(default)]
    pub gamma: GammaConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Measure ground-truth ΔL for the candidate updates.
    #[serde(default = "default_intervene")]
    pub intervene: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_dataset")]
    pub dataset: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            noise_samples: default_noise_samples(),
            eval_samples: default_eval_samples(),
            ema_beta: default_ema_beta(),
            eigen: EigenConfig::default(),
            sharpness: SharpnessConfig::default(),
            gamma: GammaConfig::default(),
            calibration: CalibrationConfig::default(),
            intervene: default_intervene(),
            seed: default_seed(),
            dataset: default_dataset(),
        }
    }
}

impl MonitorConfig {
    pub fn variant(&self) -> Variant {
        if self.gamma.enabled { Variant::On } else { Variant::Off }
    }

    /// `meta.txt` contents used to pair runs. `gamma_iters` and `gamma_freq`
    /// are only recorded for "on" runs.
    pub fn run_meta(&self, max_steps: usize) -> RunMeta {
        let mut meta = RunMeta::new();
        meta.insert("seed", self.seed);
        meta.insert("variant", self.variant());
        meta.insert("k", self.eigen.k);
        meta.insert("dataset", &self.dataset);
        meta.insert("eig_freq", self.eigen.refresh_every);
        meta.insert("eval_M", self.eval_samples);
        meta.insert("noise_M", self.noise_samples);
        meta.insert("max_steps", max_steps);
        meta.insert("lr", self.lr);
        if self.gamma.enabled {
            meta.insert("gamma_iters", self.gamma.iters);
            meta.insert("gamma_freq", self.gamma.every);
        }
        meta
    }

    fn validate(&self) -> Result<(), InstrumentError> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(InstrumentError::InvalidInput(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if self.noise_samples < 2 {
            return Err(InstrumentError::DegenerateInput(format!(
                "noise_samples must be at least 2, got {}",
                self.noise_samples
            )));
        }
        if self.eigen.k == 0 {
            return Err(InstrumentError::InvalidInput(
                "subspace rank k must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a step sits in the data stream; copied into the log row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepIndex {
    pub epoch: usize,
    pub batch: usize,
}

/// Side-channel record of a gamma estimate that could not be used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GammaFailure {
    pub step: usize,
    pub seed: u64,
    pub dataset: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub row: MetricsRow,
    /// Gradient at the current parameters on the current batch.
    pub grad: Array1<f64>,
    /// Set when the threshold scale was refitted on this step.
    pub calibration: Option<ScaleSelection>,
}

/// Everything that persists across steps: the tracked subspace and its
/// predecessor, the curvature floor, the drift angle, the latest gamma, the
/// EMA and the calibration buffer.
pub struct Monitor {
    config: MonitorConfig,
    dim: usize,
    step: usize,
    basis: SubspaceBasis,
    basis_from_eigen: bool,
    mu: f64,
    eps: f64,
    gamma: Option<GammaEstimate>,
    ema: Ema,
    calibrator: ScaleCalibrator,
    failures: Vec<GammaFailure>,
}

impl Monitor {
    /// Starts from a seeded random orthonormal basis and `mu = 0` until the
    /// first eigen refresh.
    pub fn new(config: MonitorConfig, dim: usize) -> Result<Self, InstrumentError> {
        config.validate()?;
        let basis = SubspaceBasis::random(dim, config.eigen.k, config.seed)?;
        let ema = Ema::new(config.ema_beta)?;
        let calibrator = ScaleCalibrator::new(config.calibration.clone())?;
        Ok(Self {
            config,
            dim,
            step: 0,
            basis,
            basis_from_eigen: false,
            mu: 0.0,
            eps: 0.0,
            gamma: None,
            ema,
            calibrator,
            failures: Vec::new(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn basis(&self) -> &SubspaceBasis {
        &self.basis
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn ema_r(&self) -> Option<f64> {
        self.ema.get()
    }

    pub fn calibrator(&self) -> &ScaleCalibrator {
        &self.calibrator
    }

    pub fn gamma_failures(&self) -> &[GammaFailure] {
        &self.failures
    }

    fn refresh_basis<O: GradientOracle>(
        &mut self,
        oracle: &O,
        params: ArrayView1<'_, f64>,
        batch: &O::Batch,
    ) -> Result<(), InstrumentError> {
        let hvp = FiniteDifferenceHvp::new(oracle, params, batch);
        let seed = self.config.seed.wrapping_add(self.step as u64);
        let pairs = topk_power(&hvp, self.dim, &self.config.eigen, seed)?;
        let mu = pairs.mu();
        let fresh = pairs.into_basis();
        let prev = self.basis_from_eigen.then_some(&self.basis);
        self.eps = principal_angle_max(prev, Some(&fresh));
        log::debug!(
            "step {}: eigen refresh mu={mu:.4e} eps={:.4e}",
            self.step,
            self.eps
        );
        self.basis = fresh;
        self.basis_from_eigen = true;
        self.mu = mu;
        Ok(())
    }

    fn refresh_gamma<O: GradientOracle>(&mut self, oracle: &O, params: ArrayView1<'_, f64>, batch: &O::Batch) {
        let hvp = FiniteDifferenceHvp::new(oracle, params, batch);
        let seed = self
            .config
            .seed
            .wrapping_add(self.config.gamma.seed_offset)
            .wrapping_add(self.step as u64);
        match estimate_gamma(&hvp, &self.basis, &self.config.gamma, seed) {
            GammaOutcome::Available(est) => self.gamma = Some(est),
            GammaOutcome::Unavailable { reason } => {
                log::warn!(
                    "gamma unavailable at step {} (seed {}, dataset {}): {reason}",
                    self.step,
                    self.config.seed,
                    self.config.dataset
                );
                self.failures.push(GammaFailure {
                    step: self.step,
                    seed: self.config.seed,
                    dataset: self.config.dataset.clone(),
                    reason,
                });
                self.gamma = None;
            }
        }
    }

    fn gradient_samples<O, S>(
        &self,
        oracle: &O,
        params: ArrayView1<'_, f64>,
        grad: &Array1<f64>,
        sampler: &mut CyclicSampler<S>,
    ) -> Result<Vec<Array1<f64>>, InstrumentError>
    where
        O: GradientOracle,
        S: BatchSource<Batch = O::Batch>,
    {
        let mut samples = Vec::with_capacity(self.config.noise_samples);
        samples.push(grad.clone());
        for _ in 1..self.config.noise_samples {
            let extra = sampler.draw()?;
            samples.push(oracle.loss_and_grad(params, &extra).1);
        }
        Ok(samples)
    }

    /// Measures one step at `params` on `batch`. Extra noise and evaluation
    /// batches are drawn from `sampler`.
    pub fn observe_step<O, S>(
        &mut self,
        oracle: &O,
        params: ArrayView1<'_, f64>,
        batch: &O::Batch,
        sampler: &mut CyclicSampler<S>,
        index: StepIndex,
    ) -> Result<StepOutcome, InstrumentError>
    where
        O: GradientOracle,
        S: BatchSource<Batch = O::Batch>,
    {
        if params.len() != self.dim {
            return Err(InstrumentError::DimensionMismatch(format!(
                "parameter vector has length {}, monitor tracks dimension {}",
                params.len(),
                self.dim
            )));
        }
        let eta = self.config.lr;
        let eigen_on = self.config.eigen.enabled();
        let scale = self.calibrator.active_scale();

        if self.config.eigen.due(self.step) {
            self.refresh_basis(oracle, params, batch)?;
        }

        let (loss, grad) = oracle.loss_and_grad(params, batch);
        let ps_grad_sq = signal_ps_grad_sq(&grad, &self.basis);
        let grad_norm = grad_norm_sq(&grad);

        let samples = self.gradient_samples(oracle, params, &grad, sampler)?;
        let tr_ps_sigma = noise_trace_ps_sigma(&samples, &self.basis)?;
        let tr_sigma_full = noise_trace_full(&samples)?;

        let threshold = r_and_threshold(eta, self.mu, ps_grad_sq, tr_ps_sigma);

        let gamma_on = self.config.gamma.enabled && eigen_on;
        let mut gamma_ok = false;
        if gamma_on && self.config.gamma.due(self.step) {
            self.refresh_gamma(oracle, params, batch);
            gamma_ok = self.gamma.is_some();
        }
        let r_th_gamma = if gamma_on {
            self.gamma
                .map(|est| corrected_threshold(eta, mu_eff_gamma_k1(self.mu, self.eps, est.gamma)))
        } else {
            None
        };
        let base = base_threshold(threshold.r_th, r_th_gamma, gamma_on);
        let r_th_eff = scale * base;

        let ema_r = self.ema.update(threshold.r);

        let (lambda_max, two_over_lr) = if self.config.sharpness.enabled && eigen_on {
            let hvp = FiniteDifferenceHvp::new(oracle, params, batch);
            let seed = self.config.seed.wrapping_add(self.config.sharpness.seed_offset);
            let (lam, _) = power_max_eig(
                &hvp,
                self.dim,
                self.config.sharpness.iters,
                self.config.sharpness.tol,
                seed,
            )?;
            (lam, 2.0 / eta)
        } else {
            (f64::NAN, f64::NAN)
        };

        let trigger = trigger_decision(ema_r, r_th_eff, eta, self.mu, eigen_on, threshold.mask_applicable);

        let deltas = if self.config.intervene {
            measure_interventions(
                oracle,
                params,
                batch,
                grad.view(),
                &self.basis,
                eta,
                sampler,
                self.config.eval_samples,
            )?
        } else {
            InterventionDeltas::skipped()
        };

        let record = CalibrationRecord {
            ema_r,
            threshold: base,
            delta_l: deltas.dom,
        };
        let calibration = self.calibrator.observe(self.step, Some(record))?;

        let gamma_est = if gamma_on { self.gamma } else { None };
        let row = MetricsRow {
            step: self.step,
            epoch: index.epoch,
            batch: index.batch,
            loss,
            r: ema_r,
            r_th: threshold.r_th,
            r_th_eff,
            r_th_gamma_eff: r_th_gamma.unwrap_or(f64::NAN),
            mu: self.mu,
            ps_grad_sq,
            tr_ps_sigma,
            tr_sigma_full,
            grad_norm_sq: grad_norm,
            delta_l_dom: deltas.dom,
            delta_l_bulk: deltas.bulk,
            delta_l_full: deltas.full,
            lambda_max,
            two_over_lr,
            trigger,
            cstar: self.calibrator.cstar().unwrap_or(f64::NAN),
            mask_applicable: threshold.mask_applicable,
            eps_current: self.eps,
            gamma_val: gamma_est.map_or(f64::NAN, |est| est.gamma),
            gamma_iters_used: gamma_est.map(|est| est.iters_used),
            gamma_ok,
        };

        self.step += 1;
        Ok(StepOutcome {
            row,
            grad,
            calibration,
        })
    }
}
