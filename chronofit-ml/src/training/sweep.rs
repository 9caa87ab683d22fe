//! Hyperparameter sweeps.
//!
//! A [`SweepSpace`] names the configuration fields to sample, how to sample
//! them and which run metric to optimize. [`SweepController`] executes a fixed
//! budget of trials; each trial overrides exactly the sampled fields of the
//! base configuration and runs the full pipeline. A failed trial is recorded
//! and the budget continues.

use crate::config::ExperimentConfig;
use crate::error::MlError;
use crate::persistence::atomic_write_json;
use crate::training::runner::{ExperimentRunner, RunReport};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Trials run when no count is given.
pub const DEFAULT_TRIAL_COUNT: usize = 50;

/// Probability that a bayes trial explores instead of refining the best trial.
const EXPLORE_PROBABILITY: f64 = 0.25;

/// Metrics a run reports and a sweep can optimize.
pub const SWEEP_METRICS: [&str; 3] = ["val_loss", "train_loss", "test_loss"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMethod {
    #[default]
    Random,
    Grid,
    /// Epsilon-greedy refinement of the best completed trial.
    Bayes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    #[default]
    Minimize,
    Maximize,
}

impl Goal {
    /// Whether `a` is strictly better than `b`.
    pub fn better(self, a: f64, b: f64) -> bool {
        match self {
            Self::Minimize => a < b,
            Self::Maximize => a > b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepMetric {
    pub name: String,
    #[serde(default)]
    pub goal: Goal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeDistribution {
    #[default]
    Uniform,
    LogUniform,
    IntUniform,
}

/// How one field is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSpec {
    Values {
        values: Vec<Value>,
    },
    Range {
        min: f64,
        max: f64,
        #[serde(default)]
        distribution: RangeDistribution,
    },
}

impl ParameterSpec {
    fn validate(&self, field: &str) -> Result<(), MlError> {
        match self {
            Self::Values { values } if values.is_empty() => Err(MlError::config(format!(
                "sweep parameter `{field}` has no values"
            ))),
            Self::Range { min, max, .. } if !(min.is_finite() && max.is_finite() && min <= max) => {
                Err(MlError::config(format!(
                    "sweep parameter `{field}` needs finite min <= max"
                )))
            }
            Self::Range {
                min,
                distribution: RangeDistribution::LogUniform,
                ..
            } if *min <= 0.0 => Err(MlError::config(format!(
                "sweep parameter `{field}` is log-uniform and needs min > 0"
            ))),
            Self::Range {
                min,
                max,
                distribution: RangeDistribution::IntUniform,
            } if min.ceil() > max.floor() => Err(MlError::config(format!(
                "sweep parameter `{field}` has no integer in [{min}, {max}]"
            ))),
            _ => Ok(()),
        }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Self::Values { values } => values.choose(rng).cloned().unwrap_or(Value::Null),
            Self::Range {
                min,
                max,
                distribution,
            } => match distribution {
                RangeDistribution::Uniform => json!(rng.gen_range(*min..=*max)),
                RangeDistribution::LogUniform => {
                    json!(rng.gen_range(min.ln()..=max.ln()).exp().clamp(*min, *max))
                }
                RangeDistribution::IntUniform => {
                    json!(rng.gen_range(min.ceil() as i64..=max.floor() as i64))
                }
            },
        }
    }

    /// A value near `center`: a Gaussian step of a tenth of the range, or a
    /// fresh draw for discrete candidates. Log-uniform ranges step in log space.
    fn perturb<R: Rng>(&self, center: &Value, rng: &mut R) -> Value {
        let Self::Range {
            min,
            max,
            distribution,
        } = self
        else {
            return self.sample(rng);
        };
        let Some(c) = center.as_f64() else {
            return self.sample(rng);
        };
        let mut step = |lo: f64, hi: f64, at: f64| {
            let sigma = ((hi - lo) / 10.0).max(f64::EPSILON);
            let delta = Normal::new(0.0, sigma)
                .map(|n| n.sample(rng))
                .unwrap_or(0.0);
            (at + delta).clamp(lo, hi)
        };
        match distribution {
            RangeDistribution::IntUniform => json!(step(*min, *max, c).round() as i64),
            RangeDistribution::Uniform => json!(step(*min, *max, c)),
            RangeDistribution::LogUniform => {
                let at = c.clamp(*min, *max).ln();
                json!(step(min.ln(), max.ln(), at).exp().clamp(*min, *max))
            }
        }
    }

    fn cardinality(&self) -> Option<usize> {
        match self {
            Self::Values { values } => Some(values.len()),
            Self::Range { .. } => None,
        }
    }
}

/// Search space, method and optimization target of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpace {
    #[serde(default)]
    pub method: SweepMethod,
    pub metric: SweepMetric,
    pub parameters: BTreeMap<String, ParameterSpec>,
}

impl Default for SweepSpace {
    fn default() -> Self {
        let values = |v: Value| match v {
            Value::Array(values) => ParameterSpec::Values { values },
            other => ParameterSpec::Values {
                values: vec![other],
            },
        };
        Self {
            method: SweepMethod::Random,
            metric: SweepMetric {
                name: "val_loss".to_string(),
                goal: Goal::Minimize,
            },
            parameters: BTreeMap::from([
                (
                    "learning_rate".to_string(),
                    values(json!([0.0001, 0.0002, 0.0004, 0.0006, 0.001, 0.01])),
                ),
                ("batch_size".to_string(), values(json!([16, 32, 64, 128, 256]))),
                ("train_epochs".to_string(), values(json!([100]))),
                ("ema_decay".to_string(), values(json!([0.995, 0.98, 0.97]))),
                ("dropout".to_string(), values(json!([0.1, 0.2, 0.3]))),
                ("random_seed".to_string(), values(json!([2021]))),
            ]),
        }
    }
}

impl SweepSpace {
    /// Load a space from YAML (`.yml`, `.yaml`) or JSON (`.json`).
    pub fn load(path: &Path) -> Result<Self, MlError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MlError::config(format!("cannot read sweep config {}: {e}", path.display()))
        })?;
        let space: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yml" | "yaml") => serde_yaml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| MlError::config(format!("invalid sweep config: {e}")))?,
            _ => {
                return Err(MlError::config(format!(
                    "sweep config must be .yaml, .yml or .json: {}",
                    path.display()
                )));
            }
        };
        space.validate()?;
        Ok(space)
    }

    pub fn validate(&self) -> Result<(), MlError> {
        if !SWEEP_METRICS.contains(&self.metric.name.as_str()) {
            return Err(MlError::config(format!(
                "sweep metric `{}` is not reported by runs (expected one of {SWEEP_METRICS:?})",
                self.metric.name
            )));
        }
        if self.parameters.is_empty() {
            return Err(MlError::config("sweep space has no parameters"));
        }
        for (field, spec) in &self.parameters {
            spec.validate(field)?;
        }
        if self.method == SweepMethod::Grid && self.grid_size().is_none() {
            return Err(MlError::config(
                "grid sweeps need a finite `values` list for every parameter",
            ));
        }
        Ok(())
    }

    /// Number of grid points, if every parameter is discrete.
    pub fn grid_size(&self) -> Option<usize> {
        self.parameters
            .values()
            .try_fold(1usize, |acc, spec| spec.cardinality().map(|n| acc.saturating_mul(n)))
    }

    /// The `index`-th grid point, last parameter varying fastest.
    fn grid_point(&self, mut index: usize) -> BTreeMap<String, Value> {
        let mut point = BTreeMap::new();
        for (field, spec) in self.parameters.iter().rev() {
            if let ParameterSpec::Values { values } = spec {
                point.insert(field.clone(), values[index % values.len()].clone());
                index /= values.len();
            }
        }
        point
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    Failed,
}

/// One sampled configuration and the outcome of its run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepTrial {
    pub trial_number: usize,
    pub params: BTreeMap<String, Value>,
    pub seed: Option<u64>,
    pub metric: Option<f64>,
    pub status: TrialStatus,
    pub run_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub id: String,
    pub method: SweepMethod,
    pub metric: SweepMetric,
    pub budget: usize,
    pub sweep_seed: u64,
    pub trials: Vec<SweepTrial>,
    /// Index into `trials` of the best completed trial.
    pub best_trial: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SweepReport {
    pub fn best(&self) -> Option<&SweepTrial> {
        self.best_trial.and_then(|i| self.trials.get(i))
    }

    pub fn failed(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Failed)
            .count()
    }

    /// Write the report to `<log_dir>/sweeps/<id>.json`.
    pub fn save(&self, log_dir: &Path) -> Result<PathBuf, MlError> {
        let path = log_dir.join("sweeps").join(format!("{}.json", self.id));
        atomic_write_json(&path, self)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    RunningTrial { trial: usize },
}

#[derive(Debug)]
pub struct SweepController {
    id: String,
    base: ExperimentConfig,
    space: SweepSpace,
    budget: usize,
    sweep_seed: u64,
    rng: StdRng,
    state: SweepState,
    trials: Vec<SweepTrial>,
}

impl SweepController {
    pub fn new(
        base: ExperimentConfig,
        space: SweepSpace,
        count: usize,
        sweep_seed: u64,
    ) -> Result<Self, MlError> {
        space.validate()?;
        if count == 0 {
            return Err(MlError::config("sweep trial count must be positive"));
        }
        let budget = match space.method {
            SweepMethod::Grid => space.grid_size().map_or(count, |size| count.min(size)),
            SweepMethod::Random | SweepMethod::Bayes => count,
        };
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            base,
            space,
            budget,
            sweep_seed,
            rng: StdRng::seed_from_u64(sweep_seed),
            state: SweepState::Idle,
            trials: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Trials this sweep will execute.
    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    pub fn trials(&self) -> &[SweepTrial] {
        &self.trials
    }

    /// Sample the parameters of trial `trial`.
    pub fn sample(&mut self, trial: usize) -> BTreeMap<String, Value> {
        match self.space.method {
            SweepMethod::Grid => self.space.grid_point(trial),
            SweepMethod::Random => self.sample_random(),
            SweepMethod::Bayes => {
                let best = self
                    .best_index()
                    .map(|i| self.trials[i].params.clone());
                match best {
                    Some(best) if !self.rng.gen_bool(EXPLORE_PROBABILITY) => {
                        self.refine(&best)
                    }
                    _ => self.sample_random(),
                }
            }
        }
    }

    fn sample_random(&mut self) -> BTreeMap<String, Value> {
        self.space
            .parameters
            .iter()
            .map(|(field, spec)| (field.clone(), spec.sample(&mut self.rng)))
            .collect()
    }

    /// Keep each of the best trial's values with probability one half,
    /// perturbing the others.
    fn refine(&mut self, best: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        self.space
            .parameters
            .iter()
            .map(|(field, spec)| {
                let value = match best.get(field) {
                    Some(center) if self.rng.gen_bool(0.5) => center.clone(),
                    Some(center) => spec.perturb(center, &mut self.rng),
                    None => spec.sample(&mut self.rng),
                };
                (field.clone(), value)
            })
            .collect()
    }

    /// The base configuration with exactly the sampled fields overridden.
    pub fn trial_config(
        &self,
        params: &BTreeMap<String, Value>,
    ) -> Result<ExperimentConfig, MlError> {
        let mut config = self.base.clone();
        config.apply_overrides(params)?;
        Ok(config)
    }

    fn best_index(&self) -> Option<usize> {
        let goal = self.space.metric.goal;
        let mut best: Option<(usize, f64)> = None;
        for (i, trial) in self.trials.iter().enumerate() {
            let Some(m) = trial.metric.filter(|m| m.is_finite()) else {
                continue;
            };
            if best.is_none_or(|(_, b)| goal.better(m, b)) {
                best = Some((i, m));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Execute the whole budget with the pipeline runner.
    pub fn run(&mut self, runner: &ExperimentRunner) -> SweepReport {
        self.run_with(|config| runner.run(config))
    }

    /// Execute the whole budget, calling `run_trial` once per trial.
    pub fn run_with<F>(&mut self, mut run_trial: F) -> SweepReport
    where
        F: FnMut(ExperimentConfig) -> Result<RunReport, MlError>,
    {
        let started_at = Utc::now();
        tracing::info!(
            sweep = %self.id,
            method = ?self.space.method,
            metric = %self.space.metric.name,
            budget = self.budget,
            sweep_seed = self.sweep_seed,
            "Starting sweep"
        );

        for trial_number in 0..self.budget {
            self.state = SweepState::RunningTrial {
                trial: trial_number,
            };
            let params = self.sample(trial_number);
            let trial = match self.trial_config(&params) {
                Ok(config) => {
                    let seed = config.random_seed;
                    tracing::info!(sweep = %self.id, trial = trial_number, seed, ?params, "Starting trial");
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_trial(config)))
                        .unwrap_or_else(|payload| Err(panicked_trial(payload.as_ref())));
                    self.finish_trial(trial_number, params, Some(seed), outcome)
                }
                Err(e) => self.finish_trial(trial_number, params, None, Err(e)),
            };
            self.trials.push(trial);
            self.state = SweepState::Idle;
        }

        let report = SweepReport {
            id: self.id.clone(),
            method: self.space.method,
            metric: self.space.metric.clone(),
            budget: self.budget,
            sweep_seed: self.sweep_seed,
            trials: self.trials.clone(),
            best_trial: self.best_index(),
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            sweep = %self.id,
            trials = report.trials.len(),
            failed = report.failed(),
            best = ?report.best().and_then(|t| t.metric),
            "Sweep finished"
        );
        report
    }

    fn finish_trial(
        &self,
        trial_number: usize,
        params: BTreeMap<String, Value>,
        seed: Option<u64>,
        outcome: Result<RunReport, MlError>,
    ) -> SweepTrial {
        match outcome {
            Ok(report) => {
                let metric = report.metric(&self.space.metric.name);
                tracing::info!(sweep = %self.id, trial = trial_number, run = %report.identity.name, metric = ?metric, "Trial completed");
                SweepTrial {
                    trial_number,
                    params,
                    seed,
                    metric,
                    status: TrialStatus::Completed,
                    run_name: Some(report.identity.name),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(sweep = %self.id, trial = trial_number, error = %e, "Trial failed; continuing sweep");
                SweepTrial {
                    trial_number,
                    params,
                    seed,
                    metric: None,
                    status: TrialStatus::Failed,
                    run_name: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Training error standing in for a trial that panicked.
fn panicked_trial(payload: &(dyn std::any::Any + Send)) -> MlError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    MlError::training(format!("trial panicked: {message}"))
}
