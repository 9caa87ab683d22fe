//! Experiment runner: one full train + test pipeline per configuration.
//!
//! The order is fixed: seed, provision the three splits (threading the
//! returned configuration), build the model, build callbacks, open the
//! tracker, resolve the run identity, attach checkpoint policies, fit, test.

use crate::config::ExperimentConfig;
use crate::data::{DatasetProvider, DatasetRequest, Split, provider_for};
use crate::error::MlError;
use crate::model::{ModelLoaders, build_model};
use crate::runtime::{MatmulPrecision, float32_matmul_precision};
use crate::tracker::{RunIdentity, Tracker, open_tracker};
use crate::training::callbacks::{add_checkpoint_policies, build_callbacks};
use crate::training::reproducibility::{EnvironmentSnapshot, seed_everything};
use crate::training::trainer::{
    CheckpointFailure, Trainer, TrainerConfig, configure_precision,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub identity: RunIdentity,
    pub seed: u64,
    pub checkpoint_dir: PathBuf,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_checkpoint: Option<String>,
    /// `val_loss` (best epoch), `train_loss` (last epoch) and `test_loss`.
    pub metrics: BTreeMap<String, f64>,
    pub checkpoint_failures: Vec<CheckpointFailure>,
    pub lr_history: Vec<(u64, f64)>,
    pub environment: EnvironmentSnapshot,
    /// Process-wide float32 matmul precision in effect while training.
    pub matmul_precision: MatmulPrecision,
}

impl RunReport {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn test_loss(&self) -> Option<f64> {
        self.metric("test_loss")
    }
}

/// Runs the pipeline; the dataset provider is chosen from the configuration
/// unless one is injected.
#[derive(Default)]
pub struct ExperimentRunner {
    provider: Option<Box<dyn DatasetProvider>>,
}

impl std::fmt::Debug for ExperimentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRunner")
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl ExperimentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(provider: Box<dyn DatasetProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// Repeat the pipeline `itr` times. Stops at the first failing run.
    pub fn run_all(&self, config: &ExperimentConfig) -> Result<Vec<RunReport>, MlError> {
        (0..config.itr.max(1))
            .map(|ii| {
                tracing::info!(iteration = ii + 1, of = config.itr, "Starting run");
                self.run(config.clone())
            })
            .collect()
    }

    /// Execute one run.
    pub fn run(&self, config: ExperimentConfig) -> Result<RunReport, MlError> {
        let seeds = seed_everything(config.random_seed);
        let environment = EnvironmentSnapshot::capture(&seeds);

        let fallback;
        let provider: &dyn DatasetProvider = match &self.provider {
            Some(p) => p.as_ref(),
            None => {
                fallback = provider_for(&config);
                fallback.as_ref()
            }
        };
        let request = DatasetRequest::pretrain(&config, true, Split::Train);
        let train = provider.provide(config, &request, &seeds)?;
        let config = train.config;
        let val = provider.provide(
            config.clone(),
            &DatasetRequest::pretrain(&config, true, Split::Val),
            &seeds,
        )?;
        let config = val.config;
        let test = provider.provide(
            config.clone(),
            &DatasetRequest::pretrain(&config, false, Split::Test),
            &seeds,
        )?;
        let config = test.config;
        let (mut train_loader, mut val_loader, mut test_loader) =
            (train.loader, val.loader, test.loader);

        let mut model = build_model(
            &config,
            ModelLoaders {
                train: &train_loader,
                val: &val_loader,
                test: &test_loader,
            },
            &seeds,
        )?;

        let mut callbacks = build_callbacks(&config);
        let mut tracker = open_tracker(&config)?;
        tracker.log_config(&config.tracker_view()?)?;

        let identity = match tracker.run_name() {
            Some(name) => RunIdentity {
                project: config.tracker_project.clone(),
                group: config.tracker_group.clone(),
                name: name.to_string(),
            },
            None => unique_local_identity(&config),
        };
        let checkpoint_dir = config.checkpoint_dir(&identity.name);
        add_checkpoint_policies(&mut callbacks, &config);
        tracing::info!(
            run = %identity.name,
            seed = seeds.seed(),
            model = %config.model,
            checkpoints = %checkpoint_dir.display(),
            callbacks = ?callbacks.names(),
            "Run configured"
        );
        tracing::debug!(?environment, "Environment snapshot");

        let trainer_config = TrainerConfig::from_experiment(&config, checkpoint_dir.clone())?;
        configure_precision(trainer_config.precision);
        let matmul_precision = float32_matmul_precision();
        tracing::debug!(
            precision = %trainer_config.precision,
            matmul = ?matmul_precision,
            "Precision configured"
        );
        let mut trainer = Trainer::new(trainer_config, callbacks);

        let result = (|| {
            let fit = trainer.fit(
                model.as_mut(),
                &mut train_loader,
                &mut val_loader,
                tracker.as_mut(),
            )?;
            let test = trainer.test(model.as_mut(), &mut test_loader, tracker.as_mut())?;
            Ok::<_, MlError>((fit, test))
        })();
        let finished = tracker.finish();
        let (fit, test) = result?;
        finished?;

        let mut metrics = BTreeMap::from([("test_loss".to_string(), test.test_loss)]);
        if let Some(best) = fit.metrics.best_val_loss {
            metrics.insert("val_loss".to_string(), best);
        }
        if let Some(&last) = fit.metrics.train_loss_history.last() {
            metrics.insert("train_loss".to_string(), last);
        }

        let report = RunReport {
            identity,
            seed: seeds.seed(),
            checkpoint_dir,
            epochs_run: fit.epochs_run,
            stopped_early: fit.stopped_early,
            best_checkpoint: test.restored_from,
            metrics,
            checkpoint_failures: trainer.checkpoint_failures().to_vec(),
            lr_history: fit.metrics.lr_history,
            environment,
            matmul_precision,
        };
        tracing::info!(
            run = %report.identity.name,
            epochs = report.epochs_run,
            stopped_early = report.stopped_early,
            test_loss = test.test_loss,
            checkpoint_failures = report.checkpoint_failures.len(),
            "Run finished"
        );
        Ok(report)
    }
}

/// Local-time identity whose checkpoint directory is not taken yet.
fn unique_local_identity(config: &ExperimentConfig) -> RunIdentity {
    let mut identity = RunIdentity::local(config);
    let base = identity.name.clone();
    let mut n = 1;
    while config.checkpoint_dir(&identity.name).exists() {
        identity.name = format!("{base}-{n}");
        n += 1;
    }
    identity
}
