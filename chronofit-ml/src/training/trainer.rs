//! Trainer orchestrator: fit and test loops around a [`ForecastModel`].
//!
//! The trainer owns the callback set and the checkpoint store. It fulfils the
//! checkpoint requests callbacks return; a failed write is logged, recorded and
//! reported to the requesting callback, and training continues.

use crate::config::ExperimentConfig;
use crate::data::{DataLoader, Split};
use crate::error::MlError;
use crate::model::optim::{Adam, clip_grad_norm};
use crate::model::{ForecastModel, ParameterSet};
use crate::runtime::{MatmulPrecision, set_float32_matmul_precision};
use crate::tracker::Tracker;
use crate::training::callbacks::{
    CallbackAction, CallbackSet, CheckpointOutcome, CheckpointRequest, Metrics, TrainState,
};
use crate::training::checkpoint::{CheckpointStore, Snapshot};
use crate::training::metrics::{MeanLoss, TrainingMetrics};
use crate::training::view::{LocalView, ParameterView, ShardedView};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

/// Maximum global gradient norm.
pub const GRADIENT_CLIP_VAL: f64 = 0.5;
/// Optimizer steps between training-loss log lines.
pub const LOG_EVERY_N_STEPS: u64 = 50;

/// Numeric precision mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "32")]
    Full32,
    #[serde(rename = "64")]
    Double64,
    #[serde(rename = "16-mixed")]
    Mixed16,
    #[serde(rename = "bf16-mixed")]
    MixedBf16,
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "32" | "32-true" => Ok(Self::Full32),
            "64" | "64-true" => Ok(Self::Double64),
            "16" | "16-mixed" => Ok(Self::Mixed16),
            "bf16" | "bf16-mixed" => Ok(Self::MixedBf16),
            other => Err(format!(
                "unknown precision `{other}` (expected 32, 64, 16-mixed or bf16-mixed)"
            )),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full32 => "32",
            Self::Double64 => "64",
            Self::Mixed16 => "16-mixed",
            Self::MixedBf16 => "bf16-mixed",
        })
    }
}

impl Precision {
    /// Mixed modes keep f32 master weights and round gradients to the
    /// reduced mantissa.
    fn round_gradients(self, grads: &mut ParameterSet) {
        let mask: u32 = match self {
            Self::Mixed16 => 0xFFFF_E000,
            Self::MixedBf16 => 0xFFFF_0000,
            Self::Full32 | Self::Double64 => return,
        };
        for v in grads.params.iter_mut().flat_map(|p| p.values.iter_mut()) {
            *v = f32::from_bits(v.to_bits() & mask);
        }
    }
}

/// Apply process-wide settings implied by the precision mode.
///
/// Full f32 precision allows the faster `High` matmul setting.
pub fn configure_precision(precision: Precision) {
    if precision == Precision::Full32 {
        set_float32_matmul_precision(MatmulPrecision::High);
    }
}

/// Distribution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SingleProcess,
    DataParallel,
    /// Parameters partitioned across devices.
    Sharded,
}

impl Strategy {
    pub fn select(use_deep_speed: bool, devices: NonZeroUsize) -> Self {
        if use_deep_speed {
            Self::Sharded
        } else if devices.get() > 1 {
            Self::DataParallel
        } else {
            Self::SingleProcess
        }
    }

    /// The parameter view callbacks see under this strategy.
    pub fn view<'a>(
        self,
        params: &'a mut ParameterSet,
        devices: NonZeroUsize,
    ) -> Box<dyn ParameterView + 'a> {
        match self {
            Self::Sharded => Box::new(ShardedView::new(params, devices)),
            Self::SingleProcess | Self::DataParallel => Box::new(LocalView::new(params)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub devices: NonZeroUsize,
    pub accelerator: String,
    pub strategy: Strategy,
    pub precision: Precision,
    pub gradient_clip_val: f64,
    pub accumulate_grad_batches: usize,
    pub log_every_n_steps: u64,
    pub default_root_dir: PathBuf,
}

impl TrainerConfig {
    pub fn from_experiment(
        config: &ExperimentConfig,
        checkpoint_dir: PathBuf,
    ) -> Result<Self, MlError> {
        let devices = NonZeroUsize::new(config.num_nodes)
            .ok_or_else(|| MlError::config("`num_nodes` must be positive"))?;
        Ok(Self {
            max_epochs: config.train_epochs,
            devices,
            accelerator: "auto".to_string(),
            strategy: Strategy::select(config.use_deep_speed, devices),
            precision: config.precision.parse().map_err(MlError::config)?,
            gradient_clip_val: GRADIENT_CLIP_VAL,
            accumulate_grad_batches: config.gradient_accumulation_steps.max(1),
            log_every_n_steps: LOG_EVERY_N_STEPS,
            default_root_dir: checkpoint_dir,
        })
    }
}

/// A checkpoint write that failed during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFailure {
    pub filename: String,
    pub global_step: u64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub metrics: TrainingMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_loss: f64,
    /// Snapshot whose weights were tested; `None` means the live weights.
    pub restored_from: Option<String>,
}

/// Source of wall-clock instants for time-based callbacks.
pub type Clock = Box<dyn Fn() -> Instant + Send>;

pub struct Trainer {
    config: TrainerConfig,
    callbacks: CallbackSet,
    store: CheckpointStore,
    clock: Clock,
    failures: Vec<CheckpointFailure>,
    global_step: u64,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("global_step", &self.global_step)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    pub fn new(config: TrainerConfig, callbacks: CallbackSet) -> Self {
        let store = CheckpointStore::new(config.default_root_dir.clone());
        Self {
            config,
            callbacks,
            store,
            clock: Box::new(Instant::now),
            failures: Vec::new(),
            global_step: 0,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &CallbackSet {
        &self.callbacks
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn checkpoint_failures(&self) -> &[CheckpointFailure] {
        &self.failures
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Train for up to `max_epochs`, validating after every epoch.
    pub fn fit(
        &mut self,
        model: &mut dyn ForecastModel,
        train: &mut DataLoader,
        val: &mut DataLoader,
        tracker: &mut dyn Tracker,
    ) -> Result<FitOutcome, MlError> {
        let started = (self.clock)();
        let schedule = model.schedule();
        let mut optimizer = Adam::new(model.parameters());
        let mut grads = model.parameters().zeros_like();
        let mut metrics = TrainingMetrics::default();
        let accumulate = self.config.accumulate_grad_batches.max(1);
        let (strategy, devices) = (self.config.strategy, self.config.devices);
        self.global_step = 0;

        let mut lr = schedule.lr_at(0);
        let start_state = TrainState {
            epoch: 0,
            global_step: 0,
            lr,
            now: started,
        };
        self.callbacks
            .on_fit_start(&start_state, strategy.view(model.parameters_mut(), devices).as_mut())?;
        tracing::info!(
            model = model.name(),
            max_epochs = self.config.max_epochs,
            strategy = ?strategy,
            precision = %self.config.precision,
            batches = train.num_batches(),
            "Starting fit"
        );

        let mut stopped_early = false;
        for epoch in 0..self.config.max_epochs {
            let mut train_loss = MeanLoss::default();
            let mut stop = false;

            for group in train.epoch().chunks(accumulate) {
                grads.fill_zero();
                for batch in group {
                    let out = model.training_step(batch)?;
                    if !out.loss.is_finite() {
                        return Err(MlError::training(format!(
                            "training loss diverged at epoch {epoch}, step {}",
                            self.global_step
                        )));
                    }
                    train_loss.add(out.loss, batch.len());
                    grads.add_assign(&out.grads);
                }
                grads.scale(1.0 / group.len() as f32);
                self.config.precision.round_gradients(&mut grads);
                clip_grad_norm(&mut grads, self.config.gradient_clip_val);

                lr = schedule.lr_at(self.global_step);
                optimizer.step(model.parameters_mut(), &grads, lr);
                self.global_step += 1;
                metrics.record_lr(self.global_step, lr);

                let state = TrainState {
                    epoch,
                    global_step: self.global_step,
                    lr,
                    now: (self.clock)(),
                };
                let actions = self.callbacks.on_train_step_end(
                    &state,
                    strategy.view(model.parameters_mut(), devices).as_mut(),
                    tracker,
                )?;
                stop |= self.apply_actions(actions, &state, model.parameters());

                if self.global_step % self.config.log_every_n_steps.max(1) == 0 {
                    let running = train_loss.mean().unwrap_or(f64::NAN);
                    tracker.log_metrics(
                        &Metrics::from([("train_loss".to_string(), running)]),
                        self.global_step,
                    )?;
                    tracing::debug!(epoch, step = self.global_step, train_loss = running, lr, "Training step");
                }
            }

            let val_loss = self.evaluate(model, val, Split::Val)?;
            let epoch_train = train_loss.mean().unwrap_or(f64::NAN);
            metrics.record_epoch(epoch_train, val_loss);
            let logged = Metrics::from([
                ("train_loss".to_string(), epoch_train),
                ("val_loss".to_string(), val_loss),
            ]);
            tracker.log_metrics(&logged, self.global_step)?;
            tracing::info!(epoch, step = self.global_step, train_loss = epoch_train, val_loss, "Epoch finished");

            let state = TrainState {
                epoch,
                global_step: self.global_step,
                lr,
                now: (self.clock)(),
            };
            let actions = self.callbacks.on_validation_end(&state, &logged)?;
            stop |= self.apply_actions(actions, &state, model.parameters());
            if stop {
                stopped_early = epoch + 1 < self.config.max_epochs;
                break;
            }
        }

        metrics.total_training_time_secs =
            (self.clock)().saturating_duration_since(started).as_secs_f64();
        tracing::info!(
            epochs = metrics.epochs_completed,
            stopped_early,
            best_val_loss = ?metrics.best_val_loss,
            failures = self.failures.len(),
            "Fit finished"
        );
        Ok(FitOutcome {
            epochs_run: metrics.epochs_completed,
            stopped_early,
            metrics,
        })
    }

    /// Test the best checkpoint if one was written, else the live weights.
    pub fn test(
        &mut self,
        model: &mut dyn ForecastModel,
        test: &mut DataLoader,
        tracker: &mut dyn Tracker,
    ) -> Result<TestOutcome, MlError> {
        let restored_from = match self.store.best()? {
            Some(entry) => {
                let snapshot = self.store.load(&entry.filename)?;
                if !snapshot.params.same_layout(model.parameters()) {
                    return Err(MlError::checkpoint(format!(
                        "{} does not match the model's parameter layout",
                        entry.filename
                    )));
                }
                *model.parameters_mut() = snapshot.params;
                self.callbacks.load_states(&snapshot.callbacks)?;
                tracing::info!(file = %entry.filename, val_loss = ?entry.monitor, "Restored best checkpoint for testing");
                Some(entry.filename)
            }
            None => {
                tracing::warn!("No best checkpoint available; testing the live weights");
                None
            }
        };

        let test_loss = self.evaluate(model, test, Split::Test)?;
        tracker.log_metrics(
            &Metrics::from([("test_loss".to_string(), test_loss)]),
            self.global_step,
        )?;
        tracing::info!(test_loss, "Test finished");
        Ok(TestOutcome {
            test_loss,
            restored_from,
        })
    }

    /// Mean loss over a loader, with eval hooks around it.
    fn evaluate(
        &mut self,
        model: &mut dyn ForecastModel,
        loader: &mut DataLoader,
        split: Split,
    ) -> Result<f64, MlError> {
        let (strategy, devices) = (self.config.strategy, self.config.devices);
        self.callbacks
            .on_eval_enter(strategy.view(model.parameters_mut(), devices).as_mut())?;
        let result = eval_loop(model, loader, split);
        self.callbacks
            .on_eval_exit(strategy.view(model.parameters_mut(), devices).as_mut())?;
        result?
            .mean()
            .ok_or_else(|| MlError::training(format!("{split} loader yielded no batches")))
    }

    /// Fulfil callback actions; returns whether any asked to stop.
    fn apply_actions(
        &mut self,
        actions: Vec<(usize, CallbackAction)>,
        state: &TrainState,
        params: &ParameterSet,
    ) -> bool {
        let mut stop = false;
        for (index, action) in actions {
            match action {
                CallbackAction::Continue => {}
                CallbackAction::Stop => stop = true,
                CallbackAction::Checkpoint(requests) => {
                    for request in requests {
                        let outcome = self.write_checkpoint(&request, state, params);
                        self.callbacks.report(index, &outcome);
                    }
                }
            }
        }
        stop
    }

    fn write_checkpoint(
        &mut self,
        request: &CheckpointRequest,
        state: &TrainState,
        params: &ParameterSet,
    ) -> CheckpointOutcome {
        let saved = self.callbacks.states().and_then(|callbacks| {
            let snapshot = Snapshot {
                epoch: state.epoch,
                global_step: state.global_step,
                monitor: request.monitor,
                params: params.clone(),
                callbacks,
            };
            self.store.save(&request.filename, request.kind, &snapshot)
        });

        match saved {
            Ok(entry) => {
                tracing::debug!(file = %entry.filename, kind = ?entry.kind, bytes = entry.size_bytes, "Saved checkpoint");
                for old in &request.evict {
                    if let Err(e) = self.store.remove(old) {
                        tracing::error!(file = %old, error = %e, "Failed to evict checkpoint");
                        self.failures.push(CheckpointFailure {
                            filename: old.clone(),
                            global_step: state.global_step,
                            error: e.to_string(),
                        });
                    }
                }
                CheckpointOutcome::Saved {
                    filename: entry.filename,
                    evicted: request.evict.clone(),
                }
            }
            Err(e) => {
                tracing::error!(file = %request.filename, step = state.global_step, error = %e, "Checkpoint write failed; training continues");
                self.failures.push(CheckpointFailure {
                    filename: request.filename.clone(),
                    global_step: state.global_step,
                    error: e.to_string(),
                });
                CheckpointOutcome::Failed {
                    filename: request.filename.clone(),
                    error: e.to_string(),
                }
            }
        }
    }
}

fn eval_loop(
    model: &mut dyn ForecastModel,
    loader: &mut DataLoader,
    split: Split,
) -> Result<MeanLoss, MlError> {
    model.on_eval_epoch_start();
    let mut mean = MeanLoss::default();
    for batch in loader.epoch() {
        let loss = match split {
            Split::Test => model.test_step(&batch)?,
            Split::Train | Split::Val => model.validation_step(&batch)?,
        };
        mean.add(loss, batch.len());
    }
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Window, WindowDataset};
    use crate::model::{LinearForecaster, LrAdjust, LrSchedule, ModelShape};
    use crate::tracker::DisabledTracker;
    use crate::training::callbacks::{Ema, EarlyStopping, MONITOR, add_checkpoint_policies};
    use crate::training::reproducibility::SeedSource;
    use std::sync::Arc;

    fn loader(n: usize, offset: usize) -> DataLoader {
        let windows = (0..n)
            .map(|i| {
                let s: Vec<f32> = (0..6).map(|t| ((i + offset + t) as f32 * 0.4).sin()).collect();
                Window {
                    input: s[..4].to_vec(),
                    target: s[4..].to_vec(),
                }
            })
            .collect();
        DataLoader::sequential(
            Arc::new(WindowDataset {
                split: Split::Train,
                seq_len: 4,
                pred_len: 2,
                in_channels: 1,
                out_channels: 1,
                windows,
            }),
            4,
        )
    }

    fn model() -> LinearForecaster {
        LinearForecaster::new(
            ModelShape {
                seq_len: 4,
                pred_len: 2,
                in_channels: 1,
                out_channels: 1,
            },
            0.0,
            true,
            LrSchedule {
                base_lr: 0.01,
                adjust: LrAdjust::Constant,
                total_steps: 100,
                pct_start: 0.3,
            },
            &SeedSource::new(5),
        )
    }

    fn trainer_config(dir: PathBuf, epochs: usize) -> TrainerConfig {
        TrainerConfig {
            max_epochs: epochs,
            devices: NonZeroUsize::MIN,
            accelerator: "auto".into(),
            strategy: Strategy::Sharded,
            precision: Precision::Full32,
            gradient_clip_val: GRADIENT_CLIP_VAL,
            accumulate_grad_batches: 2,
            log_every_n_steps: LOG_EVERY_N_STEPS,
            default_root_dir: dir,
        }
    }

    #[test]
    fn test_precision_parsing() {
        assert_eq!("32".parse::<Precision>(), Ok(Precision::Full32));
        assert_eq!("bf16-mixed".parse::<Precision>(), Ok(Precision::MixedBf16));
        assert_eq!(Precision::Mixed16.to_string(), "16-mixed");
        assert!("8".parse::<Precision>().is_err());
    }

    #[test]
    fn test_strategy_selection() {
        let two = NonZeroUsize::new(2).unwrap();
        assert_eq!(Strategy::select(true, NonZeroUsize::MIN), Strategy::Sharded);
        assert_eq!(Strategy::select(false, two), Strategy::DataParallel);
        assert_eq!(Strategy::select(false, NonZeroUsize::MIN), Strategy::SingleProcess);
    }

    #[test]
    fn test_config_from_experiment() {
        let config = ExperimentConfig {
            train_epochs: 7,
            gradient_accumulation_steps: 3,
            use_deep_speed: false,
            ..ExperimentConfig::default()
        };
        let tc = TrainerConfig::from_experiment(&config, PathBuf::from("/tmp/x")).unwrap();
        assert_eq!(tc.max_epochs, 7);
        assert_eq!(tc.accumulate_grad_batches, 3);
        assert_eq!(tc.strategy, Strategy::SingleProcess);
        assert_eq!(tc.gradient_clip_val, 0.5);
        assert_eq!(tc.accelerator, "auto");
    }

    #[test]
    fn test_mixed_precision_rounds_mantissa() {
        let mut g = ParameterSet::new(vec![crate::model::Parameter::new("w", vec![1.000_001])]);
        Precision::MixedBf16.round_gradients(&mut g);
        assert_eq!(g.params[0].values[0], 1.0);
    }

    #[test]
    fn test_fit_writes_checkpoints_and_tests_best() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExperimentConfig::default();
        let mut callbacks = CallbackSet::new();
        callbacks.push(Box::new(EarlyStopping::new(MONITOR, 10)));
        callbacks.push(Box::new(Ema::new(0.9)));
        add_checkpoint_policies(&mut callbacks, &config);
        let mut trainer = Trainer::new(trainer_config(dir.path().join("ckpt"), 3), callbacks);

        let mut m = model();
        let (mut train, mut val, mut test) = (loader(12, 0), loader(4, 20), loader(4, 40));
        let fit = trainer.fit(&mut m, &mut train, &mut val, &mut DisabledTracker).unwrap();
        assert_eq!(fit.epochs_run, 3);
        assert!(!fit.stopped_early);
        // 3 batches per epoch, 2 per optimizer step
        assert_eq!(trainer.global_step(), 6);
        assert_eq!(fit.metrics.lr_history.len(), 6);

        assert!(trainer.store().path_of("last.ckpt").exists());
        let best = trainer.store().best().unwrap().unwrap();
        assert!(trainer.store().path_of(&best.filename).exists());
        let snapshot = trainer.store().load(&best.filename).unwrap();
        assert!(snapshot.callbacks.contains_key("ema"));

        let outcome = trainer.test(&mut m, &mut test, &mut DisabledTracker).unwrap();
        assert_eq!(outcome.restored_from, Some(best.filename));
        assert!(outcome.test_loss.is_finite());
        assert!(trainer.checkpoint_failures().is_empty());
    }

    #[test]
    fn test_checkpoint_failure_does_not_abort_fit() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let mut callbacks = CallbackSet::new();
        add_checkpoint_policies(&mut callbacks, &ExperimentConfig::default());
        let mut trainer = Trainer::new(trainer_config(blocker.join("ckpt"), 2), callbacks);

        let mut m = model();
        let (mut train, mut val, mut test) = (loader(8, 0), loader(4, 20), loader(4, 40));
        let fit = trainer.fit(&mut m, &mut train, &mut val, &mut DisabledTracker).unwrap();
        assert_eq!(fit.epochs_run, 2);
        // best + last per epoch
        assert_eq!(trainer.checkpoint_failures().len(), 4);

        let outcome = trainer.test(&mut m, &mut test, &mut DisabledTracker).unwrap();
        assert_eq!(outcome.restored_from, None);
    }

    #[test]
    fn test_interval_checkpoint_uses_injected_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut callbacks = CallbackSet::new();
        add_checkpoint_policies(&mut callbacks, &ExperimentConfig::default());
        let origin = Instant::now();
        let ticks = std::sync::atomic::AtomicU64::new(0);
        // Every clock read advances one hour.
        let clock: Clock = Box::new(move || {
            let n = ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            origin + std::time::Duration::from_secs(3600 * n)
        });
        let mut trainer =
            Trainer::new(trainer_config(dir.path().to_path_buf(), 1), callbacks).with_clock(clock);
        let mut m = model();
        let (mut train, mut val) = (loader(16, 0), loader(4, 20));
        trainer.fit(&mut m, &mut train, &mut val, &mut DisabledTracker).unwrap();
        let interval: Vec<_> = trainer
            .store()
            .list()
            .unwrap()
            .into_iter()
            .filter(|e| e.filename.starts_with("time-checkpoint-step="))
            .collect();
        assert_eq!(interval.len(), 1);
    }
}
