//! Model container: the trainable models the trainer drives.
//!
//! The trainer only sees [`ForecastModel`]. [`build_model`] is the single place
//! that branches on [`ModelFamily`].

pub mod diffusion;
pub mod linear;
pub mod optim;
pub mod params;

pub use diffusion::DiffusionForecaster;
pub use linear::LinearForecaster;
pub use optim::{Adam, LrAdjust, LrSchedule};
pub use params::{Parameter, ParameterSet};

use crate::config::{ExperimentConfig, ModelFamily};
use crate::data::{Batch, DataLoader, Window, WindowDataset};
use crate::error::MlError;
use crate::training::reproducibility::SeedSource;
use rand::Rng;

/// Loss and gradients of one training batch.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    /// Gradient of the mean batch loss, laid out like the parameters.
    pub grads: ParameterSet,
}

/// A model the trainer can fit, validate and test.
pub trait ForecastModel: Send {
    fn name(&self) -> &str;

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Learning-rate schedule for the optimizer.
    fn schedule(&self) -> LrSchedule;

    fn training_step(&mut self, batch: &Batch<'_>) -> Result<StepOutput, MlError>;

    /// Mean loss of the batch; reported as `val_loss`.
    fn validation_step(&mut self, batch: &Batch<'_>) -> Result<f64, MlError>;

    /// Mean loss of the batch; reported as `test_loss`.
    fn test_step(&mut self, batch: &Batch<'_>) -> Result<f64, MlError> {
        self.validation_step(batch)
    }

    /// Called before every validation or test loop.
    fn on_eval_epoch_start(&mut self) {}
}

/// Window geometry a model is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub seq_len: usize,
    pub pred_len: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl ModelShape {
    pub fn of(dataset: &WindowDataset) -> Self {
        Self {
            seq_len: dataset.seq_len,
            pred_len: dataset.pred_len,
            in_channels: dataset.in_channels,
            out_channels: dataset.out_channels,
        }
    }

    /// `(input, target)` slices per output channel. Output channel `k` reads
    /// input channel `in_channels - out_channels + k`, i.e. targets sit last.
    pub(crate) fn channel_pairs<'w>(
        &self,
        window: &'w Window,
    ) -> Result<Vec<(&'w [f32], &'w [f32])>, MlError> {
        if window.input.len() != self.in_channels * self.seq_len
            || window.target.len() != self.out_channels * self.pred_len
        {
            return Err(MlError::model(format!(
                "window of {}/{} values does not match shape {:?}",
                window.input.len(),
                window.target.len(),
                self
            )));
        }
        let offset = self.in_channels - self.out_channels;
        Ok((0..self.out_channels)
            .map(|k| {
                let c = offset + k;
                (
                    &window.input[c * self.seq_len..(c + 1) * self.seq_len],
                    &window.target[k * self.pred_len..(k + 1) * self.pred_len],
                )
            })
            .collect())
    }
}

/// Subtract the window mean when `use_norm` is set.
pub(crate) fn normalize(x: &[f32], use_norm: bool) -> (Vec<f32>, f32) {
    let mean = if use_norm && !x.is_empty() {
        x.iter().sum::<f32>() / x.len() as f32
    } else {
        0.0
    };
    (x.iter().map(|v| v - mean).collect(), mean)
}

/// Inverted dropout on `x`.
pub(crate) fn dropout<R: Rng>(x: &mut [f32], p: f32, rng: &mut R) {
    if p <= 0.0 {
        return;
    }
    let keep = 1.0 / (1.0 - p);
    for v in x.iter_mut() {
        if rng.r#gen::<f32>() < p {
            *v = 0.0;
        } else {
            *v *= keep;
        }
    }
}

/// Uniform `[-1/sqrt(fan_in), 1/sqrt(fan_in))` initialization.
pub(crate) fn uniform_init<R: Rng>(n: usize, fan_in: usize, rng: &mut R) -> Vec<f32> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
}

/// The three loaders handed to the model container.
#[derive(Debug, Clone, Copy)]
pub struct ModelLoaders<'a> {
    pub train: &'a DataLoader,
    pub val: &'a DataLoader,
    pub test: &'a DataLoader,
}

/// Construct the model named by `config.model_family`.
pub fn build_model(
    config: &ExperimentConfig,
    loaders: ModelLoaders<'_>,
    seeds: &SeedSource,
) -> Result<Box<dyn ForecastModel>, MlError> {
    let shape = ModelShape::of(loaders.train.dataset());
    for (split, loader) in [("val", loaders.val), ("test", loaders.test)] {
        let other = ModelShape::of(loader.dataset());
        if other != shape {
            return Err(MlError::model(format!(
                "{split} split shape {other:?} differs from train shape {shape:?}"
            )));
        }
    }

    let adjust: LrAdjust = config.lradj.parse().map_err(MlError::config)?;
    let steps_per_epoch = loaders
        .train
        .num_batches()
        .div_ceil(config.gradient_accumulation_steps.max(1));
    let schedule = LrSchedule {
        base_lr: config.learning_rate,
        adjust,
        total_steps: (steps_per_epoch * config.train_epochs) as u64,
        pct_start: config.pct_start,
    };

    let model: Box<dyn ForecastModel> = match config.model_family {
        ModelFamily::Forecast => Box::new(LinearForecaster::new(
            shape,
            config.dropout as f32,
            config.use_norm,
            schedule,
            seeds,
        )),
        ModelFamily::Diffusion => Box::new(DiffusionForecaster::new(
            shape,
            config.timesteps,
            config.k_cond as f32,
            config.use_norm,
            schedule,
            seeds,
        )?),
    };
    tracing::info!(
        model = model.name(),
        parameters = model.parameters().num_values(),
        total_steps = schedule.total_steps,
        "Built model"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Split;
    use std::sync::Arc;

    fn dataset(in_channels: usize, out_channels: usize, n: usize) -> Arc<WindowDataset> {
        Arc::new(WindowDataset {
            split: Split::Train,
            seq_len: 4,
            pred_len: 2,
            in_channels,
            out_channels,
            windows: (0..n)
                .map(|i| Window {
                    input: vec![i as f32; in_channels * 4],
                    target: vec![i as f32; out_channels * 2],
                })
                .collect(),
        })
    }

    #[test]
    fn test_channel_pairs_align_targets_last() {
        let shape = ModelShape {
            seq_len: 2,
            pred_len: 1,
            in_channels: 3,
            out_channels: 1,
        };
        let window = Window {
            input: vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0],
            target: vec![9.0],
        };
        let pairs = shape.channel_pairs(&window).unwrap();
        assert_eq!(pairs, vec![(&[2.0f32, 2.0][..], &[9.0f32][..])]);
    }

    #[test]
    fn test_channel_pairs_rejects_bad_window() {
        let shape = ModelShape {
            seq_len: 2,
            pred_len: 1,
            in_channels: 1,
            out_channels: 1,
        };
        let window = Window {
            input: vec![0.0; 3],
            target: vec![0.0],
        };
        assert!(shape.channel_pairs(&window).is_err());
    }

    #[test]
    fn test_build_model_picks_family_and_schedule() {
        let train = DataLoader::sequential(dataset(2, 2, 10), 4);
        let val = DataLoader::sequential(dataset(2, 2, 3), 4);
        let test = DataLoader::sequential(dataset(2, 2, 3), 4);
        let loaders = ModelLoaders {
            train: &train,
            val: &val,
            test: &test,
        };
        let config = ExperimentConfig {
            train_epochs: 5,
            gradient_accumulation_steps: 2,
            ..ExperimentConfig::default()
        };
        let model = build_model(&config, loaders, &SeedSource::new(1)).unwrap();
        assert_eq!(model.name(), "linear");
        assert_eq!(model.schedule().total_steps, 10);

        let config = ExperimentConfig {
            model_family: ModelFamily::Diffusion,
            timesteps: 50,
            ..config
        };
        let model = build_model(&config, loaders, &SeedSource::new(1)).unwrap();
        assert_eq!(model.name(), "diffusion");
    }

    #[test]
    fn test_build_model_rejects_mismatched_splits() {
        let train = DataLoader::sequential(dataset(2, 2, 10), 4);
        let val = DataLoader::sequential(dataset(3, 3, 3), 4);
        let loaders = ModelLoaders {
            train: &train,
            val: &val,
            test: &train,
        };
        let err = build_model(&ExperimentConfig::default(), loaders, &SeedSource::new(1))
            .err()
            .unwrap();
        assert!(matches!(err, MlError::Model(_)));
    }

    #[test]
    fn test_normalize_and_dropout() {
        let (x, mean) = normalize(&[1.0, 2.0, 3.0], true);
        assert_eq!(mean, 2.0);
        assert_eq!(x, vec![-1.0, 0.0, 1.0]);
        let (x, mean) = normalize(&[1.0, 2.0], false);
        assert_eq!((x, mean), (vec![1.0, 2.0], 0.0));

        let mut rng = SeedSource::new(3).stream("noise");
        let mut v = vec![1.0f32; 1000];
        dropout(&mut v, 0.5, &mut rng);
        assert!(v.iter().all(|&x| x == 0.0 || x == 2.0));
        let zeros = v.iter().filter(|&&x| x == 0.0).count();
        assert!((350..650).contains(&zeros));
    }
}
