//! Dataset provisioning: series sources, split borders, windowing and loaders.
//!
//! The orchestration layer only sees [`DatasetProvider`]: given the configuration
//! and a [`DatasetRequest`] it returns a dataset handle, a loader and the
//! (possibly updated) configuration that later calls must use.

pub mod loader;
pub mod source;

pub use loader::{Batch, DataLoader};
pub use source::{ChannelScaler, CsvProvider, Series, SyntheticProvider};

use crate::config::ExperimentConfig;
use crate::error::MlError;
use crate::training::reproducibility::SeedSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        })
    }
}

/// What the pipeline asks the provider for.
#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub dataset_id: String,
    pub path: PathBuf,
    /// Carve the validation split out of the development region.
    pub val_from_train: bool,
    pub split: Split,
}

impl DatasetRequest {
    /// Request for the pretraining dataset named by the configuration.
    pub fn pretrain(config: &ExperimentConfig, val_from_train: bool, split: Split) -> Self {
        Self {
            dataset_id: config.data_pretrain.clone(),
            path: config.root_path.join(&config.data_path_pretrain),
            val_from_train,
            split,
        }
    }
}

/// One supervised window: channel-major inputs and targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// `in_channels * seq_len` values, channel `c` at `c * seq_len..`.
    pub input: Vec<f32>,
    /// `out_channels * pred_len` values, channel `c` at `c * pred_len..`.
    pub target: Vec<f32>,
}

/// Windowed split of a series.
#[derive(Debug, Clone)]
pub struct WindowDataset {
    pub split: Split,
    pub seq_len: usize,
    pub pred_len: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub windows: Vec<Window>,
}

impl WindowDataset {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Provider output.
#[derive(Debug)]
pub struct Provisioned {
    pub dataset: Arc<WindowDataset>,
    pub loader: DataLoader,
    /// Configuration to thread into every subsequent call.
    pub config: ExperimentConfig,
}

/// Source of datasets and loaders.
pub trait DatasetProvider: Send + Sync {
    fn name(&self) -> &str;

    fn provide(
        &self,
        config: ExperimentConfig,
        request: &DatasetRequest,
        seeds: &SeedSource,
    ) -> Result<Provisioned, MlError>;
}

/// Select the provider named by `config.loader`.
pub fn provider_for(config: &ExperimentConfig) -> Box<dyn DatasetProvider> {
    match config.loader.as_str() {
        "synthetic" => Box::new(SyntheticProvider::default()),
        _ => Box::new(CsvProvider),
    }
}

/// Row ranges of each split, with `seq_len` of look-back overlap.
///
/// The development region is the first 80% of the series; the last 20% is
/// held out. With `val_from_train` the development region is split 70/10 into
/// train and val; without it train uses the whole development region and val
/// falls back to the held-out region.
pub fn split_range(
    total: usize,
    seq_len: usize,
    percent: usize,
    split: Split,
    val_from_train: bool,
) -> Range<usize> {
    let num_train = total * 7 / 10;
    let num_test = total * 2 / 10;
    let dev_end = total - num_test;
    let held_out = dev_end.saturating_sub(seq_len)..total;

    match (split, val_from_train) {
        (Split::Train, carve) => {
            let end = if carve { num_train } else { dev_end };
            let end = if percent < 100 {
                end.saturating_sub(seq_len) * percent / 100 + seq_len
            } else {
                end
            };
            0..end.min(total)
        }
        (Split::Val, true) => num_train.saturating_sub(seq_len)..dev_end,
        (Split::Val, false) | (Split::Test, _) => held_out,
    }
}

/// Cut `(seq_len -> pred_len)` windows every `stride` rows of `range`.
pub fn make_windows(
    series: &Series,
    range: Range<usize>,
    seq_len: usize,
    pred_len: usize,
    stride: usize,
) -> Vec<Window> {
    let span = seq_len + pred_len;
    if range.len() < span {
        return Vec::new();
    }
    let last_start = range.end - span;
    (range.start..=last_start)
        .step_by(stride.max(1))
        .map(|start| {
            let mut input = Vec::with_capacity(series.input_channels.len() * seq_len);
            for &c in &series.input_channels {
                input.extend_from_slice(&series.values[c][start..start + seq_len]);
            }
            let mut target = Vec::with_capacity(series.output_channels.len() * pred_len);
            for &c in &series.output_channels {
                target.extend_from_slice(&series.values[c][start + seq_len..start + span]);
            }
            Window { input, target }
        })
        .collect()
}

/// Window a series for a request and build the loader, recording the inferred
/// channel counts in the returned configuration.
pub(crate) fn provision(
    mut config: ExperimentConfig,
    series: &Series,
    request: &DatasetRequest,
    seeds: &SeedSource,
) -> Result<Provisioned, MlError> {
    let range = split_range(
        series.len(),
        config.seq_len,
        config.percent,
        request.split,
        request.val_from_train,
    );
    let windows = make_windows(series, range.clone(), config.seq_len, config.pred_len, config.stride);
    if windows.is_empty() {
        return Err(MlError::dataset(format!(
            "{} split of `{}` has rows {}..{}, too short for seq_len {} + pred_len {}",
            request.split,
            request.dataset_id,
            range.start,
            range.end,
            config.seq_len,
            config.pred_len
        )));
    }

    config.enc_in = series.input_channels.len();
    config.dec_in = series.input_channels.len();
    config.c_out = series.output_channels.len();

    let dataset = Arc::new(WindowDataset {
        split: request.split,
        seq_len: config.seq_len,
        pred_len: config.pred_len,
        in_channels: series.input_channels.len(),
        out_channels: series.output_channels.len(),
        windows,
    });
    let loader = match request.split {
        Split::Train => DataLoader::shuffled(
            Arc::clone(&dataset),
            config.batch_size,
            seeds.stream(&format!("{}/{}", crate::training::reproducibility::DATA_STREAM, request.split)),
        ),
        Split::Val | Split::Test => {
            DataLoader::sequential(Arc::clone(&dataset), config.eval_batch_size)
        }
    };
    tracing::debug!(
        dataset = %request.dataset_id,
        split = %request.split,
        windows = dataset.len(),
        batches = loader.num_batches(),
        "Provisioned split"
    );
    Ok(Provisioned {
        dataset,
        loader,
        config,
    })
}
