//! Series sources: CSV files and a seeded synthetic generator.

use super::{DatasetProvider, DatasetRequest, Provisioned, Split, provision, split_range};
use crate::config::{ExperimentConfig, Features};
use crate::error::MlError;
use crate::training::reproducibility::SeedSource;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A multichannel series, channel-major, with the channel roles of the task.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub columns: Vec<String>,
    pub values: Vec<Vec<f32>>,
    pub input_channels: Vec<usize>,
    pub output_channels: Vec<usize>,
}

impl Series {
    /// Build a series, moving `target` last and assigning channel roles.
    pub fn with_task(
        mut columns: Vec<String>,
        mut values: Vec<Vec<f32>>,
        features: Features,
        target: &str,
    ) -> Result<Self, MlError> {
        let target_idx = columns
            .iter()
            .position(|c| c == target)
            .ok_or_else(|| MlError::dataset(format!("target column `{target}` not found")))?;
        let name = columns.remove(target_idx);
        columns.push(name);
        let series = values.remove(target_idx);
        values.push(series);

        let last = columns.len() - 1;
        let (input_channels, output_channels) = match features {
            Features::Multivariate => ((0..=last).collect(), (0..=last).collect()),
            Features::Univariate => (vec![last], vec![last]),
            Features::MultiToUni => ((0..=last).collect(), vec![last]),
        };
        Ok(Self {
            columns,
            values,
            input_channels,
            output_channels,
        })
    }

    pub fn len(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-channel standardization fitted on the training region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelScaler {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl ChannelScaler {
    pub fn fit(series: &Series, rows: std::ops::Range<usize>) -> Self {
        let (mean, std) = series
            .values
            .iter()
            .map(|channel| {
                let slice = &channel[rows.clone()];
                let n = slice.len().max(1) as f32;
                let mean = slice.iter().sum::<f32>() / n;
                let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
                (mean, var.sqrt().max(1e-8))
            })
            .unzip();
        Self { mean, std }
    }

    pub fn transform(&self, series: &mut Series) {
        for (c, channel) in series.values.iter_mut().enumerate() {
            for v in channel.iter_mut() {
                *v = (*v - self.mean[c]) / self.std[c];
            }
        }
    }
}

/// Standardize with statistics from the training rows and provision the split.
///
/// The scaler is attached to the configuration as a runtime value.
fn standardize_and_provision(
    mut config: ExperimentConfig,
    mut series: Series,
    request: &DatasetRequest,
    seeds: &SeedSource,
) -> Result<Provisioned, MlError> {
    let train_rows = split_range(series.len(), config.seq_len, 100, Split::Train, true);
    let scaler = ChannelScaler::fit(&series, train_rows);
    scaler.transform(&mut series);
    config
        .runtime
        .insert_json("columns", serde_json::to_value(&series.columns)?);
    config.runtime.insert_opaque("scaler", scaler);
    provision(config, &series, request, seeds)
}

/// Reads `<root_path>/<file>`: a header row, a timestamp column, numeric columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvProvider;

impl CsvProvider {
    pub fn read_series(path: &Path, features: Features, target: &str) -> Result<Series, MlError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| MlError::dataset(format!("cannot open {}: {e}", path.display())))?;

        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(MlError::dataset(format!(
                "{}: expected a timestamp column and at least one value column",
                path.display()
            )));
        }
        let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
        let mut values = vec![Vec::new(); columns.len()];

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            for (c, field) in record.iter().skip(1).enumerate() {
                let value: f32 = field.parse().map_err(|_| {
                    MlError::dataset(format!(
                        "{} row {}: column `{}` is not numeric: {field:?}",
                        path.display(),
                        row + 2,
                        columns[c]
                    ))
                })?;
                values[c].push(value);
            }
        }
        if values[0].is_empty() {
            return Err(MlError::dataset(format!("{} has no rows", path.display())));
        }
        Series::with_task(columns, values, features, target)
    }
}

impl DatasetProvider for CsvProvider {
    fn name(&self) -> &str {
        "csv"
    }

    fn provide(
        &self,
        config: ExperimentConfig,
        request: &DatasetRequest,
        seeds: &SeedSource,
    ) -> Result<Provisioned, MlError> {
        let series = Self::read_series(&request.path, config.features, &config.target)?;
        standardize_and_provision(config, series, request, seeds)
    }
}

/// Seeded mixture of sinusoids with Gaussian noise.
///
/// The channel count is fixed on the provider so every split of a run is cut
/// from the same series, whatever `enc_in` the threaded config carries.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticProvider {
    pub length: usize,
    pub channels: usize,
    pub noise_std: f32,
}

impl Default for SyntheticProvider {
    fn default() -> Self {
        Self {
            length: 2000,
            channels: 3,
            noise_std: 0.1,
        }
    }
}

impl SyntheticProvider {
    pub fn generate(
        &self,
        channels: usize,
        target: &str,
        seeds: &SeedSource,
    ) -> Result<Series, MlError> {
        let mut rng = seeds.stream("synthetic");
        let noise = Normal::new(0.0f32, self.noise_std)
            .map_err(|e| MlError::dataset(format!("invalid synthetic noise: {e}")))?;
        let channels = channels.max(1);
        let mut columns: Vec<String> = (0..channels - 1).map(|c| format!("x{c}")).collect();
        columns.push(target.to_string());

        let values = (0..channels)
            .map(|_| {
                let period = rng.gen_range(12.0f32..96.0);
                let phase = rng.gen_range(0.0f32..std::f32::consts::TAU);
                let amplitude = rng.gen_range(0.5f32..2.0);
                (0..self.length)
                    .map(|t| {
                        let angle = std::f32::consts::TAU * t as f32 / period + phase;
                        amplitude * angle.sin() + noise.sample(&mut rng)
                    })
                    .collect()
            })
            .collect();
        let all: Vec<usize> = (0..channels).collect();
        Ok(Series {
            columns,
            values,
            input_channels: all.clone(),
            output_channels: all,
        })
    }
}

impl DatasetProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn provide(
        &self,
        config: ExperimentConfig,
        request: &DatasetRequest,
        seeds: &SeedSource,
    ) -> Result<Provisioned, MlError> {
        let raw = self.generate(self.channels, &config.target, seeds)?;
        let series = Series::with_task(raw.columns, raw.values, config.features, &config.target)?;
        standardize_and_provision(config, series, request, seeds)
    }
}
