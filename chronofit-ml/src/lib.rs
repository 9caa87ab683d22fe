//! # chronofit-ml: experiment orchestration for forecasting and diffusion training
//!
//! This crate wires one training run end to end: configuration resolution,
//! seeding, dataset provisioning, model construction, callbacks, experiment
//! tracking and the fit/test loop. A sweep wraps the same pipeline once per
//! sampled configuration.
//!
//! ## Pipeline
//!
//! 1. [`ExperimentConfig::resolve`] layers defaults, a TOML file, `CHRONOFIT_*`
//!    environment variables and explicit command-line values.
//! 2. [`training::seed_everything`] returns the [`training::SeedSource`] every
//!    random consumer draws from.
//! 3. A [`data::DatasetProvider`] provisions train, val and test splits.
//! 4. [`model::build_model`] picks the model family.
//! 5. Callbacks and the tracker are attached and [`training::Trainer`] runs
//!    fit and test.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod runtime;

// Data & models
pub mod data;
pub mod model;

// Tracking & training
pub mod tracker;
pub mod training;

// Re-exports
pub use config::{ExperimentConfig, ModelFamily};
pub use error::MlError;
pub use training::{ExperimentRunner, RunReport, SweepController, SweepReport, SweepSpace};
