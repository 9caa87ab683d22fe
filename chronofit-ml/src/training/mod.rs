//! Training infrastructure: trainer, callbacks, checkpoints, runs and sweeps.

pub mod callbacks;
pub mod checkpoint;
pub mod metrics;
pub mod reproducibility;
pub mod runner;
pub mod sweep;
pub mod trainer;
pub mod view;

pub use checkpoint::{CheckpointEntry, CheckpointStore, Snapshot};
pub use metrics::TrainingMetrics;
pub use reproducibility::{SeedSource, seed_everything};
pub use runner::{ExperimentRunner, RunReport};
pub use sweep::{SweepController, SweepReport, SweepSpace};
pub use trainer::{Precision, Strategy, Trainer, TrainerConfig};
pub use view::{LocalView, ParameterView, ShardedView};
