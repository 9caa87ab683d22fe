//! Training callbacks: early stopping, learning-rate monitoring, EMA of
//! weights and the two checkpoint policies.
//!
//! Each callback subscribes to the lifecycle events it needs. Callbacks never
//! write files themselves; they return [`CallbackAction::Checkpoint`] requests
//! which the trainer fulfils and reports back through
//! [`Callback::on_checkpoint_result`].

pub mod checkpointing;
pub mod early_stopping;
pub mod ema;
pub mod lr_monitor;

pub use checkpointing::{BestCheckpoint, IntervalCheckpoint};
pub use early_stopping::EarlyStopping;
pub use ema::Ema;
pub use lr_monitor::LearningRateMonitor;

use crate::config::ExperimentConfig;
use crate::error::MlError;
use crate::tracker::Tracker;
use crate::training::view::ParameterView;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Metrics logged at the end of a validation epoch.
pub type Metrics = BTreeMap<String, f64>;

/// Metric monitored by early stopping and the best-checkpoint policy.
pub const MONITOR: &str = "val_loss";

/// Wall-clock interval between safeguard snapshots.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Loop position passed to every event.
#[derive(Debug, Clone, Copy)]
pub struct TrainState {
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: u64,
    /// Learning rate of the latest optimizer step.
    pub lr: f64,
    pub now: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Best,
    Last,
    Interval,
}

/// A snapshot the trainer should write.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRequest {
    pub filename: String,
    pub kind: CheckpointKind,
    pub monitor: Option<f64>,
    /// Files to delete once this one is written.
    pub evict: Vec<String>,
}

/// What a callback asks the trainer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    Continue,
    Stop,
    Checkpoint(Vec<CheckpointRequest>),
}

/// Result of a checkpoint request, reported to the requesting callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Saved {
        filename: String,
        evicted: Vec<String>,
    },
    Failed {
        filename: String,
        error: String,
    },
}

/// A training-loop observer. Every event has a no-op default.
pub trait Callback: Send {
    /// Stable key for the callback's state inside snapshots.
    fn name(&self) -> &'static str;

    fn on_fit_start(
        &mut self,
        _state: &TrainState,
        _params: &mut dyn ParameterView,
    ) -> Result<(), MlError> {
        Ok(())
    }

    /// After every optimizer step.
    fn on_train_step_end(
        &mut self,
        _state: &TrainState,
        _params: &mut dyn ParameterView,
        _tracker: &mut dyn Tracker,
    ) -> Result<CallbackAction, MlError> {
        Ok(CallbackAction::Continue)
    }

    /// Before a validation or test loop.
    fn on_eval_enter(&mut self, _params: &mut dyn ParameterView) -> Result<(), MlError> {
        Ok(())
    }

    /// After a validation or test loop; undoes `on_eval_enter`.
    fn on_eval_exit(&mut self, _params: &mut dyn ParameterView) -> Result<(), MlError> {
        Ok(())
    }

    fn on_validation_end(
        &mut self,
        _state: &TrainState,
        _metrics: &Metrics,
    ) -> Result<CallbackAction, MlError> {
        Ok(CallbackAction::Continue)
    }

    fn on_checkpoint_result(&mut self, _outcome: &CheckpointOutcome) {}

    /// Extra state persisted in snapshots.
    fn checkpoint_state(&self) -> Result<Option<Value>, MlError> {
        Ok(None)
    }

    fn on_load_checkpoint(&mut self, _state: &Value) -> Result<(), MlError> {
        Ok(())
    }
}

/// Ordered collection of callbacks; actions are returned with the index of
/// the callback that issued them.
#[derive(Default)]
pub struct CallbackSet {
    callbacks: Vec<Box<dyn Callback>>,
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.iter().any(|c| c.name() == name)
    }

    pub fn on_fit_start(
        &mut self,
        state: &TrainState,
        params: &mut dyn ParameterView,
    ) -> Result<(), MlError> {
        for cb in &mut self.callbacks {
            cb.on_fit_start(state, params)?;
        }
        Ok(())
    }

    pub fn on_train_step_end(
        &mut self,
        state: &TrainState,
        params: &mut dyn ParameterView,
        tracker: &mut dyn Tracker,
    ) -> Result<Vec<(usize, CallbackAction)>, MlError> {
        let mut actions = Vec::new();
        for (i, cb) in self.callbacks.iter_mut().enumerate() {
            let action = cb.on_train_step_end(state, params, tracker)?;
            if action != CallbackAction::Continue {
                actions.push((i, action));
            }
        }
        Ok(actions)
    }

    pub fn on_eval_enter(&mut self, params: &mut dyn ParameterView) -> Result<(), MlError> {
        for cb in &mut self.callbacks {
            cb.on_eval_enter(params)?;
        }
        Ok(())
    }

    /// Reverse order of `on_eval_enter`.
    pub fn on_eval_exit(&mut self, params: &mut dyn ParameterView) -> Result<(), MlError> {
        for cb in self.callbacks.iter_mut().rev() {
            cb.on_eval_exit(params)?;
        }
        Ok(())
    }

    pub fn on_validation_end(
        &mut self,
        state: &TrainState,
        metrics: &Metrics,
    ) -> Result<Vec<(usize, CallbackAction)>, MlError> {
        let mut actions = Vec::new();
        for (i, cb) in self.callbacks.iter_mut().enumerate() {
            let action = cb.on_validation_end(state, metrics)?;
            if action != CallbackAction::Continue {
                actions.push((i, action));
            }
        }
        Ok(actions)
    }

    pub fn report(&mut self, index: usize, outcome: &CheckpointOutcome) {
        if let Some(cb) = self.callbacks.get_mut(index) {
            cb.on_checkpoint_result(outcome);
        }
    }

    /// State of every callback that has some, keyed by name.
    pub fn states(&self) -> Result<BTreeMap<String, Value>, MlError> {
        let mut states = BTreeMap::new();
        for cb in &self.callbacks {
            if let Some(state) = cb.checkpoint_state()? {
                states.insert(cb.name().to_string(), state);
            }
        }
        Ok(states)
    }

    pub fn load_states(&mut self, states: &BTreeMap<String, Value>) -> Result<(), MlError> {
        for cb in &mut self.callbacks {
            if let Some(state) = states.get(cb.name()) {
                cb.on_load_checkpoint(state)?;
            }
        }
        Ok(())
    }
}

/// Early stopping, EMA (unless `ema_decay == 1`) and the learning-rate monitor.
pub fn build_callbacks(config: &ExperimentConfig) -> CallbackSet {
    let mut set = CallbackSet::new();
    set.push(Box::new(EarlyStopping::new(MONITOR, config.patience)));
    if config.ema_decay != 1.0 {
        set.push(Box::new(Ema::new(config.ema_decay)));
    }
    set.push(Box::new(LearningRateMonitor::new()));
    set
}

/// Best-by-metric and time-interval checkpoint policies.
pub fn add_checkpoint_policies(set: &mut CallbackSet, config: &ExperimentConfig) {
    set.push(Box::new(BestCheckpoint::new(MONITOR, config.save_top_k)));
    set.push(Box::new(IntervalCheckpoint::new(CHECKPOINT_INTERVAL)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_callbacks_order() {
        let mut set = build_callbacks(&ExperimentConfig::default());
        add_checkpoint_policies(&mut set, &ExperimentConfig::default());
        assert_eq!(
            set.names(),
            vec![
                "early_stopping",
                "ema",
                "lr_monitor",
                "best_checkpoint",
                "interval_checkpoint"
            ]
        );
    }

    #[test]
    fn test_no_ema_at_unit_decay() {
        let config = ExperimentConfig {
            ema_decay: 1.0,
            ..ExperimentConfig::default()
        };
        let set = build_callbacks(&config);
        assert!(!set.contains("ema"));
        assert_eq!(set.len(), 2);
    }
}
