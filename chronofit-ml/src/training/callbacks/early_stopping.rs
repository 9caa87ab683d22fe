use super::{Callback, CallbackAction, Metrics, TrainState};
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stops training once the monitored metric has not strictly improved for
/// `patience` consecutive validation epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub monitor: String,
    pub patience: usize,
    pub min_delta: f64,
    wait_count: usize,
    best: Option<f64>,
    #[serde(skip)]
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(monitor: &str, patience: usize) -> Self {
        Self {
            monitor: monitor.to_string(),
            patience,
            min_delta: 0.0,
            wait_count: 0,
            best: None,
            stopped_epoch: None,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn wait_count(&self) -> usize {
        self.wait_count
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// Feed one validation value.
    pub fn observe(&mut self, epoch: usize, value: f64) -> CallbackAction {
        if !value.is_finite() {
            tracing::warn!(monitor = %self.monitor, value, epoch, "Monitored metric is not finite; stopping");
            self.stopped_epoch = Some(epoch);
            return CallbackAction::Stop;
        }
        match self.best {
            Some(best) if value >= best - self.min_delta => {
                self.wait_count += 1;
                if self.wait_count >= self.patience {
                    tracing::info!(
                        monitor = %self.monitor,
                        best,
                        epoch,
                        patience = self.patience,
                        "No improvement; stopping early"
                    );
                    self.stopped_epoch = Some(epoch);
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
            _ => {
                self.best = Some(value);
                self.wait_count = 0;
                CallbackAction::Continue
            }
        }
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &'static str {
        "early_stopping"
    }

    fn on_validation_end(
        &mut self,
        state: &TrainState,
        metrics: &Metrics,
    ) -> Result<CallbackAction, MlError> {
        let value = metrics.get(&self.monitor).copied().ok_or_else(|| {
            MlError::training(format!(
                "early stopping monitors `{}`, which was not logged",
                self.monitor
            ))
        })?;
        Ok(self.observe(state.epoch, value))
    }

    fn checkpoint_state(&self) -> Result<Option<Value>, MlError> {
        Ok(Some(serde_json::to_value(self)?))
    }

    fn on_load_checkpoint(&mut self, state: &Value) -> Result<(), MlError> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn state(epoch: usize) -> TrainState {
        TrainState {
            epoch,
            global_step: 0,
            lr: 0.0,
            now: Instant::now(),
        }
    }

    #[test]
    fn test_stops_after_patience_non_improving_epochs() {
        let mut cb = EarlyStopping::new("val_loss", 3);
        let losses = [1.0, 0.9, 0.95, 0.96, 0.97];
        let actions: Vec<_> = losses
            .iter()
            .enumerate()
            .map(|(i, &v)| cb.observe(i + 1, v))
            .collect();
        assert!(actions[..4].iter().all(|a| *a == CallbackAction::Continue));
        assert_eq!(actions[4], CallbackAction::Stop);
        assert_eq!(cb.best(), Some(0.9));
        assert_eq!(cb.stopped_epoch(), Some(5));
    }

    #[test]
    fn test_equal_value_is_not_improvement() {
        let mut cb = EarlyStopping::new("val_loss", 2);
        cb.observe(1, 0.5);
        assert_eq!(cb.observe(2, 0.5), CallbackAction::Continue);
        assert_eq!(cb.wait_count(), 1);
        assert_eq!(cb.observe(3, 0.4), CallbackAction::Continue);
        assert_eq!(cb.wait_count(), 0);
    }

    #[test]
    fn test_non_finite_stops_immediately() {
        let mut cb = EarlyStopping::new("val_loss", 10);
        assert_eq!(cb.observe(1, f64::NAN), CallbackAction::Stop);
    }

    #[test]
    fn test_missing_metric_is_error() {
        let mut cb = EarlyStopping::new("val_loss", 3);
        let metrics = Metrics::from([("train_loss".to_string(), 1.0)]);
        assert!(cb.on_validation_end(&state(1), &metrics).is_err());
    }

    #[test]
    fn test_state_round_trips_through_snapshot() {
        let mut cb = EarlyStopping::new("val_loss", 3);
        cb.observe(1, 0.7);
        cb.observe(2, 0.8);
        let saved = cb.checkpoint_state().unwrap().unwrap();
        let mut restored = EarlyStopping::new("val_loss", 3);
        restored.on_load_checkpoint(&saved).unwrap();
        assert_eq!(restored.best(), Some(0.7));
        assert_eq!(restored.wait_count(), 1);
    }
}
