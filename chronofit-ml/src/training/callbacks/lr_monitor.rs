use super::{Callback, CallbackAction, TrainState};
use crate::error::MlError;
use crate::tracker::Tracker;
use crate::training::view::ParameterView;
use std::collections::BTreeMap;

/// Metric key the learning rate is logged under.
pub const LR_KEY: &str = "lr-Adam";

/// Logs the learning rate of every optimizer step.
#[derive(Debug, Clone, Default)]
pub struct LearningRateMonitor {
    history: Vec<(u64, f64)>,
}

impl LearningRateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(global_step, lr)` pairs in step order.
    pub fn history(&self) -> &[(u64, f64)] {
        &self.history
    }
}

impl Callback for LearningRateMonitor {
    fn name(&self) -> &'static str {
        "lr_monitor"
    }

    fn on_train_step_end(
        &mut self,
        state: &TrainState,
        _params: &mut dyn ParameterView,
        tracker: &mut dyn Tracker,
    ) -> Result<CallbackAction, MlError> {
        self.history.push((state.global_step, state.lr));
        tracker.log_metrics(&BTreeMap::from([(LR_KEY.to_string(), state.lr)]), state.global_step)?;
        Ok(CallbackAction::Continue)
    }
}
