//! Exponential moving average of the model weights.
//!
//! The shadow is kept in flat index space and updated shard by shard through
//! the [`ParameterView`], so the same routine serves local and sharded layouts.
//! Evaluation runs on the shadow: it is swapped in on eval enter and the live
//! weights are restored on eval exit, before training resumes.

use super::{Callback, CallbackAction, TrainState};
use crate::error::MlError;
use crate::tracker::Tracker;
use crate::training::view::ParameterView;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ema {
    decay: f64,
    shadow: Option<Vec<f32>>,
    /// Live weights while the shadow is swapped in.
    #[serde(skip)]
    backup: Option<Vec<f32>>,
}

impl Ema {
    pub fn new(decay: f64) -> Self {
        Self {
            decay,
            shadow: None,
            backup: None,
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn shadow(&self) -> Option<&[f32]> {
        self.shadow.as_deref()
    }

    pub fn is_swapped(&self) -> bool {
        self.backup.is_some()
    }

    /// `shadow = decay * shadow + (1 - decay) * live`, one shard at a time.
    pub fn update(&mut self, params: &dyn ParameterView) -> Result<(), MlError> {
        if self.backup.is_some() {
            return Err(MlError::training(
                "EMA update while shadow weights are swapped in",
            ));
        }
        let d = self.decay;
        let shadow = self.shadow.get_or_insert_with(|| params.gather());
        if shadow.len() != params.num_values() {
            return Err(MlError::training(format!(
                "EMA shadow holds {} values, model has {}",
                shadow.len(),
                params.num_values()
            )));
        }
        let mut buf = Vec::new();
        for (i, range) in params.shards().iter().enumerate() {
            buf.resize(range.len(), 0.0);
            params.pull_shard(i, &mut buf);
            for (s, &live) in shadow[range.clone()].iter_mut().zip(&buf) {
                *s = (d * f64::from(*s) + (1.0 - d) * f64::from(live)) as f32;
            }
        }
        Ok(())
    }
}

impl Callback for Ema {
    fn name(&self) -> &'static str {
        "ema"
    }

    fn on_fit_start(
        &mut self,
        _state: &TrainState,
        params: &mut dyn ParameterView,
    ) -> Result<(), MlError> {
        self.shadow = Some(params.gather());
        self.backup = None;
        Ok(())
    }

    fn on_train_step_end(
        &mut self,
        _state: &TrainState,
        params: &mut dyn ParameterView,
        _tracker: &mut dyn Tracker,
    ) -> Result<CallbackAction, MlError> {
        self.update(params)?;
        Ok(CallbackAction::Continue)
    }

    fn on_eval_enter(&mut self, params: &mut dyn ParameterView) -> Result<(), MlError> {
        let Some(shadow) = self.shadow.as_ref() else {
            return Ok(());
        };
        if self.backup.is_some() {
            return Err(MlError::training("EMA shadow weights are already swapped in"));
        }
        self.backup = Some(params.gather());
        params.scatter(shadow)
    }

    fn on_eval_exit(&mut self, params: &mut dyn ParameterView) -> Result<(), MlError> {
        match self.backup.take() {
            Some(live) => params.scatter(&live),
            None => Ok(()),
        }
    }

    fn checkpoint_state(&self) -> Result<Option<Value>, MlError> {
        Ok(Some(serde_json::to_value(self)?))
    }

    fn on_load_checkpoint(&mut self, state: &Value) -> Result<(), MlError> {
        let restored: Self = serde_json::from_value(state.clone())?;
        self.decay = restored.decay;
        self.shadow = restored.shadow;
        self.backup = None;
        Ok(())
    }
}
