//! Checkpoint policies: best-by-metric top-K and wall-clock interval.

use super::{
    Callback, CallbackAction, CheckpointKind, CheckpointOutcome, CheckpointRequest, Metrics,
    TrainState,
};
use crate::error::MlError;
use crate::tracker::Tracker;
use crate::training::view::ParameterView;
use std::time::{Duration, Instant};

pub const LAST_FILENAME: &str = "last.ckpt";

pub fn best_filename(epoch: usize, step: u64, value: f64) -> String {
    format!("epoch={epoch}-step={step}-val_loss={value:.4}.ckpt")
}

pub fn interval_filename(step: u64) -> String {
    format!("time-checkpoint-step={step}.ckpt")
}

/// Retains the `save_top_k` snapshots with the lowest monitored value and
/// always refreshes `last.ckpt`.
///
/// `save_top_k == -1` keeps every snapshot, `0` keeps none. A candidate equal
/// to the worst retained value replaces it.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    monitor: String,
    save_top_k: i64,
    /// `(value, filename)` in insertion order.
    kept: Vec<(f64, String)>,
    pending: Option<(f64, String)>,
}

impl BestCheckpoint {
    pub fn new(monitor: &str, save_top_k: i64) -> Self {
        Self {
            monitor: monitor.to_string(),
            save_top_k,
            kept: Vec::new(),
            pending: None,
        }
    }

    pub fn kept(&self) -> &[(f64, String)] {
        &self.kept
    }

    /// Lowest retained value and its file.
    pub fn best(&self) -> Option<&(f64, String)> {
        self.kept
            .iter()
            .fold(None, |best: Option<&(f64, String)>, entry| match best {
                Some(b) if b.0 <= entry.0 => Some(b),
                _ => Some(entry),
            })
    }

    /// Index of the worst retained entry; the oldest among equals.
    fn worst(&self) -> Option<usize> {
        let mut worst: Option<usize> = None;
        for (i, (value, _)) in self.kept.iter().enumerate() {
            if worst.is_none_or(|w| *value > self.kept[w].0) {
                worst = Some(i);
            }
        }
        worst
    }

    /// The request for a candidate, if it enters the top-K.
    fn candidate(&self, epoch: usize, step: u64, value: f64) -> Option<CheckpointRequest> {
        if !value.is_finite() || self.save_top_k == 0 {
            return None;
        }
        let filename = best_filename(epoch, step, value);
        let mut evict = Vec::new();
        if self.save_top_k > 0 && self.kept.len() as i64 >= self.save_top_k {
            let w = self.worst()?;
            if value > self.kept[w].0 {
                return None;
            }
            if self.kept[w].1 != filename {
                evict.push(self.kept[w].1.clone());
            }
        }
        Some(CheckpointRequest {
            filename,
            kind: CheckpointKind::Best,
            monitor: Some(value),
            evict,
        })
    }
}

impl Callback for BestCheckpoint {
    fn name(&self) -> &'static str {
        "best_checkpoint"
    }

    fn on_validation_end(
        &mut self,
        state: &TrainState,
        metrics: &Metrics,
    ) -> Result<CallbackAction, MlError> {
        let value = metrics.get(&self.monitor).copied().ok_or_else(|| {
            MlError::checkpoint(format!(
                "checkpoint policy monitors `{}`, which was not logged",
                self.monitor
            ))
        })?;
        let mut requests = Vec::with_capacity(2);
        if let Some(request) = self.candidate(state.epoch, state.global_step, value) {
            self.pending = Some((value, request.filename.clone()));
            requests.push(request);
        }
        requests.push(CheckpointRequest {
            filename: LAST_FILENAME.to_string(),
            kind: CheckpointKind::Last,
            monitor: Some(value),
            evict: Vec::new(),
        });
        Ok(CallbackAction::Checkpoint(requests))
    }

    fn on_checkpoint_result(&mut self, outcome: &CheckpointOutcome) {
        match outcome {
            CheckpointOutcome::Saved { filename, evicted } => {
                if let Some((value, pending)) = self.pending.take_if(|(_, f)| f == filename) {
                    self.kept.retain(|(_, f)| !evicted.contains(f) && *f != pending);
                    self.kept.push((value, pending));
                }
            }
            CheckpointOutcome::Failed { filename, .. } => {
                if self.pending.as_ref().is_some_and(|(_, f)| f == filename) {
                    self.pending = None;
                }
            }
        }
    }
}

/// Writes a snapshot whenever `interval` has elapsed since the previous one,
/// regardless of any metric.
#[derive(Debug, Clone)]
pub struct IntervalCheckpoint {
    interval: Duration,
    last: Option<Instant>,
}

impl IntervalCheckpoint {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// The request due at `now`, if any.
    pub fn poll(&mut self, now: Instant, step: u64) -> Option<CheckpointRequest> {
        let last = *self.last.get_or_insert(now);
        if now.saturating_duration_since(last) < self.interval {
            return None;
        }
        self.last = Some(now);
        Some(CheckpointRequest {
            filename: interval_filename(step),
            kind: CheckpointKind::Interval,
            monitor: None,
            evict: Vec::new(),
        })
    }
}

impl Callback for IntervalCheckpoint {
    fn name(&self) -> &'static str {
        "interval_checkpoint"
    }

    fn on_fit_start(
        &mut self,
        state: &TrainState,
        _params: &mut dyn ParameterView,
    ) -> Result<(), MlError> {
        self.last = Some(state.now);
        Ok(())
    }

    fn on_train_step_end(
        &mut self,
        state: &TrainState,
        _params: &mut dyn ParameterView,
        _tracker: &mut dyn Tracker,
    ) -> Result<CallbackAction, MlError> {
        Ok(match self.poll(state.now, state.global_step) {
            Some(request) => CallbackAction::Checkpoint(vec![request]),
            None => CallbackAction::Continue,
        })
    }
}
