//! Per-run training history.

use serde::{Deserialize, Serialize};

/// Loss and learning-rate history of one fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub train_loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    /// `(global_step, lr)` per optimizer step.
    pub lr_history: Vec<(u64, f64)>,
    /// 1-based epoch of the lowest validation loss.
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, train_loss: f64, val_loss: f64) {
        self.train_loss_history.push(train_loss);
        self.val_loss_history.push(val_loss);
        self.epochs_completed += 1;

        if val_loss.is_finite() && self.best_val_loss.is_none_or(|best| val_loss < best) {
            self.best_val_loss = Some(val_loss);
            self.best_epoch = Some(self.epochs_completed);
        }
    }

    pub fn record_lr(&mut self, step: u64, lr: f64) {
        self.lr_history.push((step, lr));
    }
}

/// Running weighted mean of per-batch losses.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanLoss {
    sum: f64,
    weight: usize,
}

impl MeanLoss {
    pub fn add(&mut self, batch_mean: f64, batch_len: usize) {
        self.sum += batch_mean * batch_len as f64;
        self.weight += batch_len;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.weight > 0).then(|| self.sum / self.weight as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_metrics() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.5, 0.6);
        metrics.record_epoch(0.3, 0.4);
        metrics.record_epoch(0.2, f64::NAN);
        assert_eq!(metrics.epochs_completed, 3);
        assert_eq!(metrics.best_epoch, Some(2));
        assert_eq!(metrics.best_val_loss, Some(0.4));
    }

    #[test]
    fn test_mean_loss_weights_by_batch() {
        let mut mean = MeanLoss::default();
        assert_eq!(mean.mean(), None);
        mean.add(1.0, 3);
        mean.add(3.0, 1);
        assert_eq!(mean.mean(), Some(1.5));
    }
}
