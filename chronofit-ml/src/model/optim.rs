//! Optimizer, learning-rate schedules and gradient clipping.

use super::params::ParameterSet;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::str::FromStr;

/// Learning-rate adjustment named by `lradj`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrAdjust {
    /// Cosine annealing over all optimizer steps.
    Cosine,
    /// One-cycle: warm up for `pct_start` of the steps, then anneal.
    OneCycle,
    Constant,
}

impl FromStr for LrAdjust {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COS" | "cos" | "cosine" => Ok(Self::Cosine),
            "TST" | "one_cycle" => Ok(Self::OneCycle),
            "constant" | "none" => Ok(Self::Constant),
            other => Err(format!(
                "unknown lradj `{other}` (expected COS, TST or constant)"
            )),
        }
    }
}

/// Step-indexed learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub adjust: LrAdjust,
    pub total_steps: u64,
    pub pct_start: f64,
}

impl LrSchedule {
    const DIV_FACTOR: f64 = 25.0;
    const FINAL_DIV_FACTOR: f64 = 1e4;

    pub fn lr_at(&self, step: u64) -> f64 {
        let total = self.total_steps.max(1) as f64;
        let step = (step as f64).min(total);
        match self.adjust {
            LrAdjust::Constant => self.base_lr,
            LrAdjust::Cosine => self.base_lr * 0.5 * (1.0 + (PI * step / total).cos()),
            LrAdjust::OneCycle => {
                let initial = self.base_lr / Self::DIV_FACTOR;
                let min = initial / Self::FINAL_DIV_FACTOR;
                let warmup = (self.pct_start * total).max(1.0);
                if step <= warmup {
                    initial + (self.base_lr - initial) * step / warmup
                } else {
                    let progress = (step - warmup) / (total - warmup).max(1.0);
                    min + (self.base_lr - min) * 0.5 * (1.0 + (PI * progress).cos())
                }
            }
        }
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut ParameterSet, max_norm: f64) -> f64 {
    let norm = grads.l2_norm();
    if norm > max_norm {
        grads.scale((max_norm / (norm + 1e-6)) as f32);
    }
    norm
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: ParameterSet,
    v: ParameterSet,
    t: i32,
}

impl Adam {
    pub fn new(layout: &ParameterSet) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: layout.zeros_like(),
            v: layout.zeros_like(),
            t: 0,
        }
    }

    pub fn step(&mut self, params: &mut ParameterSet, grads: &ParameterSet, lr: f64) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        for (((p, g), m), v) in params
            .params
            .iter_mut()
            .zip(&grads.params)
            .zip(&mut self.m.params)
            .zip(&mut self.v.params)
        {
            for i in 0..p.values.len() {
                let grad = f64::from(g.values[i]);
                let m_i = self.beta1 * f64::from(m.values[i]) + (1.0 - self.beta1) * grad;
                let v_i = self.beta2 * f64::from(v.values[i]) + (1.0 - self.beta2) * grad * grad;
                m.values[i] = m_i as f32;
                v.values[i] = v_i as f32;
                let update = lr * (m_i / bc1) / ((v_i / bc2).sqrt() + self.eps);
                p.values[i] -= update as f32;
            }
        }
    }
}
