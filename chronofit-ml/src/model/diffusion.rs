//! Conditional denoising-diffusion forecaster.
//!
//! The forward process noises the (mean-normalized) target window over a linear
//! beta schedule; a linear network predicts the noise from the noisy target,
//! the timestep and the conditioning input window.

use super::{ForecastModel, LrSchedule, ModelShape, Parameter, ParameterSet, StepOutput, normalize, uniform_init};
use crate::data::Batch;
use crate::error::MlError;
use crate::training::reproducibility::{INIT_STREAM, NOISE_STREAM, SeedSource};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

const BETA_START: f64 = 1e-4;
const BETA_END: f64 = 0.02;

/// Cumulative products of `1 - beta_t` over a linear beta schedule.
pub fn alpha_bar_schedule(timesteps: usize) -> Vec<f64> {
    let mut acc = 1.0;
    (0..timesteps)
        .map(|t| {
            let beta = if timesteps > 1 {
                BETA_START + (BETA_END - BETA_START) * t as f64 / (timesteps - 1) as f64
            } else {
                BETA_START
            };
            acc *= 1.0 - beta;
            acc
        })
        .collect()
}

#[derive(Debug)]
pub struct DiffusionForecaster {
    shape: ModelShape,
    /// `cond_weight` (pred x seq), `mix`, `time`, `bias` (pred each).
    params: ParameterSet,
    alpha_bar: Vec<f64>,
    k_cond: f32,
    use_norm: bool,
    schedule: LrSchedule,
    seeds: SeedSource,
    noise: StdRng,
    eval_noise: StdRng,
}

impl DiffusionForecaster {
    pub fn new(
        shape: ModelShape,
        timesteps: usize,
        k_cond: f32,
        use_norm: bool,
        schedule: LrSchedule,
        seeds: &SeedSource,
    ) -> Result<Self, MlError> {
        if timesteps == 0 {
            return Err(MlError::model("diffusion needs at least one timestep"));
        }
        let mut init = seeds.stream(INIT_STREAM);
        let (l, p) = (shape.seq_len, shape.pred_len);
        let params = ParameterSet::new(vec![
            Parameter::new("cond_weight", uniform_init(p * l, l, &mut init)),
            Parameter::new("mix", uniform_init(p, 1, &mut init)),
            Parameter::new("time", uniform_init(p, 1, &mut init)),
            Parameter::new("bias", vec![0.0; p]),
        ]);
        Ok(Self {
            shape,
            params,
            alpha_bar: alpha_bar_schedule(timesteps),
            k_cond,
            use_norm,
            schedule,
            seeds: *seeds,
            noise: seeds.stream(NOISE_STREAM),
            eval_noise: Self::eval_stream(seeds),
        })
    }

    fn eval_stream(seeds: &SeedSource) -> StdRng {
        seeds.stream(&format!("{NOISE_STREAM}/eval"))
    }

    pub fn timesteps(&self) -> usize {
        self.alpha_bar.len()
    }

    /// Noise-prediction MSE; training draws from the noise stream, evaluation
    /// from a stream reset before every evaluation loop.
    fn pass(&mut self, batch: &Batch<'_>, mut grads: Option<&mut ParameterSet>) -> Result<f64, MlError> {
        let (l, p) = (self.shape.seq_len, self.shape.pred_len);
        let [cond, mix, time, bias] = &self.params.params[..] else {
            return Err(MlError::model("diffusion parameters are malformed"));
        };
        let rng = if grads.is_some() {
            &mut self.noise
        } else {
            &mut self.eval_noise
        };
        let mut sum = 0.0f64;
        let mut count = 0usize;

        for window in &batch.windows {
            for (x, y) in self.shape.channel_pairs(window)? {
                let (xn, mean) = normalize(x, self.use_norm);
                let t = rng.gen_range(0..self.alpha_bar.len());
                let ab = self.alpha_bar[t];
                let (signal, gamma) = (ab.sqrt() as f32, (1.0 - ab).sqrt() as f32);

                for j in 0..p {
                    let eps: f32 = rng.sample(StandardNormal);
                    let y_t = signal * (y[j] - mean) + gamma * eps;
                    let row = &cond.values[j * l..(j + 1) * l];
                    let conditioning = self.k_cond * row.iter().zip(&xn).map(|(w, v)| w * v).sum::<f32>();
                    let pred = conditioning + mix.values[j] * y_t + time.values[j] * gamma + bias.values[j];
                    let err = pred - eps;
                    sum += f64::from(err * err);
                    count += 1;
                    if let Some(g) = grads.as_deref_mut() {
                        let d = 2.0 * err;
                        for (gw, v) in g.params[0].values[j * l..(j + 1) * l].iter_mut().zip(&xn) {
                            *gw += d * self.k_cond * v;
                        }
                        g.params[1].values[j] += d * y_t;
                        g.params[2].values[j] += d * gamma;
                        g.params[3].values[j] += d;
                    }
                }
            }
        }
        if count == 0 {
            return Err(MlError::model("empty batch"));
        }
        if let Some(g) = grads {
            g.scale(1.0 / count as f32);
        }
        Ok(sum / count as f64)
    }
}

impl ForecastModel for DiffusionForecaster {
    fn name(&self) -> &str {
        "diffusion"
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn schedule(&self) -> LrSchedule {
        self.schedule
    }

    fn training_step(&mut self, batch: &Batch<'_>) -> Result<StepOutput, MlError> {
        let mut grads = self.params.zeros_like();
        let loss = self.pass(batch, Some(&mut grads))?;
        Ok(StepOutput { loss, grads })
    }

    fn validation_step(&mut self, batch: &Batch<'_>) -> Result<f64, MlError> {
        self.pass(batch, None)
    }

    fn on_eval_epoch_start(&mut self) {
        self.eval_noise = Self::eval_stream(&self.seeds);
    }
}
