use super::{
    ForecastModel, LrSchedule, ModelShape, Parameter, ParameterSet, StepOutput, dropout,
    normalize, uniform_init,
};
use crate::data::Batch;
use crate::error::MlError;
use crate::training::reproducibility::{INIT_STREAM, NOISE_STREAM, SeedSource};
use rand::rngs::StdRng;

/// Direct multi-step forecaster: one linear map `seq_len -> pred_len` shared
/// by every channel, applied to mean-normalized inputs.
#[derive(Debug)]
pub struct LinearForecaster {
    shape: ModelShape,
    params: ParameterSet,
    dropout: f32,
    use_norm: bool,
    schedule: LrSchedule,
    noise: StdRng,
}

impl LinearForecaster {
    pub fn new(
        shape: ModelShape,
        dropout: f32,
        use_norm: bool,
        schedule: LrSchedule,
        seeds: &SeedSource,
    ) -> Self {
        let mut init = seeds.stream(INIT_STREAM);
        let (l, p) = (shape.seq_len, shape.pred_len);
        let params = ParameterSet::new(vec![
            Parameter::new("weight", uniform_init(p * l, l, &mut init)),
            Parameter::new("bias", uniform_init(p, l, &mut init)),
        ]);
        Self {
            shape,
            params,
            dropout,
            use_norm,
            schedule,
            noise: seeds.stream(NOISE_STREAM),
        }
    }

    /// Mean squared error over the batch; accumulates gradients when given.
    fn pass(&mut self, batch: &Batch<'_>, mut grads: Option<&mut ParameterSet>) -> Result<f64, MlError> {
        let (l, p) = (self.shape.seq_len, self.shape.pred_len);
        let weight = &self.params.params[0].values;
        let bias = &self.params.params[1].values;
        let mut sum = 0.0f64;
        let mut count = 0usize;

        for window in &batch.windows {
            for (x, y) in self.shape.channel_pairs(window)? {
                let (mut xn, mean) = normalize(x, self.use_norm);
                if grads.is_some() {
                    dropout(&mut xn, self.dropout, &mut self.noise);
                }
                for j in 0..p {
                    let row = &weight[j * l..(j + 1) * l];
                    let pred = row.iter().zip(&xn).map(|(w, v)| w * v).sum::<f32>() + bias[j] + mean;
                    let err = pred - y[j];
                    sum += f64::from(err * err);
                    count += 1;
                    if let Some(g) = grads.as_deref_mut() {
                        let d = 2.0 * err;
                        for (gw, v) in g.params[0].values[j * l..(j + 1) * l].iter_mut().zip(&xn) {
                            *gw += d * v;
                        }
                        g.params[1].values[j] += d;
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

impl ForecastModel for LinearForecaster {
    fn name(&self) -> &str {
        "linear"
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Window;
    use crate::model::LrAdjust;
    use crate::model::optim::Adam;

    fn schedule() -> LrSchedule {
        LrSchedule {
            base_lr: 0.05,
            adjust: LrAdjust::Constant,
            total_steps: 1,
            pct_start: 0.0,
        }
    }

    fn shape() -> ModelShape {
        ModelShape {
            seq_len: 4,
            pred_len: 2,
            in_channels: 1,
            out_channels: 1,
        }
    }

    fn windows() -> Vec<Window> {
        (0..16)
            .map(|i| {
                let s: Vec<f32> = (0..6).map(|t| ((i + t) as f32 * 0.3).sin()).collect();
                Window {
                    input: s[..4].to_vec(),
                    target: s[4..].to_vec(),
                }
            })
            .collect()
    }

    #[test]
    fn test_same_seed_same_init() {
        let a = LinearForecaster::new(shape(), 0.1, true, schedule(), &SeedSource::new(8));
        let b = LinearForecaster::new(shape(), 0.1, true, schedule(), &SeedSource::new(8));
        assert_eq!(a.parameters(), b.parameters());
        assert_eq!(a.parameters().num_values(), 10);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut model = LinearForecaster::new(shape(), 0.0, true, schedule(), &SeedSource::new(1));
        let windows = windows();
        let batch = Batch {
            windows: windows.iter().collect(),
        };
        let out = model.training_step(&batch).unwrap();

        let h = 1e-3f32;
        model.params.params[0].values[3] += h;
        let up = model.validation_step(&batch).unwrap();
        model.params.params[0].values[3] -= 2.0 * h;
        let down = model.validation_step(&batch).unwrap();
        let numeric = (up - down) / (2.0 * f64::from(h));
        let analytic = f64::from(out.grads.params[0].values[3]);
        assert!((numeric - analytic).abs() < 1e-2, "{numeric} vs {analytic}");
    }

    #[test]
    fn test_adam_reduces_loss() {
        let mut model = LinearForecaster::new(shape(), 0.0, true, schedule(), &SeedSource::new(2));
        let windows = windows();
        let batch = Batch {
            windows: windows.iter().collect(),
        };
        let before = model.validation_step(&batch).unwrap();
        let mut adam = Adam::new(model.parameters());
        for _ in 0..50 {
            let out = model.training_step(&batch).unwrap();
            adam.step(model.parameters_mut(), &out.grads, 0.05);
        }
        assert!(model.validation_step(&batch).unwrap() < before);
    }
}
