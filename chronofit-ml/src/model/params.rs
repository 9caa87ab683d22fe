use serde::{Deserialize, Serialize};

/// A named flat tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub values: Vec<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered trainable parameters of a model; gradients share the layout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterSet {
    pub params: Vec<Parameter>,
}

impl ParameterSet {
    pub fn new(params: Vec<Parameter>) -> Self {
        Self { params }
    }

    /// Same names and shapes, all zeros.
    pub fn zeros_like(&self) -> Self {
        Self {
            params: self
                .params
                .iter()
                .map(|p| Parameter::new(p.name.clone(), vec![0.0; p.len()]))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn num_values(&self) -> usize {
        self.params.iter().map(Parameter::len).sum()
    }

    pub fn same_layout(&self, other: &Self) -> bool {
        self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.name == b.name && a.len() == b.len())
    }

    pub fn l2_norm(&self) -> f64 {
        self.params
            .iter()
            .flat_map(|p| p.values.iter())
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt()
    }

    pub fn scale(&mut self, factor: f32) {
        for v in self.params.iter_mut().flat_map(|p| p.values.iter_mut()) {
            *v *= factor;
        }
    }

    /// `self += other`; layouts must match.
    pub fn add_assign(&mut self, other: &Self) {
        for (a, b) in self.params.iter_mut().zip(&other.params) {
            for (x, y) in a.values.iter_mut().zip(&b.values) {
                *x += y;
            }
        }
    }

    pub fn fill_zero(&mut self) {
        for p in &mut self.params {
            p.values.fill(0.0);
        }
    }

    /// Copy flat positions `start..start + out.len()` across tensor boundaries.
    pub fn read_flat(&self, start: usize, out: &mut [f32]) {
        self.walk_flat(start, out.len(), |values, offset| {
            let n = values.len();
            out[offset..offset + n].copy_from_slice(values);
        });
    }

    /// Overwrite flat positions `start..start + src.len()`.
    pub fn write_flat(&mut self, start: usize, src: &[f32]) {
        let mut pos = 0;
        let end = start + src.len();
        for p in &mut self.params {
            let (lo, hi) = (pos, pos + p.len());
            pos = hi;
            if hi <= start || lo >= end {
                continue;
            }
            let (a, b) = (start.max(lo), end.min(hi));
            p.values[a - lo..b - lo].copy_from_slice(&src[a - start..b - start]);
        }
    }

    pub fn to_flat(&self) -> Vec<f32> {
        self.params.iter().flat_map(|p| p.values.iter().copied()).collect()
    }

    fn walk_flat(&self, start: usize, len: usize, mut f: impl FnMut(&[f32], usize)) {
        let mut pos = 0;
        let end = start + len;
        for p in &self.params {
            let (lo, hi) = (pos, pos + p.len());
            pos = hi;
            if hi <= start || lo >= end {
                continue;
            }
            let (a, b) = (start.max(lo), end.min(hi));
            f(&p.values[a - lo..b - lo], a - start);
        }
    }
}
