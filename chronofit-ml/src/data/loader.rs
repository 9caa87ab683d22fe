use super::{Window, WindowDataset};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Borrowed batch of windows.
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    pub windows: Vec<&'a Window>,
}

impl Batch<'_> {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Batches a [`WindowDataset`]; shuffles each epoch when given a generator.
#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<WindowDataset>,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl DataLoader {
    pub fn shuffled(dataset: Arc<WindowDataset>, batch_size: usize, rng: StdRng) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rng: Some(rng),
        }
    }

    pub fn sequential(dataset: Arc<WindowDataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rng: None,
        }
    }

    pub fn dataset(&self) -> &WindowDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn shuffles(&self) -> bool {
        self.rng.is_some()
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Sample order of the next epoch. Consumes randomness when shuffling.
    pub fn next_order(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        order
    }

    /// Batches of the next epoch.
    pub fn epoch(&mut self) -> Vec<Batch<'_>> {
        let order = self.next_order();
        let dataset = &self.dataset;
        order
            .chunks(self.batch_size)
            .map(|chunk| Batch {
                windows: chunk.iter().map(|&i| &dataset.windows[i]).collect(),
            })
            .collect()
    }
}
