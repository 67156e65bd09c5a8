//! Mini-batch iteration

use super::dataset::Dataset;
use crate::train::Batch;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Batches over an owned dataset
///
/// Shuffling is seeded by `seed + epoch`, so an epoch's order is
/// reproducible across runs and resumes.
#[derive(Clone, Debug)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch, counting a final partial batch
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Sample order of one epoch
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn iter(&self, epoch: usize) -> Batches<'_> {
        Batches {
            loader: self,
            order: self.order(epoch),
            cursor: 0,
        }
    }

    /// First batch of epoch 0
    pub fn first(&self) -> Option<Batch> {
        self.iter(0).next()
    }
}

/// Iterator over the batches of one epoch
#[derive(Debug)]
pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let (inputs, targets) = self.loader.dataset.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(Batch::new(inputs, targets))
    }
}
