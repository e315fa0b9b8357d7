//! Epoch-wise data loading

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{BatchAssembler, ClassificationBatch, Example, LabeledSplit};
use crate::error::{Error, Result};

/// Produces the batches of one split, epoch by epoch
#[derive(Debug, Clone)]
pub struct DataLoader {
    examples: Vec<Example>,
    assembler: BatchAssembler,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    /// Create a loader over a split; labels are checked immediately
    pub fn new(split: &LabeledSplit, assembler: BatchAssembler, shuffle: bool, seed: u64) -> Result<Self> {
        Self::from_examples(split.examples.clone(), assembler, shuffle, seed)
    }

    /// Create a loader over raw examples
    pub fn from_examples(
        examples: Vec<Example>,
        assembler: BatchAssembler,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        assembler.validate(&examples)?;
        Ok(Self {
            examples,
            assembler,
            shuffle,
            seed,
        })
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the loader has no examples
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        self.examples.len().div_ceil(self.assembler.batch_size())
    }

    /// Example order for `epoch`. Shuffling is seeded by `seed + epoch`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Collate batch `index` of an epoch order
    pub fn batch_at(&self, order: &[usize], index: usize) -> Result<ClassificationBatch> {
        let batch_size = self.assembler.batch_size();
        let start = index * batch_size;
        if start >= order.len() {
            return Err(Error::shape(format!(
                "batch {index} is past the end of a {}-example epoch",
                order.len()
            )));
        }
        let end = (start + batch_size).min(order.len());
        let chunk: Vec<Example> = order[start..end]
            .iter()
            .map(|&i| self.examples[i].clone())
            .collect();
        self.assembler.collate(&chunk)
    }

    /// Batches of `epoch`, collated one at a time as the iterator advances
    pub fn epoch_batches(&self, epoch: usize) -> EpochBatches<'_> {
        EpochBatches {
            loader: self,
            order: self.epoch_order(epoch),
            next: 0,
            total: self.num_batches(),
        }
    }
}

/// Lazy iterator over the batches of one epoch
pub struct EpochBatches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    next: usize,
    total: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<ClassificationBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let batch = self.loader.batch_at(&self.order, self.next);
        self.next += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn loader(shuffle: bool) -> DataLoader {
        let examples: Vec<_> = (0..10u32).map(|i| Example::new(vec![i + 1], (i % 2) as usize)).collect();
        let assembler = BatchAssembler::new(3, 2, 0, Device::Cpu).unwrap();
        DataLoader::from_examples(examples, assembler, shuffle, 7).unwrap()
    }

    fn batches(loader: &DataLoader, epoch: usize) -> Vec<ClassificationBatch> {
        loader.epoch_batches(epoch).collect::<Result<Vec<_>>>().unwrap()
    }

    fn first_tokens(batches: &[ClassificationBatch]) -> Vec<u32> {
        batches
            .iter()
            .flat_map(|b| b.input_ids.to_vec2::<u32>().unwrap())
            .map(|row| row[0])
            .collect()
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(loader(false).num_batches(), 4);
        assert_eq!(loader(false).epoch_batches(0).len(), 4);
        assert_eq!(batches(&loader(false), 0).len(), 4);
    }

    #[test]
    fn test_unshuffled_order_is_stable() {
        let tokens = first_tokens(&batches(&loader(false), 3));
        assert_eq!(tokens, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_is_seeded_per_epoch() {
        let l = loader(true);
        let a = first_tokens(&batches(&l, 1));
        let b = first_tokens(&batches(&l, 1));
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_batches_are_collated_on_demand() {
        let l = loader(true);
        let mut iter = l.epoch_batches(2);
        assert_eq!(iter.len(), 4);

        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.batch_size, 3);
        assert_eq!(iter.len(), 3);

        let rest: Vec<_> = iter.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(rest.last().unwrap().batch_size, 1);
    }

    #[test]
    fn test_batch_past_end_is_rejected() {
        let l = loader(false);
        let order = l.epoch_order(0);
        assert!(l.batch_at(&order, 3).is_ok());
        assert!(matches!(l.batch_at(&order, 4), Err(Error::Shape(_))));
    }
}
