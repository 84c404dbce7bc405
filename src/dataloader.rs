//! Data loader

use std::{cell::RefCell, collections::HashSet};

use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::tensor::{Shape, Tensor};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Cannot load batches from an empty dataset")]
    EmptyDataset,
    #[error("Batch size must be positive")]
    ZeroBatchSize,
}

/// A group of samples stacked into a `[batch, input_dim]` tensor with their class labels
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<f32>>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    // reshuffles reproducibly when set, otherwise the thread rng is used
    rng: Option<RefCell<Pcg64Mcg>>,
}

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        if data.is_empty() {
            return Err(DataLoaderError::EmptyDataset);
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        let input_dims = data.iter().map(|d| d.len()).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
            rng: None,
        })
    }

    /// Draws every shuffle from a generator seeded with `seed`
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Some(RefCell::new(Pcg64Mcg::seed_from_u64(seed)));
        self
    }

    pub fn n_samples(&self) -> usize {
        self.data.len()
    }

    pub fn input_dim(&self) -> usize {
        self.data.first().map_or(0, |d| d.len())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per pass, counting a trailing partial batch
    pub fn n_batches(&self) -> usize {
        self.data.len().div_ceil(self.batch_size)
    }

    /// Starts a new pass over the dataset. Each call draws a fresh permutation when shuffling.
    pub fn iter(&self) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            match &self.rng {
                Some(rng) => indices.shuffle(&mut *rng.borrow_mut()),
                None => indices.shuffle(&mut rand::rng()),
            }
        }
        DataLoaderIterator {
            data: &self.data,
            labels: &self.labels,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Batch;
    type IntoIter = DataLoaderIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    data: &'a [Vec<f32>],
    labels: &'a [usize],
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.data.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        let input_dim = self.data[batch_indices[0]].len();

        let mut inputs = Vec::with_capacity(batch_indices.len() * input_dim);
        for &i in batch_indices {
            inputs.extend_from_slice(&self.data[i]);
        }
        let labels = batch_indices.iter().map(|&i| self.labels[i]).collect();
        self.curr_iter = end;

        Some(Batch {
            inputs: Tensor::constant(inputs, Shape::new(batch_indices.len(), input_dim)),
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataloader() {
        let data = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let labels = vec![0, 1];
        let dataloader = DataLoader::new(data, labels, 2, false).unwrap();
        let mut iter = dataloader.iter();
        assert_eq!(
            iter.next(),
            Some(Batch {
                inputs: Tensor::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap(),
                labels: vec![0, 1],
            })
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_partial_last_batch() {
        let data = (0..5).map(|i| vec![i as f32]).collect::<Vec<_>>();
        let labels = (0..5).collect::<Vec<_>>();
        let dataloader = DataLoader::new(data, labels, 2, false).unwrap();
        assert_eq!(dataloader.n_samples(), 5);
        assert_eq!(dataloader.input_dim(), 1);
        assert_eq!(dataloader.batch_size(), 2);
        assert_eq!(dataloader.n_batches(), 3);
        let sizes = dataloader.iter().map(|b| b.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 1]);
        let last = dataloader.iter().last().unwrap();
        assert_eq!(last.inputs.shape(), Shape::new(1, 1));
        assert_eq!(last.labels, vec![4]);
    }

    #[test]
    fn test_dataloader_shuffle() {
        let seed = 42;
        let data = (0..50).map(|i| vec![i as f32, -(i as f32)]).collect::<Vec<_>>();
        let labels = (0..50).collect::<Vec<_>>();
        let first = DataLoader::new(data.clone(), labels.clone(), 8, true)
            .unwrap()
            .with_seed(seed);
        let second = DataLoader::new(data, labels, 8, true)
            .unwrap()
            .with_seed(seed);

        let order = |loader: &DataLoader| {
            loader
                .iter()
                .flat_map(|b| b.labels)
                .collect::<Vec<_>>()
        };
        let epoch_1 = order(&first);
        assert_eq!(epoch_1, order(&second));
        assert_ne!(epoch_1, (0..50).collect::<Vec<_>>());

        // every sample is visited exactly once and rows stay paired with labels
        let mut sorted = epoch_1.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        for batch in &first {
            for (r, label) in batch.labels.iter().enumerate() {
                assert_eq!(batch.inputs.row(r), vec![*label as f32, -(*label as f32)]);
            }
        }

        // restarting draws a new permutation
        assert_ne!(order(&first), epoch_1);
    }

    #[test]
    fn test_dataloader_errors() {
        // different length data and labels
        let data = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let labels = vec![1, 0, 1];
        let expected_label_len = labels.len();
        let expected_data_len = data.len();
        let dataloader = DataLoader::new(data, labels, 2, false);
        assert!(matches!(
            dataloader,
            Err(DataLoaderError::LabelLengthMismatch {
                label_len,
                data_len,
            }) if label_len == expected_label_len && data_len == expected_data_len
        ));

        let data = vec![vec![1.0, 2.0], vec![4.0]];
        assert!(matches!(
            DataLoader::new(data, vec![0, 1], 2, false),
            Err(DataLoaderError::InputDimensionMismatch { .. })
        ));
        assert!(matches!(
            DataLoader::new(vec![], vec![], 2, false),
            Err(DataLoaderError::EmptyDataset)
        ));
        assert!(matches!(
            DataLoader::new(vec![vec![1.0]], vec![0], 0, false),
            Err(DataLoaderError::ZeroBatchSize)
        ));
    }
}
