use crate::error::EngineError;
use crate::network::{tensor_from_vec, Network};
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug)]
pub struct Batch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub inputs: Tensor<B, 4>,
    pub labels: Vec<usize>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct DataSplits<B: Backend> {
    pub train: Vec<Batch<B>>,
    pub validation: Vec<Batch<B>>,
    pub test: Vec<Batch<B>>,
}

impl<B: Backend> DataSplits<B> {
    pub fn split(&self, split: Split) -> &[Batch<B>] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    /// First batch of a split, cut down to at most `limit` examples.
    pub fn sample_batch(&self, split: Split, limit: usize) -> Result<Tensor<B, 4>, EngineError> {
        let batch = self
            .split(split)
            .iter()
            .find(|batch| !batch.is_empty())
            .ok_or_else(|| EngineError::EmptySplit(split.to_string()))?;
        let [n, c, h, w] = batch.inputs.dims();
        let take = n.min(limit.max(1));
        Ok(batch.inputs.clone().slice([0..take, 0..c, 0..h, 0..w]))
    }
}

#[derive(Config, Debug)]
pub struct SyntheticDataConfig {
    #[config(default = 4)]
    pub train_batches: usize,
    #[config(default = 2)]
    pub validation_batches: usize,
    #[config(default = 2)]
    pub test_batches: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 1.0)]
    pub input_std: f64,
    #[config(default = 42)]
    pub seed: u64,
}

impl SyntheticDataConfig {
    /// Draws Gaussian inputs and labels them with `reference`'s own predictions,
    /// so the reference network scores 1.0 on every split.
    pub fn generate<B: Backend>(
        &self,
        reference: &Network<B>,
        device: &B::Device,
    ) -> Result<DataSplits<B>, EngineError> {
        let normal = Normal::new(0.0f64, self.input_std).map_err(|err| {
            EngineError::InvalidParameter {
                technique: "synthetic_data".to_string(),
                reason: err.to_string(),
            }
        })?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let [c, h, w] = reference.input_shape();
        let mut make_split = |batches: usize| -> Result<Vec<Batch<B>>, EngineError> {
            let mut split = Vec::with_capacity(batches);
            for _ in 0..batches {
                let data: Vec<f32> = (0..self.batch_size * c * h * w)
                    .map(|_| normal.sample(&mut rng) as f32)
                    .collect();
                let inputs = tensor_from_vec(data, [self.batch_size, c, h, w], device);
                let labels = reference.predict(inputs.clone())?;
                split.push(Batch { inputs, labels });
            }
            Ok(split)
        };
        Ok(DataSplits {
            train: make_split(self.train_batches)?,
            validation: make_split(self.validation_batches)?,
            test: make_split(self.test_batches)?,
        })
    }
}
