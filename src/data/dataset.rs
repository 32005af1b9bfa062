use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::tokenizer::GPT2Tokenizer;

/// One padded training sequence
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub targets: Vec<u32>,
    /// 1.0 where the target is a real token, 0.0 on padding
    pub loss_mask: Vec<f32>,
}

impl Sample {
    /// Build the shifted input/target pair for a token sequence
    pub fn from_tokens(mut tokens: Vec<u32>, max_length: usize, pad_token_id: u32) -> Option<Self> {
        tokens.truncate(max_length);
        if tokens.len() < 2 {
            return None;
        }
        let real = tokens.len();
        tokens.resize(max_length, pad_token_id);

        let input_ids = tokens[..max_length - 1].to_vec();
        let targets = tokens[1..].to_vec();
        let loss_mask = (1..max_length)
            .map(|pos| if pos < real { 1.0 } else { 0.0 })
            .collect();

        Some(Self {
            input_ids,
            targets,
            loss_mask,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.len()
    }
}

/// Tokenized chat examples ready for training
pub struct ChatDataset {
    samples: Vec<Sample>,
    max_length: usize,
    device: Device,
}

impl ChatDataset {
    /// Encode each example followed by EOS, truncated and padded to `max_length`
    pub fn new(
        examples: &[String],
        tokenizer: &GPT2Tokenizer,
        max_length: usize,
        device: &Device,
    ) -> Result<Self> {
        let eos = tokenizer.eos_token_id();
        let pad = tokenizer.pad_token_id();

        let encoded: Vec<Vec<u32>> = examples
            .par_iter()
            .map(|text| -> Result<Vec<u32>> {
                let mut ids = tokenizer.encode(text)?;
                ids.push(eos);
                Ok(ids)
            })
            .collect::<Result<_>>()?;

        let total = encoded.len();
        let samples: Vec<Sample> = encoded
            .into_iter()
            .filter_map(|ids| Sample::from_tokens(ids, max_length, pad))
            .collect();

        if samples.len() < total {
            log::debug!("Skipped {} examples too short to train on", total - samples.len());
        }
        log::info!(
            "Created dataset with {} samples of {} tokens",
            samples.len(),
            max_length
        );

        Ok(Self {
            samples,
            max_length,
            device: device.clone(),
        })
    }

    /// Wrap samples that are already padded to `max_length`
    pub fn from_samples(samples: Vec<Sample>, max_length: usize, device: &Device) -> Self {
        debug_assert!(samples.iter().all(|s| s.seq_len() + 1 == max_length));
        Self {
            samples,
            max_length,
            device: device.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn sample(&self, idx: usize) -> Option<&Sample> {
        self.samples.get(idx)
    }

    /// Number of tokens that contribute to the loss
    pub fn trained_tokens(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.loss_mask.iter().filter(|&&m| m > 0.0).count())
            .sum()
    }

    pub fn dataloader(&self, batch_size: usize, shuffle: bool, drop_last: bool, seed: u64) -> DataLoader {
        DataLoader::new(self, batch_size, shuffle, drop_last, seed)
    }
}

/// A batch of `(input, target, mask)` tensors
pub struct Batch {
    pub input_ids: Tensor,
    pub targets: Tensor,
    pub loss_mask: Tensor,
}

/// Batch iterator over a [`ChatDataset`]
pub struct DataLoader<'a> {
    dataset: &'a ChatDataset,
    batch_size: usize,
    indices: Vec<usize>,
    current_idx: usize,
    shuffle: bool,
    drop_last: bool,
    rng: StdRng,
}

impl<'a> DataLoader<'a> {
    fn new(dataset: &'a ChatDataset, batch_size: usize, shuffle: bool, drop_last: bool, seed: u64) -> Self {
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            indices: (0..dataset.len()).collect(),
            current_idx: 0,
            shuffle,
            drop_last,
            rng: StdRng::seed_from_u64(seed),
        };

        if shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }

        loader
    }

    /// Get the number of batches
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.indices.len() / self.batch_size
        } else {
            self.indices.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewind for the next epoch, reshuffling if enabled
    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn stack(&self, batch_indices: &[usize]) -> Result<Batch> {
        let seq_len = self.dataset.max_length - 1;
        let b = batch_indices.len();
        let mut inputs = Vec::with_capacity(b * seq_len);
        let mut targets = Vec::with_capacity(b * seq_len);
        let mut mask = Vec::with_capacity(b * seq_len);

        for &idx in batch_indices {
            let sample = &self.dataset.samples[idx];
            inputs.extend_from_slice(&sample.input_ids);
            targets.extend_from_slice(&sample.targets);
            mask.extend_from_slice(&sample.loss_mask);
        }

        let device = &self.dataset.device;
        Ok(Batch {
            input_ids: Tensor::from_vec(inputs, (b, seq_len), device)?,
            targets: Tensor::from_vec(targets, (b, seq_len), device)?,
            loss_mask: Tensor::from_vec(mask, (b, seq_len), device)?,
        })
    }
}

impl<'a> Iterator for DataLoader<'a> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len().saturating_sub(self.current_idx);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }

        let batch_end = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = self.indices[self.current_idx..batch_end].to_vec();
        self.current_idx = batch_end;

        Some(self.stack(&batch_indices))
    }
}
