use std::borrow::Cow;

use burn::{data::dataloader::batcher::Batcher, tensor::backend::Backend};
use rand::Rng;

use crate::{
    augment,
    dataset::{DataError, OcrBatch, OcrBatcher, OcrItem, Sample},
    image_data,
    utils::vocabulary::Vocabulary,
};

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub height: u32,
    pub width: u32,
    pub max_len: usize,
    /// Probability of swapping a sample for a synthetic one.
    pub fake: f64,
}

/// Fixed-size batches over a slice of samples. The last batch may be
/// smaller. Every call to [`OcrBatches::iter`] starts over from the first
/// sample.
pub struct OcrBatches<'a, B: Backend> {
    samples: &'a [Sample],
    vocab: &'a Vocabulary,
    batcher: OcrBatcher<B>,
    config: BatchConfig,
}

impl<'a, B: Backend> OcrBatches<'a, B> {
    pub fn new(
        samples: &'a [Sample],
        vocab: &'a Vocabulary,
        device: B::Device,
        config: BatchConfig,
    ) -> Self {
        Self {
            samples,
            vocab,
            batcher: OcrBatcher::new(device),
            config,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size())
    }

    pub fn iter<'b, R: Rng>(&'b self, rng: &'b mut R) -> BatchIter<'b, 'a, B, R> {
        BatchIter {
            batches: self,
            rng,
            cursor: 0,
        }
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    fn prepare<R: Rng>(&self, sample: &Sample, rng: &mut R) -> Result<OcrItem, DataError> {
        let fake = self.config.fake;
        let sample = match fake > 0.0 && rng.gen_bool(fake.min(1.0)) {
            true => augment::splice_samples(self.samples, self.config.max_len, rng)
                .map(Cow::Owned)
                .unwrap_or(Cow::Borrowed(sample)),
            false => Cow::Borrowed(sample),
        };
        let image = image_data::fit_to_canvas(&sample.image, self.config.height, self.config.width);

        OcrItem::new(image, &sample.label, self.vocab, self.config.max_len)
    }
}

pub struct BatchIter<'b, 'a, B: Backend, R: Rng> {
    batches: &'b OcrBatches<'a, B>,
    rng: &'b mut R,
    cursor: usize,
}

impl<'b, 'a, B: Backend, R: Rng> Iterator for BatchIter<'b, 'a, B, R> {
    type Item = Result<OcrBatch<B>, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let samples = self.batches.samples;
        if self.cursor >= samples.len() {
            return None;
        }
        let end = (self.cursor + self.batches.batch_size()).min(samples.len());
        let chunk = &samples[self.cursor..end];
        self.cursor = end;

        let items = chunk
            .iter()
            .map(|sample| self.batches.prepare(sample, self.rng))
            .collect::<Result<Vec<_>, _>>();

        Some(items.map(|items| self.batches.batcher.batch(items)))
    }
}
