use std::{
    fs, io,
    path::{Path, PathBuf},
};

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Data, Int, Shape, Tensor},
};
use image::GrayImage;

use crate::{
    image_data,
    utils::vocabulary::{Vocabulary, VocabularyError},
};

pub const LABELS_FILE: &str = "labels.txt";

/// Share of the dataset, in tenths, that goes to training.
const TRAINING_TENTHS: usize = 9;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("fail to read `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fail to decode image `{path}`")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("line {line} of `{path}` is not `<image path>\\t<label>`")]
    MalformedLine { path: PathBuf, line: usize },
    #[error("label on line {line} of `{path}` cannot be encoded")]
    Label {
        path: PathBuf,
        line: usize,
        #[source]
        source: VocabularyError,
    },
    #[error("label of {len} symbols exceeds the maximum output length {max_len}")]
    LabelTooLong { len: usize, max_len: usize },
}

/// An image with its encoded label.
#[derive(Clone, Debug)]
pub struct Sample {
    pub image: GrayImage,
    pub label: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct OcrDataset {
    samples: Vec<Sample>,
}

impl OcrDataset {
    /// Loads every sample listed in `<root>/labels.txt`. Each line holds an
    /// image path relative to `root` and its label, separated by a tab.
    pub fn load<P: AsRef<Path>>(root: P, vocab: &Vocabulary) -> Result<Self, DataError> {
        let root = root.as_ref();
        let labels_path = root.join(LABELS_FILE);
        let data = fs::read_to_string(&labels_path).map_err(|source| DataError::Io {
            path: labels_path.clone(),
            source,
        })?;

        let mut samples = Vec::new();
        for (idx, row) in data.lines().enumerate() {
            let line = idx + 1;
            let row = row.trim_end_matches('\r');
            if row.trim().is_empty() {
                continue;
            }
            let (path, label) = row
                .split_once('\t')
                .filter(|(path, _)| !path.trim().is_empty())
                .ok_or_else(|| DataError::MalformedLine {
                    path: labels_path.clone(),
                    line,
                })?;

            let label = vocab.encode(label).map_err(|source| DataError::Label {
                path: labels_path.clone(),
                line,
                source,
            })?;
            let image_path = root.join(path.trim());
            let image = image::open(&image_path)
                .map_err(|source| DataError::Image {
                    path: image_path,
                    source,
                })?
                .into_luma8();

            samples.push(Sample { image, label });
        }
        tracing::debug!("loaded {} samples from {}", samples.len(), root.display());

        Ok(Self { samples })
    }

    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Cuts the dataset by index: the first 90% for training, the rest for
    /// validation. The order of the samples is kept.
    pub fn split(self) -> (Vec<Sample>, Vec<Sample>) {
        let mut training = self.samples;
        let validation = training.split_off(split_index(training.len()));

        (training, validation)
    }
}

/// `floor(0.9 * len)`.
pub fn split_index(len: usize) -> usize {
    len * TRAINING_TENTHS / 10
}

/// A sample already fitted to the canvas and laid out for teacher forcing.
#[derive(Clone, Debug)]
pub struct OcrItem {
    pub image: GrayImage,
    /// `<GO> c1 .. cn <PAD> ..`
    pub decoder_input: Vec<u32>,
    /// `n + 1`, counting the `<GO>` token.
    pub decoder_length: usize,
    /// `c1 .. cn <EOS> <PAD> ..`
    pub target: Vec<u32>,
}

impl OcrItem {
    pub fn new(
        image: GrayImage,
        label: &[u32],
        vocab: &Vocabulary,
        max_len: usize,
    ) -> Result<Self, DataError> {
        if label.len() > max_len {
            return Err(DataError::LabelTooLong {
                len: label.len(),
                max_len,
            });
        }
        let steps = max_len + 1;

        let mut decoder_input = Vec::with_capacity(steps);
        decoder_input.push(vocab.go());
        decoder_input.extend_from_slice(label);
        decoder_input.resize(steps, vocab.pad());

        let mut target = Vec::with_capacity(steps);
        target.extend_from_slice(label);
        target.push(vocab.eos());
        target.resize(steps, vocab.pad());

        Ok(Self {
            image,
            decoder_input,
            decoder_length: label.len() + 1,
            target,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OcrBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub decoder_inputs: Tensor<B, 2, Int>,
    pub decoder_lengths: Tensor<B, 1, Int>,
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> OcrBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
pub struct OcrBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> OcrBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<OcrItem, OcrBatch<B>> for OcrBatcher<B> {
    /// All items must share the canvas size and the sequence length.
    fn batch(&self, items: Vec<OcrItem>) -> OcrBatch<B> {
        let batch_size = items.len();
        let (width, height) = items
            .first()
            .map(|item| item.image.dimensions())
            .unwrap_or((0, 0));
        let steps = items.first().map(|item| item.target.len()).unwrap_or(0);

        let mut pixels = Vec::with_capacity(batch_size * (height * width) as usize);
        let mut decoder_inputs = Vec::with_capacity(batch_size * steps);
        let mut decoder_lengths = Vec::with_capacity(batch_size);
        let mut targets = Vec::with_capacity(batch_size * steps);

        for item in items {
            image_data::extend_normalized(&mut pixels, &item.image);
            decoder_inputs.extend(item.decoder_input.into_iter().map(i64::from));
            decoder_lengths.push(item.decoder_length as i64);
            targets.extend(item.target.into_iter().map(i64::from));
        }

        let images = Tensor::<B, 4>::from_data(
            Data::new(
                pixels,
                Shape::new([batch_size, 1, height as usize, width as usize]),
            )
            .convert::<B::FloatElem>(),
            &self.device,
        );
        let decoder_inputs = Tensor::<B, 2, Int>::from_data(
            Data::new(decoder_inputs, Shape::new([batch_size, steps])).convert::<B::IntElem>(),
            &self.device,
        );
        let decoder_lengths = Tensor::<B, 1, Int>::from_data(
            Data::new(decoder_lengths, Shape::new([batch_size])).convert::<B::IntElem>(),
            &self.device,
        );
        let targets = Tensor::<B, 2, Int>::from_data(
            Data::new(targets, Shape::new([batch_size, steps])).convert::<B::IntElem>(),
            &self.device,
        );

        OcrBatch {
            images,
            decoder_inputs,
            decoder_lengths,
            targets,
        }
    }
}
