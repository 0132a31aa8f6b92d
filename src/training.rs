use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    batches::{BatchConfig, OcrBatches},
    checkpoint::{CheckpointError, CheckpointKind, CheckpointStore, ConfigKind},
    dataset::{DataError, OcrDataset, Sample},
    loss::masked_cross_entropy,
    model::ocr_net::{ModelConfigError, OcrNet, OcrNetConfig},
    optim::{OptimizerSettings, UpdateRule},
    utils::vocabulary::{Vocabulary, VocabularyError},
};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 100)]
    pub max_epochs: usize,
    #[config(default = 0.001)]
    pub learning_rate: f64,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 128)]
    pub img_h: usize,
    #[config(default = 384)]
    pub img_w: usize,
    /// Longest label the decoder has to emit, `<EOS>` excluded.
    #[config(default = 8)]
    pub seq_len: usize,
    #[config(default = 208)]
    pub dims: usize,
    /// Probability of training on a synthetic sample instead of a real one.
    #[config(default = 0.0)]
    pub fake: f64,
    #[config(default = "UpdateRule::Adam")]
    pub optimizer: UpdateRule,
    #[config(default = 3)]
    pub stacks: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch size must be positive".into()));
        }
        if self.seq_len == 0 {
            return Err(TrainError::Config(
                "output sequence length must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fake) {
            return Err(TrainError::Config(format!(
                "synthetic sample probability {} is outside [0, 1]",
                self.fake
            )));
        }

        Ok(())
    }

    pub fn model_config(&self, num_classes: usize) -> OcrNetConfig {
        OcrNetConfig::new([self.img_h, self.img_w], num_classes, self.seq_len)
            .with_dimensions(self.dims)
            .with_stacks(self.stacks)
            .with_n_heads(self.n_heads)
            .with_dropout(self.dropout)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            height: self.img_h as u32,
            width: self.img_w as u32,
            max_len: self.seq_len,
            fake: self.fake,
        }
    }
}

/// Where the labeled images and the vocabulary are read from.
#[derive(Clone, Debug)]
pub struct DataSource {
    pub data_dir: PathBuf,
    pub vocabulary: PathBuf,
}

impl Default for DataSource {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/train"),
            vocabulary: PathBuf::from("data/train/vocabulary.json"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Training,
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Training => f.write_str("training"),
            Phase::Validation => f.write_str("validation"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("invalid training configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Model(#[from] ModelConfigError),
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("the {phase} split is empty ({total} samples loaded)")]
    EmptySplit { phase: Phase, total: usize },
    #[error("{phase} loss diverged at epoch {epoch}, batch {batch}: {loss}")]
    Divergence {
        phase: Phase,
        epoch: usize,
        batch: usize,
        loss: f64,
    },
}

fn check_finite(phase: Phase, epoch: usize, batch: usize, loss: f64) -> Result<(), TrainError> {
    match loss.is_finite() {
        true => Ok(()),
        false => Err(TrainError::Divergence {
            phase,
            epoch,
            batch,
            loss,
        }),
    }
}

/// Running mean of per-batch losses.
#[derive(Clone, Debug, Default)]
pub struct LossAccumulator {
    total: f64,
    batches: usize,
}

impl LossAccumulator {
    pub fn update(&mut self, loss: f64) {
        self.total += loss;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// `NaN` before the first batch.
    pub fn average(&self) -> f64 {
        self.total / self.batches as f64
    }
}

#[derive(Clone, Debug)]
pub struct BatchProgress {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f64,
    pub average_loss: f64,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct EpochSummary {
    pub epoch: usize,
    pub training_loss: f64,
    pub validation_loss: f64,
    pub training_batches: usize,
    pub validation_batches: usize,
    pub duration: Duration,
}

pub trait TrainingObserver {
    fn on_batch(&mut self, progress: &BatchProgress);
    fn on_epoch(&mut self, summary: &EpochSummary);
}

/// Prints one line per training batch and one per epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleObserver;

impl ConsoleObserver {
    pub fn batch_line(progress: &BatchProgress) -> String {
        format!(
            "[Epoch {}  Batch {}]  batch_loss {:.10}  average_loss {:.10}  elapsed {:.2}s",
            progress.epoch,
            progress.batch,
            progress.loss,
            progress.average_loss,
            progress.elapsed.as_secs_f64()
        )
    }

    pub fn epoch_line(summary: &EpochSummary) -> String {
        format!(
            "[Epoch {}]  training_loss {:.10}  validation_loss {:.10}  duration {:.2}s",
            summary.epoch,
            summary.training_loss,
            summary.validation_loss,
            summary.duration.as_secs_f64()
        )
    }
}

impl TrainingObserver for ConsoleObserver {
    fn on_batch(&mut self, progress: &BatchProgress) {
        println!("{}", Self::batch_line(progress));
    }

    fn on_epoch(&mut self, summary: &EpochSummary) {
        println!("{}", Self::epoch_line(summary));
    }
}

#[derive(Clone, Debug)]
pub struct TrainingSummary {
    pub resumed_model: bool,
    pub resumed_optimizer: bool,
    pub epochs: Vec<EpochSummary>,
}

/// Mean masked loss of `model` over every batch, without gradients.
pub fn evaluate<B: Backend, R: Rng>(
    model: &OcrNet<B>,
    batches: &OcrBatches<'_, B>,
    padding_idx: u32,
    epoch: usize,
    rng: &mut R,
) -> Result<LossAccumulator, TrainError> {
    let mut accumulator = LossAccumulator::default();
    for batch in batches.iter(rng) {
        let batch = batch?;
        let output = model.forward(batch.images, batch.decoder_inputs, batch.decoder_lengths);
        let loss = masked_cross_entropy(output.logits, batch.targets, padding_idx)
            .into_scalar()
            .elem::<f64>();
        check_finite(Phase::Validation, epoch, accumulator.batches() + 1, loss)?;
        accumulator.update(loss);
    }

    Ok(accumulator)
}

/// Trains the run `run_id` for `config.max_epochs` epochs, resuming from its
/// checkpoints when they exist, and checkpoints after every epoch.
pub fn train<B, S, O>(
    config: &TrainingConfig,
    source: &DataSource,
    run_id: &str,
    store: &S,
    device: B::Device,
    observer: &mut O,
) -> Result<TrainingSummary, TrainError>
where
    B: AutodiffBackend,
    S: CheckpointStore<B>,
    O: TrainingObserver,
{
    config.validate()?;

    let vocab = Vocabulary::load(&source.vocabulary)?;
    tracing::info!("vocabulary size: {}", vocab.size());
    let model_config = config.model_config(vocab.size());
    model_config.validate()?;

    tracing::info!("loading dataset from {}", source.data_dir.display());
    let dataset = OcrDataset::load(&source.data_dir, &vocab)?;
    let total = dataset.len();
    let (training_set, validation_set) = dataset.split();
    tracing::info!("training set: {}", training_set.len());
    tracing::info!("validation set: {}", validation_set.len());
    if training_set.is_empty() {
        return Err(TrainError::EmptySplit {
            phase: Phase::Training,
            total,
        });
    }
    if validation_set.is_empty() {
        return Err(TrainError::EmptySplit {
            phase: Phase::Validation,
            total,
        });
    }

    B::seed(config.seed);
    let mut model = model_config.init::<B>(&device);
    let resumed_model = match store.load(run_id, CheckpointKind::Model, &device)? {
        Some(record) => {
            ensure_compatible::<B, S>(store, run_id, &model_config)?;
            model = model.load_record(record);
            true
        }
        None => {
            tracing::info!("no checkpoint for run `{run_id}`, starting from scratch");
            false
        }
    };
    store.save_config(run_id, ConfigKind::Training, config)?;
    store.save_config(run_id, ConfigKind::Model, &model_config)?;

    let settings = OptimizerSettings::new(config.optimizer, config.learning_rate);
    let learning_rate = settings.learning_rate();
    tracing::info!("optimizer: {settings}");

    let run = Run {
        config,
        run_id,
        store,
        observer,
        vocab: &vocab,
        device,
        rng: StdRng::seed_from_u64(config.seed),
    };
    let (resumed_optimizer, epochs) = match settings {
        OptimizerSettings::Adam { .. } => run.fit(
            model,
            OptimizerSettings::adam_config().init::<B, OcrNet<B>>(),
            learning_rate,
            training_set,
            &validation_set,
        )?,
        OptimizerSettings::Sgd { momentum, .. } => run.fit(
            model,
            OptimizerSettings::sgd_config(momentum).init::<B, OcrNet<B>>(),
            learning_rate,
            training_set,
            &validation_set,
        )?,
    };

    Ok(TrainingSummary {
        resumed_model,
        resumed_optimizer,
        epochs,
    })
}

/// Refuses a model checkpoint saved for a differently shaped network.
fn ensure_compatible<B, S>(
    store: &S,
    run_id: &str,
    model_config: &OcrNetConfig,
) -> Result<(), TrainError>
where
    B: Backend,
    S: CheckpointStore<B>,
{
    let Some(saved) = store.load_config::<OcrNetConfig>(run_id, ConfigKind::Model)? else {
        tracing::warn!("run `{run_id}` has no saved model config, loading its checkpoint unchecked");
        return Ok(());
    };

    match model_config.mismatch(&saved) {
        None => Ok(()),
        Some(mismatch) => Err(CheckpointError::Incompatible {
            run_id: run_id.to_string(),
            field: mismatch.field,
            saved: mismatch.saved,
            requested: mismatch.requested,
        }
        .into()),
    }
}

struct Run<'a, B: AutodiffBackend, S, O> {
    config: &'a TrainingConfig,
    run_id: &'a str,
    store: &'a S,
    observer: &'a mut O,
    vocab: &'a Vocabulary,
    device: B::Device,
    rng: StdRng,
}

impl<'a, B, S, O> Run<'a, B, S, O>
where
    B: AutodiffBackend,
    S: CheckpointStore<B>,
    O: TrainingObserver,
{
    fn fit<Opt: Optimizer<OcrNet<B>, B>>(
        mut self,
        mut model: OcrNet<B>,
        mut optim: Opt,
        learning_rate: f64,
        mut training_set: Vec<Sample>,
        validation_set: &[Sample],
    ) -> Result<(bool, Vec<EpochSummary>), TrainError> {
        let resumed_optimizer = match self
            .store
            .load(self.run_id, CheckpointKind::Optimizer, &self.device)?
        {
            Some(record) => {
                optim = optim.load_record(record);
                true
            }
            None => false,
        };

        let padding_idx = self.vocab.pad();
        let mut validation_config = self.config.batch_config();
        validation_config.fake = 0.0;

        tracing::info!("training...");
        let mut epochs = Vec::with_capacity(self.config.max_epochs);
        for epoch in 1..=self.config.max_epochs {
            let started = Instant::now();

            training_set.shuffle(&mut self.rng);
            let training_batches = OcrBatches::<B>::new(
                &training_set,
                self.vocab,
                self.device.clone(),
                self.config.batch_config(),
            );
            tracing::debug!(
                "epoch {epoch}: {} training batches",
                training_batches.num_batches()
            );
            let mut training_loss = LossAccumulator::default();
            for batch in training_batches.iter(&mut self.rng) {
                let batch = batch?;
                let batch_idx = training_loss.batches() + 1;

                let output =
                    model.forward(batch.images, batch.decoder_inputs, batch.decoder_lengths);
                let loss = masked_cross_entropy(output.logits, batch.targets, padding_idx);
                let batch_loss = loss.clone().into_scalar().elem::<f64>();
                check_finite(Phase::Training, epoch, batch_idx, batch_loss)?;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(learning_rate, model, grads);

                training_loss.update(batch_loss);
                self.observer.on_batch(&BatchProgress {
                    epoch,
                    batch: batch_idx,
                    loss: batch_loss,
                    average_loss: training_loss.average(),
                    elapsed: started.elapsed(),
                });
            }

            let validation_batches = OcrBatches::<B::InnerBackend>::new(
                validation_set,
                self.vocab,
                self.device.clone(),
                validation_config.clone(),
            );
            let validation_loss = evaluate(
                &model.valid(),
                &validation_batches,
                padding_idx,
                epoch,
                &mut self.rng,
            )?;

            let summary = EpochSummary {
                epoch,
                training_loss: training_loss.average(),
                validation_loss: validation_loss.average(),
                training_batches: training_loss.batches(),
                validation_batches: validation_loss.batches(),
                duration: started.elapsed(),
            };
            self.observer.on_epoch(&summary);
            tracing::info!(
                "epoch {epoch} done: training loss {:.6}, validation loss {:.6}",
                summary.training_loss,
                summary.validation_loss
            );

            self.store
                .save(self.run_id, CheckpointKind::Model, model.clone().into_record())?;
            self.store
                .save(self.run_id, CheckpointKind::Optimizer, optim.to_record())?;
            epochs.push(summary);
        }

        Ok((resumed_optimizer, epochs))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_average_is_mean_of_batches() {
        let mut accumulator = LossAccumulator::default();
        assert!(accumulator.average().is_nan());

        for loss in [2.5, 1.0, 0.25, 4.0] {
            accumulator.update(loss);
        }

        assert_eq!(accumulator.batches(), 4);
        assert!((accumulator.average() - 7.75 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_loss_diverges() {
        assert!(check_finite(Phase::Training, 1, 1, 0.3).is_ok());

        for loss in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = check_finite(Phase::Training, 2, 5, loss).unwrap_err();
            assert!(matches!(
                err,
                TrainError::Divergence {
                    phase: Phase::Training,
                    epoch: 2,
                    batch: 5,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_console_lines() {
        let batch = ConsoleObserver::batch_line(&BatchProgress {
            epoch: 1,
            batch: 9,
            loss: 2.5,
            average_loss: 3.0,
            elapsed: Duration::from_millis(1250),
        });
        let epoch = ConsoleObserver::epoch_line(&EpochSummary {
            epoch: 1,
            training_loss: 3.0,
            validation_loss: 2.75,
            training_batches: 9,
            validation_batches: 1,
            duration: Duration::from_secs(4),
        });

        assert_eq!(
            batch,
            "[Epoch 1  Batch 9]  batch_loss 2.5000000000  average_loss 3.0000000000  elapsed 1.25s"
        );
        assert_eq!(
            epoch,
            "[Epoch 1]  training_loss 3.0000000000  validation_loss 2.7500000000  duration 4.00s"
        );
    }

    #[test]
    fn test_defaults() {
        let config = TrainingConfig::new();

        assert_eq!(config.max_epochs, 100);
        assert_eq!(config.learning_rate, 0.001);
        assert_eq!(config.batch_size, 32);
        assert_eq!([config.img_h, config.img_w], [128, 384]);
        assert_eq!(config.seq_len, 8);
        assert_eq!(config.dims, 208);
        assert_eq!(config.fake, 0.0);
        assert_eq!(config.optimizer, UpdateRule::Adam);
        assert!(config.validate().is_ok());
        assert!(config.model_config(70).validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            TrainingConfig::new().with_batch_size(0).validate(),
            Err(TrainError::Config(_))
        ));
        assert!(matches!(
            TrainingConfig::new().with_fake(1.5).validate(),
            Err(TrainError::Config(_))
        ));
    }
}
