use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    module::Module,
};
use image::{GrayImage, Luma};
use ocr_trainer::{
    batches::OcrBatches,
    checkpoint::{
        CheckpointError, CheckpointKind, CheckpointStore, ConfigKind, FileCheckpointStore,
    },
    dataset::OcrDataset,
    model::ocr_net::{OcrNet, OcrNetConfig},
    optim::UpdateRule,
    training::{
        self, BatchProgress, DataSource, EpochSummary, Phase, TrainError, TrainingConfig,
        TrainingObserver,
    },
    utils::vocabulary::{Vocabulary, VocabularyError},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

type Backend = NdArray;
type AutodiffBackend = Autodiff<Backend>;

const SYMBOLS: [&str; 12] = [
    "<PAD>", "<GO>", "<EOS>", "0", "1", "2", "3", "4", "5", "6", "7", "8",
];

#[derive(Default)]
struct Collector {
    batches: Vec<BatchProgress>,
    epochs: Vec<EpochSummary>,
}

impl TrainingObserver for Collector {
    fn on_batch(&mut self, progress: &BatchProgress) {
        self.batches.push(progress.clone());
    }

    fn on_epoch(&mut self, summary: &EpochSummary) {
        self.epochs.push(summary.clone());
    }
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "ocr-trainer-it-{name}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Writes `count` noisy line images with digit labels and the vocabulary.
fn write_dataset(root: &Path, count: usize) -> DataSource {
    fs::create_dir_all(root).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut labels = String::new();

    for i in 0..count {
        let len = rng.gen_range(1..=4);
        let label: String = (0..len)
            .map(|_| char::from(b'0' + rng.gen_range(0..9u8)))
            .collect();
        let width = 16 * len as u32;
        let image = GrayImage::from_fn(width, 24, |_, _| Luma([rng.gen::<u8>()]));
        let name = format!("{i:03}.png");
        image.save(root.join(&name)).unwrap();
        labels.push_str(&format!("{name}\t{label}\n"));
    }
    fs::write(root.join("labels.txt"), labels).unwrap();

    let vocabulary = root.join("vocabulary.json");
    fs::write(&vocabulary, serde_json::to_string(&SYMBOLS).unwrap()).unwrap();

    DataSource {
        data_dir: root.to_path_buf(),
        vocabulary,
    }
}

fn small_config() -> TrainingConfig {
    TrainingConfig::new()
        .with_max_epochs(1)
        .with_batch_size(10)
        .with_img_h(32)
        .with_img_w(64)
        .with_seq_len(4)
        .with_dims(16)
        .with_n_heads(2)
        .with_stacks(1)
}

#[test]
fn test_one_epoch_end_to_end() {
    let root = scratch_dir("end-to-end");
    let source = write_dataset(&root.join("data"), 100);
    let store = FileCheckpointStore::new(root.join("model"));
    let mut collector = Collector::default();

    let summary = training::train::<AutodiffBackend, _, _>(
        &small_config(),
        &source,
        "ocr_net",
        &store,
        NdArrayDevice::Cpu,
        &mut collector,
    )
    .unwrap();

    assert!(!summary.resumed_model);
    assert!(!summary.resumed_optimizer);
    assert_eq!(collector.batches.len(), 9);
    assert_eq!(collector.epochs.len(), 1);

    let epoch = &collector.epochs[0];
    assert_eq!(epoch.epoch, 1);
    assert_eq!(epoch.training_batches, 9);
    assert_eq!(epoch.validation_batches, 1);
    assert!(epoch.validation_loss.is_finite());

    let mean = collector.batches.iter().map(|batch| batch.loss).sum::<f64>() / 9.0;
    assert!((epoch.training_loss - mean).abs() < 1e-9);
    for (i, batch) in collector.batches.iter().enumerate() {
        assert_eq!(batch.epoch, 1);
        assert_eq!(batch.batch, i + 1);
    }

    assert!(store.exists("ocr_net", CheckpointKind::Model));
    assert!(store.exists("ocr_net", CheckpointKind::Optimizer));
    assert!(store.config_path("ocr_net", ConfigKind::Training).is_file());
    assert!(store.config_path("ocr_net", ConfigKind::Model).is_file());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_restart_reloads_checkpoint() {
    let root = scratch_dir("restart");
    let source = write_dataset(&root.join("data"), 100);
    let store = FileCheckpointStore::new(root.join("model"));
    let config = small_config();
    let mut first = Collector::default();

    training::train::<AutodiffBackend, _, _>(
        &config,
        &source,
        "restart",
        &store,
        NdArrayDevice::Cpu,
        &mut first,
    )
    .unwrap();
    let reported = first.epochs[0].validation_loss;

    // the checkpointed parameters reproduce the reported validation loss
    let device = NdArrayDevice::Cpu;
    let vocab = Vocabulary::load(&source.vocabulary).unwrap();
    let (_, validation_set) = OcrDataset::load(&source.data_dir, &vocab).unwrap().split();
    let record = CheckpointStore::<Backend>::load(&store, "restart", CheckpointKind::Model, &device)
        .unwrap()
        .unwrap();
    let model: OcrNet<Backend> = config
        .model_config(vocab.size())
        .init::<Backend>(&device)
        .load_record(record);
    let batches = OcrBatches::<Backend>::new(&validation_set, &vocab, device, config.batch_config());
    let loss = training::evaluate(
        &model,
        &batches,
        vocab.pad(),
        1,
        &mut StdRng::seed_from_u64(0),
    )
    .unwrap();
    assert!((loss.average() - reported).abs() < 1e-4);

    let mut second = Collector::default();
    let summary = training::train::<AutodiffBackend, _, _>(
        &config,
        &source,
        "restart",
        &store,
        NdArrayDevice::Cpu,
        &mut second,
    )
    .unwrap();

    assert!(summary.resumed_model);
    assert!(summary.resumed_optimizer);
    assert_eq!(second.epochs.len(), 1);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_sgd_run_resumes_optimizer_state() {
    let root = scratch_dir("sgd");
    let source = write_dataset(&root.join("data"), 100);
    let store = FileCheckpointStore::new(root.join("model"));
    let config = small_config()
        .with_optimizer(UpdateRule::Sgd)
        .with_learning_rate(0.01);

    let mut first = Collector::default();
    let summary = training::train::<AutodiffBackend, _, _>(
        &config,
        &source,
        "sgd",
        &store,
        NdArrayDevice::Cpu,
        &mut first,
    )
    .unwrap();
    assert!(!summary.resumed_optimizer);
    assert_eq!(first.batches.len(), 9);
    assert!(first.epochs[0].training_loss.is_finite());
    assert!(store.exists("sgd", CheckpointKind::Optimizer));

    let mut second = Collector::default();
    let summary = training::train::<AutodiffBackend, _, _>(
        &config,
        &source,
        "sgd",
        &store,
        NdArrayDevice::Cpu,
        &mut second,
    )
    .unwrap();

    assert!(summary.resumed_model);
    assert!(summary.resumed_optimizer);
    assert_eq!(second.epochs.len(), 1);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_resume_with_other_dimensions_is_refused() {
    let root = scratch_dir("changed-dims");
    let source = write_dataset(&root.join("data"), 100);
    let store = FileCheckpointStore::new(root.join("model"));

    training::train::<AutodiffBackend, _, _>(
        &small_config(),
        &source,
        "shaped",
        &store,
        NdArrayDevice::Cpu,
        &mut Collector::default(),
    )
    .unwrap();

    let mut collector = Collector::default();
    let err = training::train::<AutodiffBackend, _, _>(
        &small_config().with_dims(32),
        &source,
        "shaped",
        &store,
        NdArrayDevice::Cpu,
        &mut collector,
    )
    .unwrap_err();

    match err {
        TrainError::Checkpoint(CheckpointError::Incompatible {
            field,
            saved,
            requested,
            ..
        }) => {
            assert_eq!(field, "dimensions");
            assert_eq!(saved, "16");
            assert_eq!(requested, "32");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(collector.batches.is_empty());

    // the refused run leaves the saved shape untouched
    let saved: OcrNetConfig =
        CheckpointStore::<Backend>::load_config(&store, "shaped", ConfigKind::Model)
            .unwrap()
            .unwrap();
    assert_eq!(saved.dimensions, 16);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_divergence_stops_before_checkpoint() {
    let root = scratch_dir("divergence");
    let source = write_dataset(&root.join("data"), 100);
    let store = FileCheckpointStore::new(root.join("model"));
    let mut collector = Collector::default();

    let err = training::train::<AutodiffBackend, _, _>(
        &small_config().with_learning_rate(f64::NAN),
        &source,
        "diverged",
        &store,
        NdArrayDevice::Cpu,
        &mut collector,
    )
    .unwrap_err();

    // the first update poisons the parameters, the second batch reports it
    assert!(matches!(
        err,
        TrainError::Divergence {
            phase: Phase::Training,
            epoch: 1,
            batch: 2,
            ..
        }
    ));
    assert_eq!(collector.batches.len(), 1);
    assert!(collector.epochs.is_empty());
    assert!(!store.exists("diverged", CheckpointKind::Model));
    assert!(!store.exists("diverged", CheckpointKind::Optimizer));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn test_missing_vocabulary() {
    let root = scratch_dir("no-vocabulary");
    let source = DataSource {
        data_dir: root.clone(),
        vocabulary: root.join("vocabulary.json"),
    };
    let store = FileCheckpointStore::new(root.join("model"));

    let err = training::train::<AutodiffBackend, _, _>(
        &small_config(),
        &source,
        "ocr_net",
        &store,
        NdArrayDevice::Cpu,
        &mut Collector::default(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        TrainError::Vocabulary(VocabularyError::Missing(_))
    ));
    assert!(!store.run_dir("ocr_net").exists());
    let _ = fs::remove_dir_all(root);
}
