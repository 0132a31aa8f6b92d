use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    tensor::backend::AutodiffBackend,
};
use clap::Parser;
use ocr_trainer::{
    checkpoint::FileCheckpointStore,
    optim::UpdateRule,
    parse_config::ConfigFile,
    training::{self, ConsoleObserver, DataSource, TrainingConfig},
};
use tracing_subscriber::EnvFilter;

/// Trains the attention OCR network on a directory of labeled line images.
#[derive(Parser, Debug)]
#[command(name = "ocr-trainer", version)]
struct Cli {
    /// YAML file with MODEL and TRAINING sections
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, alias = "max_epochs")]
    max_epochs: Option<usize>,
    #[arg(long, alias = "learning_rate")]
    learning_rate: Option<f64>,
    #[arg(long, alias = "batch_size")]
    batch_size: Option<usize>,
    /// Canvas width in pixels
    #[arg(long, alias = "img_w")]
    img_w: Option<usize>,
    /// Canvas height in pixels
    #[arg(long, alias = "img_h")]
    img_h: Option<usize>,
    /// Longest label the model emits
    #[arg(long, alias = "seq_len")]
    seq_len: Option<usize>,
    /// Feature dimensions of the attention blocks
    #[arg(long)]
    dims: Option<usize>,
    /// Probability of training on a spliced synthetic sample
    #[arg(long)]
    fake: Option<f64>,
    /// Use SGD with momentum instead of Adam
    #[arg(long)]
    sgd: bool,
    #[arg(long)]
    gpu: bool,
    #[arg(long, alias = "device_id", default_value_t = 0)]
    device_id: usize,
    #[arg(long, alias = "data_dir")]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    vocabulary: Option<PathBuf>,
    #[arg(long, alias = "checkpoint_dir")]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long, alias = "run_id")]
    run_id: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
}

struct Settings {
    config: TrainingConfig,
    source: DataSource,
    checkpoint_dir: PathBuf,
    run_id: String,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => ConfigFile::from_yaml(path)?,
            None => ConfigFile::default(),
        };
        let mut config = file.apply(TrainingConfig::new());

        if let Some(max_epochs) = self.max_epochs {
            config.max_epochs = max_epochs;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(img_w) = self.img_w {
            config.img_w = img_w;
        }
        if let Some(img_h) = self.img_h {
            config.img_h = img_h;
        }
        if let Some(seq_len) = self.seq_len {
            config.seq_len = seq_len;
        }
        if let Some(dims) = self.dims {
            config.dims = dims;
        }
        if let Some(fake) = self.fake {
            config.fake = fake;
        }
        if self.sgd {
            config.optimizer = UpdateRule::Sgd;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        let defaults = DataSource::default();
        let training = file.training;
        let source = DataSource {
            data_dir: self
                .data_dir
                .clone()
                .or(training.data_dir)
                .unwrap_or(defaults.data_dir),
            vocabulary: self
                .vocabulary
                .clone()
                .or(training.vocabulary)
                .unwrap_or(defaults.vocabulary),
        };

        Ok(Settings {
            config,
            source,
            checkpoint_dir: self
                .checkpoint_dir
                .clone()
                .or(training.checkpoint_dir)
                .unwrap_or_else(|| PathBuf::from("model")),
            run_id: self
                .run_id
                .clone()
                .or(training.run_id)
                .unwrap_or_else(|| "ocr_net".to_string()),
        })
    }
}

fn run<B: AutodiffBackend>(settings: Settings, device: B::Device) -> Result<()> {
    let store = FileCheckpointStore::new(&settings.checkpoint_dir);
    let summary = training::train::<B, _, _>(
        &settings.config,
        &settings.source,
        &settings.run_id,
        &store,
        device,
        &mut ConsoleObserver,
    )
    .with_context(|| format!("training run `{}` failed", settings.run_id))?;

    tracing::info!(
        "finished {} epochs, checkpoints in {}",
        summary.epochs.len(),
        store.run_dir(&settings.run_id).display()
    );

    Ok(())
}

#[cfg(feature = "tch")]
fn run_on_gpu(settings: Settings, device_id: usize) -> Result<()> {
    use burn::backend::{libtorch::LibTorchDevice, LibTorch};

    run::<Autodiff<LibTorch>>(settings, LibTorchDevice::Cuda(device_id))
}

#[cfg(all(feature = "wgpu", not(feature = "tch")))]
fn run_on_gpu(settings: Settings, device_id: usize) -> Result<()> {
    use burn::backend::{wgpu::WgpuDevice, Wgpu};

    run::<Autodiff<Wgpu>>(settings, WgpuDevice::DiscreteGpu(device_id))
}

#[cfg(not(any(feature = "wgpu", feature = "tch")))]
fn run_on_gpu(_settings: Settings, _device_id: usize) -> Result<()> {
    anyhow::bail!("built without a GPU backend, enable the `wgpu` or `tch` feature")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ocr_trainer=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = cli.settings()?;
    tracing::info!("{}", settings.config);

    match cli.gpu {
        true => run_on_gpu(settings, cli.device_id),
        false => run::<Autodiff<NdArray>>(settings, NdArrayDevice::Cpu),
    }
}
