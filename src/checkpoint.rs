use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use burn::{
    config::Config,
    record::{BinFileRecorder, FullPrecisionSettings, Record, Recorder},
    tensor::backend::Backend,
};

/// Extension the binary file recorder appends to every path.
const RECORD_EXTENSION: &str = "bin";
/// Suffix of the file a record is written to before it replaces the previous one.
const PARTIAL_SUFFIX: &str = "-partial";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("fail to prepare checkpoint directory `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fail to write `{path}`")]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fail to read `{path}`: {message}")]
    ConfigLoad { path: PathBuf, message: String },
    #[error(
        "checkpoint of run `{run_id}` was trained with {field} = {saved}, \
         but {requested} was requested"
    )]
    Incompatible {
        run_id: String,
        field: &'static str,
        saved: String,
        requested: String,
    },
    #[error("fail to save checkpoint `{path}`: {message}")]
    Save { path: PathBuf, message: String },
    #[error("fail to load checkpoint `{path}`: {message}")]
    Load { path: PathBuf, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    Model,
    Optimizer,
}

impl CheckpointKind {
    fn file_stem(&self) -> &'static str {
        match self {
            CheckpointKind::Model => "model",
            CheckpointKind::Optimizer => "optimizer",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// JSON configs kept next to the records of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKind {
    /// Hyperparameters the run was started with.
    Training,
    /// Shape of the network the model record belongs to.
    Model,
}

impl ConfigKind {
    fn file_name(&self) -> &'static str {
        match self {
            ConfigKind::Training => "config.json",
            ConfigKind::Model => "model_config.json",
        }
    }
}

/// Latest model and optimizer state of each run.
pub trait CheckpointStore<B: Backend> {
    /// `Ok(None)` when the run has no checkpoint of this kind yet.
    fn load<R: Record<B>>(
        &self,
        run_id: &str,
        kind: CheckpointKind,
        device: &B::Device,
    ) -> Result<Option<R>, CheckpointError>;

    /// Overwrites the previous checkpoint of this kind.
    fn save<R: Record<B>>(
        &self,
        run_id: &str,
        kind: CheckpointKind,
        record: R,
    ) -> Result<(), CheckpointError>;

    fn save_config<C: Config>(
        &self,
        run_id: &str,
        kind: ConfigKind,
        config: &C,
    ) -> Result<(), CheckpointError>;

    /// `Ok(None)` when the run has not saved this config yet.
    fn load_config<C: Config>(
        &self,
        run_id: &str,
        kind: ConfigKind,
    ) -> Result<Option<C>, CheckpointError>;
}

/// Stores `<root>/<run_id>/model.bin` and `<root>/<run_id>/optimizer.bin`.
/// A record is written to `<kind>-partial.bin` first and renamed over the
/// previous file once complete.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    recorder: BinFileRecorder<FullPrecisionSettings>,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            recorder: BinFileRecorder::new(),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Path handed to the recorder, which appends the extension itself.
    fn record_path(&self, run_id: &str, kind: CheckpointKind) -> PathBuf {
        self.run_dir(run_id).join(kind.file_stem())
    }

    /// Path of the file on disk.
    pub fn file_path(&self, run_id: &str, kind: CheckpointKind) -> PathBuf {
        self.record_path(run_id, kind).with_extension(RECORD_EXTENSION)
    }

    pub fn exists(&self, run_id: &str, kind: CheckpointKind) -> bool {
        self.file_path(run_id, kind).is_file()
    }

    fn partial_record_path(&self, run_id: &str, kind: CheckpointKind) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("{}{PARTIAL_SUFFIX}", kind.file_stem()))
    }

    pub fn config_path(&self, run_id: &str, kind: ConfigKind) -> PathBuf {
        self.run_dir(run_id).join(kind.file_name())
    }

    fn prepare_run_dir(&self, run_id: &str) -> Result<(), CheckpointError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io { path: dir, source })
    }
}

impl<B: Backend> CheckpointStore<B> for FileCheckpointStore {
    fn load<R: Record<B>>(
        &self,
        run_id: &str,
        kind: CheckpointKind,
        device: &B::Device,
    ) -> Result<Option<R>, CheckpointError> {
        if !self.exists(run_id, kind) {
            return Ok(None);
        }
        let path = self.record_path(run_id, kind);
        let record = Recorder::<B>::load(&self.recorder, path.clone(), device).map_err(|err| {
            CheckpointError::Load {
                path: self.file_path(run_id, kind),
                message: format!("{err:?}"),
            }
        })?;
        tracing::info!("loaded {kind} checkpoint of run `{run_id}`");

        Ok(Some(record))
    }

    fn save<R: Record<B>>(
        &self,
        run_id: &str,
        kind: CheckpointKind,
        record: R,
    ) -> Result<(), CheckpointError> {
        self.prepare_run_dir(run_id)?;
        let partial = self.partial_record_path(run_id, kind);
        let path = self.file_path(run_id, kind);
        Recorder::<B>::record(&self.recorder, record, partial.clone()).map_err(|err| {
            CheckpointError::Save {
                path: path.clone(),
                message: format!("{err:?}"),
            }
        })?;
        fs::rename(partial.with_extension(RECORD_EXTENSION), &path)
            .map_err(|source| CheckpointError::Io { path, source })?;
        tracing::debug!("saved {kind} checkpoint of run `{run_id}`");

        Ok(())
    }

    fn save_config<C: Config>(
        &self,
        run_id: &str,
        kind: ConfigKind,
        config: &C,
    ) -> Result<(), CheckpointError> {
        self.prepare_run_dir(run_id)?;
        let path = self.config_path(run_id, kind);

        config
            .save(&path)
            .map_err(|source| CheckpointError::Config { path, source })
    }

    fn load_config<C: Config>(
        &self,
        run_id: &str,
        kind: ConfigKind,
    ) -> Result<Option<C>, CheckpointError> {
        let path = self.config_path(run_id, kind);
        if !path.is_file() {
            return Ok(None);
        }

        C::load(&path)
            .map(Some)
            .map_err(|err| CheckpointError::ConfigLoad {
                path,
                message: format!("{err:?}"),
            })
    }
}

#[cfg(test)]
mod test {
    use burn::{
        backend::{ndarray::NdArrayDevice, NdArray},
        module::Module,
        nn::{Linear, LinearConfig},
        tensor::Tensor,
    };

    use super::*;

    type Backend = NdArray;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ocr-trainer-checkpoint-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let store = FileCheckpointStore::new(scratch_dir("missing"));
        let device = NdArrayDevice::Cpu;

        let record: Option<<Linear<Backend> as Module<Backend>>::Record> =
            CheckpointStore::<Backend>::load(&store, "run", CheckpointKind::Model, &device)
                .unwrap();

        assert!(record.is_none());
    }

    #[test]
    fn test_round_trip_is_keyed_by_run() {
        let root = scratch_dir("round-trip");
        let store = FileCheckpointStore::new(&root);
        let device = NdArrayDevice::Cpu;
        let linear: Linear<Backend> = LinearConfig::new(3, 2).init(&device);
        let input = Tensor::<Backend, 2>::ones([1, 3], &device);
        let expected = linear.forward(input.clone()).into_data();

        CheckpointStore::<Backend>::save(
            &store,
            "first",
            CheckpointKind::Model,
            linear.clone().into_record(),
        )
        .unwrap();
        assert!(store.exists("first", CheckpointKind::Model));
        assert!(!store.exists("second", CheckpointKind::Model));
        assert!(!store.exists("first", CheckpointKind::Optimizer));

        let fresh: Linear<Backend> = LinearConfig::new(3, 2).init(&device);
        let record = CheckpointStore::<Backend>::load(&store, "first", CheckpointKind::Model, &device)
            .unwrap()
            .unwrap();
        let restored = fresh.load_record(record);

        assert_eq!(restored.forward(input).into_data(), expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_save_replaces_previous_record() {
        let root = scratch_dir("replace");
        let store = FileCheckpointStore::new(&root);
        let device = NdArrayDevice::Cpu;
        let first: Linear<Backend> = LinearConfig::new(3, 2).init(&device);
        let second: Linear<Backend> = LinearConfig::new(3, 2).init(&device);
        let input = Tensor::<Backend, 2>::ones([1, 3], &device);
        let expected = second.forward(input.clone()).into_data();

        for linear in [first, second] {
            CheckpointStore::<Backend>::save(
                &store,
                "run",
                CheckpointKind::Model,
                linear.into_record(),
            )
            .unwrap();
        }

        let written: Vec<_> = fs::read_dir(store.run_dir("run"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(written, vec![std::ffi::OsString::from("model.bin")]);

        let fresh: Linear<Backend> = LinearConfig::new(3, 2).init(&device);
        let record = CheckpointStore::<Backend>::load(&store, "run", CheckpointKind::Model, &device)
            .unwrap()
            .unwrap();
        assert_eq!(fresh.load_record(record).forward(input).into_data(), expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_config_round_trip() {
        let root = scratch_dir("config");
        let store = FileCheckpointStore::new(&root);

        let missing: Option<LinearConfig> =
            CheckpointStore::<Backend>::load_config(&store, "run", ConfigKind::Model).unwrap();
        assert!(missing.is_none());

        CheckpointStore::<Backend>::save_config(
            &store,
            "run",
            ConfigKind::Model,
            &LinearConfig::new(7, 5),
        )
        .unwrap();
        assert!(store.config_path("run", ConfigKind::Model).is_file());
        assert!(!store.config_path("run", ConfigKind::Training).exists());

        let loaded: LinearConfig =
            CheckpointStore::<Backend>::load_config(&store, "run", ConfigKind::Model)
                .unwrap()
                .unwrap();
        assert_eq!([loaded.d_input, loaded.d_output], [7, 5]);
        let _ = fs::remove_dir_all(root);
    }
}
