use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{optim::UpdateRule, training::TrainingConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("fail to read training config `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fail to parse training config `{path}`")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelYaml {
    pub img_h: Option<usize>,
    pub img_w: Option<usize>,
    pub seq_len: Option<usize>,
    pub dims: Option<usize>,
    pub stacks: Option<usize>,
    pub n_heads: Option<usize>,
    pub dropout: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingYaml {
    pub max_epochs: Option<usize>,
    pub learning_rate: Option<f64>,
    pub batch_size: Option<usize>,
    pub fake: Option<f64>,
    pub optimizer: Option<UpdateRule>,
    pub seed: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub vocabulary: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub run_id: Option<String>,
}

/// Optional YAML file with `MODEL` and `TRAINING` sections. Every key may be
/// left out.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default, rename_all = "UPPERCASE")]
pub struct ConfigFile {
    pub model: ModelYaml,
    pub training: TrainingYaml,
}

impl ConfigFile {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        // an empty document is a valid, empty config
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Overrides the fields of `config` that the file sets.
    pub fn apply(&self, mut config: TrainingConfig) -> TrainingConfig {
        let model = &self.model;
        let training = &self.training;

        if let Some(img_h) = model.img_h {
            config.img_h = img_h;
        }
        if let Some(img_w) = model.img_w {
            config.img_w = img_w;
        }
        if let Some(seq_len) = model.seq_len {
            config.seq_len = seq_len;
        }
        if let Some(dims) = model.dims {
            config.dims = dims;
        }
        if let Some(stacks) = model.stacks {
            config.stacks = stacks;
        }
        if let Some(n_heads) = model.n_heads {
            config.n_heads = n_heads;
        }
        if let Some(dropout) = model.dropout {
            config.dropout = dropout;
        }

        if let Some(max_epochs) = training.max_epochs {
            config.max_epochs = max_epochs;
        }
        if let Some(learning_rate) = training.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(batch_size) = training.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(fake) = training.fake {
            config.fake = fake;
        }
        if let Some(optimizer) = training.optimizer {
            config.optimizer = optimizer;
        }
        if let Some(seed) = training.seed {
            config.seed = seed;
        }

        config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_file() {
        let file = ConfigFile::parse(
            "
MODEL:
  dims: 256
  n_heads: 4
TRAINING:
  batch_size: 16
  optimizer: sgd
  run_id: small
",
        )
        .unwrap();

        assert_eq!(file.training.run_id.as_deref(), Some("small"));
        assert_eq!(file.training.data_dir, None);

        let config = file.apply(TrainingConfig::new());
        assert_eq!(config.dims, 256);
        assert_eq!(config.n_heads, 4);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.optimizer, UpdateRule::Sgd);
        // untouched keys keep their defaults
        assert_eq!(config.max_epochs, 100);
        assert_eq!(config.img_w, 384);
    }

    #[test]
    fn test_empty_file() {
        let file = ConfigFile::parse("").unwrap();

        assert_eq!(file, ConfigFile::default());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(ConfigFile::parse("TRAINING:\n  epochs: 3\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigFile::from_yaml("no/such/config.yaml").unwrap_err();

        assert!(matches!(err, ConfigFileError::Io { .. }));
    }
}
