use std::{
    fs, io,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use num_traits::PrimInt;

pub const PAD: &str = "<PAD>";
pub const GO: &str = "<GO>";
pub const EOS: &str = "<EOS>";
pub const UNK: &str = "<UNK>";

#[derive(Debug, thiserror::Error)]
pub enum VocabularyError {
    #[error("vocabulary file `{0}` does not exist")]
    Missing(PathBuf),
    #[error("fail to read vocabulary file `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fail to parse vocabulary file `{path}`")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("vocabulary lacks the reserved symbol `{0}`")]
    MissingReserved(&'static str),
    #[error("symbol `{0}` appears more than once in the vocabulary")]
    Duplicate(String),
    #[error("character `{ch}` of label `{label}` is not in the vocabulary")]
    UnknownSymbol { ch: char, label: String },
}

#[derive(Clone, Debug)]
pub struct ReservedSymbols {
    pub pad: u32,
    pub go: u32,
    pub eos: u32,
    pub unk: Option<u32>,
}

/// Fixed mapping between label symbols and class indices.
///
/// Indices follow the order of the symbols in the vocabulary file, so the
/// reserved tokens may sit anywhere in the table.
#[derive(Clone, Debug)]
pub struct Vocabulary {
    symbols: IndexMap<String, u32>,
    pub reserved: ReservedSymbols,
}

impl Vocabulary {
    /// Reads a JSON array of symbols, e.g. `["<PAD>", "<GO>", "<EOS>", "A", "B"]`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VocabularyError::Missing(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|source| VocabularyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let symbols: Vec<String> =
            serde_json::from_str(&raw).map_err(|source| VocabularyError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_symbols(symbols)
    }

    pub fn from_symbols<I, S>(symbols: I) -> Result<Self, VocabularyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = IndexMap::new();
        for symbol in symbols {
            let symbol = symbol.into();
            let idx = table.len() as u32;
            if table.insert(symbol.clone(), idx).is_some() {
                return Err(VocabularyError::Duplicate(symbol));
            }
        }

        let required = |name: &'static str| {
            table
                .get(name)
                .copied()
                .ok_or(VocabularyError::MissingReserved(name))
        };
        let reserved = ReservedSymbols {
            pad: required(PAD)?,
            go: required(GO)?,
            eos: required(EOS)?,
            unk: table.get(UNK).copied(),
        };

        Ok(Self {
            symbols: table,
            reserved,
        })
    }

    pub fn size(&self) -> usize {
        self.symbols.len()
    }

    pub fn index_of(&self, symbol: &str) -> Option<u32> {
        self.symbols.get(symbol).copied()
    }

    pub fn symbol(&self, index: u32) -> Option<&str> {
        self.symbols
            .get_index(index as usize)
            .map(|(symbol, _)| symbol.as_str())
    }

    pub fn pad(&self) -> u32 {
        self.reserved.pad
    }

    pub fn go(&self) -> u32 {
        self.reserved.go
    }

    pub fn eos(&self) -> u32 {
        self.reserved.eos
    }

    /// Encodes a label one character at a time.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, VocabularyError> {
        let mut buf = [0u8; 4];
        text.chars()
            .map(|ch| {
                self.index_of(ch.encode_utf8(&mut buf))
                    .or(self.reserved.unk)
                    .ok_or_else(|| VocabularyError::UnknownSymbol {
                        ch,
                        label: text.to_string(),
                    })
            })
            .collect()
    }

    /// Decodes up to the first `<EOS>`. `<PAD>` and `<GO>` are dropped and
    /// indices outside the table are ignored.
    pub fn decode<INT: PrimInt>(&self, encoded: &[INT]) -> String {
        let mut res = String::with_capacity(encoded.len());
        for idx in encoded.iter().filter_map(|each| each.to_u32()) {
            match idx {
                _ if idx == self.reserved.eos => break,
                _ if idx == self.reserved.pad || idx == self.reserved.go => continue,
                _ => {
                    if let Some(symbol) = self.symbol(idx) {
                        res.push_str(symbol);
                    }
                }
            }
        }

        res
    }
}
