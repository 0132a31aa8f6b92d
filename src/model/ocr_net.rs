use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Int, Tensor},
};

use super::{
    decoder::tiny::{Decoder, DecoderConfig},
    encoder::conv_attention::{Encoder, EncoderConfig, DOWNSAMPLING},
};

#[derive(Debug, thiserror::Error)]
pub enum ModelConfigError {
    #[error("feature dimensions {dimensions} cannot be split into {n_heads} attention heads")]
    Heads { dimensions: usize, n_heads: usize },
    #[error("images of {height}x{width} are smaller than the 16x16 backbone stride")]
    ImageTooSmall { height: usize, width: usize },
    #[error("at least one attention block is required")]
    NoStacks,
}

#[derive(Config, Debug)]
pub struct OcrNetConfig {
    /// Canvas `[height, width]` every image is fitted into.
    pub max_hw: [usize; 2],
    pub num_classes: usize,
    /// Longest label, `<EOS>` excluded.
    pub max_len: usize,
    #[config(default = 208)]
    pub dimensions: usize,
    #[config(default = 3)]
    pub stacks: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = false)]
    pub share_parameter: bool,
    /// Defaults to four times `dimensions`.
    pub feed_forward_size: Option<usize>,
}

impl OcrNetConfig {
    pub fn validate(&self) -> Result<(), ModelConfigError> {
        let [height, width] = self.max_hw;
        if self.n_heads == 0 || self.dimensions % self.n_heads != 0 {
            return Err(ModelConfigError::Heads {
                dimensions: self.dimensions,
                n_heads: self.n_heads,
            });
        }
        if height < DOWNSAMPLING || width < DOWNSAMPLING {
            return Err(ModelConfigError::ImageTooSmall { height, width });
        }
        if self.stacks == 0 {
            return Err(ModelConfigError::NoStacks);
        }

        Ok(())
    }

    /// First structural field where a network built from `self` differs from
    /// one built from `saved`. Dropout is not structural.
    pub fn mismatch(&self, saved: &Self) -> Option<ShapeMismatch> {
        let fields = [
            ("max_hw", format!("{:?}", saved.max_hw), format!("{:?}", self.max_hw)),
            ("num_classes", saved.num_classes.to_string(), self.num_classes.to_string()),
            ("max_len", saved.max_len.to_string(), self.max_len.to_string()),
            ("dimensions", saved.dimensions.to_string(), self.dimensions.to_string()),
            ("stacks", saved.stacks.to_string(), self.stacks.to_string()),
            ("n_heads", saved.n_heads.to_string(), self.n_heads.to_string()),
            (
                "share_parameter",
                saved.share_parameter.to_string(),
                self.share_parameter.to_string(),
            ),
            (
                "feed_forward_size",
                saved.resolved_feed_forward_size().to_string(),
                self.resolved_feed_forward_size().to_string(),
            ),
        ];

        fields
            .into_iter()
            .find(|(_, saved, requested)| saved != requested)
            .map(|(field, saved, requested)| ShapeMismatch {
                field,
                saved,
                requested,
            })
    }

    fn resolved_feed_forward_size(&self) -> usize {
        self.feed_forward_size.unwrap_or(self.dimensions * 4)
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> OcrNet<B> {
        let [height, width] = self.max_hw;
        let feed_forward_size = self.resolved_feed_forward_size();

        OcrNet {
            encoder: EncoderConfig::new(height, width, self.dimensions)
                .with_stacks(self.stacks)
                .with_n_heads(self.n_heads)
                .with_dropout(self.dropout)
                .with_feed_forward_size(feed_forward_size)
                .init(device),
            decoder: DecoderConfig::new(self.num_classes, self.dimensions, self.max_len + 1)
                .with_stacks(self.stacks)
                .with_n_heads(self.n_heads)
                .with_dropout(self.dropout)
                .with_share_parameter(self.share_parameter)
                .with_feed_forward_size(feed_forward_size)
                .init(device),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub field: &'static str,
    pub saved: String,
    pub requested: String,
}

/// Attention weights produced on the way to the logits, kept for
/// inspection only.
pub struct AttentionMaps<B: Backend> {
    /// `[batch, n_heads, source_length, source_length]`
    pub encoder_self: Tensor<B, 4>,
    /// `[batch, n_heads, target_length, target_length]`
    pub decoder_self: Tensor<B, 4>,
    /// `[batch, n_heads, target_length, source_length]`
    pub cross: Tensor<B, 4>,
}

pub struct OcrNetOutput<B: Backend> {
    /// `[batch, target_length, num_classes]`
    pub logits: Tensor<B, 3>,
    pub attention: AttentionMaps<B>,
}

#[derive(Module, Debug)]
pub struct OcrNet<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
}

impl<B: Backend> OcrNet<B> {
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        decoder_inputs: Tensor<B, 2, Int>,
        decoder_lengths: Tensor<B, 1, Int>,
    ) -> OcrNetOutput<B> {
        let encoded = self.encoder.forward(images);
        let decoded = self
            .decoder
            .forward(encoded.features, decoder_inputs, decoder_lengths);

        OcrNetOutput {
            logits: decoded.logits,
            attention: AttentionMaps {
                encoder_self: encoded.self_attention,
                decoder_self: decoded.self_attention,
                cross: decoded.cross_attention,
            },
        }
    }
}
