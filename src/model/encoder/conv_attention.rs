use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        BatchNormConfig, Dropout, DropoutConfig, LayerNorm, LayerNormConfig, PositionalEncoding,
        PositionalEncodingConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::burn_ext::{
    position_wise_feed_forward::{PositionWiseFeedForward, PositionWiseFeedForwardConfig},
    sequential::Sequential,
    utils::{convolution, max_pool_2d, xavier},
};

/// Output channels of the first three of the four backbone stages. The last
/// stage outputs `dimensions`. Each stage halves both spatial dimensions.
const BACKBONE_CHANNELS: [usize; 3] = [32, 64, 128];
pub const DOWNSAMPLING: usize = 16;

#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    attention: MultiHeadAttention<B>,
    feed_forward: PositionWiseFeedForward<B>,
    norm_attention: LayerNorm<B>,
    norm_feed_forward: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> EncoderLayer<B> {
    /// Returns the new features and the self-attention weights
    /// `[batch, n_heads, seq_length, seq_length]`.
    pub fn forward(&self, input: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let normed = self.norm_attention.forward(input.clone());
        let attended = self.attention.forward(MhaInput::self_attn(normed));
        let output = input + self.dropout.forward(attended.context);

        let normed = self.norm_feed_forward.forward(output.clone());
        let output = output + self.dropout.forward(self.feed_forward.forward(normed));

        (output, attended.weights)
    }
}

pub struct EncoderOutput<B: Backend> {
    /// `[batch, seq_length, dimensions]`
    pub features: Tensor<B, 3>,
    /// Self-attention weights of the last layer.
    pub self_attention: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pub backbone: Sequential<B>,
    position: PositionalEncoding<B>,
    dropout: Dropout,
    pub layers: Vec<EncoderLayer<B>>,
    layernorm: LayerNorm<B>,
}

impl<B: Backend> Encoder<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> EncoderOutput<B> {
        let feature = self.backbone.forward(images);

        let [batch, channels, height, width] = feature.dims(); // (B, C, H/16, W/16)
        let feature = feature.permute([0, 3, 2, 1]); // read column by column, left to right
        let feature = feature.reshape([batch, width * height, channels]);
        let feature = self.position.forward(feature);
        let mut feature = self.dropout.forward(feature);

        let mut self_attention = None;
        for layer in &self.layers {
            let (output, weights) = layer.forward(feature);
            feature = output;
            self_attention = Some(weights);
        }
        let self_attention = self_attention.unwrap_or_else(|| {
            let seq_length = width * height;
            Tensor::zeros([batch, 1, seq_length, seq_length], &feature.device())
        });

        EncoderOutput {
            features: self.layernorm.forward(feature),
            self_attention,
        }
    }
}

#[derive(Config, Debug)]
pub struct EncoderConfig {
    height: usize,
    width: usize,
    dimensions: usize,
    #[config(default = 3)]
    stacks: usize,
    #[config(default = 8)]
    n_heads: usize,
    #[config(default = 0.1)]
    dropout: f64,
    #[config(default = 832)]
    feed_forward_size: usize,
}

impl EncoderConfig {
    /// Number of feature vectors handed to the decoder.
    pub fn sequence_length(&self) -> usize {
        (self.height / DOWNSAMPLING) * (self.width / DOWNSAMPLING)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let mut backbone = Sequential::new();
        let mut in_channels = 1;
        for out_channels in BACKBONE_CHANNELS.into_iter().chain([self.dimensions]) {
            backbone.append(
                convolution(device, in_channels, out_channels, [3, 3], [1, 1], [1, 1], false)
                    .into(),
            );
            backbone.append(BatchNormConfig::new(out_channels).init(device).into());
            backbone.append(Relu::new().into());
            backbone.append(max_pool_2d([2, 2], [2, 2], [0, 0]).into());
            in_channels = out_channels;
        }

        let layers = (0..self.stacks)
            .map(|_| EncoderLayer {
                attention: MultiHeadAttentionConfig::new(self.dimensions, self.n_heads)
                    .with_dropout(self.dropout)
                    .with_initializer(xavier())
                    .init(device),
                feed_forward: PositionWiseFeedForwardConfig::new(
                    self.dimensions,
                    self.feed_forward_size,
                )
                .with_dropout(self.dropout)
                .init(device),
                norm_attention: LayerNormConfig::new(self.dimensions)
                    .with_epsilon(1e-6)
                    .init(device),
                norm_feed_forward: LayerNormConfig::new(self.dimensions)
                    .with_epsilon(1e-6)
                    .init(device),
                dropout: DropoutConfig::new(self.dropout).init(),
            })
            .collect();

        Encoder {
            backbone,
            position: PositionalEncodingConfig::new(self.dimensions)
                .with_max_sequence_size(self.sequence_length().max(1))
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            layers,
            layernorm: LayerNormConfig::new(self.dimensions)
                .with_epsilon(1e-6)
                .init(device),
        }
    }
}
