use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::{
            generate_autoregressive_mask, MhaInput, MultiHeadAttention, MultiHeadAttentionConfig,
        },
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
        LinearConfig, PositionalEncoding, PositionalEncodingConfig,
    },
    tensor::{backend::Backend, Int, Tensor},
};

use crate::burn_ext::{
    position_wise_feed_forward::{PositionWiseFeedForward, PositionWiseFeedForwardConfig},
    utils::{generate_length_mask, xavier},
};

#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    pub masked_attention: MultiHeadAttention<B>,
    pub attention: MultiHeadAttention<B>,
    pub position_feed_forward: PositionWiseFeedForward<B>,
    norm_masked_attention: LayerNorm<B>,
    norm_attention: LayerNorm<B>,
    norm_feed_forward: LayerNorm<B>,
}

pub struct DecoderOutput<B: Backend> {
    /// `[batch, target_length, n_classes]`
    pub logits: Tensor<B, 3>,
    /// Masked self-attention weights of the last block.
    pub self_attention: Tensor<B, 4>,
    /// Attention over the encoder features of the last block.
    pub cross_attention: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub embedding: Embedding<B>,
    pub position: PositionalEncoding<B>,
    pos_dropout: Dropout,
    pub layers: Vec<DecoderLayer<B>>,
    pub layernorm: LayerNorm<B>,
    dropout: Dropout,
    pub generator: Linear<B>,
    sqrt_model_size: f64,
    stacks: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn forward(
        &self,
        encoded_res: Tensor<B, 3>,
        target: Tensor<B, 2, Int>,
        target_lengths: Tensor<B, 1, Int>,
    ) -> DecoderOutput<B> {
        self.forward_with_iteration(encoded_res, target, target_lengths, self.stacks)
    }

    /// Runs `iteration` blocks. With shared parameters the single block is
    /// applied `iteration` times.
    fn forward_with_iteration(
        &self,
        encoded_res: Tensor<B, 3>,
        target: Tensor<B, 2, Int>,
        target_lengths: Tensor<B, 1, Int>,
        iteration: usize,
    ) -> DecoderOutput<B> {
        let device = encoded_res.device();
        let target = target.to_device(&device);
        let [batch, target_length] = target.dims();
        let [_, source_length, _] = encoded_res.dims();

        let pad_mask = generate_length_mask(target_lengths.to_device(&device), target_length);
        let attn_mask = generate_autoregressive_mask::<B>(batch, target_length, &device);

        let target_embed = self
            .embedding
            .forward(target)
            .mul_scalar(self.sqrt_model_size);
        let target_embed = self.position.forward(target_embed);
        let mut output = self.pos_dropout.forward(target_embed);

        let mut self_attention =
            Tensor::zeros([batch, 1, target_length, target_length], &device);
        let mut cross_attention = Tensor::zeros([batch, 1, target_length, source_length], &device);
        for i in 0..iteration {
            let layer = match self.layers.len() {
                1 => &self.layers[0],
                _ => &self.layers[i],
            };

            let normed_output = layer.norm_masked_attention.forward(output.clone());
            let masked = layer.masked_attention.forward(
                MhaInput::new(normed_output.clone(), normed_output.clone(), normed_output)
                    .mask_pad(pad_mask.clone())
                    .mask_attn(attn_mask.clone()),
            );
            output = output + self.dropout.forward(masked.context);
            self_attention = masked.weights;

            let normed_output = layer.norm_attention.forward(output.clone());
            let attended = layer.attention.forward(MhaInput::new(
                normed_output,
                encoded_res.clone(),
                encoded_res.clone(),
            ));
            output = output + self.dropout.forward(attended.context);
            cross_attention = attended.weights;

            let normed_output = layer.norm_feed_forward.forward(output.clone());
            output = output
                + self
                    .dropout
                    .forward(layer.position_feed_forward.forward(normed_output));
        }

        let feature = self.layernorm.forward(output);

        DecoderOutput {
            logits: self.generator.forward(feature),
            self_attention,
            cross_attention,
        }
    }
}

#[derive(Config, Debug)]
pub struct DecoderConfig {
    n_classes: usize,
    dimensions: usize,
    /// Longest decoder input, `<GO>` included.
    max_target_length: usize,
    #[config(default = "832")]
    feed_forward_size: usize,
    #[config(default = "3")]
    stacks: usize,
    #[config(default = "8")]
    n_heads: usize,
    #[config(default = "0.1")]
    dropout: f64,
    #[config(default = "false")]
    share_parameter: bool,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let embedding = EmbeddingConfig::new(self.n_classes, self.dimensions).init(device);
        let position = PositionalEncodingConfig::new(self.dimensions)
            .with_max_sequence_size(self.max_target_length.max(1))
            .init(device);

        let get_mha = || {
            MultiHeadAttentionConfig::new(self.dimensions, self.n_heads)
                .with_dropout(self.dropout)
                .with_initializer(xavier())
                .init(device)
        };
        let get_layernorm = || {
            LayerNormConfig::new(self.dimensions)
                .with_epsilon(1e-6)
                .init(device)
        };
        let get_layer = || DecoderLayer {
            masked_attention: get_mha(),
            attention: get_mha(),
            position_feed_forward: PositionWiseFeedForwardConfig::new(
                self.dimensions,
                self.feed_forward_size,
            )
            .with_dropout(self.dropout)
            .init(device),
            norm_masked_attention: get_layernorm(),
            norm_attention: get_layernorm(),
            norm_feed_forward: get_layernorm(),
        };

        let stacks = self.stacks.max(1);
        let layers = match self.share_parameter {
            true => vec![get_layer()],
            false => (0..stacks).map(|_| get_layer()).collect(),
        };

        Decoder {
            embedding,
            position,
            pos_dropout: DropoutConfig::new(self.dropout).init(),
            layers,
            layernorm: get_layernorm(),
            dropout: DropoutConfig::new(self.dropout).init(),
            generator: LinearConfig::new(self.dimensions, self.n_classes)
                .with_initializer(xavier())
                .init(device),
            sqrt_model_size: (self.dimensions as f64).sqrt(),
            stacks,
        }
    }
}
