use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, PaddingConfig2d,
    },
    tensor::{backend::Backend, Bool, Int, Tensor},
};

/// Variance-scaling initializer shared by every trainable layer.
pub fn xavier() -> Initializer {
    Initializer::XavierUniform { gain: 1.0 }
}

pub fn convolution<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    bias: bool,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], kernel_size)
        .with_stride(stride)
        .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
        .with_bias(bias)
        .with_initializer(xavier())
        .init(device)
}

pub fn max_pool_2d(kernel_size: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> MaxPool2d {
    MaxPool2dConfig::new(kernel_size)
        .with_strides(stride)
        .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
        .init()
}

/// `true` at every position at or past the sequence length, shape
/// `[batch, seq_length]`.
pub fn generate_length_mask<B: Backend>(
    lengths: Tensor<B, 1, Int>,
    seq_length: usize,
) -> Tensor<B, 2, Bool> {
    let device = lengths.device();
    let [batch] = lengths.dims();
    let positions = Tensor::<B, 1, Int>::arange(0..seq_length as i64, &device)
        .unsqueeze::<2>()
        .repeat(0, batch);
    let lengths = lengths.unsqueeze_dim::<2>(1).repeat(1, seq_length);

    positions.greater_equal(lengths)
}
