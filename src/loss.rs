use burn::tensor::{activation, backend::Backend, Int, Tensor};

/// Mean token cross-entropy over the target positions that are not
/// `padding_idx`. `<EOS>` positions count as regular targets.
///
/// # Shapes
///
/// - logits: `[batch, steps, classes]`
/// - targets: `[batch, steps]`
/// - output: `[1]`
pub fn masked_cross_entropy<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    padding_idx: u32,
) -> Tensor<B, 1> {
    let [batch, steps, classes] = logits.dims();
    let log_probs = activation::log_softmax(logits.reshape([batch * steps, classes]), 1);
    let targets = targets.reshape([batch * steps, 1]);

    let mask = targets
        .clone()
        .equal_elem(padding_idx as i64)
        .bool_not()
        .float()
        .reshape([batch * steps]);
    let picked = log_probs.gather(1, targets).reshape([batch * steps]);

    let total = (picked * mask.clone()).sum().neg();
    let count = mask.sum().clamp_min(1.0);

    total / count
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    type Backend = NdArray;

    #[test]
    fn test_uniform_logits() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<Backend, 3>::zeros([2, 3, 4], &device);
        let targets = Tensor::<Backend, 2, Int>::from_ints([[1, 2, 0], [3, 0, 0]], &device);

        let loss: f32 = masked_cross_entropy(logits, targets, 0).into_scalar();

        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_padding_is_ignored() {
        let device = NdArrayDevice::Cpu;
        // the first position is predicted perfectly, the padded ones badly
        let logits = Tensor::<Backend, 3>::from_floats(
            [[[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 20.0, 0.0]]],
            &device,
        );
        let targets = Tensor::<Backend, 2, Int>::from_ints([[0, 2, 2]], &device);

        let masked: f32 = masked_cross_entropy(logits.clone(), targets.clone(), 2).into_scalar();
        let unmasked: f32 = masked_cross_entropy(logits, targets, 1).into_scalar();

        assert!(masked < 1e-5);
        assert!(unmasked > 10.0);
    }

    #[test]
    fn test_all_padding_is_zero() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<Backend, 3>::ones([1, 2, 3], &device);
        let targets = Tensor::<Backend, 2, Int>::from_ints([[2, 2]], &device);

        let loss: f32 = masked_cross_entropy(logits, targets, 2).into_scalar();

        assert_eq!(loss, 0.0);
    }
}
