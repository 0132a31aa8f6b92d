use burn::{
    module::Module,
    nn::{conv::Conv2d, pool::MaxPool2d, BatchNorm, Relu},
    tensor::{backend::Backend, Tensor},
};

#[derive(Module, Debug)]
pub enum SequentialType<B: Backend> {
    Conv2d(Conv2d<B>),
    BatchNorm(BatchNorm<B, 2>),
    Relu(Relu),
    MaxPool2d(MaxPool2d),
}

macro_rules! impl_all_sequential_type {
    ($($type_name:ty, $enum_name:ident);*) => {
        $(
            impl<B: Backend> From<$type_name> for SequentialType<B> {
                fn from(value: $type_name) -> Self {
                    SequentialType::$enum_name(value)
                }
            }
        )*
    };
}

impl_all_sequential_type!(
    Conv2d<B>, Conv2d;
    BatchNorm<B, 2>, BatchNorm;
    Relu, Relu;
    MaxPool2d, MaxPool2d
);

macro_rules! match_layer {
    ($e1:expr, $e2:expr; $($val:tt),*) => {
        match $e1 {
            $(
                SequentialType::$val(actual_layer) => $e2 = actual_layer.forward($e2),
            )*
        }
    };
}

impl<B: Backend> SequentialType<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        match_layer!(self, x; Conv2d, BatchNorm, Relu, MaxPool2d);

        x
    }
}

/// Image-to-image layers applied in order.
#[derive(Module, Debug)]
pub struct Sequential<B: Backend> {
    pub layers: Vec<SequentialType<B>>,
}

impl<B: Backend> Default for Sequential<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Sequential<B> {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn append(&mut self, layer: SequentialType<B>) {
        self.layers.push(layer);
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }
}
