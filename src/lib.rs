pub mod augment;
pub mod batches;
pub mod burn_ext;
pub mod checkpoint;
pub mod dataset;
pub mod image_data;
pub mod loss;
pub mod model;
pub mod optim;
pub mod parse_config;
pub mod training;
pub mod utils;
