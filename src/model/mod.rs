pub mod decoder;
pub mod encoder;
pub mod ocr_net;
