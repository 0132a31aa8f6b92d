pub mod position_wise_feed_forward;
pub mod sequential;
pub mod utils;
