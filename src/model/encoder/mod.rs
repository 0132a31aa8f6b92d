pub mod conv_attention;
