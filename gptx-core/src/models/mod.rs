pub mod gpt2;

pub use candle_core::{DType, Device};
