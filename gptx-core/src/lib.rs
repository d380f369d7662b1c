pub mod export;
pub mod hub;
pub mod models;
pub mod onnx;
pub mod stateless;

pub mod testing;
