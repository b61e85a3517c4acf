//! Shared helpers for inference backends

pub mod preprocessing;

pub use preprocessing::{ImagePreprocessor, ModelInputSpec};
