//! Inference backends
//!
//! - ONNX Runtime backend (feature `onnx`): provider probe, session factory and
//!   filesystem model store
//! - Test doubles for every collaborator (`cfg(test)`)

#[cfg(feature = "onnx")]
pub mod onnx;

// Test utilities for backend testing
#[cfg(test)]
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::{describe_providers, FsModelStore, OrtProviderProbe, OrtSession, OrtSessionFactory};
