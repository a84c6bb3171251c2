//! Model collaborator implementations
//!
//! - Tract backend (pure Rust ONNX human parsing)
//! - Scripted mocks for tests, benchmarks and dry runs

#[cfg(feature = "tract")]
pub mod tract;

pub mod mock;

#[cfg(feature = "tract")]
pub use self::tract::TractSegmenter;

pub use self::mock::{MockCounters, MockModels};
