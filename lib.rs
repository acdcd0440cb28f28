//! Photo category tagging with a fast object detector backed by a semantic embedding
//! classifier.

pub mod config;
pub mod context;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod hybrid;
pub mod mapper;
pub mod models;
pub mod onnx;
pub mod scan;
pub mod semantic;
pub mod tag_store;
pub mod validator;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use context::{ClassifyReport, ModelContext};
pub use error::{Error, Result};
pub use hybrid::ClassifyOptions;
pub use models::{Category, ClassificationResult};
