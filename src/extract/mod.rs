//! AI extraction: the model call and raw-response handling.

pub mod model;
pub mod response;

pub use model::{AnthropicExtractor, ExtractionModel};
