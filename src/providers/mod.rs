//! Remote endpoint implementations.

pub mod mock;
pub use mock::{MockDetector, MockProvider};

pub mod openai_compatible;
pub use openai_compatible::OpenAICompatibleProvider;
