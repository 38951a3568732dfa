//! Message normalization: provider bytes to the canonical message shape.

pub mod normalize;
pub mod types;

pub use normalize::normalize;
pub use types::{NormalizedMessage, RawMessage, Sender};
