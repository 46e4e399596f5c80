//! Shared types, traits, and error handling for the agent core.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
