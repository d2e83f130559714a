//! Common types for the Qwen credential-pool proxy

pub mod clock;
mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::SecretString;
