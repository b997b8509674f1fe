//! Common types shared by the media gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
