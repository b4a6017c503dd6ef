//! Common types shared by the key balancer crates

mod secret;
mod error;

pub use secret::{REDACTED, Secret};
pub use error::{Error, Result};
