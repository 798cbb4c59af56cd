//! Common types shared by the key pool and the admin service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, mask};
