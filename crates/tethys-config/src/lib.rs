#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Environment-driven configuration for the session process.
//!
//! Layout: `defaults.rs` (default values and variable names), `validate.rs`
//! (parsing helpers), `model.rs` (`SessionConfig` and its loader).

mod defaults;
pub mod error;
pub mod model;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use model::SessionConfig;
