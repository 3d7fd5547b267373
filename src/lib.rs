//! FIDO key seeder
//!
//! Command-line front end for programming seeds onto FIDO security keys.
//! The protocol lives in the `seedkey` and `seedkey-transport` crates; this
//! crate holds the pieces the CLI layers on top:
//!
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `seed_input`: hex seed parsing and device selection

pub mod config;
pub mod logging;
pub mod seed_input;

pub use config::{ConfigError, SeederConfig};
