//! Error types

use thiserror::Error;

/// Errors surfaced by constructors.
///
/// Hot-path outcomes are never errors: an unclaimed frame is returned to
/// the caller, an overflowed delivery is dropped and counted.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;
