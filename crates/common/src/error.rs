//! Errors raised while loading `dealer-api` settings from disk

use thiserror::Error;

/// Why a config file could not be turned into settings.
#[derive(Error, Debug)]
pub enum Error {
    /// File parsed but a value is out of range or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
