//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device database error: {0}")]
    Database(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
