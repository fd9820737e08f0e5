use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("TLS error: {0}")]
    TlsError(#[from] rustls::Error),
    #[error("Certificate error: {0}")]
    CertError(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
