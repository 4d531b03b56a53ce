//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type Niks3Result<T> = Result<T, Niks3Error>;

/// An error.
#[derive(Debug, Display)]
pub enum Niks3Error {
    /// Invalid closure key "{key}": {reason}
    InvalidClosureKey { key: String, reason: &'static str },

    /// Invalid pin name "{name}"
    InvalidPinName { name: String },

    /// Signing error: {0}
    SigningError(super::signing::Error),

    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl Niks3Error {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidClosureKey { .. } => "InvalidClosureKey",
            Self::InvalidPinName { .. } => "InvalidPinName",
            Self::SigningError(_) => "SigningError",
            Self::HashError(_) => "HashError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for Niks3Error {}

impl From<io::Error> for Niks3Error {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::signing::Error> for Niks3Error {
    fn from(error: super::signing::Error) -> Self {
        Self::SigningError(error)
    }
}

impl From<super::hash::Error> for Niks3Error {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}
