//! The status model shared by every operation.
use portos_types::{Errno, ResourceKind};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A failed operation: a human readable message plus a symbolic code.
///
/// The message is meant for people, the [`Errno`] is meant for code that
/// wants to branch on the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct Error {
    code: Errno,
    message: String,
}

impl Error {
    pub fn new(code: Errno, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Errno {
        self.code
    }

    /// The symbolic name of the code, e.g. `"ENOENT"`.
    pub fn symbol(&self) -> &'static str {
        self.code.symbol()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The operation was attempted on a handle that was already closed.
    pub fn closed(kind: ResourceKind) -> Self {
        Self::new(Errno::Closed, format!("attempt to use a closed {kind}"))
    }

    /// The platform lacks the capability.
    pub fn not_implemented(what: &str) -> Self {
        Self::new(
            Errno::Notimpl,
            format!("{what} is not implemented on this platform"),
        )
    }

    /// The caller passed something that makes no sense.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Errno::Inval, message)
    }

    pub(crate) fn would_block(&self) -> bool {
        self.code == Errno::Again
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.code == Errno::Intr
    }
}

impl From<Errno> for Error {
    fn from(code: Errno) -> Self {
        Self::new(code, code.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from(&err)
    }
}

impl From<&io::Error> for Error {
    fn from(err: &io::Error) -> Self {
        Self::new(Errno::from(err), err.to_string())
    }
}
