use std::fmt::{self, Display, Formatter};

/// Coarse classification of the few recoverable failures this crate exposes.
///
/// Everything that `spec.md` classifies as a *precondition violation* (popping
/// an empty [`TimerQueue`](crate::TimerQueue), cancelling an already-popped
/// timer, re-entering [`Engine::mainloop`](crate::Engine::mainloop)) stays a
/// `debug_assert!`/`assert!` and never reaches this type — it is a programmer
/// error, not something a caller recovers from.
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A builder was asked to produce a value from an invalid configuration.
    InvalidConfig,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidConfig => write!(f, "invalid configuration"),
        }
    }
}

/// Error type returned by the fallible builders in this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    /// Creates a new error from a kind and a human-readable message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}
