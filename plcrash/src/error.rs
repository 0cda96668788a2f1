use std::fmt;

/// An error that can occur when registering the [`crate::SignalHandler`] or
/// while writing a crash report
#[derive(Debug)]
pub enum Error {
    /// An unknown error, if encountered this is a bug
    Unknown,
    /// The crash report could not be opened or written to
    Output,
    /// Unable to `mmap` memory
    OutOfMemory,
    /// The operation is not supported on this target
    NotSupported,
    /// An invalid argument was supplied
    InvalidArgument,
    /// An internal invariant was broken
    Internal,
    /// For simplicity sake, the handler can only be registered once per
    /// process.
    HandlerAlreadyInstalled,
    /// The operation requires the handler to have been registered first
    HandlerNotInstalled,
    /// An I/O or other syscall failed
    Io(std::io::Error),
}

impl Error {
    /// A static description of the error.
    ///
    /// Unlike the [`fmt::Display`] implementation this never formats, so it
    /// can be used from within a signal handler.
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::Output => "crash report can not be opened or written to",
            Self::OutOfMemory => "unable to allocate memory",
            Self::NotSupported => "operation not supported",
            Self::InvalidArgument => "invalid argument",
            Self::Internal => "internal error",
            Self::HandlerAlreadyInstalled => "a crash handler is already installed",
            Self::HandlerNotInstalled => "the crash handler has not been installed",
            Self::Io(_) => "an I/O error occurred",
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            other => f.write_str(other.description()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
