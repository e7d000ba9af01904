use std::fmt;

/// Error kinds returned by this crate's public surface.
///
/// Transient conditions (`StoreFull`, `StoreSealing`, `UnsyncedStore`, CAS
/// races) never reach here — the coordinator resolves them internally
/// (spec §7). Everything in this enum is either a caller-facing cursor
/// status or a fatal condition the caller must treat as unrecoverable.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Corrupt on-disk data: truncated frame, zero-length block mid-stream, etc.
    Corrupt(&'static str),
    /// Store header magic or recorded size did not match what was expected.
    BadFormat(&'static str),
    Unsupported(&'static str),
    /// A seek or read precondition was violated by the caller.
    OutOfBounds,
    /// Cursor has walked past the last written block.
    End,
    /// Cursors only move forward; `seek` was given an offset at or behind
    /// the cursor's current position.
    InvalidSeekDirection,
    /// `advance()` called before the cursor was ever `seek`ed.
    UninitialisedCursor,
    /// A decompressing store's cursor read failed specifically in the
    /// decode step (see the `StoreBackend` contract in compression.rs).
    DecompressionFault,
    /// A cursor tried to read a store that hasn't completed its first sync.
    /// Transient at the store layer; the coordinator never lets this reach
    /// a caller (spec §7).
    UnsyncedStore,
    /// An internal invariant was violated — programmer error, not a runtime
    /// condition. Always fatal.
    ProgrammerError(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::BadFormat(msg) => write!(f, "bad format: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::OutOfBounds => write!(f, "out of bounds"),
            Error::End => write!(f, "end of store"),
            Error::InvalidSeekDirection => write!(f, "cursors are forward-only"),
            Error::UninitialisedCursor => write!(f, "cursor was never seeked"),
            Error::DecompressionFault => write!(f, "decompression fault"),
            Error::UnsyncedStore => write!(f, "store has not completed its first sync"),
            Error::ProgrammerError(msg) => write!(f, "programmer error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Abort the process after logging `msg`. Used for the fatal error kinds
/// (`BadFormat`, `Io`, `ProgrammerError`) per spec §7: once one of these is
/// observed the structure holding it is no longer trustworthy and recovery
/// is out of scope — the caller is expected to treat the handle as dead.
pub(crate) fn fatal(msg: &str, err: &Error) -> ! {
    log::error!("ringq: fatal: {msg}: {err}");
    panic!("ringq: fatal: {msg}: {err}");
}
