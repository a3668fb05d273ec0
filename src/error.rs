use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Categorical error kinds for the two-phase commit core. Names follow the
/// vocabulary a SQL-facing caller would translate these into, not the
/// underlying mechanism.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    FileAccess(String),
    WrongObjectType(String),
    DataCorrupted(String),
    InvalidParameter(String),
    DuplicateObject(String),
    OutOfMemory,
    UndefinedObject(String),
    Busy(String),
    InsufficientPrivilege(String),
    InvalidArgument(String),
    InvalidState(String),
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(ioe: io::Error) -> Self {
        Error::Io(ioe)
    }
}

impl StdError for Error {
    fn description(&self) -> &str {
        use self::Error::*;

        match *self {
            FileAccess(ref e)
            | WrongObjectType(ref e)
            | DataCorrupted(ref e)
            | InvalidParameter(ref e)
            | DuplicateObject(ref e)
            | UndefinedObject(ref e)
            | Busy(ref e)
            | InsufficientPrivilege(ref e)
            | InvalidArgument(ref e)
            | InvalidState(ref e)
            | Internal(ref e) => &*e,
            Io(ref e) => e.description(),
            OutOfMemory => "out of memory",
        }
    }
}

/// Unwraps a result produced inside a critical section, panicking
/// (process-fatal) instead of propagating `Err`. Once a critical
/// section's first durable write has landed, a failure partway through
/// the rest of it can't be made to look like it never started — the
/// only safe response is to stop the process and let crash recovery
/// reconcile state from what's already on disk.
pub fn critical<T>(step: &str, result: Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("critical section failed at {}: {}", step, e),
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            FileAccess(ref e) => write!(f, "file access error: {}", e),
            WrongObjectType(ref e) => write!(f, "wrong object type: {}", e),
            DataCorrupted(ref e) => write!(f, "data corrupted: {}", e),
            InvalidParameter(ref e) => write!(f, "invalid parameter: {}", e),
            DuplicateObject(ref e) => write!(f, "duplicate object: {}", e),
            OutOfMemory => write!(f, "out of memory"),
            UndefinedObject(ref e) => write!(f, "undefined object: {}", e),
            Busy(ref e) => write!(f, "object not in prerequisite state: {}", e),
            InsufficientPrivilege(ref e) => write!(f, "insufficient privilege: {}", e),
            InvalidArgument(ref e) => write!(f, "invalid argument: {}", e),
            InvalidState(ref e) => write!(f, "invalid state: {}", e),
            Internal(ref e) => write!(f, "internal error: {}", e),
            Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}
