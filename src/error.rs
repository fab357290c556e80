use core::fmt;
use std::io;

/// Wire-level status codes carried in `Reply`/`GetResponse` frames. `0` is
/// success; everything else maps onto a variant of [`Error`].
pub mod code {
    pub const OK: u32 = 0;
    pub const PROTOCOL: u32 = 1;
    pub const ALREADY_EXISTS: u32 = 2;
    pub const NOT_IMPLEMENTED: u32 = 3;
    pub const TIMEOUT: u32 = 4;
    pub const SERVER_DIED: u32 = 5;
    pub const CONNECTION_LOST: u32 = 6;
    pub const WRONG_PASSWORD: u32 = 7;
    pub const LOCK_TIMEOUT: u32 = 8;
}

pub enum Error {
    /// Malformed or unknown frame. The connection carrying it is dropped.
    Protocol(String),
    /// Duplicate subscription or duplicate client name, locally or
    /// anywhere in the cloud.
    AlreadyExists(String),
    /// The subdomain handler serving this client does not advertise the
    /// requested capability.
    NotImplemented(String),
    /// A get-style call exceeded its caller-supplied deadline.
    Timeout,
    /// The broker this handle was attached to went away.
    ServerDied,
    ConnectionLost,
    WrongPassword,
    /// A distributed lock could not be acquired within its retry budget.
    LockTimeout,
    /// Every URL in the failover list was tried and refused.
    ConnectFailed(String),
    Io(io::Error),
}

impl Error {
    /// The status code used for this error on the wire.
    pub fn wire_code(&self) -> u32 {
        match self {
            Error::Protocol(_) => code::PROTOCOL,
            Error::AlreadyExists(_) => code::ALREADY_EXISTS,
            Error::NotImplemented(_) => code::NOT_IMPLEMENTED,
            Error::Timeout => code::TIMEOUT,
            Error::ServerDied => code::SERVER_DIED,
            Error::ConnectionLost => code::CONNECTION_LOST,
            Error::WrongPassword => code::WRONG_PASSWORD,
            Error::LockTimeout => code::LOCK_TIMEOUT,
            Error::ConnectFailed(_) => code::CONNECTION_LOST,
            Error::Io(_) => code::CONNECTION_LOST,
        }
    }

    /// Reconstructs an error from a non-zero wire status code.
    pub fn from_wire_code(status: u32) -> Self {
        match status {
            code::ALREADY_EXISTS => {
                Error::AlreadyExists("rejected by broker".into())
            }
            code::NOT_IMPLEMENTED => {
                Error::NotImplemented("rejected by broker".into())
            }
            code::TIMEOUT => Error::Timeout,
            code::SERVER_DIED => Error::ServerDied,
            code::CONNECTION_LOST => Error::ConnectionLost,
            code::WRONG_PASSWORD => Error::WrongPassword,
            code::LOCK_TIMEOUT => Error::LockTimeout,
            _ => Error::Protocol(format!("unknown status code {status}")),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(what) => write!(f, "protocol error: {what}"),
            Error::AlreadyExists(what) => {
                write!(f, "already exists: {what}")
            }
            Error::NotImplemented(what) => {
                write!(f, "not implemented by subdomain handler: {what}")
            }
            Error::Timeout => write!(f, "timed out"),
            Error::ServerDied => write!(f, "server died"),
            Error::ConnectionLost => write!(f, "connection lost"),
            Error::WrongPassword => write!(f, "wrong password"),
            Error::LockTimeout => {
                write!(f, "distributed lock acquisition timed out")
            }
            Error::ConnectFailed(what) => {
                write!(f, "connect failed: {what}")
            }
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
