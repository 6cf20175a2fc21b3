//! Error taxonomy shared by the client and server engines.
//!
//! Every error maps to a sign-preserving integer code carried in RPC
//! responses; zero means success. [`Error::check`] rebuilds the typed error
//! on the peer that receives a code.

/// Wire code for a successful operation.
pub const SUCCESS: i32 = 0;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocation failed")]
    Allocation,
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no migration class registered for this fileset")]
    UnknownClass,
    #[error("unknown file: {0}")]
    UnknownFile(String),
    #[error("provider identity could not be matched")]
    UnknownProvider,
    #[error("unknown metadata key: {0}")]
    UnknownMeta(String),
    #[error("buffer too small for requested data")]
    Size,
    #[error("bulk transfer length mismatch")]
    Migration,
    #[error("migration class already registered")]
    ClassExists,
    #[error("destination file already exists")]
    FileExists,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("user callback returned status {0}")]
    User(i32),
    #[error("unknown operation id")]
    InvalidOpId,
}

impl Error {
    /// Sign-preserving integer carried on the wire.
    pub fn code(&self) -> i32 {
        match self {
            Error::Allocation => -1,
            Error::InvalidArg(_) => -2,
            Error::Transport(_) => -3,
            Error::UnknownClass => -4,
            Error::UnknownFile(_) => -5,
            Error::UnknownProvider => -6,
            Error::UnknownMeta(_) => -7,
            Error::Size => -8,
            Error::Migration => -9,
            Error::ClassExists => -10,
            Error::FileExists => -11,
            Error::Io(_) => -12,
            Error::User(_) => -13,
            Error::InvalidOpId => -14,
        }
    }

    /// Rebuilds a `Result` from a wire code. `user_status` is only consulted
    /// when the code denotes a user-callback failure.
    pub fn check(code: i32, user_status: i32) -> Result<()> {
        let remote = || "reported by remote peer".to_string();
        match code {
            0 => Ok(()),
            -1 => Err(Error::Allocation),
            -2 => Err(Error::InvalidArg(remote())),
            -3 => Err(Error::Transport(remote())),
            -4 => Err(Error::UnknownClass),
            -5 => Err(Error::UnknownFile(remote())),
            -6 => Err(Error::UnknownProvider),
            -7 => Err(Error::UnknownMeta(remote())),
            -8 => Err(Error::Size),
            -9 => Err(Error::Migration),
            -10 => Err(Error::ClassExists),
            -11 => Err(Error::FileExists),
            -12 => Err(Error::Io(remote())),
            -13 => Err(Error::User(user_status)),
            -14 => Err(Error::InvalidOpId),
            other => Err(Error::Transport(format!("unknown error code {other}"))),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
