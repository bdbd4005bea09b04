use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupFsError>;

#[derive(Debug, Error)]
pub enum BackupFsError {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The random source could not supply the bytes a `%u` token needs.
    #[error("random source unavailable: {0}")]
    RandomUnavailable(String),

    #[error("access denied: the device only accepts write-only opens")]
    AccessDenied,

    #[error("no such entry: {0}")]
    NotFound(String),

    /// Stale or never-issued session token.
    #[error("invalid file handle {0}")]
    InvalidHandle(u64),

    #[error("handle table exhausted ({0} sessions open)")]
    Exhausted(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackupFsError {
    /// The errno reported back to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            BackupFsError::Config(_) => libc::EINVAL,
            BackupFsError::RandomUnavailable(_) => libc::EAGAIN,
            BackupFsError::AccessDenied => libc::EACCES,
            BackupFsError::NotFound(_) => libc::ENOENT,
            BackupFsError::InvalidHandle(_) => libc::EINVAL,
            BackupFsError::Exhausted(_) => libc::EAGAIN,
            BackupFsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<nix::Error> for BackupFsError {
    fn from(e: nix::Error) -> Self {
        BackupFsError::Io(io::Error::from(e))
    }
}

impl From<BackupFsError> for rfuse3::Errno {
    fn from(e: BackupFsError) -> Self {
        e.errno().into()
    }
}
