//! Engine error taxonomy and library status translation.

use std::io;

use thiserror::Error;

/// Status codes visible to callers, mirroring the library's own set plus
/// the resource conditions the environment layer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Corruption,
    NotSupported,
    InvalidArgument,
    IoError,
    MergeInProgress,
    Incomplete,
    ShutdownInProgress,
    TimedOut,
    Aborted,
    Busy,
    Expired,
    TryAgain,
    NoSpace,
    MemoryLimit,
}

impl Status {
    /// Translate a runtime I/O condition into a library status.
    ///
    /// Anything without a direct counterpart becomes `Aborted`; the caller
    /// keeps the diagnostic string alongside.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Status::NotFound,
            io::ErrorKind::InvalidInput => Status::InvalidArgument,
            io::ErrorKind::TimedOut => Status::TimedOut,
            io::ErrorKind::WouldBlock => Status::TryAgain,
            _ => match err.raw_os_error() {
                Some(libc::ENOTSUP) => Status::NotSupported,
                Some(libc::EINVAL) => Status::InvalidArgument,
                Some(libc::EBUSY) => Status::Busy,
                Some(libc::EAGAIN) => Status::TryAgain,
                Some(libc::ENOSPC) => Status::NoSpace,
                Some(libc::ENOMEM) => Status::MemoryLimit,
                Some(libc::ETIMEDOUT) => Status::TimedOut,
                Some(_) | None => Status::IoError,
            },
        }
    }
}

/// The error type returned by every fallible engine operation.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("not found")]
    NotFound,

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("merge in progress")]
    MergeInProgress,

    #[error("incomplete: {0}")]
    Incomplete(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("timed out")]
    TimedOut,

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("device busy")]
    Busy,

    #[error("expired")]
    Expired,

    #[error("try again")]
    TryAgain,

    /// Column descriptor set does not match what is on disk.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// The status code this error corresponds to.
    pub fn status(&self) -> Status {
        match self {
            DbError::NotFound => Status::NotFound,
            DbError::Corruption(_) => Status::Corruption,
            DbError::NotSupported(_) => Status::NotSupported,
            DbError::InvalidArgument(_) => Status::InvalidArgument,
            DbError::Io(_) => Status::IoError,
            DbError::MergeInProgress => Status::MergeInProgress,
            DbError::Incomplete(_) => Status::Incomplete,
            DbError::ShutdownInProgress => Status::ShutdownInProgress,
            DbError::TimedOut => Status::TimedOut,
            DbError::Aborted(_) => Status::Aborted,
            DbError::Busy => Status::Busy,
            DbError::Expired => Status::Expired,
            DbError::TryAgain => Status::TryAgain,
            DbError::Schema(_) => Status::InvalidArgument,
            DbError::Other(_) => Status::Aborted,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound)
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        match Status::from_io(&err) {
            Status::NotFound => DbError::NotFound,
            Status::NotSupported => DbError::NotSupported(err.to_string()),
            Status::InvalidArgument => DbError::InvalidArgument(err.to_string()),
            Status::TimedOut => DbError::TimedOut,
            Status::Busy => DbError::Busy,
            Status::TryAgain => DbError::TryAgain,
            _ => DbError::Io(err.to_string()),
        }
    }
}

impl From<rocksdb::Error> for DbError {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => DbError::NotFound,
            ErrorKind::Corruption => DbError::Corruption(msg),
            ErrorKind::NotSupported => DbError::NotSupported(msg),
            ErrorKind::InvalidArgument => DbError::InvalidArgument(msg),
            ErrorKind::IOError => DbError::Io(msg),
            ErrorKind::MergeInProgress => DbError::MergeInProgress,
            ErrorKind::Incomplete => DbError::Incomplete(msg),
            ErrorKind::ShutdownInProgress => DbError::ShutdownInProgress,
            ErrorKind::TimedOut => DbError::TimedOut,
            ErrorKind::Aborted => DbError::Aborted(msg),
            ErrorKind::Busy => DbError::Busy,
            ErrorKind::Expired => DbError::Expired,
            ErrorKind::TryAgain => DbError::TryAgain,
            _ => DbError::Other(msg),
        }
    }
}

impl From<nix::Error> for DbError {
    fn from(err: nix::Error) -> Self {
        match err.as_errno() {
            Some(errno) => io::Error::from_raw_os_error(errno as i32).into(),
            None => DbError::Other(err.to_string()),
        }
    }
}

/// Attach operator guidance to a corruption error raised while opening.
///
/// The database refuses to open on a torn write-ahead log under the default
/// recovery policy; the way out is an explicit point-in-time reopen.
pub fn corruption_open_hint(err: DbError) -> DbError {
    match err {
        DbError::Corruption(msg) => DbError::Corruption(format!(
            "{} (reopen with wal_recovery=point to roll back to the last consistent point)",
            msg
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_translation_table() {
        let cases = [
            (libc::ENOENT, Status::NotFound),
            (libc::ENOTSUP, Status::NotSupported),
            (libc::EINVAL, Status::InvalidArgument),
            (libc::ETIMEDOUT, Status::TimedOut),
            (libc::EBUSY, Status::Busy),
            (libc::EAGAIN, Status::TryAgain),
            (libc::ENOSPC, Status::NoSpace),
            (libc::ENOMEM, Status::MemoryLimit),
            (libc::EIO, Status::IoError),
        ];
        for (errno, status) in &cases {
            let err = io::Error::from_raw_os_error(*errno);
            assert_eq!(Status::from_io(&err), *status, "errno {}", errno);
        }
    }

    #[test]
    fn open_hint_only_touches_corruption() {
        let hinted = corruption_open_hint(DbError::Corruption("torn record".into()));
        assert!(hinted.to_string().contains("wal_recovery=point"));

        let busy = corruption_open_hint(DbError::Busy);
        assert!(matches!(busy, DbError::Busy));
    }
}
