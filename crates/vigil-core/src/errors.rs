//! Error taxonomy for the watching engine.
//!
//! The engine deals with three broad families of failure: filesystem races
//! (paths vanishing between readdir and stat — routine, recovered in-tree),
//! watcher backend trouble (event loss recovers via recrawl; watch-descriptor
//! exhaustion poisons the root until restart), and client-visible failures
//! (query parse/execution errors, sync timeouts). Classification of raw IO
//! errors happens here so the rest of the engine can match on intent rather
//! than errno.

use std::io;

use thiserror::Error;
use vigil_path::PathString;

/// Classification of an `io::Error` into the categories the engine reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoClass {
    NoSuchFileOrDirectory,
    NotADirectory,
    TooManySymbolicLinkLevels,
    PermissionDenied,
    SystemLimitsExceeded,
    Other,
}

impl IoClass {
    /// ENOENT-class errors: the path is simply gone. Expected during any
    /// crawl that races with the filesystem; recovered by marking nodes
    /// deleted.
    pub fn is_missing(self) -> bool {
        matches!(
            self,
            IoClass::NoSuchFileOrDirectory
                | IoClass::NotADirectory
                | IoClass::TooManySymbolicLinkLevels
        )
    }
}

pub fn classify_io(err: &io::Error) -> IoClass {
    match err.raw_os_error() {
        Some(libc::ENOENT) => IoClass::NoSuchFileOrDirectory,
        Some(libc::ENOTDIR) => IoClass::NotADirectory,
        Some(libc::ELOOP) => IoClass::TooManySymbolicLinkLevels,
        Some(libc::EACCES) | Some(libc::EPERM) => IoClass::PermissionDenied,
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOSPC) => {
            IoClass::SystemLimitsExceeded
        }
        _ => IoClass::Other,
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("filewatching backend error: {0}")]
    Notify(#[from] notify::Error),
    #[error("watch limits exceeded on {path}: {reason}")]
    LimitsExceeded { path: PathString, reason: String },
    #[error("filewatching has been stopped")]
    Stopped,
    #[error("filewatching failed to start: {0}")]
    Setup(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("sync_to_now timed out waiting for the cookie to be observed")]
    Timeout,
    #[error("root dir was removed or is inaccessible")]
    RootRemoved,
    #[error("failed to create cookie file at {path}: {io_err}")]
    Io {
        io_err: io::Error,
        path: PathString,
    },
    #[error("cookie notification channel closed")]
    Closed,
}

/// Query failures are split into parse-time and execution-time kinds so
/// clients can distinguish a malformed request from a request that hit
/// trouble while running.
#[derive(Clone, Debug, Error)]
pub enum QueryError {
    #[error("failed to parse query: {0}")]
    Parse(String),
    #[error("error executing query: {0}")]
    Exec(String),
    #[error("synchronization failed: {0}")]
    SyncTimeout(String),
    #[error("timed out waiting for the root")]
    LockTimeout,
    #[error("the watch is unhealthy: {0}")]
    Poisoned(String),
    #[error("the root has been cancelled")]
    RootCancelled,
}

#[derive(Debug, Error)]
pub enum RootError {
    #[error("path \"{0}\" must be absolute")]
    NotAbsolute(PathString),
    #[error("cannot watch \"/\"")]
    CannotWatchSlash,
    #[error("directory {0} is not watched")]
    NotWatched(PathString),
    #[error("realpath({path}) -> {io_err}")]
    Realpath {
        path: PathString,
        io_err: io::Error,
    },
    #[error(
        "path uses the \"{fstype}\" filesystem and is disallowed by \
         global config illegal_fstypes: {advice}"
    )]
    IllegalFilesystem { fstype: String, advice: String },
    #[error(
        "none of the files listed in root_restrict_files are present and \
         enforce_root_files is set to true"
    )]
    RestrictedRoot,
    #[error(transparent)]
    Path(#[from] vigil_path::PathError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid or missing name")]
    InvalidName,
    #[error("invalid command array")]
    InvalidCommand,
    #[error("invalid stdin value {0}")]
    InvalidStdin(String),
    #[error("max_files_stdin must be >= 0")]
    InvalidMaxFiles,
    #[error("{label}: must be prefixed with either > or >>, got {value}")]
    InvalidRedirection { label: &'static str, value: String },
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("the root has been cancelled")]
    RootCancelled,
}

#[cfg(test)]
mod test {
    use std::io;

    use super::{classify_io, IoClass};

    #[test]
    fn test_classify_by_errno() {
        let enoent = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(classify_io(&enoent), IoClass::NoSuchFileOrDirectory);
        assert!(classify_io(&enoent).is_missing());

        let enotdir = io::Error::from_raw_os_error(libc::ENOTDIR);
        assert!(classify_io(&enotdir).is_missing());

        let eacces = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(classify_io(&eacces), IoClass::PermissionDenied);
        assert!(!classify_io(&eacces).is_missing());

        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_io(&emfile), IoClass::SystemLimitsExceeded);

        let other = io::Error::new(io::ErrorKind::Other, "weird");
        assert_eq!(classify_io(&other), IoClass::Other);
    }
}
