use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cli::MAX_FILES;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no file specified to tail")]
    NoFiles,
    #[error("too many files to tail: {0} given, max file limit is {max}", max = MAX_FILES)]
    TooManyFiles(usize),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("{0}")]
    Usage(#[from] clap::Error),
    #[error("error while initializing file notifications: {0}")]
    NotifyInit(#[source] io::Error),
    #[error("error while adding a watch for {}: {source}", path.display())]
    Register {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error while opening file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error while reading file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error while writing output: {0}")]
    Output(#[source] io::Error),
    #[error("file event stream closed")]
    EventStreamClosed,
    #[error("file session aborted: {0}")]
    Aborted(#[source] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn open(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Error::Open { path, source }
    }

    pub(crate) fn read(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Error::Read { path, source }
    }
}
