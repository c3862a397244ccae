pub mod backoff;
pub mod folders;
pub mod policy;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod tree;
pub mod uploader;

use thiserror::Error;

pub use store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("path contains unsupported component: {0}")]
    UnsupportedPath(String),
    #[error("unknown sync mode: {0}")]
    UnknownMode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
