pub mod models;
pub mod reconcile;
pub mod store;

pub use models::{Session, SessionStatus};
pub use reconcile::{Conflict, ConflictKind, ReconcileReport, reconcile};
pub use store::SessionStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{0}' already exists")]
    Duplicate(String),

    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("invalid session update: {0}")]
    InvalidUpdate(String),

    #[error("session store lock: {0}")]
    Lock(String),

    #[error("session store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("session file is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Provider(#[from] sbx_infra::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
