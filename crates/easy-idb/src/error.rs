use crate::engine::EngineError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The request-style operations the façade issues against an object store.
///
/// The display form is what appears in [`Error::Operation`] messages, e.g.
/// `Failed to add in store users: ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Add,
    Put,
    Get,
    GetAll,
    Delete,
    Clear,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Put => "put",
            OperationKind::Get => "get",
            OperationKind::GetAll => "getAll",
            OperationKind::Delete => "delete",
            OperationKind::Clear => "clear",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the façade can surface.
///
/// Configuration errors are returned synchronously from [`crate::EasyDb::of`] and
/// [`crate::Registry::obtain`]. Everything else is the rejection of a deferred operation.
/// Connection errors are `Clone` because a single failed open is observed by every
/// operation that awaits the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Database name is required")]
    MissingDatabaseName,

    #[error("At least one store name is required")]
    MissingStoreNames,

    #[error("duplicate store name: {0}")]
    DuplicateStoreName(String),

    #[error("invalid schema version {0} (must be >= 1)")]
    InvalidVersion(u32),

    #[error("No indexedDb instance available. Check your browser support.")]
    IndexedDbUnavailable,

    #[error("Failed to open IndexedDB: {0}")]
    Open(EngineError),

    #[error("Missing stores: {}", .0.join(", "))]
    MissingStores(Vec<String>),

    #[error("Invalid store name: {0}")]
    InvalidStore(String),

    #[error("Failed to {kind} in store {store}: {source}")]
    Operation {
        kind: OperationKind,
        store: String,
        source: EngineError,
    },

    #[error("Cursor error in store {store}: {source}")]
    Cursor { store: String, source: EngineError },

    /// The transaction as a whole failed or aborted.
    #[error("Failed to get all records from {store}: {source}")]
    Transaction { store: String, source: EngineError },

    #[error("failed to {kind} in store {store}: value does not round-trip through serde: {message}")]
    Codec {
        kind: OperationKind,
        store: String,
        message: String,
    },

    #[error("Failed to delete database {database}: {source}")]
    DeleteDatabase {
        database: String,
        source: EngineError,
    },

    /// The engine dropped a request's handlers without invoking either of them.
    #[error("request was dropped by the storage engine before it settled")]
    Canceled,
}

impl Error {
    /// True for failures raised before any engine interaction took place.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingDatabaseName
                | Error::MissingStoreNames
                | Error::DuplicateStoreName(_)
                | Error::InvalidVersion(_)
                | Error::IndexedDbUnavailable
        )
    }

    /// The engine error underlying this failure, if the engine produced one.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Error::Open(source)
            | Error::Operation { source, .. }
            | Error::Cursor { source, .. }
            | Error::Transaction { source, .. }
            | Error::DeleteDatabase { source, .. } => Some(source),
            _ => None,
        }
    }
}
