//! The storage-engine seam.
//!
//! These traits reproduce the event protocol of the browser's IndexedDB engine: an open
//! request that may fire an upgrade-needed event before success or error, per-store
//! transactions that report completion or failure, request-style operations that settle
//! through a success handler or an error handler, and forward cursors that report each
//! step. The façade in [`crate::EasyDb`] is written against these traits only, so it runs
//! unchanged on top of [`MemoryFactory`] (native targets and tests) and, on wasm32, on top
//! of the real browser engine.
//!
//! Engines must invoke exactly one of a request's handlers. Dropping both without calling
//! either is tolerated and surfaces to callers as [`crate::Error::Canceled`].

use std::fmt;

pub mod memory;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use memory::{Fault, MemoryFactory};
#[cfg(target_arch = "wasm32")]
pub use web::WebFactory;

/// Engine-level value stored under a key.
///
/// Object stores are schemaless; the façade converts caller types to and from this
/// representation with `serde`.
pub type Record = serde_json::Value;

pub type SuccessHandler<T> = Box<dyn FnOnce(T)>;
pub type ErrorHandler = Box<dyn FnOnce(EngineError)>;

/// Error reported by the storage engine, shaped like a DOM `DOMException`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct EngineError {
    pub name: String,
    pub message: String,
}

impl EngineError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new("ConstraintError", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NotFoundError", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new("AbortError", message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => f.write_str("readonly"),
            TransactionMode::ReadWrite => f.write_str("readwrite"),
        }
    }
}

/// Success/error handler pair for one request. The engine invokes exactly one of them.
pub struct RequestHandlers<T> {
    pub on_success: SuccessHandler<T>,
    pub on_error: ErrorHandler,
}

/// Handlers for a forward cursor.
///
/// `on_step` receives `Some(cursor)` for every record and `None` once the traversal is
/// exhausted. The engine only delivers the next step after [`Cursor::advance`] has been
/// called.
pub struct CursorHandlers<C> {
    pub on_step: Box<dyn FnMut(Option<C>)>,
    pub on_error: ErrorHandler,
}

/// Handlers for the open handshake.
///
/// `on_upgrade_needed` runs at most once, before `on_success`, when the container did not
/// previously exist at the requested version. Returning an error from it aborts the open.
pub struct OpenHandlers<C> {
    pub on_upgrade_needed: Box<dyn FnOnce(&mut dyn SchemaEditor) -> Result<(), EngineError>>,
    pub on_success: SuccessHandler<C>,
    pub on_error: ErrorHandler,
}

/// Entry point of an engine: opens and deletes named, versioned containers.
pub trait Factory: 'static {
    type Connection: Connection + 'static;

    /// Starts opening `name` at `version`. The outcome is reported through `handlers`.
    ///
    /// A synchronous error means the request could not even be issued, in which case none
    /// of the handlers will be called.
    fn open(
        &self,
        name: &str,
        version: u32,
        handlers: OpenHandlers<Self::Connection>,
    ) -> Result<(), EngineError>;

    fn delete_database(
        &self,
        name: &str,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError>;

    /// Delivers the events the engine has queued so far.
    ///
    /// Called whenever a pending result is polled. Engines driven by a host event loop
    /// (the browser) have nothing to do here.
    fn drive() {}
}

/// Schema access available during the upgrade handshake.
pub trait SchemaEditor {
    fn store_names(&self) -> Vec<String>;
    fn create_store(&mut self, name: &str) -> Result<(), EngineError>;
}

pub trait Connection {
    type Transaction: Transaction + 'static;

    fn store_names(&self) -> Vec<String>;

    fn has_store(&self, name: &str) -> bool {
        self.store_names().iter().any(|s| s == name)
    }

    fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
    ) -> Result<Self::Transaction, EngineError>;

    fn close(&self);
}

/// A single-store unit of work.
///
/// At most one of the completion handler and the error handler fires. The error handler
/// covers both failed and aborted transactions.
pub trait Transaction {
    type Store: ObjectStore + 'static;

    fn object_store(&self, name: &str) -> Result<Self::Store, EngineError>;

    fn on_complete(&self, handler: Box<dyn FnOnce()>);
    fn on_error(&self, handler: ErrorHandler);
}

/// Request-style operations on one store inside a transaction.
///
/// Each method issues one request. A synchronous `Err` means the request was rejected
/// before being queued (e.g. the transaction is read-only or no longer active) and no
/// handler will run.
pub trait ObjectStore {
    type Cursor: Cursor + 'static;

    fn add(&self, key: &str, value: Record, handlers: RequestHandlers<()>)
        -> Result<(), EngineError>;
    fn put(&self, key: &str, value: Record, handlers: RequestHandlers<()>)
        -> Result<(), EngineError>;
    fn get(&self, key: &str, handlers: RequestHandlers<Option<Record>>)
        -> Result<(), EngineError>;
    fn delete(&self, key: &str, handlers: RequestHandlers<()>) -> Result<(), EngineError>;
    fn clear(&self, handlers: RequestHandlers<()>) -> Result<(), EngineError>;
    fn open_cursor(&self, handlers: CursorHandlers<Self::Cursor>) -> Result<(), EngineError>;
}

/// Position of a forward cursor.
pub trait Cursor {
    fn key(&self) -> String;
    /// The record at the current position. Fails if the stored value cannot be read back.
    fn value(&self) -> Result<Record, EngineError>;
    /// Requests the next step (the engine's `continue`).
    fn advance(&self) -> Result<(), EngineError>;
}
