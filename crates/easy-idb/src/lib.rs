//! Request/response façade over IndexedDB-style versioned key/value storage.
//!
//! The browser engine speaks in events: an open request fires `upgradeneeded`, `success`
//! or `error`; every read and write is a request firing `success` or `error`; cursors fire
//! once per step and transactions fire `complete` or `error`. This crate turns that
//! protocol into `async` CRUD operations:
//!
//! - [`EasyDb::of`] validates a [`Config`], returns the cached instance for it or creates
//!   one, and starts the open/upgrade handshake exactly once per configuration.
//! - [`EasyDb::add`], [`put`](EasyDb::put), [`get`](EasyDb::get),
//!   [`delete`](EasyDb::delete), [`get_all`](EasyDb::get_all) and
//!   [`clear`](EasyDb::clear) each run in a fresh single-store transaction.
//! - [`EasyDb::store`] binds a store name first and takes per-call arguments later.
//!
//! The engine is injected through the [`engine::Factory`] trait. [`MemoryFactory`]
//! implements it in process (native targets, tests); on wasm32 [`engine::WebFactory`]
//! drives the browser's `indexedDB`.
//!
//! ```
//! use easy_idb::{Config, EasyDb, MemoryFactory};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Entity {
//!     id: String,
//!     name: String,
//! }
//!
//! # pollster::block_on(async {
//! let db = EasyDb::of(Config::new(MemoryFactory::new(), "docs-crate").store("entities"))?;
//! let entity = Entity { id: "id1".into(), name: "entity 1".into() };
//!
//! db.add("entities", &entity.id, &entity).await?;
//! assert_eq!(db.get::<Entity>("entities", "id1").await?, Some(entity));
//! assert_eq!(db.get_all::<Entity>("entities").await?.len(), 1);
//! # Ok::<_, easy_idb::Error>(())
//! # }).unwrap();
//! ```

mod bridge;
mod config;
mod connection;
mod db;
pub mod engine;
mod error;
mod registry;
mod scan;

pub use crate::config::{CacheKey, Config, DEFAULT_VERSION};
pub use crate::connection::delete_database;
pub use crate::db::{EasyDb, StoreRef};
pub use crate::engine::{EngineError, Fault, MemoryFactory, TransactionMode};
pub use crate::error::{Error, OperationKind, Result};
pub use crate::registry::Registry;
