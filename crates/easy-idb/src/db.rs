use crate::bridge;
use crate::config::{CacheKey, Config};
use crate::connection::ConnectionManager;
use crate::engine::{Connection, Factory, ObjectStore, Record, Transaction, TransactionMode};
use crate::error::{Error, OperationKind, Result};
use crate::registry::Registry;
use crate::scan;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::rc::Rc;

type TransactionOf<F> = <<F as Factory>::Connection as Connection>::Transaction;
type StoreOf<F> = <TransactionOf<F> as Transaction>::Store;

/// Request/response façade over one versioned container.
///
/// Every operation validates the store name, waits for the shared connection, opens a
/// fresh single-store transaction and settles with that transaction's request.
/// Operations may be issued concurrently; ordering between operations on the same store
/// is left to the engine's transaction scheduler.
pub struct EasyDb<F: Factory> {
    database_name: String,
    store_names: Rc<[String]>,
    version: u32,
    cache_key: CacheKey,
    connection: ConnectionManager<F::Connection>,
}

impl<F: Factory> fmt::Debug for EasyDb<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EasyDb")
            .field("database_name", &self.database_name)
            .field("store_names", &self.store_names)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<F: Factory> EasyDb<F> {
    /// Returns the instance for `config` from this thread's registry, creating it (and
    /// starting the open handshake) on first use.
    ///
    /// Configurations with the same database name, store set (in any order) and version
    /// yield the same instance. Invalid configurations are rejected before the engine is
    /// touched.
    ///
    /// The registry is keyed by the engine type `F` and the [`CacheKey`] only; the factory
    /// value is not part of the key. A second, distinct factory of the same type asking for
    /// an already cached configuration gets the instance built on the first factory, whose
    /// data it will read and write. Use a dedicated [`Registry`] per factory when that is
    /// not wanted.
    pub fn of(config: Config<F>) -> Result<Rc<Self>> {
        Registry::<F>::global().obtain(config)
    }

    /// Builds a new instance from an already validated configuration.
    pub(crate) fn new(config: Config<F>) -> Self {
        let cache_key = config.cache_key();
        let (factory, database_name, store_names, version) = config.into_parts();
        let store_names: Rc<[String]> = store_names.into();
        let connection =
            ConnectionManager::open(&factory, &database_name, Rc::clone(&store_names), version);
        Self {
            database_name,
            store_names,
            version,
            cache_key,
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.database_name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn store_names(&self) -> &[String] {
        &self.store_names
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Binds a store name; the returned handle issues operations against it.
    pub fn store(&self, name: impl Into<String>) -> StoreRef<'_, F> {
        StoreRef {
            db: self,
            name: name.into(),
        }
    }

    /// Inserts `value` under `key`. Fails if the key already exists.
    pub async fn add<T>(&self, store: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        const KIND: OperationKind = OperationKind::Add;
        self.check_store(store)?;
        let record = encode(KIND, store, value)?;
        let os = self.open_store(store, TransactionMode::ReadWrite, KIND).await?;
        tracing::trace!(db = %self.database_name, store, key, "add");
        bridge::wrap::<F, _>(KIND, store, |handlers| os.add(key, record, handlers)).await
    }

    /// Inserts `value` under `key`, overwriting any existing value.
    pub async fn put<T>(&self, store: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        const KIND: OperationKind = OperationKind::Put;
        self.check_store(store)?;
        let record = encode(KIND, store, value)?;
        let os = self.open_store(store, TransactionMode::ReadWrite, KIND).await?;
        tracing::trace!(db = %self.database_name, store, key, "put");
        bridge::wrap::<F, _>(KIND, store, |handlers| os.put(key, record, handlers)).await
    }

    /// Reads the value under `key`; an absent key resolves to `None`.
    pub async fn get<T: DeserializeOwned>(&self, store: &str, key: &str) -> Result<Option<T>> {
        const KIND: OperationKind = OperationKind::Get;
        self.check_store(store)?;
        let os = self.open_store(store, TransactionMode::ReadOnly, KIND).await?;
        tracing::trace!(db = %self.database_name, store, key, "get");
        bridge::wrap::<F, _>(KIND, store, |handlers| os.get(key, handlers))
            .await?
            .map(|record| decode(KIND, store, record))
            .transpose()
    }

    /// Reads every value in the store, in the engine's key order.
    pub async fn get_all<T: DeserializeOwned>(&self, store: &str) -> Result<Vec<T>> {
        const KIND: OperationKind = OperationKind::GetAll;
        self.check_store(store)?;
        let tx = self.transaction(store, TransactionMode::ReadOnly, KIND).await?;
        tracing::trace!(db = %self.database_name, store, "getAll");
        scan::scan_all::<F>(&tx, store)
            .await?
            .into_iter()
            .map(|record| decode(KIND, store, record))
            .collect()
    }

    /// Removes `key`. Removing an absent key succeeds.
    pub async fn delete(&self, store: &str, key: &str) -> Result<()> {
        const KIND: OperationKind = OperationKind::Delete;
        self.check_store(store)?;
        let os = self.open_store(store, TransactionMode::ReadWrite, KIND).await?;
        tracing::trace!(db = %self.database_name, store, key, "delete");
        bridge::wrap::<F, _>(KIND, store, |handlers| os.delete(key, handlers)).await
    }

    /// Removes every record in the store.
    pub async fn clear(&self, store: &str) -> Result<()> {
        const KIND: OperationKind = OperationKind::Clear;
        self.check_store(store)?;
        let os = self.open_store(store, TransactionMode::ReadWrite, KIND).await?;
        tracing::trace!(db = %self.database_name, store, "clear");
        bridge::wrap::<F, _>(KIND, store, |handlers| os.clear(handlers)).await
    }

    fn check_store(&self, store: &str) -> Result<()> {
        if self.store_names.iter().any(|name| name == store) {
            Ok(())
        } else {
            Err(Error::InvalidStore(store.to_owned()))
        }
    }

    async fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
        kind: OperationKind,
    ) -> Result<TransactionOf<F>> {
        let conn = self.connection.connection().await?;
        conn.transaction(store, mode)
            .map_err(|source| operation_error(kind, store, source))
    }

    async fn open_store(
        &self,
        store: &str,
        mode: TransactionMode,
        kind: OperationKind,
    ) -> Result<StoreOf<F>> {
        self.transaction(store, mode, kind)
            .await?
            .object_store(store)
            .map_err(|source| operation_error(kind, store, source))
    }
}

/// A store name bound to a façade instance.
///
/// ```
/// # use easy_idb::{Config, EasyDb, MemoryFactory};
/// # pollster::block_on(async {
/// let db = EasyDb::of(Config::new(MemoryFactory::new(), "docs-store-ref").store("users"))?;
/// let users = db.store("users");
/// users.put("ada", "Ada Lovelace").await?;
/// assert_eq!(users.get::<String>("ada").await?.as_deref(), Some("Ada Lovelace"));
/// # Ok::<_, easy_idb::Error>(())
/// # }).unwrap();
/// ```
pub struct StoreRef<'a, F: Factory> {
    db: &'a EasyDb<F>,
    name: String,
}

impl<F: Factory> fmt::Debug for StoreRef<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRef")
            .field("db", &self.db.database_name)
            .field("name", &self.name)
            .finish()
    }
}

impl<F: Factory> StoreRef<'_, F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.db.add(&self.name, key, value).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.db.put(&self.name, key, value).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.db.get(&self.name, key).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.db.delete(&self.name, key).await
    }

    pub async fn get_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.db.get_all(&self.name).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.db.clear(&self.name).await
    }
}

fn operation_error(kind: OperationKind, store: &str, source: crate::engine::EngineError) -> Error {
    Error::Operation {
        kind,
        store: store.to_owned(),
        source,
    }
}

fn encode<T: Serialize + ?Sized>(kind: OperationKind, store: &str, value: &T) -> Result<Record> {
    serde_json::to_value(value).map_err(|e| Error::Codec {
        kind,
        store: store.to_owned(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(kind: OperationKind, store: &str, record: Record) -> Result<T> {
    serde_json::from_value(record).map_err(|e| Error::Codec {
        kind,
        store: store.to_owned(),
        message: e.to_string(),
    })
}
