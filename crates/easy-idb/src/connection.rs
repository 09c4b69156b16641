//! Open/upgrade handshake and the shared, deferred connection handle.

use crate::bridge::{self, Settler};
use crate::engine::{Connection, EngineError, Factory, OpenHandlers, SchemaEditor};
use crate::error::{Error, Result};
use futures_util::future::{FutureExt, LocalBoxFuture, Shared};
use std::rc::Rc;

type SharedConnection<C> = Shared<LocalBoxFuture<'static, Result<Rc<C>>>>;

/// Owns the single open request issued for one façade instance.
///
/// The open starts as soon as the manager is created. Every caller of
/// [`ConnectionManager::connection`] observes the same outcome: the same connection on
/// success, the same error on failure.
pub(crate) struct ConnectionManager<C> {
    connection: SharedConnection<C>,
}

impl<C: Connection + 'static> ConnectionManager<C> {
    pub(crate) fn open<F>(
        factory: &F,
        database_name: &str,
        store_names: Rc<[String]>,
        version: u32,
    ) -> Self
    where
        F: Factory<Connection = C>,
    {
        let (settler, pending) = bridge::deferred::<F, Result<Rc<C>>>();
        tracing::debug!(db = database_name, version, "opening database");

        let handlers = open_handlers(database_name, store_names, settler.clone());
        if let Err(source) = factory.open(database_name, version, handlers) {
            tracing::error!(db = database_name, error = %source, "open request was rejected");
            settler.settle(Err(Error::Open(source)));
        }

        Self {
            connection: async move { pending.await? }.boxed_local().shared(),
        }
    }

    pub(crate) async fn connection(&self) -> Result<Rc<C>> {
        self.connection.clone().await
    }
}

fn open_handlers<C: Connection + 'static>(
    database_name: &str,
    store_names: Rc<[String]>,
    settler: Settler<Result<Rc<C>>>,
) -> OpenHandlers<C> {
    let upgrade_stores = Rc::clone(&store_names);
    let on_error = settler.clone();
    let db = database_name.to_owned();
    let failed_db = db.clone();

    OpenHandlers {
        on_upgrade_needed: Box::new(move |schema: &mut dyn SchemaEditor| {
            create_missing_stores(schema, &upgrade_stores)
        }),
        on_success: Box::new(move |conn: C| {
            settler.settle(validate(conn, &db, &store_names));
        }),
        on_error: Box::new(move |source| {
            tracing::error!(db = %failed_db, error = %source, "failed to open database");
            on_error.settle(Err(Error::Open(source)));
        }),
    }
}

/// Creates every configured store the container does not have yet. Re-running it on an
/// up-to-date container does nothing.
fn create_missing_stores(
    schema: &mut dyn SchemaEditor,
    store_names: &[String],
) -> std::result::Result<(), EngineError> {
    let existing = schema.store_names();
    for name in store_names.iter().filter(|name| !existing.contains(name)) {
        tracing::info!(store = %name, "creating object store");
        schema.create_store(name)?;
    }
    Ok(())
}

fn validate<C: Connection>(conn: C, database_name: &str, store_names: &[String]) -> Result<Rc<C>> {
    let missing: Vec<String> = store_names
        .iter()
        .filter(|name| !conn.has_store(name))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(Rc::new(conn));
    }

    tracing::warn!(
        db = database_name,
        missing = ?missing,
        "database opened without the configured stores; was it created at this version with a different store list?"
    );
    conn.close();
    Err(Error::MissingStores(missing))
}

/// Deletes the container `name`.
pub async fn delete_database<F: Factory>(factory: &F, name: &str) -> Result<()> {
    let (settler, pending) = bridge::deferred::<F, _>();
    let fail = |source| Error::DeleteDatabase {
        database: name.to_owned(),
        source,
    };
    factory
        .delete_database(name, bridge::request_handlers(settler))
        .map_err(fail)?;
    pending.await?.map_err(fail)?;
    tracing::debug!(db = name, "deleted database");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Fault, MemoryFactory};
    use futures::future::join_all;
    use pollster::block_on;

    fn stores(names: &[&str]) -> Rc<[String]> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn concurrent_waiters_share_one_open() {
        let factory = MemoryFactory::new();
        let manager = ConnectionManager::open(&factory, "db", stores(&["a", "b"]), 1);

        let conns = block_on(join_all((0..4).map(|_| manager.connection())));
        assert_eq!(factory.opens(), 1);
        let first = conns[0].clone().unwrap();
        for conn in conns {
            assert!(Rc::ptr_eq(&first, &conn.unwrap()));
        }
        assert_eq!(first.store_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn open_failure_is_seen_by_every_waiter() {
        let factory = MemoryFactory::new();
        factory.inject(Fault::Open(EngineError::new("UnknownError", "disk on fire")));
        let manager = ConnectionManager::open(&factory, "db", stores(&["a"]), 1);

        for _ in 0..2 {
            let err = block_on(manager.connection()).unwrap_err();
            assert_eq!(
                err.to_string(),
                "Failed to open IndexedDB: UnknownError: disk on fire"
            );
        }
    }

    #[test]
    fn existing_container_without_new_store_fails_validation() {
        let factory = MemoryFactory::new();
        block_on(ConnectionManager::open(&factory, "db", stores(&["a"]), 1).connection())
            .unwrap();

        let manager = ConnectionManager::open(&factory, "db", stores(&["a", "b", "c"]), 1);
        let err = block_on(manager.connection()).unwrap_err();
        assert_eq!(err, Error::MissingStores(vec!["b".into(), "c".into()]));
        assert_eq!(err.to_string(), "Missing stores: b, c");
    }

    #[test]
    fn rejected_open_request_settles_immediately() {
        let factory = MemoryFactory::new();
        let manager = ConnectionManager::open(&factory, "db", stores(&["a"]), 0);
        let err = block_on(manager.connection()).unwrap_err();
        assert!(matches!(err, Error::Open(ref e) if e.name == "TypeError"));
    }

    #[test]
    fn delete_database_removes_the_container() {
        let factory = MemoryFactory::new();
        block_on(ConnectionManager::open(&factory, "db", stores(&["a"]), 2).connection())
            .unwrap();
        assert_eq!(factory.version_of("db"), Some(2));

        block_on(delete_database(&factory, "db")).unwrap();
        assert_eq!(factory.version_of("db"), None);
    }
}
