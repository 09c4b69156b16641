#![cfg(not(target_arch = "wasm32"))]

use easy_idb::{Config, EasyDb, EngineError, Error, Fault, MemoryFactory, OperationKind, Registry};
use futures::future::join_all;
use pollster::block_on;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entity {
    id: String,
    name: String,
}

fn entity(id: &str, name: &str) -> Entity {
    Entity {
        id: id.to_owned(),
        name: name.to_owned(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn open(factory: &MemoryFactory, name: &str, stores: &[&str]) -> Rc<EasyDb<MemoryFactory>> {
    init_tracing();
    Registry::new()
        .obtain(Config::new(factory.clone(), name).stores(stores.iter().copied()))
        .unwrap()
}

#[test]
fn put_then_get_round_trips_values() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "round-trip", &["entities"]);

    block_on(async {
        let e = entity("id1", "entity 1");
        db.put("entities", "id1", &e).await.unwrap();
        assert_eq!(db.get::<Entity>("entities", "id1").await.unwrap(), Some(e));

        db.put("entities", "empty", "").await.unwrap();
        assert_eq!(
            db.get::<String>("entities", "empty").await.unwrap().as_deref(),
            Some("")
        );

        // A stored null is distinct from an absent key.
        db.put("entities", "null", &None::<String>).await.unwrap();
        assert_eq!(
            db.get::<Option<String>>("entities", "null").await.unwrap(),
            Some(None)
        );
        assert_eq!(
            db.get::<Option<String>>("entities", "missing").await.unwrap(),
            None
        );
    });
}

#[test]
fn put_overwrites_existing_value() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "overwrite", &["entities"]);

    block_on(async {
        db.put("entities", "id1", &entity("id1", "old")).await.unwrap();
        db.put("entities", "id1", &entity("id1", "new")).await.unwrap();
        assert_eq!(
            db.get::<Entity>("entities", "id1").await.unwrap(),
            Some(entity("id1", "new"))
        );
    });
}

#[test]
fn add_rejects_existing_key_and_keeps_first_value() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "duplicate", &["entities"]);

    block_on(async {
        db.add("entities", "id1", &entity("id1", "first")).await.unwrap();
        let err = db
            .add("entities", "id1", &entity("id1", "second"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Operation {
                kind: OperationKind::Add,
                ref store,
                ref source,
            } if store == "entities" && source.name == "ConstraintError"
        ));
        assert!(err.to_string().starts_with("Failed to add in store entities"));
        assert_eq!(
            db.get::<Entity>("entities", "id1").await.unwrap(),
            Some(entity("id1", "first"))
        );
    });
}

#[test]
fn get_of_missing_key_is_absent() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "absent", &["entities"]);
    assert_eq!(
        block_on(db.get::<Entity>("entities", "missing")).unwrap(),
        None
    );
}

#[test]
fn get_all_returns_every_record_in_key_order() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "scan", &["entities"]);

    block_on(async {
        assert!(db.get_all::<Entity>("entities").await.unwrap().is_empty());

        for id in ["c", "a", "b"] {
            db.add("entities", id, &entity(id, id)).await.unwrap();
        }
        let all = db.get_all::<Entity>("entities").await.unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    });
}

#[test]
fn clear_then_get_all_is_empty() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "clear", &["entities", "other"]);

    block_on(async {
        for i in 0..5 {
            db.put("entities", &format!("k{i}"), &i).await.unwrap();
        }
        db.put("other", "kept", &1).await.unwrap();

        db.clear("entities").await.unwrap();
        assert!(db.get_all::<i32>("entities").await.unwrap().is_empty());
        assert_eq!(db.get_all::<i32>("other").await.unwrap(), vec![1]);
    });
}

#[test]
fn delete_removes_key_and_tolerates_absent_keys() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "delete", &["entities"]);

    block_on(async {
        db.put("entities", "id1", &entity("id1", "x")).await.unwrap();
        db.delete("entities", "id1").await.unwrap();
        assert_eq!(db.get::<Entity>("entities", "id1").await.unwrap(), None);

        db.delete("entities", "never-there").await.unwrap();
    });
}

#[test]
fn invalid_store_fails_without_touching_the_engine() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "invalid-store", &["entities"]);

    block_on(async {
        let invalid = Error::InvalidStore("nope".into());
        assert_eq!(db.add("nope", "k", &1).await.unwrap_err(), invalid);
        assert_eq!(db.put("nope", "k", &1).await.unwrap_err(), invalid);
        assert_eq!(db.get::<i32>("nope", "k").await.unwrap_err(), invalid);
        assert_eq!(db.get_all::<i32>("nope").await.unwrap_err(), invalid);
        assert_eq!(db.delete("nope", "k").await.unwrap_err(), invalid);
        assert_eq!(db.clear("nope").await.unwrap_err(), invalid);
        assert_eq!(invalid.to_string(), "Invalid store name: nope");
    });
    assert_eq!(factory.transactions(), 0);
}

#[test]
fn concurrent_adds_to_distinct_keys_all_succeed() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "concurrent", &["entities"]);
    let keys: Vec<String> = (0..16).map(|i| format!("key-{i:02}")).collect();

    let results = block_on(join_all(keys.iter().map(|key| db.add("entities", key, key))));
    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(factory.opens(), 1);
    assert_eq!(factory.transactions(), 16);

    let all = block_on(db.get_all::<String>("entities")).unwrap();
    assert_eq!(all, keys);
}

#[test]
fn store_handle_binds_the_store_name() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "bound", &["users", "sessions"]);
    let users = db.store("users");
    assert_eq!(users.name(), "users");

    block_on(async {
        users.add("ada", &entity("ada", "Ada")).await.unwrap();
        users.put("alan", &entity("alan", "Alan")).await.unwrap();
        assert_eq!(
            users.get::<Entity>("ada").await.unwrap(),
            Some(entity("ada", "Ada"))
        );
        users.delete("ada").await.unwrap();
        assert_eq!(users.get_all::<Entity>().await.unwrap().len(), 1);
        users.clear().await.unwrap();
        assert!(users.get_all::<Entity>().await.unwrap().is_empty());

        let err = db.store("missing").get::<Entity>("ada").await.unwrap_err();
        assert_eq!(err, Error::InvalidStore("missing".into()));
    });
}

#[test]
fn undecodable_value_is_a_codec_error() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "codec", &["entities"]);

    block_on(async {
        db.put("entities", "id1", "not a number").await.unwrap();
        let err = db.get::<u32>("entities", "id1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: OperationKind::Get,
                ..
            }
        ));
    });
}

#[test]
fn failed_request_is_attributed_and_rolled_back() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "request-fault", &["entities"]);

    block_on(async {
        db.put("entities", "id1", &1).await.unwrap();
        factory.inject(Fault::Request {
            store: "entities".into(),
            error: EngineError::new("QuotaExceededError", "disk full"),
        });
        let err = db.put("entities", "id1", &2).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to put in store entities: QuotaExceededError: disk full"
        );
        assert_eq!(db.get::<i32>("entities", "id1").await.unwrap(), Some(1));
    });
}

#[test]
fn scan_reports_transaction_failures() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "commit-fault", &["entities"]);

    block_on(async {
        db.put("entities", "id1", &1).await.unwrap();
        factory.inject(Fault::Commit {
            store: "entities".into(),
            error: EngineError::abort("aborted"),
        });
        let err = db.get_all::<i32>("entities").await.unwrap_err();
        assert!(matches!(err, Error::Transaction { ref store, .. } if store == "entities"));

        // The fault is consumed; the next scan succeeds.
        assert_eq!(db.get_all::<i32>("entities").await.unwrap(), vec![1]);
    });
}

#[test]
fn open_failure_rejects_every_operation() {
    let factory = MemoryFactory::new();
    factory.inject(Fault::Open(EngineError::new("UnknownError", "broken")));
    let db = open(&factory, "open-fault", &["entities"]);

    block_on(async {
        let expected = Error::Open(EngineError::new("UnknownError", "broken"));
        assert_eq!(db.get::<i32>("entities", "k").await.unwrap_err(), expected);
        assert_eq!(db.put("entities", "k", &1).await.unwrap_err(), expected);
        assert_eq!(db.get_all::<i32>("entities").await.unwrap_err(), expected);
    });
    assert_eq!(factory.opens(), 1);
    assert_eq!(factory.transactions(), 0);
}

#[test]
fn new_store_at_same_version_reports_missing_stores() {
    let factory = MemoryFactory::new();
    let v1 = open(&factory, "schema", &["a"]);
    block_on(v1.put("a", "k", &1)).unwrap();

    let same_version = open(&factory, "schema", &["a", "b"]);
    let err = block_on(same_version.get::<i32>("a", "k")).unwrap_err();
    assert_eq!(err, Error::MissingStores(vec!["b".into()]));
}

#[test]
fn version_bump_adds_stores_and_keeps_data() {
    let factory = MemoryFactory::new();
    let v1 = open(&factory, "upgrade", &["a"]);
    block_on(v1.put("a", "k", &1)).unwrap();

    init_tracing();
    let v2 = Registry::new()
        .obtain(Config::new(factory.clone(), "upgrade").stores(["a", "b"]).version(2))
        .unwrap();
    block_on(async {
        assert_eq!(v2.get::<i32>("a", "k").await.unwrap(), Some(1));
        v2.put("b", "k", &2).await.unwrap();
        assert_eq!(v2.get_all::<i32>("b").await.unwrap(), vec![2]);
    });
    assert_eq!(factory.version_of("upgrade"), Some(2));
}

#[test]
fn delete_database_drops_all_stores() {
    let factory = MemoryFactory::new();
    let db = open(&factory, "doomed", &["entities"]);
    block_on(db.put("entities", "k", &1)).unwrap();

    block_on(easy_idb::delete_database(&factory, "doomed")).unwrap();
    assert_eq!(factory.version_of("doomed"), None);

    let reopened = open(&factory, "doomed", &["entities"]);
    assert_eq!(block_on(reopened.get::<i32>("entities", "k")).unwrap(), None);
}
