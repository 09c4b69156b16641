#![cfg(not(target_arch = "wasm32"))]

use easy_idb::{CacheKey, Config, EasyDb, Error, MemoryFactory, Registry};
use pollster::block_on;
use std::rc::Rc;

#[test]
fn same_name_and_store_set_share_one_instance() {
    let factory = MemoryFactory::new();
    let a = EasyDb::of(Config::new(factory.clone(), "shared").stores(["users", "posts"])).unwrap();
    let b = EasyDb::of(Config::new(factory.clone(), "shared").stores(["posts", "users"])).unwrap();

    assert!(Rc::ptr_eq(&a, &b));
    assert_eq!(factory.opens(), 1);
    assert_eq!(a.store_names(), ["users", "posts"]);
    assert_eq!(a.cache_key().to_string(), "shared_posts-users@v1");

    // Writes through one handle are visible through the other.
    block_on(a.put("users", "ada", "Ada")).unwrap();
    assert_eq!(
        block_on(b.get::<String>("users", "ada")).unwrap().as_deref(),
        Some("Ada")
    );
}

#[test]
fn different_name_or_version_is_a_different_instance() {
    let factory = MemoryFactory::new();
    let base = EasyDb::of(Config::new(factory.clone(), "distinct").store("s")).unwrap();
    let renamed = EasyDb::of(Config::new(factory.clone(), "distinct-2").store("s")).unwrap();
    let bumped = EasyDb::of(Config::new(factory.clone(), "distinct").store("s").version(2)).unwrap();

    assert!(!Rc::ptr_eq(&base, &renamed));
    assert!(!Rc::ptr_eq(&base, &bumped));
    assert_eq!(bumped.version(), 2);
    assert_eq!(renamed.name(), "distinct-2");
}

#[test]
fn explicit_registry_tracks_its_instances() {
    let factory = MemoryFactory::new();
    let registry = Registry::new();
    assert!(registry.is_empty());

    let db = registry
        .obtain(Config::new(factory.clone(), "explicit").stores(["b", "a"]))
        .unwrap();
    let key = CacheKey::new("explicit", &["a".to_owned(), "b".to_owned()], 1);
    assert_eq!(db.cache_key(), &key);
    assert!(Rc::ptr_eq(&registry.get(&key).unwrap(), &db));
    assert_eq!(registry.len(), 1);

    // The thread-wide registry is a separate cache.
    let global = EasyDb::of(Config::new(factory.clone(), "explicit").stores(["a", "b"])).unwrap();
    assert!(!Rc::ptr_eq(&global, &db));
}

#[test]
fn thread_registry_ignores_which_factory_asks() {
    let first = MemoryFactory::new();
    let second = MemoryFactory::new();
    let a = EasyDb::of(Config::new(first.clone(), "per-engine-type").store("s")).unwrap();
    let b = EasyDb::of(Config::new(second.clone(), "per-engine-type").store("s")).unwrap();

    // Same engine type and cache key: the second factory gets the first one's instance.
    assert!(Rc::ptr_eq(&a, &b));
    block_on(b.put("s", "k", &1)).unwrap();
    assert_eq!(first.opens(), 1);
    assert_eq!(first.version_of("per-engine-type"), Some(1));
    assert_eq!(second.opens(), 0);
    assert_eq!(second.version_of("per-engine-type"), None);

    // A dedicated registry binds the instance to its own factory.
    let scoped = Registry::new()
        .obtain(Config::new(second.clone(), "per-engine-type").store("s"))
        .unwrap();
    assert_eq!(block_on(scoped.get::<i32>("s", "k")).unwrap(), None);
    assert_eq!(second.opens(), 1);
}

#[test]
fn configuration_errors_are_raised_before_opening() {
    let factory = MemoryFactory::new();

    let cases = [
        (Config::new(factory.clone(), "   ").store("s"), Error::MissingDatabaseName),
        (Config::new(factory.clone(), "cfg"), Error::MissingStoreNames),
        (
            Config::new(factory.clone(), "cfg").stores(["s", "t", "s"]),
            Error::DuplicateStoreName("s".into()),
        ),
        (
            Config::new(factory.clone(), "cfg").store("s").version(0),
            Error::InvalidVersion(0),
        ),
    ];
    for (config, expected) in cases {
        let err = EasyDb::of(config).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err, expected);
    }

    assert_eq!(factory.opens(), 0);
    assert_eq!(
        Error::MissingDatabaseName.to_string(),
        "Database name is required"
    );
}
