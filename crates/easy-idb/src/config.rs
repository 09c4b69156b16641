use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt;

/// Schema version used when [`Config::version`] is not called.
pub const DEFAULT_VERSION: u32 = 1;

/// Everything needed to construct a façade instance.
///
/// ```
/// use easy_idb::{Config, MemoryFactory};
///
/// let config = Config::new(MemoryFactory::new(), "app")
///     .stores(["users", "sessions"])
///     .version(2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct Config<F> {
    factory: F,
    database_name: String,
    store_names: Vec<String>,
    version: u32,
}

impl<F> fmt::Debug for Config<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_name", &self.database_name)
            .field("store_names", &self.store_names)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<F> Config<F> {
    pub fn new(factory: F, database_name: impl Into<String>) -> Self {
        Self {
            factory,
            database_name: database_name.into(),
            store_names: Vec::new(),
            version: DEFAULT_VERSION,
        }
    }

    /// Appends one store name.
    pub fn store(mut self, name: impl Into<String>) -> Self {
        self.store_names.push(name.into());
        self
    }

    /// Appends several store names, preserving their order.
    pub fn stores<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn store_names(&self) -> &[String] {
        &self.store_names
    }

    pub fn schema_version(&self) -> u32 {
        self.version
    }

    /// Checks the configuration without touching the engine.
    pub fn validate(&self) -> Result<()> {
        if self.database_name.trim().is_empty() {
            return Err(Error::MissingDatabaseName);
        }
        if self.store_names.is_empty() {
            return Err(Error::MissingStoreNames);
        }
        if self.version == 0 {
            return Err(Error::InvalidVersion(self.version));
        }
        let mut seen = HashSet::with_capacity(self.store_names.len());
        for name in &self.store_names {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateStoreName(name.clone()));
            }
        }
        Ok(())
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.database_name, &self.store_names, self.version)
    }

    pub(crate) fn into_parts(self) -> (F, String, Vec<String>, u32) {
        (
            self.factory,
            self.database_name,
            self.store_names,
            self.version,
        )
    }
}

/// Identity of a façade instance.
///
/// Store order does not matter; the schema version does, so a connection opened at an
/// older version is never handed out for a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    database_name: String,
    store_names: Vec<String>,
    version: u32,
}

impl CacheKey {
    pub fn new(database_name: &str, store_names: &[String], version: u32) -> Self {
        let mut store_names = store_names.to_vec();
        store_names.sort();
        Self {
            database_name: database_name.to_owned(),
            store_names,
            version,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}@v{}",
            self.database_name,
            self.store_names.join("-"),
            self.version
        )
    }
}
