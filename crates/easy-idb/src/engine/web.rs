//! Browser engine: the global `indexedDB` factory driven through `web-sys`.
//!
//! Values cross the JS boundary as JSON text (`JSON.stringify` / `JSON.parse`), so every
//! [`Record`] round-trips exactly. A `get` whose result is `undefined` is an absent key.
//!
//! Event handlers are JS closures owned by a [`Listeners`] set per event target. When the
//! target settles its handlers are unset and the set is dropped, freeing the closures. A
//! transaction's set also owns the closures of cursors opened in it.

use super::{
    Connection, Cursor, CursorHandlers, EngineError, ErrorHandler, Factory, ObjectStore,
    OpenHandlers, Record, RequestHandlers, SchemaEditor, Transaction, TransactionMode,
};
use crate::error::Error;
use std::cell::RefCell;
use std::mem;
use std::fmt;
use std::rc::Rc;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{
    DomException, DomStringList, Event, IdbCursorWithValue, IdbDatabase, IdbFactory,
    IdbObjectStore, IdbOpenDbRequest, IdbRequest, IdbTransaction, IdbTransactionMode,
    IdbVersionChangeEvent, WorkerGlobalScope,
};

/// Factory backed by the browser's `indexedDB`.
#[derive(Clone)]
pub struct WebFactory {
    factory: IdbFactory,
}

impl fmt::Debug for WebFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebFactory").finish_non_exhaustive()
    }
}

impl WebFactory {
    /// Uses the `indexedDB` of the current global scope (a window or a worker).
    pub fn from_global() -> crate::Result<Self> {
        let global = js_sys::global();
        let factory = if let Some(window) = global.dyn_ref::<web_sys::Window>() {
            window.indexed_db()
        } else if let Some(worker) = global.dyn_ref::<WorkerGlobalScope>() {
            worker.indexed_db()
        } else {
            return Err(Error::IndexedDbUnavailable);
        };

        match factory {
            Ok(Some(factory)) => Ok(Self { factory }),
            _ => Err(Error::IndexedDbUnavailable),
        }
    }

    pub fn from_factory(factory: IdbFactory) -> Self {
        Self { factory }
    }
}

impl Factory for WebFactory {
    type Connection = WebConnection;

    fn open(
        &self,
        name: &str,
        version: u32,
        handlers: OpenHandlers<WebConnection>,
    ) -> Result<(), EngineError> {
        let request = self.factory.open_with_u32(name, version).map_err(js_error)?;
        let OpenHandlers {
            on_upgrade_needed,
            on_success,
            on_error,
        } = handlers;
        let listeners = Listeners::default();

        {
            let req = request.clone();
            let db_name = name.to_owned();
            let mut upgrade = Some(on_upgrade_needed);
            request.set_onupgradeneeded(Some(&listeners.add(move |event: Event| {
                let Some(on_upgrade_needed) = upgrade.take() else {
                    return;
                };
                let from = event
                    .dyn_ref::<IdbVersionChangeEvent>()
                    .map(|e| e.old_version())
                    .unwrap_or_default();
                tracing::info!(db = %db_name, from, to = version, "upgrading database");

                let Some(db) = req
                    .result()
                    .ok()
                    .and_then(|result| result.dyn_into::<IdbDatabase>().ok())
                else {
                    return;
                };
                if let Err(error) = on_upgrade_needed(&mut WebSchemaEditor { db }) {
                    tracing::error!(db = %db_name, %error, "upgrade failed, aborting");
                    if let Some(tx) = req.transaction() {
                        let _ = tx.abort();
                    }
                }
            })));
        }

        {
            let db_name = name.to_owned();
            request.set_onblocked(Some(&listeners.add(move |_: Event| {
                tracing::warn!(db = %db_name, "open is blocked by connections at an older version");
            })));
        }

        let outcome = Rc::new(RefCell::new(Some((on_success, on_error))));
        {
            let outcome = Rc::clone(&outcome);
            let req = request.clone();
            let set = listeners.clone();
            request.set_onsuccess(Some(&listeners.add(move |_: Event| {
                unregister(&req);
                set.release();
                let taken = outcome.borrow_mut().take();
                let Some((on_success, on_error)) = taken else {
                    return;
                };
                let db = req.result().map_err(js_error).and_then(|result| {
                    result.dyn_into::<IdbDatabase>().map_err(|_| {
                        EngineError::new("TypeError", "open request did not yield a database")
                    })
                });
                match db {
                    Ok(db) => on_success(WebConnection::new(db)),
                    Err(error) => on_error(error),
                }
            })));
        }
        {
            let req = request.clone();
            let set = listeners.clone();
            request.set_onerror(Some(&listeners.add(move |_: Event| {
                unregister(&req);
                set.release();
                let taken = outcome.borrow_mut().take();
                if let Some((_, on_error)) = taken {
                    on_error(request_error(&req));
                }
            })));
        }
        Ok(())
    }

    fn delete_database(
        &self,
        name: &str,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        let request = self.factory.delete_database(name).map_err(js_error)?;
        let listeners = Listeners::default();
        let db_name = name.to_owned();
        request.set_onblocked(Some(&listeners.add(move |_: Event| {
            tracing::warn!(db = %db_name, "delete is blocked by open connections");
        })));
        listen_with(&request, listeners, handlers, |_| Ok(()));
        Ok(())
    }
}

struct WebSchemaEditor {
    db: IdbDatabase,
}

impl SchemaEditor for WebSchemaEditor {
    fn store_names(&self) -> Vec<String> {
        string_list(&self.db.object_store_names())
    }

    fn create_store(&mut self, name: &str) -> Result<(), EngineError> {
        self.db.create_object_store(name).map(drop).map_err(js_error)
    }
}

pub struct WebConnection {
    db: IdbDatabase,
    _on_version_change: Closure<dyn FnMut(Event)>,
}

impl fmt::Debug for WebConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebConnection")
            .field("name", &self.db.name())
            .finish_non_exhaustive()
    }
}

impl WebConnection {
    fn new(db: IdbDatabase) -> Self {
        // Another context wants to upgrade or delete the container; step aside.
        let handle = db.clone();
        let name = db.name();
        let on_version_change = Closure::wrap(Box::new(move |_: Event| {
            tracing::info!(db = %name, "closing connection for a version change");
            handle.close();
        }) as Box<dyn FnMut(Event)>);
        db.set_onversionchange(Some(on_version_change.as_ref().unchecked_ref()));
        Self {
            db,
            _on_version_change: on_version_change,
        }
    }
}

impl Drop for WebConnection {
    fn drop(&mut self) {
        // Nothing can reach the connection any more.
        self.db.set_onversionchange(None);
        self.db.close();
    }
}

impl Connection for WebConnection {
    type Transaction = WebTransaction;

    fn store_names(&self) -> Vec<String> {
        string_list(&self.db.object_store_names())
    }

    fn has_store(&self, name: &str) -> bool {
        self.db.object_store_names().contains(name)
    }

    fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
    ) -> Result<WebTransaction, EngineError> {
        let mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
        };
        let tx = self
            .db
            .transaction_with_str_and_mode(store, mode)
            .map_err(js_error)?;
        Ok(WebTransaction::new(tx))
    }

    fn close(&self) {
        self.db.close();
    }
}

#[derive(Default)]
struct TxHandlers {
    on_complete: Option<Box<dyn FnOnce()>>,
    on_error: Option<ErrorHandler>,
}

/// A transaction with its `complete`, `error` and `abort` listeners installed up front.
///
/// The first terminal event unsets all three and frees every closure in the transaction's
/// set, cursor closures included.
pub struct WebTransaction {
    tx: IdbTransaction,
    handlers: Rc<RefCell<TxHandlers>>,
    listeners: Listeners,
}

impl WebTransaction {
    fn new(tx: IdbTransaction) -> Self {
        let handlers = Rc::new(RefCell::new(TxHandlers::default()));
        let listeners = Listeners::default();

        let on_complete = {
            let handlers = Rc::clone(&handlers);
            let set = listeners.clone();
            let tx = tx.clone();
            listeners.add(move |_: Event| {
                finish(&tx, &set);
                let taken = handlers.borrow_mut().on_complete.take();
                if let Some(handler) = taken {
                    handler();
                }
            })
        };

        // `error` bubbles up from a failed request; `abort` follows it, or comes alone.
        let on_failure = {
            let handlers = Rc::clone(&handlers);
            let set = listeners.clone();
            let tx = tx.clone();
            listeners.add(move |event: Event| {
                let error = event
                    .target()
                    .and_then(|target| target.dyn_into::<IdbRequest>().ok())
                    .map(|req| request_error(&req))
                    .or_else(|| tx.error().map(dom_error))
                    .unwrap_or_else(|| EngineError::abort("The transaction was aborted."));
                finish(&tx, &set);
                let taken = handlers.borrow_mut().on_error.take();
                if let Some(handler) = taken {
                    handler(error);
                }
            })
        };

        tx.set_oncomplete(Some(&on_complete));
        tx.set_onerror(Some(&on_failure));
        tx.set_onabort(Some(&on_failure));
        Self {
            tx,
            handlers,
            listeners,
        }
    }
}

impl Transaction for WebTransaction {
    type Store = WebStore;

    fn object_store(&self, name: &str) -> Result<WebStore, EngineError> {
        let store = self.tx.object_store(name).map_err(js_error)?;
        Ok(WebStore {
            store,
            listeners: self.listeners.clone(),
        })
    }

    fn on_complete(&self, handler: Box<dyn FnOnce()>) {
        self.handlers.borrow_mut().on_complete = Some(handler);
    }

    /// Reports the first of `error` (bubbled up from a failed request) and `abort`.
    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.borrow_mut().on_error = Some(handler);
    }
}

fn finish(tx: &IdbTransaction, listeners: &Listeners) {
    tx.set_oncomplete(None);
    tx.set_onerror(None);
    tx.set_onabort(None);
    listeners.release();
}

pub struct WebStore {
    store: IdbObjectStore,
    /// The owning transaction's set.
    listeners: Listeners,
}

impl ObjectStore for WebStore {
    type Cursor = WebCursor;

    fn add(
        &self,
        key: &str,
        value: Record,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        let value = to_js(&value)?;
        let request = self
            .store
            .add_with_key(&value, &JsValue::from_str(key))
            .map_err(js_error)?;
        listen(&request, handlers, |_| Ok(()));
        Ok(())
    }

    fn put(
        &self,
        key: &str,
        value: Record,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        let value = to_js(&value)?;
        let request = self
            .store
            .put_with_key(&value, &JsValue::from_str(key))
            .map_err(js_error)?;
        listen(&request, handlers, |_| Ok(()));
        Ok(())
    }

    fn get(
        &self,
        key: &str,
        handlers: RequestHandlers<Option<Record>>,
    ) -> Result<(), EngineError> {
        let request = self.store.get(&JsValue::from_str(key)).map_err(js_error)?;
        listen(&request, handlers, |req| {
            let value = req.result().map_err(js_error)?;
            if value.is_undefined() {
                Ok(None)
            } else {
                from_js(&value).map(Some)
            }
        });
        Ok(())
    }

    fn delete(&self, key: &str, handlers: RequestHandlers<()>) -> Result<(), EngineError> {
        let request = self
            .store
            .delete(&JsValue::from_str(key))
            .map_err(js_error)?;
        listen(&request, handlers, |_| Ok(()));
        Ok(())
    }

    fn clear(&self, handlers: RequestHandlers<()>) -> Result<(), EngineError> {
        let request = self.store.clear().map_err(js_error)?;
        listen(&request, handlers, |_| Ok(()));
        Ok(())
    }

    /// The cursor's closures live in the transaction's set, so a scan that stops early
    /// still frees them when the transaction finishes.
    fn open_cursor(&self, handlers: CursorHandlers<WebCursor>) -> Result<(), EngineError> {
        let request = self.store.open_cursor().map_err(js_error)?;
        let CursorHandlers {
            mut on_step,
            on_error,
        } = handlers;

        let req = request.clone();
        request.set_onsuccess(Some(&self.listeners.add(move |_: Event| {
            let cursor = req
                .result()
                .ok()
                .and_then(|result| result.dyn_into::<IdbCursorWithValue>().ok());
            match cursor {
                Some(cursor) => on_step(Some(WebCursor { cursor })),
                None => {
                    unregister(&req);
                    on_step(None);
                }
            }
        })));

        let req = request.clone();
        let mut on_error = Some(on_error);
        request.set_onerror(Some(&self.listeners.add(move |_: Event| {
            unregister(&req);
            if let Some(on_error) = on_error.take() {
                on_error(request_error(&req));
            }
        })));
        Ok(())
    }
}

pub struct WebCursor {
    cursor: IdbCursorWithValue,
}

impl Cursor for WebCursor {
    fn key(&self) -> String {
        self.cursor
            .key()
            .ok()
            .and_then(|key| key.as_string())
            .unwrap_or_default()
    }

    fn value(&self) -> Result<Record, EngineError> {
        self.cursor
            .value()
            .map_err(js_error)
            .and_then(|value| from_js(&value))
    }

    fn advance(&self) -> Result<(), EngineError> {
        self.cursor.continue_().map_err(js_error)
    }
}

/// JS closures installed on one event target (or a transaction and its cursors).
///
/// Closures capture a clone of the set, so it stays alive until [`Listeners::release`]
/// breaks the cycle. A closure may release its own set: the JS glue frees it once it
/// returns.
#[derive(Clone, Default)]
struct Listeners {
    slot: Rc<RefCell<Vec<Closure<dyn FnMut(Event)>>>>,
}

impl Listeners {
    fn add(&self, handler: impl FnMut(Event) + 'static) -> js_sys::Function {
        let closure = Closure::wrap(Box::new(handler) as Box<dyn FnMut(Event)>);
        let function = closure.as_ref().unchecked_ref::<js_sys::Function>().clone();
        self.slot.borrow_mut().push(closure);
        function
    }

    fn release(&self) {
        let closures = mem::take(&mut *self.slot.borrow_mut());
        drop(closures);
    }
}

/// Routes a request's `success`/`error` events to `handlers`. `extract` reads the result
/// on success; its error is delivered through the error handler.
fn listen<T: 'static>(
    request: &IdbRequest,
    handlers: RequestHandlers<T>,
    extract: impl FnOnce(&IdbRequest) -> Result<T, EngineError> + 'static,
) {
    listen_with(request, Listeners::default(), handlers, extract);
}

/// [`listen`], adding to a set that already holds other listeners of `request`. Whichever
/// outcome fires releases the whole set.
fn listen_with<T: 'static>(
    request: &IdbRequest,
    listeners: Listeners,
    handlers: RequestHandlers<T>,
    extract: impl FnOnce(&IdbRequest) -> Result<T, EngineError> + 'static,
) {
    let slot = Rc::new(RefCell::new(Some((handlers, extract))));

    {
        let slot = Rc::clone(&slot);
        let req = request.clone();
        let set = listeners.clone();
        request.set_onsuccess(Some(&listeners.add(move |_: Event| {
            unregister(&req);
            set.release();
            let taken = slot.borrow_mut().take();
            if let Some((handlers, extract)) = taken {
                match extract(&req) {
                    Ok(value) => (handlers.on_success)(value),
                    Err(error) => (handlers.on_error)(error),
                }
            }
        })));
    }

    let req = request.clone();
    let set = listeners.clone();
    request.set_onerror(Some(&listeners.add(move |_: Event| {
        unregister(&req);
        set.release();
        let taken = slot.borrow_mut().take();
        if let Some((handlers, _)) = taken {
            (handlers.on_error)(request_error(&req));
        }
    })));
}

fn unregister(request: &IdbRequest) {
    request.set_onsuccess(None);
    request.set_onerror(None);
    if let Some(open) = request.dyn_ref::<IdbOpenDbRequest>() {
        open.set_onupgradeneeded(None);
        open.set_onblocked(None);
    }
}

fn string_list(list: &DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.item(i)).collect()
}

fn request_error(request: &IdbRequest) -> EngineError {
    match request.error() {
        Ok(Some(exception)) => dom_error(exception),
        Ok(None) => EngineError::new("UnknownError", "request failed without an error"),
        Err(value) => js_error(value),
    }
}

fn dom_error(exception: DomException) -> EngineError {
    EngineError::new(exception.name(), exception.message())
}

fn js_error(value: JsValue) -> EngineError {
    match value.dyn_into::<DomException>() {
        Ok(exception) => dom_error(exception),
        Err(value) => match value.dyn_into::<js_sys::Error>() {
            Ok(error) => EngineError::new(String::from(error.name()), String::from(error.message())),
            Err(value) => EngineError::new("Error", format!("{value:?}")),
        },
    }
}

fn to_js(record: &Record) -> Result<JsValue, EngineError> {
    let text =
        serde_json::to_string(record).map_err(|e| EngineError::new("DataError", e.to_string()))?;
    js_sys::JSON::parse(&text).map_err(js_error)
}

fn from_js(value: &JsValue) -> Result<Record, EngineError> {
    let text = js_sys::JSON::stringify(value)
        .map_err(js_error)?
        .as_string()
        .ok_or_else(|| EngineError::new("DataError", "value has no JSON representation"))?;
    serde_json::from_str(&text).map_err(|e| EngineError::new("DataError", e.to_string()))
}
