//! In-process engine implementing the IndexedDB event protocol.
//!
//! Used on native targets and by the test suite. Like the browser engine, nothing is
//! delivered while the caller is still running: requests, open handshakes and cursor
//! steps are queued on a per-thread event queue, and the queue is drained by
//! [`run_until_idle`], which the façade's pending results call whenever they are polled.
//! Every request issued before the caller yields therefore belongs to the same batch.
//!
//! Transactions commit once their last outstanding request has been delivered; a failed
//! request aborts its transaction, rolls back the writes it made and fails every request
//! still queued on it. Read-write transactions on a store run one at a time in creation
//! order; a read-only transaction only waits for earlier read-write ones.

use super::{
    Connection, Cursor, CursorHandlers, EngineError, ErrorHandler, Factory, ObjectStore,
    OpenHandlers, Record, RequestHandlers, SchemaEditor, Transaction, TransactionMode,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::rc::Rc;

type Records = BTreeMap<String, Record>;

/// A failure the memory engine will produce on demand.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The next open request fails with this error.
    Open(EngineError),
    /// The next request (including a cursor step) against `store` fails with `error`.
    Request { store: String, error: EngineError },
    /// The next transaction on `store` aborts with `error` when it would otherwise commit.
    Commit { store: String, error: EngineError },
    /// The next `advance` on a cursor over `store` is rejected synchronously with `error`.
    Advance { store: String, error: EngineError },
    /// The next record read from a cursor over `store` fails with `error`.
    Read { store: String, error: EngineError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Request,
    Commit,
    Advance,
    Read,
}

impl Fault {
    fn hook(&self) -> Option<(Hook, &str)> {
        match self {
            Fault::Open(_) => None,
            Fault::Request { store, .. } => Some((Hook::Request, store)),
            Fault::Commit { store, .. } => Some((Hook::Commit, store)),
            Fault::Advance { store, .. } => Some((Hook::Advance, store)),
            Fault::Read { store, .. } => Some((Hook::Read, store)),
        }
    }

    fn into_error(self) -> EngineError {
        match self {
            Fault::Open(error)
            | Fault::Request { error, .. }
            | Fault::Commit { error, .. }
            | Fault::Advance { error, .. }
            | Fault::Read { error, .. } => error,
        }
    }
}

#[derive(Default)]
struct EventQueue {
    tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    draining: Cell<bool>,
}

impl EventQueue {
    fn push(&self, task: Box<dyn FnOnce()>) {
        self.tasks.borrow_mut().push_back(task);
    }

    fn pop(&self) -> Option<Box<dyn FnOnce()>> {
        self.tasks.borrow_mut().pop_front()
    }

    fn drain(&self) {
        if self.draining.replace(true) {
            return;
        }
        let _reset = DrainGuard(&self.draining);
        // The borrow must not be held while a task runs: tasks queue follow-up work.
        while let Some(task) = self.pop() {
            task();
        }
    }
}

struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

thread_local! {
    static EVENTS: EventQueue = EventQueue::default();
}

fn post(task: impl FnOnce() + 'static) {
    EVENTS.with(|events| events.push(Box::new(task)));
}

/// Delivers every queued event, including events queued by the handlers being run.
///
/// Re-entrant calls (from inside a handler) return immediately; the outer call keeps
/// draining.
pub fn run_until_idle() {
    EVENTS.with(EventQueue::drain);
}

#[derive(Default)]
struct Database {
    version: Cell<u32>,
    stores: RefCell<BTreeMap<String, Records>>,
    /// Unfinished transactions, in creation order.
    live: RefCell<Vec<Rc<TxState>>>,
}

impl Database {
    fn admit(&self, tx: &Rc<TxState>) {
        self.live.borrow_mut().push(Rc::clone(tx));
        self.start_ready();
    }

    fn release(&self, tx: &TxState) {
        self.live
            .borrow_mut()
            .retain(|live| !std::ptr::eq(Rc::as_ptr(live), tx));
        self.start_ready();
    }

    /// Starts every waiting transaction that no earlier unfinished transaction blocks.
    fn start_ready(&self) {
        let ready: Vec<Rc<TxState>> = {
            let live = self.live.borrow();
            live.iter()
                .enumerate()
                .filter(|(i, tx)| {
                    !tx.started.get() && !live[..*i].iter().any(|earlier| earlier.blocks(tx))
                })
                .map(|(_, tx)| Rc::clone(tx))
                .collect()
        };
        for tx in ready {
            TxState::start(&tx);
        }
    }
}

#[derive(Default)]
struct Backend {
    databases: RefCell<HashMap<String, Rc<Database>>>,
    faults: RefCell<Vec<Fault>>,
    opens: Cell<u64>,
    transactions: Cell<u64>,
}

impl Backend {
    fn take_fault(&self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.borrow_mut();
        let idx = faults.iter().position(matches)?;
        Some(faults.remove(idx))
    }

    fn take_scoped(&self, hook: Hook, scope: &str) -> Option<EngineError> {
        self.take_fault(|f| f.hook() == Some((hook, scope)))
            .map(Fault::into_error)
    }
}

/// Factory for in-memory databases. Clones share the same set of databases.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    backend: Rc<Backend>,
}

impl fmt::Debug for MemoryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFactory")
            .field("databases", &self.backend.databases.borrow().len())
            .finish_non_exhaustive()
    }
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure; faults fire in the order they were injected.
    pub fn inject(&self, fault: Fault) {
        self.backend.faults.borrow_mut().push(fault);
    }

    /// Stored version of `name`, or `None` if the database does not exist.
    pub fn version_of(&self, name: &str) -> Option<u32> {
        self.backend
            .databases
            .borrow()
            .get(name)
            .map(|db| db.version.get())
    }

    /// Number of open requests issued so far.
    pub fn opens(&self) -> u64 {
        self.backend.opens.get()
    }

    /// Number of transactions created so far.
    pub fn transactions(&self) -> u64 {
        self.backend.transactions.get()
    }
}

impl Factory for MemoryFactory {
    type Connection = MemoryConnection;

    fn open(
        &self,
        name: &str,
        version: u32,
        handlers: OpenHandlers<MemoryConnection>,
    ) -> Result<(), EngineError> {
        if version == 0 {
            return Err(EngineError::new(
                "TypeError",
                "The version provided must not be 0.",
            ));
        }
        self.backend.opens.set(self.backend.opens.get() + 1);

        let backend = Rc::clone(&self.backend);
        let name = name.to_owned();
        post(move || run_open(&backend, name, version, handlers));
        Ok(())
    }

    fn delete_database(
        &self,
        name: &str,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        let backend = Rc::clone(&self.backend);
        let name = name.to_owned();
        post(move || {
            backend.databases.borrow_mut().remove(&name);
            (handlers.on_success)(());
        });
        Ok(())
    }

    fn drive() {
        run_until_idle();
    }
}

fn run_open(
    backend: &Rc<Backend>,
    name: String,
    version: u32,
    handlers: OpenHandlers<MemoryConnection>,
) {
    let OpenHandlers {
        on_upgrade_needed,
        on_success,
        on_error,
    } = handlers;

    if let Some(Fault::Open(error)) = backend.take_fault(|f| matches!(f, Fault::Open(_))) {
        on_error(error);
        return;
    }

    let existing = backend.databases.borrow().get(&name).cloned();
    let db = match existing {
        Some(db) if version < db.version.get() => {
            on_error(EngineError::new(
                "VersionError",
                format!(
                    "The requested version ({version}) is less than the existing version ({}).",
                    db.version.get()
                ),
            ));
            return;
        }
        Some(db) => db,
        None => Rc::new(Database::default()),
    };

    if version > db.version.get() {
        // Upgrades are staged so an aborted handshake leaves the stored schema untouched.
        let mut editor = UpgradeEditor {
            stores: db.stores.borrow().clone(),
        };
        if let Err(error) = on_upgrade_needed(&mut editor) {
            on_error(EngineError::abort(format!(
                "The version change transaction was aborted: {error}"
            )));
            return;
        }
        *db.stores.borrow_mut() = editor.stores;
        db.version.set(version);
        backend
            .databases
            .borrow_mut()
            .insert(name, Rc::clone(&db));
    }

    on_success(MemoryConnection {
        backend: Rc::clone(backend),
        db,
        closed: Cell::new(false),
    });
}

struct UpgradeEditor {
    stores: BTreeMap<String, Records>,
}

impl SchemaEditor for UpgradeEditor {
    fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    fn create_store(&mut self, name: &str) -> Result<(), EngineError> {
        if self.stores.contains_key(name) {
            return Err(EngineError::constraint(format!(
                "An object store with the specified name '{name}' already exists."
            )));
        }
        self.stores.insert(name.to_owned(), Records::new());
        Ok(())
    }
}

pub struct MemoryConnection {
    backend: Rc<Backend>,
    db: Rc<Database>,
    closed: Cell<bool>,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("version", &self.db.version.get())
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}

impl Connection for MemoryConnection {
    type Transaction = MemoryTransaction;

    fn store_names(&self) -> Vec<String> {
        self.db.stores.borrow().keys().cloned().collect()
    }

    fn has_store(&self, name: &str) -> bool {
        self.db.stores.borrow().contains_key(name)
    }

    fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
    ) -> Result<MemoryTransaction, EngineError> {
        if self.closed.get() {
            return Err(EngineError::invalid_state(
                "The database connection is closing.",
            ));
        }
        if !self.has_store(store) {
            return Err(EngineError::not_found(
                "One of the specified object stores was not found.",
            ));
        }
        self.backend
            .transactions
            .set(self.backend.transactions.get() + 1);

        let state = Rc::new(TxState {
            backend: Rc::clone(&self.backend),
            db: Rc::clone(&self.db),
            scope: store.to_owned(),
            mode,
            started: Cell::new(false),
            queued: RefCell::new(Vec::new()),
            pending: Cell::new(0),
            finished: Cell::new(false),
            on_complete: RefCell::new(None),
            on_error: RefCell::new(None),
            undo: RefCell::new(Vec::new()),
            commit_fault: RefCell::new(self.backend.take_scoped(Hook::Commit, store)),
        });
        self.db.admit(&state);
        Ok(MemoryTransaction { state })
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

struct TxState {
    backend: Rc<Backend>,
    db: Rc<Database>,
    scope: String,
    mode: TransactionMode,
    started: Cell<bool>,
    /// Requests issued before the transaction started.
    queued: RefCell<Vec<Box<dyn FnOnce()>>>,
    pending: Cell<usize>,
    finished: Cell<bool>,
    on_complete: RefCell<Option<Box<dyn FnOnce()>>>,
    on_error: RefCell<Option<ErrorHandler>>,
    /// Previous value of every key written, in write order.
    undo: RefCell<Vec<(String, Option<Record>)>>,
    commit_fault: RefCell<Option<EngineError>>,
}

impl TxState {
    fn blocks(&self, later: &TxState) -> bool {
        self.scope == later.scope
            && (self.mode == TransactionMode::ReadWrite || later.mode == TransactionMode::ReadWrite)
    }

    fn start(tx: &Rc<Self>) {
        tx.started.set(true);
        for task in tx.queued.take() {
            post(task);
        }
        // A transaction without requests commits once the caller yields.
        let idle = Rc::clone(tx);
        post(move || {
            if idle.pending.get() == 0 && !idle.finished.get() {
                idle.commit();
            }
        });
    }

    fn schedule(&self, task: Box<dyn FnOnce()>) {
        if self.started.get() {
            post(task);
        } else {
            self.queued.borrow_mut().push(task);
        }
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if self.finished.get() {
            return Err(EngineError::new(
                "TransactionInactiveError",
                "The transaction has finished.",
            ));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        self.ensure_active()?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(EngineError::new("ReadOnlyError", "The transaction is read-only."));
        }
        Ok(())
    }

    /// Queues one request. `op` runs when the request is delivered.
    fn issue<T: 'static>(
        self: Rc<Self>,
        handlers: RequestHandlers<T>,
        op: impl FnOnce(&TxState) -> Result<T, EngineError> + 'static,
    ) -> Result<(), EngineError> {
        self.ensure_active()?;
        self.pending.set(self.pending.get() + 1);

        let tx = Rc::clone(&self);
        self.schedule(Box::new(move || {
            if tx.finished.get() {
                (handlers.on_error)(aborted());
                tx.request_done();
                return;
            }
            let outcome = match tx.backend.take_scoped(Hook::Request, &tx.scope) {
                Some(error) => Err(error),
                None => op(&*tx),
            };
            match outcome {
                Ok(value) => (handlers.on_success)(value),
                Err(error) => {
                    (handlers.on_error)(error.clone());
                    tx.abort(error);
                }
            }
            tx.request_done();
        }));
        Ok(())
    }

    fn request_done(&self) {
        let pending = self.pending.get() - 1;
        self.pending.set(pending);
        if pending == 0 && !self.finished.get() {
            self.commit();
        }
    }

    fn commit(&self) {
        if let Some(error) = self.commit_fault.take() {
            self.abort(error);
            return;
        }
        self.finished.set(true);
        self.undo.borrow_mut().clear();
        self.db.release(self);
        self.on_error.take();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }

    fn abort(&self, error: EngineError) {
        if self.finished.replace(true) {
            return;
        }
        self.rollback();
        self.db.release(self);
        self.on_complete.take();
        if let Some(on_error) = self.on_error.take() {
            on_error(error);
        }
    }

    fn rollback(&self) {
        let undo = std::mem::take(&mut *self.undo.borrow_mut());
        let mut stores = self.db.stores.borrow_mut();
        let Some(records) = stores.get_mut(&self.scope) else {
            return;
        };
        for (key, previous) in undo.into_iter().rev() {
            match previous {
                Some(value) => records.insert(key, value),
                None => records.remove(&key),
            };
        }
    }

    fn with_records<R>(
        &self,
        f: impl FnOnce(&mut Records, &mut Vec<(String, Option<Record>)>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut stores = self.db.stores.borrow_mut();
        let records = stores
            .get_mut(&self.scope)
            .ok_or_else(|| EngineError::not_found("The object store has been deleted."))?;
        f(records, &mut self.undo.borrow_mut())
    }

    fn next_after(&self, last: Option<&str>) -> Option<(String, Record)> {
        let stores = self.db.stores.borrow();
        let records = stores.get(&self.scope)?;
        let lower = match last {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        records
            .range::<str, _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

/// Error delivered to requests still queued on an aborted transaction.
fn aborted() -> EngineError {
    EngineError::abort("The transaction was aborted, so the request cannot be fulfilled.")
}

pub struct MemoryTransaction {
    state: Rc<TxState>,
}

impl Transaction for MemoryTransaction {
    type Store = MemoryStore;

    fn object_store(&self, name: &str) -> Result<MemoryStore, EngineError> {
        self.state.ensure_active()?;
        if name != self.state.scope {
            return Err(EngineError::not_found(
                "The specified object store was not found in this transaction's scope.",
            ));
        }
        Ok(MemoryStore {
            tx: Rc::clone(&self.state),
        })
    }

    fn on_complete(&self, handler: Box<dyn FnOnce()>) {
        if !self.state.finished.get() {
            *self.state.on_complete.borrow_mut() = Some(handler);
        }
    }

    fn on_error(&self, handler: ErrorHandler) {
        if !self.state.finished.get() {
            *self.state.on_error.borrow_mut() = Some(handler);
        }
    }
}

pub struct MemoryStore {
    tx: Rc<TxState>,
}

impl MemoryStore {
    fn insert(
        &self,
        key: &str,
        value: Record,
        overwrite: bool,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        self.tx.ensure_writable()?;
        let key = key.to_owned();
        Rc::clone(&self.tx).issue(handlers, move |tx| {
            tx.with_records(|records, undo| {
                let previous = records.get(&key).cloned();
                if previous.is_some() && !overwrite {
                    return Err(EngineError::constraint(
                        "Key already exists in the object store.",
                    ));
                }
                undo.push((key.clone(), previous));
                records.insert(key, value);
                Ok(())
            })
        })
    }
}

impl ObjectStore for MemoryStore {
    type Cursor = MemoryCursor;

    fn add(
        &self,
        key: &str,
        value: Record,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        self.insert(key, value, false, handlers)
    }

    fn put(
        &self,
        key: &str,
        value: Record,
        handlers: RequestHandlers<()>,
    ) -> Result<(), EngineError> {
        self.insert(key, value, true, handlers)
    }

    fn get(
        &self,
        key: &str,
        handlers: RequestHandlers<Option<Record>>,
    ) -> Result<(), EngineError> {
        let key = key.to_owned();
        Rc::clone(&self.tx).issue(handlers, move |tx| {
            tx.with_records(|records, _| Ok(records.get(&key).cloned()))
        })
    }

    fn delete(&self, key: &str, handlers: RequestHandlers<()>) -> Result<(), EngineError> {
        self.tx.ensure_writable()?;
        let key = key.to_owned();
        Rc::clone(&self.tx).issue(handlers, move |tx| {
            tx.with_records(|records, undo| {
                if let Some(previous) = records.remove(&key) {
                    undo.push((key, Some(previous)));
                }
                Ok(())
            })
        })
    }

    fn clear(&self, handlers: RequestHandlers<()>) -> Result<(), EngineError> {
        self.tx.ensure_writable()?;
        Rc::clone(&self.tx).issue(handlers, |tx| {
            tx.with_records(|records, undo| {
                undo.extend(
                    std::mem::take(records)
                        .into_iter()
                        .map(|(key, value)| (key, Some(value))),
                );
                Ok(())
            })
        })
    }

    fn open_cursor(&self, handlers: CursorHandlers<MemoryCursor>) -> Result<(), EngineError> {
        self.tx.ensure_active()?;
        let scan = Rc::new(CursorScan {
            tx: Rc::clone(&self.tx),
            on_step: RefCell::new(Some(handlers.on_step)),
            on_error: RefCell::new(Some(handlers.on_error)),
            position: RefCell::new(None),
        });
        CursorScan::schedule_step(&scan)
    }
}

struct CursorScan {
    tx: Rc<TxState>,
    on_step: RefCell<Option<Box<dyn FnMut(Option<MemoryCursor>)>>>,
    on_error: RefCell<Option<ErrorHandler>>,
    position: RefCell<Option<String>>,
}

impl CursorScan {
    fn schedule_step(scan: &Rc<Self>) -> Result<(), EngineError> {
        scan.tx.ensure_active()?;
        scan.tx.pending.set(scan.tx.pending.get() + 1);
        let step = Rc::clone(scan);
        scan.tx.schedule(Box::new(move || {
            step.step();
            step.tx.request_done();
        }));
        Ok(())
    }

    fn step(self: &Rc<Self>) {
        if self.tx.finished.get() {
            self.on_step.take();
            if let Some(on_error) = self.on_error.take() {
                on_error(aborted());
            }
            return;
        }
        if let Some(error) = self.tx.backend.take_scoped(Hook::Request, &self.tx.scope) {
            self.on_step.take();
            if let Some(on_error) = self.on_error.take() {
                on_error(error.clone());
            }
            self.tx.abort(error);
            return;
        }

        let next = self.tx.next_after(self.position.borrow().as_deref());
        let cursor = next.map(|(key, value)| {
            *self.position.borrow_mut() = Some(key.clone());
            MemoryCursor {
                scan: Rc::clone(self),
                key,
                value,
                advanced: Cell::new(false),
            }
        });
        let exhausted = cursor.is_none();

        let Some(mut on_step) = self.on_step.take() else {
            return;
        };
        on_step(cursor);
        if !exhausted {
            *self.on_step.borrow_mut() = Some(on_step);
        }
    }
}

pub struct MemoryCursor {
    scan: Rc<CursorScan>,
    key: String,
    value: Record,
    advanced: Cell<bool>,
}

impl Cursor for MemoryCursor {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn value(&self) -> Result<Record, EngineError> {
        let tx = &self.scan.tx;
        match tx.backend.take_scoped(Hook::Read, &tx.scope) {
            Some(error) => Err(error),
            None => Ok(self.value.clone()),
        }
    }

    fn advance(&self) -> Result<(), EngineError> {
        if self.advanced.replace(true) {
            return Err(EngineError::invalid_state(
                "The cursor is being iterated or has iterated past its end.",
            ));
        }
        let tx = &self.scan.tx;
        if let Some(error) = tx.backend.take_scoped(Hook::Advance, &tx.scope) {
            return Err(error);
        }
        CursorScan::schedule_step(&self.scan)
    }
}
