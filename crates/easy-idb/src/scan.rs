//! Full-store scan over a forward cursor.
//!
//! A cursor reaching its end does not mean the scan is over: the transaction may still be
//! finalizing, and it can still fail. The scan therefore only settles on the
//! transaction's own outcome:
//!
//! - transaction complete: resolve with the collected records, or reject with the cursor
//!   error if a cursor step failed,
//! - transaction error or abort: reject with the transaction error, which takes
//!   precedence over any cursor error.
//!
//! Records are materialized in full before the scan resolves.

use crate::bridge;
use crate::engine::{
    Connection, Cursor, CursorHandlers, EngineError, Factory, ObjectStore, Record, Transaction,
};
use crate::error::{Error, OperationKind, Result};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
struct ScanState {
    records: Vec<Record>,
    cursor_error: Option<EngineError>,
}

type TransactionOf<F> = <<F as Factory>::Connection as Connection>::Transaction;
type CursorOf<F> = <<TransactionOf<F> as Transaction>::Store as ObjectStore>::Cursor;

pub(crate) async fn scan_all<F: Factory>(
    tx: &TransactionOf<F>,
    store_name: &str,
) -> Result<Vec<Record>> {
    let (settler, pending) = bridge::deferred::<F, Result<Vec<Record>>>();
    let state = Rc::new(RefCell::new(ScanState::default()));

    {
        let state = Rc::clone(&state);
        let settler = settler.clone();
        let store = store_name.to_owned();
        tx.on_complete(Box::new(move || {
            let ScanState {
                records,
                cursor_error,
            } = std::mem::take(&mut *state.borrow_mut());
            let outcome = match cursor_error {
                Some(source) => Err(Error::Cursor { store, source }),
                None => Ok(records),
            };
            settler.settle(outcome);
        }));
    }
    {
        let settler = settler.clone();
        let store = store_name.to_owned();
        tx.on_error(Box::new(move |source| {
            settler.settle(Err(Error::Transaction { store, source }));
        }));
    }

    let fail = |source| Error::Operation {
        kind: OperationKind::GetAll,
        store: store_name.to_owned(),
        source,
    };
    let store = tx.object_store(store_name).map_err(fail)?;

    let on_step = {
        let state = Rc::clone(&state);
        move |cursor: Option<CursorOf<F>>| {
            // `None` is the end of the traversal; completion comes from the transaction.
            let Some(cursor) = cursor else {
                return;
            };
            let mut state = state.borrow_mut();
            // A failed read or advance stops the traversal; the transaction then completes
            // and the scan rejects with the cursor error.
            let stepped = cursor.value().and_then(|record| {
                state.records.push(record);
                cursor.advance()
            });
            if let Err(error) = stepped {
                state.cursor_error = Some(error);
            }
        }
    };
    let on_error = {
        let state = Rc::clone(&state);
        move |error: EngineError| {
            state.borrow_mut().cursor_error = Some(error);
        }
    };

    store
        .open_cursor(CursorHandlers {
            on_step: Box::new(on_step),
            on_error: Box::new(on_error),
        })
        .map_err(fail)?;

    pending.await?
}
