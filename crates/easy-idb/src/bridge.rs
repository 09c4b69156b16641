//! Turns the engine's success/error callbacks into awaitable results.
//!
//! Every request gets its own settlement slot. The slot holds a oneshot sender that is
//! taken by whichever handler fires first, so a request settles exactly once even if an
//! engine misbehaves and reports both outcomes.

use crate::engine::{EngineError, Factory, RequestHandlers};
use crate::error::{Error, OperationKind, Result};
use futures_channel::oneshot;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Write side of a deferred value. Clones share one slot.
pub(crate) struct Settler<T> {
    slot: Rc<RefCell<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Settler<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T> Settler<T> {
    /// Settles the deferred value. Returns `false` if it was already settled or nobody is
    /// waiting for it any more.
    pub(crate) fn settle(&self, value: T) -> bool {
        let Some(sender) = self.slot.borrow_mut().take() else {
            return false;
        };
        sender.send(value).is_ok()
    }
}

/// Read side of a deferred value.
///
/// Polling first drives the engine (see [`Factory::drive`]), so an in-process engine
/// delivers what it has queued the way the browser does once the caller yields.
#[must_use = "a pending result does nothing unless awaited"]
pub(crate) struct Pending<T> {
    rx: oneshot::Receiver<T>,
    drive: fn(),
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        (self.drive)();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Canceled))
    }
}

pub(crate) fn deferred<F: Factory, T>() -> (Settler<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Settler {
            slot: Rc::new(RefCell::new(Some(tx))),
        },
        Pending {
            rx,
            drive: F::drive,
        },
    )
}

/// Handler pair that settles a shared slot with the request's outcome.
pub(crate) fn request_handlers<T: 'static>(
    settler: Settler<std::result::Result<T, EngineError>>,
) -> RequestHandlers<T> {
    let on_error = settler.clone();
    RequestHandlers {
        on_success: Box::new(move |value| {
            settler.settle(Ok(value));
        }),
        on_error: Box::new(move |error| {
            on_error.settle(Err(error));
        }),
    }
}

/// Issues one request through `issue` and waits for it to settle.
///
/// Both a synchronous rejection from the engine and an error event are reported as
/// [`Error::Operation`], naming the operation and the store.
pub(crate) async fn wrap<F: Factory, T: 'static>(
    kind: OperationKind,
    store: &str,
    issue: impl FnOnce(RequestHandlers<T>) -> std::result::Result<(), EngineError>,
) -> Result<T> {
    let (settler, pending) = deferred::<F, _>();
    let fail = |source| Error::Operation {
        kind,
        store: store.to_owned(),
        source,
    };

    issue(request_handlers(settler)).map_err(fail)?;
    pending.await?.map_err(fail)
}
