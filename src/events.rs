use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};

use crate::Error;

/// Represents the pending result of asynchronous device-side work (e.g., a host-to-device copy, or the completion
/// status of a dispatched execution), informing consumers when the work is complete and reporting an [`Error`] if
/// something went wrong. [`AsyncValue`]s carry "payload" values that are returned as outputs when the underlying work
/// completes via [`AsyncValue::wait`] or by polling (e.g., such a payload value could be a host buffer that is being
/// asynchronously populated).
///
/// An [`AsyncValue`] is created together with an [`AsyncValueHandle`] via [`AsyncValue::new`]. The handle is the
/// producer side: whoever performs the underlying work fulfills it exactly once with [`AsyncValueHandle::set`].
///
/// # Relationship to [`Future`]
///
/// [`AsyncValue`]s implement [`Future`] so that they can be seamlessly integrated with asynchronous Rust code.
/// However, while in Rust [`Future`]s typically do not start executing until they are polled, [`AsyncValue`]s
/// represent work that has already been submitted to a device.
pub struct AsyncValue<O> {
    /// Completion state shared with the corresponding [`AsyncValueHandle`].
    state: Arc<AsyncValueState<O>>,
}

impl<O> AsyncValue<O> {
    /// Creates a new unfulfilled [`AsyncValue`] along with the [`AsyncValueHandle`] used to fulfill it.
    pub fn new() -> (Self, AsyncValueHandle<O>) {
        let state = Arc::new(AsyncValueState {
            inner: Mutex::new(AsyncValueInner { result: None, callbacks: Vec::new(), waker: None }),
            condvar: Condvar::new(),
        });
        (Self { state: Arc::clone(&state) }, AsyncValueHandle { state })
    }

    /// Creates an [`AsyncValue`] that is already fulfilled with the provided `result`. This is used for work that
    /// completes synchronously but is surfaced through the asynchronous completion contract.
    pub fn ready_with(result: Result<O, Error>) -> Self {
        let (value, handle) = Self::new();
        handle.set(result);
        value
    }

    /// Checks if the underlying work of this [`AsyncValue`] has finished and returns `true` if it has
    /// and `false` otherwise.
    pub fn ready(&self) -> bool {
        self.state.inner.lock().unwrap().result.is_some()
    }

    /// Registers the provided callback to be invoked when the underlying work of this [`AsyncValue`] finishes.
    /// The callback takes an optional [`Error`] as its sole argument whose value depends on whether the underlying
    /// work produced an error or not. If the work has already finished, the callback is invoked immediately on the
    /// calling thread.
    pub fn on_ready<F: FnOnce(Option<Error>) + Send + 'static>(&self, callback: F) {
        let callback: Box<dyn FnOnce(Option<Error>) + Send> = Box::new(callback);
        let mut inner = self.state.inner.lock().unwrap();
        match inner.result.as_ref() {
            Some(result) => {
                let error = result.as_ref().err().cloned();
                drop(inner);
                callback(error);
            }
            None => inner.callbacks.push(callback),
        }
    }

    /// Returns an [`Error`] that was encountered while executing the underlying work of this [`AsyncValue`]. If the
    /// underlying work has already finished and was successful, this function will return `Ok(None)`. If it has not
    /// finished yet, this function will return [`Error::FailedPrecondition`]. Otherwise, if the underlying work has
    /// finished and ran into an error, this function will return `Ok(Some(error))`.
    pub fn error(&self) -> Result<Option<Error>, Error> {
        let inner = self.state.inner.lock().unwrap();
        match inner.result.as_ref() {
            None => Err(Error::failed_precondition(
                "`AsyncValue::ready` must return `true` for `AsyncValue::error` to be meaningful",
            )),
            Some(Ok(_)) => Ok(None),
            Some(Err(error)) => Ok(Some(error.clone())),
        }
    }

    /// Blocks the current thread until this [`AsyncValue`] is fulfilled, returning its payload on success
    /// or an [`Error`] if the underlying work failed.
    pub fn wait(self) -> Result<O, Error> {
        let mut inner = self.state.inner.lock().unwrap();
        while inner.result.is_none() {
            inner = self.state.condvar.wait(inner).unwrap();
        }
        // The result is present and this function consumes `self`, so taking it is safe.
        match inner.result.take().unwrap() {
            Ok(output) => Ok(output),
            Err(error) => Err(error),
        }
    }
}

impl<O> Future for AsyncValue<O> {
    type Output = Result<O, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.state.inner.lock().unwrap();
        match inner.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Producer-side handle associated with an [`AsyncValue`] that is used to fulfill it from the thread performing the
/// underlying work. The main feature of this struct is that it can be moved into completion callbacks and worker
/// threads independently of the consuming [`AsyncValue`].
pub struct AsyncValueHandle<O> {
    /// Completion state shared with the corresponding [`AsyncValue`].
    state: Arc<AsyncValueState<O>>,
}

impl<O> AsyncValueHandle<O> {
    /// Fulfills the [`AsyncValue`] associated with this [`AsyncValueHandle`] with the provided `result`, waking any
    /// blocked waiters and invoking any registered "on-ready" callbacks.
    ///
    /// # Panic
    ///
    /// Panics if the associated [`AsyncValue`] has already been fulfilled. Fulfillment is a single-shot contract.
    pub fn set(self, result: Result<O, Error>) {
        let (callbacks, waker, error) = {
            let mut inner = self.state.inner.lock().unwrap();
            if inner.result.is_some() {
                panic!("an `AsyncValue` can only be fulfilled once");
            }
            let error = result.as_ref().err().cloned();
            inner.result = Some(result);
            (std::mem::take(&mut inner.callbacks), inner.waker.take(), error)
        };
        self.state.condvar.notify_all();
        for callback in callbacks {
            callback(error.clone());
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Completion state shared between an [`AsyncValue`] and its [`AsyncValueHandle`].
struct AsyncValueState<O> {
    inner: Mutex<AsyncValueInner<O>>,
    condvar: Condvar,
}

struct AsyncValueInner<O> {
    /// Result of the underlying work, set exactly once by [`AsyncValueHandle::set`].
    result: Option<Result<O, Error>>,

    /// Callbacks registered via [`AsyncValue::on_ready`] before fulfillment.
    callbacks: Vec<Box<dyn FnOnce(Option<Error>) + Send>>,

    /// [`Waker`] registered by the last [`Future::poll`] invocation.
    waker: Option<Waker>,
}
