//! Awaitable completion handles.
//!
//! An [`Awaitable`] pairs with a callback: the callback half is handed to a
//! socket operation, the awaitable half is either polled as a `Future`
//! (resumed by the reactor thread that delivers the event) or waited on
//! synchronously. Isomorphic to plain callback registration; no scheduler
//! of its own.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Waker},
};

use sockeye_timing::Nanos;

use crate::error::{Error, ErrorKind};

struct Shared<E> {
    state: Mutex<State<E>>,
    ready: Condvar,
}

struct State<E> {
    value: Option<E>,
    waker: Option<Waker>,
}

/// The completion half. Created by [`awaitable`].
pub struct Awaitable<E> {
    shared: Arc<Shared<E>>,
}

/// Creates a callback/awaitable pair for an event type `E`.
pub fn awaitable<E: Send + 'static>() -> (Box<dyn FnOnce(E) + Send>, Awaitable<E>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State { value: None, waker: None }),
        ready: Condvar::new(),
    });
    let completer = Arc::clone(&shared);
    let callback = Box::new(move |event: E| {
        let waker = {
            let mut state =
                completer.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.value = Some(event);
            state.waker.take()
        };
        completer.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    });
    (callback, Awaitable { shared })
}

impl<E> Awaitable<E> {
    /// Blocks the calling thread until the event arrives or `deadline`
    /// passes. Must not be called from an I/O worker.
    pub fn wait(self, deadline: Option<Nanos>) -> Result<E, Error> {
        let mut state =
            self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(value) = state.value.take() {
                return Ok(value);
            }
            match deadline {
                None => {
                    state = self
                        .shared
                        .ready
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_sub(Nanos::now());
                    if remaining == Nanos::ZERO {
                        return Err(Error::new(ErrorKind::TimedOut));
                    }
                    let (guard, _) = self
                        .shared
                        .ready
                        .wait_timeout(state, remaining.into())
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    /// Non-blocking probe.
    pub fn try_take(&self) -> Option<E> {
        let mut state =
            self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.value.take()
    }
}

impl<E> Future for Awaitable<E> {
    type Output = E;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state =
            self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(value) = state.value.take() {
            return Poll::Ready(value);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_the_delivered_event() {
        let (callback, awaitable) = awaitable::<u32>();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            callback(42);
        });
        assert_eq!(awaitable.wait(None).unwrap(), 42);
    }

    #[test]
    fn wait_times_out_without_an_event() {
        let (_callback, awaitable) = awaitable::<u32>();
        let err = awaitable.wait(Some(Nanos::now() + Nanos::from_millis(20))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn future_resumes_on_completion() {
        use std::task::{RawWaker, RawWakerVTable};

        fn noop_waker() -> Waker {
            const VTABLE: RawWakerVTable = RawWakerVTable::new(
                |_| RawWaker::new(std::ptr::null(), &VTABLE),
                |_| {},
                |_| {},
                |_| {},
            );
            unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
        }

        let (callback, mut awaitable) = awaitable::<&'static str>();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut awaitable).poll(&mut cx).is_pending());
        callback("done");
        assert_eq!(Pin::new(&mut awaitable).poll(&mut cx), Poll::Ready("done"));
    }
}
