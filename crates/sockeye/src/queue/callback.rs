//! Pending-operation entries and their FIFO pairing queue.
//!
//! Each waiting accept/receive request is one entry. Readiness events pair
//! entries with data or sockets in registration order; cancellation and
//! deadline expiry race dispatch through a single atomic state transition.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
};

use sockeye_timing::{Nanos, TimerHandle};

use crate::queue::CancelToken;

const PENDING: u8 = 0;
const ACTIVE: u8 = 1;
const CANCELLED: u8 = 2;
const COMPLETED: u8 = 3;

/// A registered completion callback with its constraints.
///
/// State machine: `pending → active → completed`, with `pending → cancelled`
/// reachable from cancel/timeout. Once an entry is `active` (dispatch has
/// claimed it) cancellation is lost.
pub struct CallbackEntry<E> {
    state: AtomicU8,
    callback: Mutex<Option<Box<dyn FnOnce(E) + Send>>>,
    token: Option<CancelToken>,
    deadline: Option<Nanos>,
    min_size: usize,
    max_size: usize,
    timer: Mutex<Option<TimerHandle>>,
}

impl<E> CallbackEntry<E> {
    pub fn new(
        callback: Box<dyn FnOnce(E) + Send>,
        token: Option<CancelToken>,
        deadline: Option<Nanos>,
        min_size: usize,
        max_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            callback: Mutex::new(Some(callback)),
            token,
            deadline,
            min_size,
            max_size,
            timer: Mutex::new(None),
        })
    }

    #[inline]
    pub fn token(&self) -> Option<CancelToken> {
        self.token
    }

    #[inline]
    pub fn deadline(&self) -> Option<Nanos> {
        self.deadline
    }

    #[inline]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_timer(&self, handle: TimerHandle) {
        let mut timer = self.timer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *timer = Some(handle);
    }

    fn cancel_timer(&self) {
        let handle = {
            let mut timer =
                self.timer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            timer.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Claims the entry for dispatch.
    pub fn try_activate(&self) -> bool {
        let claimed = self
            .state
            .compare_exchange(PENDING, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.cancel_timer();
        }
        claimed
    }

    /// Attempts `pending → cancelled`; returns false if dispatch won the
    /// race.
    pub fn try_cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.cancel_timer();
        }
        cancelled
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Runs the callback of a claimed (`active`) or cancelled entry.
    pub fn complete(&self, event: E) {
        let callback = {
            let mut callback =
                self.callback.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            callback.take()
        };
        self.state.store(COMPLETED, Ordering::Release);
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// FIFO of pending entries for one socket direction.
pub struct CallbackQueue<E> {
    entries: VecDeque<Arc<CallbackEntry<E>>>,
}

impl<E> Default for CallbackQueue<E> {
    fn default() -> Self {
        Self { entries: VecDeque::new() }
    }
}

impl<E> CallbackQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Arc<CallbackEntry<E>>) {
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Head entry that is still pending, without claiming it. Cancelled
    /// entries encountered on the way are discarded.
    pub fn front_pending(&mut self) -> Option<&Arc<CallbackEntry<E>>> {
        while let Some(front) = self.entries.front() {
            if front.is_cancelled() {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.entries.front()
    }

    /// Pops and claims the next pending entry.
    pub fn pop_ready(&mut self) -> Option<Arc<CallbackEntry<E>>> {
        while let Some(entry) = self.entries.pop_front() {
            if entry.try_activate() {
                return Some(entry);
            }
        }
        None
    }

    /// Cancels every entry matching `token`, removing it from the queue.
    /// Returns the cancelled entries so the caller can schedule their
    /// callbacks with a cancelled event.
    pub fn cancel(&mut self, token: CancelToken) -> Vec<Arc<CallbackEntry<E>>> {
        let mut cancelled = Vec::new();
        self.entries.retain(|entry| {
            if entry.token() == Some(token) && entry.try_cancel() {
                cancelled.push(Arc::clone(entry));
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Removes a specific entry (deadline expiry path). The entry must
    /// already have been claimed or cancelled by the caller.
    pub fn remove(&mut self, entry: &Arc<CallbackEntry<E>>) {
        self.entries.retain(|candidate| !Arc::ptr_eq(candidate, entry));
    }

    /// Claims every remaining entry; used when a terminal error or close
    /// fans out to all pending operations.
    pub fn drain_all(&mut self) -> Vec<Arc<CallbackEntry<E>>> {
        let mut drained = Vec::new();
        while let Some(entry) = self.entries.pop_front() {
            if entry.try_activate() {
                drained.push(entry);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn entry(
        hits: &Arc<AtomicUsize>,
        token: Option<CancelToken>,
    ) -> Arc<CallbackEntry<u32>> {
        let hits = Arc::clone(hits);
        CallbackEntry::new(
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            token,
            None,
            1,
            usize::MAX,
        )
    }

    #[test]
    fn dispatch_wins_cancel_race() {
        let hits = Arc::new(AtomicUsize::new(0));
        let entry = entry(&hits, Some(CancelToken(7)));

        assert!(entry.try_activate());
        // Too late: dispatch already claimed it.
        assert!(!entry.try_cancel());
        entry.complete(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let entry = entry(&hits, Some(CancelToken(7)));

        assert!(entry.try_cancel());
        assert!(!entry.try_activate());
    }

    #[test]
    fn queue_pairs_in_fifo_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut queue = CallbackQueue::new();
        let first = entry(&hits, None);
        let second = entry(&hits, None);
        queue.push(Arc::clone(&first));
        queue.push(Arc::clone(&second));

        let popped = queue.pop_ready().unwrap();
        assert!(Arc::ptr_eq(&popped, &first));
        let popped = queue.pop_ready().unwrap();
        assert!(Arc::ptr_eq(&popped, &second));
        assert!(queue.pop_ready().is_none());
    }

    #[test]
    fn cancel_by_token_removes_only_matches() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut queue = CallbackQueue::new();
        queue.push(entry(&hits, Some(CancelToken(1))));
        queue.push(entry(&hits, Some(CancelToken(2))));
        queue.push(entry(&hits, Some(CancelToken(1))));

        let cancelled = queue.cancel(CancelToken(1));
        assert_eq!(cancelled.len(), 2);
        assert_eq!(queue.len(), 1);
    }
}
