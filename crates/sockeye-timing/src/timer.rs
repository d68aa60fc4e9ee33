use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex, Weak},
};

use tracing::warn;

use crate::{Duration, Nanos};

enum TimerKind {
    Once(Option<Box<dyn FnOnce() + Send>>),
    Every { period: Duration, callback: Box<dyn FnMut() + Send> },
}

struct TimerState {
    kind: TimerKind,
    cancelled: bool,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<(Nanos, u64)>>,
    timers: HashMap<u64, TimerState>,
    next_id: u64,
}

/// Deadline-ordered timer set drained by the owning reactor loop.
///
/// A min-heap of absolute deadlines with lazy cancellation: the heap keeps
/// the `(deadline, id)` pair while the callback lives in a side map, so
/// `cancel` is O(1) and dead heap entries are skipped on pop.
#[derive(Default)]
pub struct TimerQueue {
    inner: Mutex<Inner>,
}

/// Cancellation handle returned by `schedule_*`.
///
/// Holds the queue weakly; cancelling after the queue is gone is a no-op.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    queue: Weak<TimerQueue>,
}

impl TimerHandle {
    /// Returns true if the timer had not yet fired (one-shot) or will never
    /// fire again (recurring).
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut inner = queue.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.timers.get_mut(&self.id) {
            Some(state) => {
                state.cancelled = true;
                true
            }
            None => false,
        }
    }
}

impl TimerQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms a one-shot timer at the absolute `deadline`.
    pub fn schedule_once<F>(self: &Arc<Self>, deadline: Nanos, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert(deadline, TimerKind::Once(Some(Box::new(callback))))
    }

    /// Arms a recurring timer; first fires at `deadline`, then every `period`.
    pub fn schedule_every<F>(
        self: &Arc<Self>,
        deadline: Nanos,
        period: Duration,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            warn!("recurring timer with zero period, treating as one-shot");
        }
        self.insert(deadline, TimerKind::Every { period, callback: Box::new(callback) })
    }

    fn insert(self: &Arc<Self>, deadline: Nanos, kind: TimerKind) -> TimerHandle {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.timers.insert(id, TimerState { kind, cancelled: false });
        inner.heap.push(Reverse((deadline, id)));
        TimerHandle { id, queue: Arc::downgrade(self) }
    }

    /// Earliest pending deadline, if any. Cancelled entries may still be
    /// reported; they are discarded on the next `fire_due`, which at worst
    /// costs one early poll wakeup.
    pub fn next_deadline(&self) -> Option<Nanos> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pops every timer due at `now` and invokes its callback outside the
    /// lock. Returns the number of callbacks fired.
    pub fn fire_due(&self, now: Nanos) -> usize {
        let mut fired = 0;
        loop {
            let mut due: Option<(u64, TimerKind)> = None;
            {
                let mut inner =
                    self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                while let Some(Reverse((deadline, id))) = inner.heap.peek().copied() {
                    if deadline > now {
                        break;
                    }
                    inner.heap.pop();
                    let Some(state) = inner.timers.remove(&id) else {
                        continue;
                    };
                    if state.cancelled {
                        continue;
                    }
                    due = Some((id, state.kind));
                    break;
                }
            }

            let Some((id, kind)) = due else {
                return fired;
            };

            match kind {
                TimerKind::Once(callback) => {
                    if let Some(callback) = callback {
                        callback();
                    }
                    fired += 1;
                }
                TimerKind::Every { period, mut callback } => {
                    callback();
                    fired += 1;
                    if !period.is_zero() {
                        let mut inner =
                            self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        inner.timers.insert(
                            id,
                            TimerState {
                                kind: TimerKind::Every { period, callback },
                                cancelled: false,
                            },
                        );
                        inner.heap.push(Reverse((now + period, id)));
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.timers.is_empty()
    }
}
