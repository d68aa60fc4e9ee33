//! Type-erased work items, the executor seam, and ordered strands.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// A type-erased nullary closure.
pub type Functor = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run functors. Reactors implement this by deferring to
/// their driving thread; tests implement it inline.
pub trait Executor: Send + Sync {
    fn execute(&self, f: Functor);
}

/// Runs functors on the calling thread, immediately. Useful as a strand
/// substrate in tests and for synchronous teardown paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, f: Functor) {
        f();
    }
}

thread_local! {
    static STRAND_STACK: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
struct StrandQueue {
    functors: VecDeque<Functor>,
    draining: bool,
}

struct StrandInner {
    queue: Mutex<StrandQueue>,
    executor: Arc<dyn Executor>,
}

/// An executor guaranteeing sequential, non-concurrent execution of its
/// functors, in submission order, on top of any underlying executor.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { inner: Arc::new(StrandInner { queue: Mutex::new(StrandQueue::default()), executor }) }
    }

    /// Queues `f`; if no drain is in flight, schedules one.
    pub fn execute_functor(&self, f: Functor) {
        let start_drain = {
            let mut queue =
                self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.functors.push_back(f);
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if start_drain {
            self.schedule_drain();
        }
    }

    /// Atomically splices `sequence` plus an optional trailing function into
    /// the queue, then schedules a drain if none is in flight.
    pub fn move_and_execute(&self, sequence: &mut VecDeque<Functor>, last: Option<Functor>) {
        let start_drain = {
            let mut queue =
                self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.functors.append(sequence);
            if let Some(last) = last {
                queue.functors.push_back(last);
            }
            if queue.draining || queue.functors.is_empty() {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if start_drain {
            self.schedule_drain();
        }
    }

    /// True when called from a functor currently being run by this strand.
    pub fn is_running_in_current_thread(&self) -> bool {
        let key = Arc::as_ptr(&self.inner) as usize;
        STRAND_STACK.with(|stack| stack.borrow().contains(&key))
    }

    fn schedule_drain(&self) {
        let this = Strand { inner: Arc::clone(&self.inner) };
        self.inner.executor.execute(Box::new(move || this.drain()));
    }

    fn drain(&self) {
        let key = Arc::as_ptr(&self.inner) as usize;
        STRAND_STACK.with(|stack| stack.borrow_mut().push(key));

        loop {
            // Swap the whole batch out so producers never wait on a running
            // functor.
            let batch = {
                let mut queue =
                    self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if queue.functors.is_empty() {
                    queue.draining = false;
                    break;
                }
                std::mem::take(&mut queue.functors)
            };
            for functor in batch {
                functor();
            }
        }

        STRAND_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let pos = stack.iter().rposition(|k| *k == key);
            if let Some(pos) = pos {
                stack.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn strand_preserves_fifo_order() {
        let strand = Strand::new(Arc::new(InlineExecutor));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            strand.execute_functor(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn strand_reports_running_thread() {
        let strand = Strand::new(Arc::new(InlineExecutor));
        assert!(!strand.is_running_in_current_thread());

        let probe = Arc::new(AtomicUsize::new(0));
        let inner = strand.clone();
        let p = Arc::clone(&probe);
        strand.execute_functor(Box::new(move || {
            p.store(usize::from(inner.is_running_in_current_thread()), Ordering::Relaxed);
        }));
        assert_eq!(probe.load(Ordering::Relaxed), 1);
        assert!(!strand.is_running_in_current_thread());
    }

    #[test]
    fn move_and_execute_splices_in_order() {
        let strand = Strand::new(Arc::new(InlineExecutor));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut batch: VecDeque<Functor> = VecDeque::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            batch.push_back(Box::new(move || order.lock().unwrap().push(i)));
        }
        let order_last = Arc::clone(&order);
        strand.move_and_execute(
            &mut batch,
            Some(Box::new(move || order_last.lock().unwrap().push(99))),
        );

        assert!(batch.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 99]);
    }

    #[test]
    fn strand_on_thread_pool_is_sequential() {
        struct SpawnExecutor;
        impl Executor for SpawnExecutor {
            fn execute(&self, f: Functor) {
                std::thread::spawn(f);
            }
        }

        let strand = Strand::new(Arc::new(SpawnExecutor));
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            strand.execute_functor(Box::new(move || {
                let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inside, Ordering::SeqCst);
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        // Wait for the strand to go idle.
        for _ in 0..1000 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            let queue = strand.inner.queue.lock().unwrap();
            if queue.functors.is_empty() && !queue.draining {
                break;
            }
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "two functors overlapped");
    }
}
