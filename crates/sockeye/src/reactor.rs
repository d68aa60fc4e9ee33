//! Poll-based readiness multiplexer.
//!
//! A reactor owns an interest map keyed by descriptor. `wait` regenerates a
//! shadow `pollfd` array lazily (the interest generation counter advances on
//! every mutation), issues one `poll`, and translates the results into
//! [`Event`]s. A self-pipe participates in every poll so interest mutations
//! and deferred work from other threads can interrupt a long wait.

use std::{
    collections::{HashMap, VecDeque},
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use bitflags::bitflags;
use sockeye_timing::{Nanos, TimerQueue};
use tracing::{debug, warn};

use crate::{
    error::{Error, ErrorKind, Result},
    executor::{Executor, Functor},
    sys,
};

bitflags! {
    /// Per-descriptor interest bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

/// One polled condition on one descriptor.
#[derive(Debug, Clone)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub exceptional: bool,
    pub error: Option<Error>,
}

/// Receiver of reactor events. Sockets attach themselves as handlers; the
/// driving thread looks the handler up per event and dispatches outside the
/// reactor lock.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

struct Registration {
    interest: Interest,
    handler: Weak<dyn EventHandler>,
}

#[derive(Default)]
struct State {
    registrations: HashMap<RawFd, Registration>,
    generation: u64,
    shadow: Vec<libc::pollfd>,
    shadow_generation: u64,
}

impl State {
    fn rebuild_shadow(&mut self, wake_fd: RawFd) {
        self.shadow.clear();
        self.shadow.push(libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 });
        for (fd, registration) in &self.registrations {
            let mut events: libc::c_short = 0;
            if registration.interest.contains(Interest::READABLE) {
                events |= libc::POLLIN | libc::POLLPRI;
            }
            if registration.interest.contains(Interest::WRITABLE) {
                events |= libc::POLLOUT;
            }
            self.shadow.push(libc::pollfd { fd: *fd, events, revents: 0 });
        }
        self.shadow_generation = self.generation;
    }
}

/// A readiness-based event multiplexer over `poll`.
pub struct Reactor {
    state: Mutex<State>,
    timers: Arc<TimerQueue>,
    deferred: Mutex<VecDeque<Functor>>,
    wake_read: RawFd,
    wake_write: RawFd,
    load: AtomicUsize,
    index: usize,
}

impl Reactor {
    pub fn new() -> Result<Arc<Self>> {
        Self::with_index(0)
    }

    pub(crate) fn with_index(index: usize) -> Result<Arc<Self>> {
        let (wake_read, wake_write) = sys::wake_pipe()?;
        Ok(Arc::new(Self {
            state: Mutex::new(State { generation: 1, ..State::default() }),
            timers: TimerQueue::new(),
            deferred: Mutex::new(VecDeque::new()),
            wake_read,
            wake_write,
            load: AtomicUsize::new(0),
            index,
        }))
    }

    /// Registers `fd`. A second attach of the same descriptor fails with
    /// `InvalidArgument`.
    pub fn attach(&self, fd: RawFd, handler: Weak<dyn EventHandler>) -> Result<()> {
        let mut state = self.lock_state();
        if state.registrations.contains_key(&fd) {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        state.registrations.insert(fd, Registration { interest: Interest::empty(), handler });
        state.generation += 1;
        drop(state);
        self.load.fetch_add(1, Ordering::Relaxed);
        self.wake();
        Ok(())
    }

    /// Removes `fd` from the polled set. Must precede closing the
    /// descriptor.
    pub fn detach(&self, fd: RawFd) -> Result<()> {
        let mut state = self.lock_state();
        if state.registrations.remove(&fd).is_none() {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        state.generation += 1;
        drop(state);
        self.load.fetch_sub(1, Ordering::Relaxed);
        self.wake();
        Ok(())
    }

    pub fn show_readable(&self, fd: RawFd) -> Result<()> {
        self.update_interest(fd, Interest::READABLE, true)
    }

    pub fn hide_readable(&self, fd: RawFd) -> Result<()> {
        self.update_interest(fd, Interest::READABLE, false)
    }

    pub fn show_writable(&self, fd: RawFd) -> Result<()> {
        self.update_interest(fd, Interest::WRITABLE, true)
    }

    pub fn hide_writable(&self, fd: RawFd) -> Result<()> {
        self.update_interest(fd, Interest::WRITABLE, false)
    }

    /// Current interest bits for `fd`, if attached.
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.lock_state().registrations.get(&fd).map(|r| r.interest)
    }

    fn update_interest(&self, fd: RawFd, bit: Interest, enabled: bool) -> Result<()> {
        let mut state = self.lock_state();
        let registration = state
            .registrations
            .get_mut(&fd)
            .ok_or(Error::new(ErrorKind::InvalidArgument))?;
        let updated = if enabled {
            registration.interest | bit
        } else {
            registration.interest - bit
        };
        if updated == registration.interest {
            return Ok(());
        }
        registration.interest = updated;
        state.generation += 1;
        drop(state);
        self.wake();
        Ok(())
    }

    /// Blocks until at least one descriptor has a polled condition or the
    /// absolute `deadline` elapses; `Err(WouldBlock)` reports the timeout.
    pub fn wait(&self, deadline: Option<Nanos>) -> Result<Vec<Event>> {
        let mut pollfds = {
            let mut state = self.lock_state();
            if state.shadow_generation != state.generation {
                state.rebuild_shadow(self.wake_read);
            }
            state.shadow.clone()
        };

        let ready = loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_sub(Nanos::now());
                    // poll rounds down; a 0 timeout still reports already
                    // pending conditions.
                    remaining.as_millis_u64().min(i32::MAX as u64) as libc::c_int
                }
            };
            let res =
                unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
            if res >= 0 {
                break res as usize;
            }
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        };

        if ready == 0 {
            return Err(Error::new(ErrorKind::WouldBlock));
        }

        if pollfds[0].revents != 0 {
            sys::pipe_drain(self.wake_read);
        }

        let mut events = Vec::with_capacity(ready);
        let mut invalid = Vec::new();
        for pollfd in &pollfds[1..] {
            if pollfd.revents == 0 {
                continue;
            }
            let revents = pollfd.revents;
            let mut event = Event {
                fd: pollfd.fd,
                readable: revents & libc::POLLIN != 0,
                writable: revents & libc::POLLOUT != 0,
                hangup: revents & libc::POLLHUP != 0,
                exceptional: revents & libc::POLLPRI != 0,
                error: None,
            };
            if revents & libc::POLLERR != 0 {
                event.error = match sys::take_socket_error(pollfd.fd) {
                    Ok(Some(err)) => Some(err),
                    Ok(None) => None,
                    Err(err) => Some(err),
                };
            }
            if revents & libc::POLLNVAL != 0 {
                // The descriptor is no longer valid; probe what we can and
                // drop it from the polled set.
                let err = sys::take_socket_error(pollfd.fd)
                    .ok()
                    .flatten()
                    .unwrap_or(Error::new(ErrorKind::InvalidArgument));
                event.error = Some(err);
                invalid.push(pollfd.fd);
            }
            events.push(event);
        }

        if !invalid.is_empty() {
            let mut state = self.lock_state();
            for fd in invalid {
                warn!(reactor = self.index, fd, "detaching invalid descriptor");
                if state.registrations.remove(&fd).is_some() {
                    self.load.fetch_sub(1, Ordering::Relaxed);
                }
            }
            state.generation += 1;
        }

        Ok(events)
    }

    /// Handler registered for `fd`, if it is attached and still alive.
    pub fn handler(&self, fd: RawFd) -> Option<Arc<dyn EventHandler>> {
        self.lock_state().registrations.get(&fd).and_then(|r| r.handler.upgrade())
    }

    /// Interrupts a wait in progress on the driving thread.
    pub fn wake(&self) {
        sys::pipe_notify(self.wake_write);
    }

    /// The reactor's deadline timer set.
    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// Earliest deadline the driving thread must wake for.
    pub fn next_timer_deadline(&self) -> Option<Nanos> {
        self.timers.next_deadline()
    }

    /// Runs every due timer; returns the count fired.
    pub fn fire_due_timers(&self) -> usize {
        self.timers.fire_due(Nanos::now())
    }

    /// Drains and runs deferred functors posted through [`Executor`].
    pub fn run_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let functor = {
                let mut deferred =
                    self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                deferred.pop_front()
            };
            match functor {
                Some(functor) => {
                    functor();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Number of attached descriptors; the load-balancing gauge.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Executor for Reactor {
    fn execute(&self, f: Functor) {
        {
            let mut deferred =
                self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            deferred.push_back(f);
        }
        self.wake();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        debug!(reactor = self.index, "reactor dropped");
        sys::close(self.wake_read);
        sys::close(self.wake_write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl EventHandler for Nop {
        fn handle_event(&self, _event: &Event) {}
    }

    fn nop_handler() -> (Arc<Nop>, Weak<dyn EventHandler>) {
        let handler = Arc::new(Nop);
        let weak = Arc::downgrade(&handler) as Weak<dyn EventHandler>;
        (handler, weak)
    }

    fn test_pipe() -> (RawFd, RawFd) {
        sys::wake_pipe().unwrap()
    }

    #[test]
    fn attach_twice_is_invalid() {
        let reactor = Reactor::new().unwrap();
        let (_keep, handler) = nop_handler();
        let (r, w) = test_pipe();

        reactor.attach(r, handler.clone()).unwrap();
        assert_eq!(
            reactor.attach(r, handler).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        reactor.detach(r).unwrap();
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn attach_detach_is_a_noop_on_the_interest_set() {
        let reactor = Reactor::new().unwrap();
        let (_keep, handler) = nop_handler();
        let (r, w) = test_pipe();

        assert_eq!(reactor.interest(r), None);
        reactor.attach(r, handler).unwrap();
        assert_eq!(reactor.interest(r), Some(Interest::empty()));
        reactor.detach(r).unwrap();
        assert_eq!(reactor.interest(r), None);
        assert_eq!(reactor.load(), 0);
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn show_then_hide_restores_interest() {
        let reactor = Reactor::new().unwrap();
        let (_keep, handler) = nop_handler();
        let (r, w) = test_pipe();

        reactor.attach(r, handler).unwrap();
        let before = reactor.interest(r).unwrap();
        reactor.show_readable(r).unwrap();
        reactor.hide_readable(r).unwrap();
        assert_eq!(reactor.interest(r), Some(before));

        reactor.detach(r).unwrap();
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn wait_times_out_with_would_block() {
        let reactor = Reactor::new().unwrap();
        let err = reactor.wait(Some(Nanos::now() + Nanos::from_millis(10))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn readable_condition_is_reported() {
        let reactor = Reactor::new().unwrap();
        let (_keep, handler) = nop_handler();
        let (r, w) = test_pipe();

        reactor.attach(r, handler).unwrap();
        reactor.show_readable(r).unwrap();
        sys::pipe_notify(w);

        let events = reactor.wait(Some(Nanos::now() + Nanos::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.fd == r && e.readable));

        reactor.detach(r).unwrap();
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn closed_descriptor_is_auto_detached() {
        let reactor = Reactor::new().unwrap();
        let (_keep, handler) = nop_handler();
        let (r, w) = test_pipe();

        reactor.attach(r, handler).unwrap();
        reactor.show_readable(r).unwrap();
        sys::close(r);
        sys::close(w);

        let events = reactor.wait(Some(Nanos::now() + Nanos::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.fd == r && e.error.is_some()));
        // POLLNVAL dropped the registration.
        assert_eq!(reactor.interest(r), None);
    }

    #[test]
    fn deferred_work_interrupts_wait() {
        let reactor = Reactor::new().unwrap();
        let flag = Arc::new(AtomicUsize::new(0));

        let posted = Arc::clone(&flag);
        let remote = Arc::clone(&reactor);
        let poster = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            remote.execute(Box::new(move || {
                posted.fetch_add(1, Ordering::SeqCst);
            }));
        });

        // The wake pipe turns the post into a poll event before the 5s
        // deadline.
        let start = Nanos::now();
        let _ = reactor.wait(Some(Nanos::now() + Nanos::from_secs(5)));
        assert!(start.elapsed() < Nanos::from_secs(4));

        reactor.run_deferred();
        assert_eq!(flag.load(Ordering::SeqCst), 1);
        poster.join().unwrap();
    }

    #[test]
    fn timers_fire_through_the_queue() {
        let reactor = Reactor::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        reactor.timers().schedule_once(Nanos::now(), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(reactor.next_timer_deadline().is_some());
        assert_eq!(reactor.fire_due_timers(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
