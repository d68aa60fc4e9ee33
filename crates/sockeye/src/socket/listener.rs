//! Listening sockets and connection admission.

use std::{
    os::fd::RawFd,
    sync::{Arc, Mutex, Weak},
};

use tracing::{debug, info, warn};

use crate::{
    buffer::BufferPool,
    endpoint::{Endpoint, Transport},
    error::{Error, ErrorKind, Result},
    executor::Executor,
    queue::{
        CancelToken,
        accept::{AcceptOptions, AcceptQueue},
        callback::{CallbackEntry, CallbackQueue},
    },
    reactor::{Event, EventHandler, Reactor},
    socket::{AcceptEvent, SocketState, StreamSocket, config::ListenerOptions},
    sys,
};

type Deferred = Vec<Box<dyn FnOnce() + Send>>;

/// Chooses the reactor each accepted socket is bound to; supplied by the
/// interface so listener admission follows its load-balancing policy.
pub(crate) type Placement = Box<dyn Fn() -> Arc<Reactor> + Send + Sync>;

struct Inner {
    state: SocketState,
    options: ListenerOptions,
    queue: AcceptQueue<Arc<StreamSocket>>,
    waiters: CallbackQueue<AcceptEvent>,
    readable_armed: bool,
    error: Option<Error>,
    bound_path: Option<std::path::PathBuf>,
}

/// A listening socket mirroring the kernel backlog into an accept queue.
pub struct ListenerSocket {
    fd: RawFd,
    transport: Transport,
    pool: BufferPool,
    reactor: Mutex<Arc<Reactor>>,
    placement: Placement,
    weak: Weak<ListenerSocket>,
    inner: Mutex<Inner>,
}

impl ListenerSocket {
    pub(crate) fn create(
        transport: Transport,
        options: ListenerOptions,
        pool: BufferPool,
        reactor: Arc<Reactor>,
        placement: Placement,
    ) -> Result<Arc<Self>> {
        let source = options
            .source_endpoint
            .clone()
            .ok_or(Error::new(ErrorKind::InvalidArgument))?;

        let fd = sys::socket(transport)?;
        let prepared = options.stream.config.apply(fd).and_then(|()| sys::bind(fd, &source));
        if let Err(err) = prepared {
            sys::close(fd);
            return Err(err);
        }
        let bound_path = match &source {
            Endpoint::Local(name) => Some(name.path().to_path_buf()),
            Endpoint::Ip(_) => None,
        };

        let queue = AcceptQueue::new(
            options.accept_queue_low_watermark,
            options.accept_queue_high_watermark,
        );
        let socket = Arc::new_cyclic(|weak| Self {
            fd,
            transport,
            pool,
            reactor: Mutex::new(reactor),
            placement,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                state: SocketState::Detached,
                options,
                queue,
                waiters: CallbackQueue::new(),
                readable_armed: false,
                error: None,
                bound_path,
            }),
        });
        socket.reactor().attach(fd, socket.handler_weak())?;
        {
            let mut inner = socket.lock_inner();
            inner.state = SocketState::Attached;
        }
        Ok(socket)
    }

    fn handler_weak(self: &Arc<Self>) -> Weak<dyn EventHandler> {
        self.weak.clone() as Weak<dyn EventHandler>
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> SocketState {
        self.lock_inner().state
    }

    /// The endpoint the listener is bound to; with port 0 binds this is the
    /// kernel-assigned endpoint.
    pub fn local_endpoint(&self) -> Result<Option<Endpoint>> {
        sys::local_endpoint(self.fd)
    }

    pub fn accept_queue_len(&self) -> usize {
        self.lock_inner().queue.len()
    }

    /// Starts listening with the configured backlog.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.state != SocketState::Attached {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        sys::listen(self.fd, inner.options.backlog)?;
        inner.state = SocketState::Active;
        self.arm_readable_locked(&mut inner);
        info!(fd = self.fd, transport = %self.transport, "listening");
        Ok(())
    }

    /// Registers an accept request; a queued or future connection fulfils
    /// it.
    pub fn accept<F>(self: &Arc<Self>, options: AcceptOptions, callback: F) -> Result<()>
    where
        F: FnOnce(AcceptEvent) + Send + 'static,
    {
        let mut inner = self.lock_inner();
        if let Some(error) = inner.error {
            return Err(error);
        }
        if inner.state != SocketState::Active {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }

        let entry = CallbackEntry::new(
            Box::new(callback),
            options.token,
            options.deadline,
            1,
            usize::MAX,
        );

        if inner.waiters.is_empty() {
            if let Some((socket, peer, progress)) = inner.queue.pop() {
                entry.try_activate();
                if progress.low_watermark {
                    self.arm_readable_locked(&mut inner);
                }
                self.reactor().execute(Box::new(move || {
                    entry.complete(AcceptEvent { result: Ok(socket), peer });
                }));
                return Ok(());
            }
        }

        if let Some(deadline) = options.deadline {
            let weak = self.weak.clone();
            let expiring = Arc::downgrade(&entry);
            let timer = self.reactor().timers().schedule_once(deadline, move || {
                if let (Some(socket), Some(entry)) = (weak.upgrade(), expiring.upgrade()) {
                    socket.expire_accept(&entry);
                }
            });
            entry.set_timer(timer);
        }
        inner.waiters.push(entry);
        self.arm_readable_locked(&mut inner);
        Ok(())
    }

    fn expire_accept(self: &Arc<Self>, entry: &Arc<CallbackEntry<AcceptEvent>>) {
        let expired = {
            let mut inner = self.lock_inner();
            if entry.try_cancel() {
                inner.waiters.remove(entry);
                true
            } else {
                false
            }
        };
        if expired {
            entry.complete(AcceptEvent {
                result: Err(Error::new(ErrorKind::TimedOut)),
                peer: None,
            });
        }
    }

    /// Cancels pending accepts registered with `token`.
    pub fn cancel(self: &Arc<Self>, token: CancelToken) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            for entry in inner.waiters.cancel(token) {
                deferred.push(Box::new(move || {
                    entry.complete(AcceptEvent {
                        result: Err(Error::new(ErrorKind::Cancelled)),
                        peer: None,
                    });
                }));
            }
        }
        run(deferred);
    }

    /// Stops admitting, cancels pending accepts, closes queued connections
    /// not yet delivered, and releases the descriptor.
    pub fn close(&self) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.state == SocketState::Closed {
                return;
            }
            self.teardown(&mut inner, &mut deferred, Error::new(ErrorKind::Cancelled));
        }
        run(deferred);
    }

    fn fail(&self, error: Error) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.state == SocketState::Closed {
                return;
            }
            warn!(fd = self.fd, %error, "listener socket failed");
            inner.error = Some(error);
            self.teardown(&mut inner, &mut deferred, error);
        }
        run(deferred);
    }

    fn teardown(&self, inner: &mut Inner, deferred: &mut Deferred, error: Error) {
        for entry in inner.waiters.drain_all() {
            deferred.push(Box::new(move || {
                entry.complete(AcceptEvent { result: Err(error), peer: None });
            }));
        }
        for (socket, _) in inner.queue.drain() {
            socket.close();
        }
        let _ = self.reactor().detach(self.fd);
        sys::close(self.fd);
        if let Some(path) = inner.bound_path.take() {
            let _ = std::fs::remove_file(path);
        }
        inner.state = SocketState::Closed;
        inner.readable_armed = false;
    }

    fn reactor(&self) -> Arc<Reactor> {
        Arc::clone(&self.reactor.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn arm_readable_locked(&self, inner: &mut Inner) {
        if inner.readable_armed
            || inner.error.is_some()
            || inner.state != SocketState::Active
            || inner.queue.saturated()
        {
            return;
        }
        match self.reactor().show_readable(self.fd) {
            Ok(()) => inner.readable_armed = true,
            Err(err) => debug!(fd = self.fd, %err, "failed to arm readable interest"),
        }
    }

    fn process_readable(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.error.is_some() || inner.state != SocketState::Active {
                return;
            }

            loop {
                if inner.queue.saturated() {
                    if inner.readable_armed {
                        let _ = self.reactor().hide_readable(self.fd);
                        inner.readable_armed = false;
                    }
                    break;
                }

                match sys::accept(self.fd) {
                    Ok((fd, peer)) => {
                        let reactor = (self.placement)();
                        match StreamSocket::from_accepted(
                            fd,
                            self.transport,
                            inner.options.stream.clone(),
                            self.pool.clone(),
                            reactor,
                        ) {
                            Ok(socket) => {
                                debug!(listener = self.fd, accepted = fd, ?peer, "accepted");
                                self.admit(&mut inner, &mut deferred, socket, peer);
                            }
                            Err(err) => {
                                warn!(listener = self.fd, %err, "accepted socket setup failed");
                            }
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Limit => {
                        // Out of descriptors; leave the connection in the
                        // kernel backlog and retry on the next event.
                        warn!(listener = self.fd, %err, "accept hit a resource limit");
                        break;
                    }
                    Err(err) => {
                        drop(inner);
                        run(deferred);
                        self.fail(err);
                        return;
                    }
                }

                if !inner.options.accept_greedily {
                    break;
                }
            }
        }
        run(deferred);
    }

    fn admit(
        &self,
        inner: &mut Inner,
        deferred: &mut Deferred,
        socket: Arc<StreamSocket>,
        peer: Option<Endpoint>,
    ) {
        if let Some(entry) = inner.waiters.pop_ready() {
            deferred.push(Box::new(move || {
                entry.complete(AcceptEvent { result: Ok(socket), peer });
            }));
            return;
        }
        let progress = inner.queue.push(socket, peer);
        if progress.high_watermark && inner.readable_armed {
            let _ = self.reactor().hide_readable(self.fd);
            inner.readable_armed = false;
        }
    }
}

impl EventHandler for ListenerSocket {
    fn handle_event(&self, event: &Event) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        if let Some(error) = event.error {
            this.fail(error);
            return;
        }
        if event.readable {
            this.process_readable();
        }
    }
}

impl Drop for ListenerSocket {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if inner.state != SocketState::Closed {
            let _ = self.reactor().detach(self.fd);
            sys::close(self.fd);
            if let Some(path) = inner.bound_path.take() {
                let _ = std::fs::remove_file(path);
            }
            inner.state = SocketState::Closed;
        }
    }
}

fn run(deferred: Deferred) {
    for callback in deferred {
        callback();
    }
}
