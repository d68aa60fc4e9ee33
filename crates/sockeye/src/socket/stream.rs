//! Connected byte-stream sockets.

use std::{
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicI32, Ordering},
    },
};

use sockeye_timing::{Nanos, RateLimiter};
use tracing::{debug, warn};

use crate::{
    buffer::{Blob, BufferPool, Data},
    endpoint::{Endpoint, Transport},
    error::{Error, ErrorKind, Result},
    executor::Executor,
    queue::{
        CancelToken,
        callback::{CallbackEntry, CallbackQueue},
        receive::{ReceiveEvent, ReceiveOptions},
        send::{Batch, SendCallback, SendOptions, SendQueue},
    },
    reactor::{Event, EventHandler, Reactor},
    session::{Compression, Serialization},
    socket::{
        ConnectEvent, SendQueueEvent, ShutdownDirection, ShutdownEvent, SocketState,
        config::{ConnectOptions, StreamSocketOptions},
    },
    sys,
};

type Deferred = Vec<Box<dyn FnOnce() + Send>>;
type ConnectCallback = Box<dyn FnOnce(ConnectEvent) + Send>;
type ShutdownHandler = Arc<dyn Fn(ShutdownEvent) + Send + Sync>;
type SendQueueHandler = Arc<dyn Fn(SendQueueEvent) + Send + Sync>;

struct ConnectInFlight {
    target: Endpoint,
    callback: Option<ConnectCallback>,
    retries_left: u32,
    retry_interval: sockeye_timing::Duration,
    token: Option<CancelToken>,
}

struct Inner {
    state: SocketState,
    options: StreamSocketOptions,
    send: SendQueue,
    receive: crate::queue::receive::ReceiveQueue,
    receive_waiters: CallbackQueue<ReceiveEvent>,
    connect: Option<ConnectInFlight>,
    send_limiter: Option<RateLimiter>,
    receive_limiter: Option<RateLimiter>,
    compression: Option<Arc<dyn Compression>>,
    serialization: Option<Arc<dyn Serialization>>,
    shutdown_handler: Option<ShutdownHandler>,
    send_queue_handler: Option<SendQueueHandler>,
    writable_armed: bool,
    readable_armed: bool,
    /// Readable interest suppressed by the receive rate limiter.
    read_limited: bool,
    /// Writable flushes suppressed by the send rate limiter.
    write_limited: bool,
    send_down: bool,
    receive_down: bool,
    /// Send shutdown requested; completes when the queue drains.
    shutdown_send_pending: bool,
    error: Option<Error>,
}

impl Inner {
    fn recompute_state(&mut self) {
        if self.state == SocketState::Closed {
            return;
        }
        self.state = match (self.send_down, self.receive_down) {
            (true, true) => SocketState::ShutDown,
            (true, false) => SocketState::ShuttingDownSend,
            (false, true) => SocketState::ShuttingDownReceive,
            (false, false) => {
                if self.shutdown_send_pending {
                    SocketState::ShuttingDownSend
                } else {
                    self.state
                }
            }
        };
    }

    fn writable_for_user(&self) -> Result<()> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.send_down || self.shutdown_send_pending || self.state == SocketState::Closed {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        Ok(())
    }
}

/// An asynchronous connected byte stream over TCP or the local domain.
pub struct StreamSocket {
    fd: AtomicI32,
    transport: Transport,
    pool: BufferPool,
    reactor: Mutex<Arc<Reactor>>,
    weak: Weak<StreamSocket>,
    inner: Mutex<Inner>,
}

impl StreamSocket {
    /// Creates a detached socket and attaches it to `reactor`.
    pub(crate) fn create(
        transport: Transport,
        options: StreamSocketOptions,
        pool: BufferPool,
        reactor: Arc<Reactor>,
    ) -> Result<Arc<Self>> {
        let fd = sys::socket(transport)?;
        if let Err(err) = Self::prepare_fd(fd, &options) {
            sys::close(fd);
            return Err(err);
        }
        let socket = Self::wrap(fd, transport, options, pool, reactor, SocketState::Detached);
        socket.attach()?;
        Ok(socket)
    }

    /// Adopts a freshly accepted descriptor as an `Active` socket.
    pub(crate) fn from_accepted(
        fd: RawFd,
        transport: Transport,
        options: StreamSocketOptions,
        pool: BufferPool,
        reactor: Arc<Reactor>,
    ) -> Result<Arc<Self>> {
        if let Err(err) = options.config.apply(fd) {
            sys::close(fd);
            return Err(err);
        }
        let socket = Self::wrap(fd, transport, options, pool, reactor, SocketState::Detached);
        socket.attach()?;
        {
            let mut inner = socket.lock_inner();
            inner.state = SocketState::Active;
        }
        socket.arm_readable();
        Ok(socket)
    }

    fn prepare_fd(fd: RawFd, options: &StreamSocketOptions) -> Result<()> {
        options.config.apply(fd)?;
        if let Some(source) = &options.source_endpoint {
            sys::bind(fd, source)?;
        }
        Ok(())
    }

    fn wrap(
        fd: RawFd,
        transport: Transport,
        options: StreamSocketOptions,
        pool: BufferPool,
        reactor: Arc<Reactor>,
        state: SocketState,
    ) -> Arc<Self> {
        let send = SendQueue::new(
            options.send_queue_low_watermark,
            options.send_queue_high_watermark,
        );
        let receive = crate::queue::receive::ReceiveQueue::new(
            options.receive_queue_low_watermark,
            options.receive_queue_high_watermark,
        );
        Arc::new_cyclic(|weak| Self {
            fd: AtomicI32::new(fd),
            transport,
            pool,
            reactor: Mutex::new(reactor),
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                state,
                options,
                send,
                receive,
                receive_waiters: CallbackQueue::new(),
                connect: None,
                send_limiter: None,
                receive_limiter: None,
                compression: None,
                serialization: None,
                shutdown_handler: None,
                send_queue_handler: None,
                writable_armed: false,
                readable_armed: false,
                read_limited: false,
                write_limited: false,
                send_down: false,
                receive_down: false,
                shutdown_send_pending: false,
                error: None,
            }),
        })
    }

    fn attach(self: &Arc<Self>) -> Result<()> {
        let reactor = self.reactor();
        reactor.attach(self.fd(), self.handler_weak())?;
        let mut inner = self.lock_inner();
        if inner.state == SocketState::Detached {
            inner.state = SocketState::Attached;
        }
        Ok(())
    }

    fn handler_weak(self: &Arc<Self>) -> Weak<dyn EventHandler> {
        self.weak.clone() as Weak<dyn EventHandler>
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> SocketState {
        self.lock_inner().state
    }

    pub fn local_endpoint(&self) -> Result<Option<Endpoint>> {
        sys::local_endpoint(self.fd())
    }

    pub fn peer_endpoint(&self) -> Result<Option<Endpoint>> {
        sys::peer_endpoint(self.fd())
    }

    pub fn send_queue_size(&self) -> usize {
        self.lock_inner().send.size()
    }

    pub fn receive_queue_size(&self) -> usize {
        self.lock_inner().receive.size()
    }

    /// Attaches a rate limiter to the send path.
    pub fn set_send_rate_limiter(&self, limiter: RateLimiter) {
        self.lock_inner().send_limiter = Some(limiter);
    }

    /// Attaches a rate limiter to the receive path.
    pub fn set_receive_rate_limiter(&self, limiter: RateLimiter) {
        self.lock_inner().receive_limiter = Some(limiter);
    }

    /// Attaches a compression session consulted by the framing layer.
    pub fn set_compression(&self, session: Arc<dyn Compression>) {
        self.lock_inner().compression = Some(session);
    }

    pub fn compression(&self) -> Option<Arc<dyn Compression>> {
        self.lock_inner().compression.clone()
    }

    /// Attaches a serialization session consulted by the framing layer.
    pub fn set_serialization(&self, session: Arc<dyn Serialization>) {
        self.lock_inner().serialization = Some(session);
    }

    pub fn serialization(&self) -> Option<Arc<dyn Serialization>> {
        self.lock_inner().serialization.clone()
    }

    /// Registers a handler for shutdown announcements.
    pub fn set_shutdown_handler<F>(&self, handler: F)
    where
        F: Fn(ShutdownEvent) + Send + Sync + 'static,
    {
        self.lock_inner().shutdown_handler = Some(Arc::new(handler));
    }

    /// Registers a handler for send-queue watermark announcements,
    /// delivered on an I/O thread in authorization order.
    pub fn set_send_queue_handler<F>(&self, handler: F)
    where
        F: Fn(SendQueueEvent) + Send + Sync + 'static,
    {
        self.lock_inner().send_queue_handler = Some(Arc::new(handler));
    }

    /// Initiates a non-blocking connect to `endpoint`.
    pub fn connect<F>(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(ConnectEvent) + Send + 'static,
    {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if let Some(error) = inner.error {
                return Err(error);
            }
            if inner.connect.is_some() || inner.state != SocketState::Attached {
                return Err(Error::new(ErrorKind::InvalidArgument));
            }
            inner.connect = Some(ConnectInFlight {
                target: endpoint.clone(),
                callback: Some(Box::new(callback)),
                retries_left: options.retry_count,
                retry_interval: options.retry_interval,
                token: options.token,
            });
            if let Some(deadline) = options.deadline {
                let weak = self.weak.clone();
                self.reactor().timers().schedule_once(deadline, move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.expire_connect();
                    }
                });
            }
            self.start_connect_attempt(&mut inner, &mut deferred);
        }
        run(deferred);
        Ok(())
    }

    fn start_connect_attempt(self: &Arc<Self>, inner: &mut Inner, deferred: &mut Deferred) {
        let Some(connect) = &mut inner.connect else {
            return;
        };
        let target = connect.target.clone();
        match sys::connect(self.fd(), &target) {
            Ok(()) => self.connect_finished(inner, deferred, Ok(())),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                // In progress; completion arrives as writability.
                if !inner.writable_armed
                    && self.reactor().show_writable(self.fd()).is_ok()
                {
                    inner.writable_armed = true;
                }
            }
            Err(err) => self.connect_attempt_failed(inner, deferred, err),
        }
    }

    fn connect_attempt_failed(
        self: &Arc<Self>,
        inner: &mut Inner,
        deferred: &mut Deferred,
        err: Error,
    ) {
        let retries_left = match &inner.connect {
            Some(connect) => connect.retries_left,
            None => return,
        };
        if retries_left == 0 {
            self.connect_finished(inner, deferred, Err(err));
            return;
        }
        let interval = {
            let connect = inner.connect.as_mut().expect("checked above");
            connect.retries_left -= 1;
            connect.retry_interval
        };
        debug!(fd = self.fd(), %err, retries_left = retries_left - 1, "connect retry");
        let weak = self.weak.clone();
        self.reactor().timers().schedule_once(Nanos::now() + interval, move || {
            if let Some(socket) = weak.upgrade() {
                socket.retry_connect();
            }
        });
    }

    fn connect_finished(
        &self,
        inner: &mut Inner,
        deferred: &mut Deferred,
        result: Result<()>,
    ) {
        let Some(mut connect) = inner.connect.take() else {
            return;
        };
        let endpoint = match &result {
            Ok(()) => sys::peer_endpoint(self.fd()).ok().flatten(),
            Err(_) => Some(connect.target.clone()),
        };
        if result.is_ok() {
            inner.state = SocketState::Active;
            self.arm_readable_locked(inner);
        }
        if let Some(callback) = connect.callback.take() {
            deferred.push(Box::new(move || callback(ConnectEvent { result, endpoint })));
        }
    }

    /// Resolves `host` through the default resolver, then connects to the
    /// selected address. IP literals bypass resolution.
    pub fn connect_to_name<F>(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        options: ConnectOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(ConnectEvent) + Send + 'static,
    {
        if let Ok(literal) = host.parse::<std::net::IpAddr>() {
            return self.connect(&Endpoint::ip(literal.into(), port), &options, callback);
        }

        let resolver = crate::global::default_resolver()
            .ok_or(Error::new(ErrorKind::Unsupported))?;

        // The socket's transport pins the address family.
        let wanted = match self.transport.domain() {
            crate::endpoint::TransportDomain::Ipv4 => crate::endpoint::IpAddressType::V4,
            crate::endpoint::TransportDomain::Ipv6 => crate::endpoint::IpAddressType::V6,
            crate::endpoint::TransportDomain::Local => {
                return Err(Error::new(ErrorKind::InvalidArgument));
            }
        };

        let resolve_options = crate::resolve::ResolveOptions {
            transport: options.transport,
            ip_address_type: wanted,
            selector: None,
            deadline: options.deadline,
            recurse: options.recurse,
        };
        let weak = self.weak.clone();
        let selector = options.ip_address_selector;
        let fallback = options.ip_address_fallback;
        resolver.resolve_ip(
            host,
            resolve_options,
            Box::new(move |result| {
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                let chosen = match &result {
                    Ok(resolution) => crate::resolve::select(&resolution.addresses, selector),
                    Err(_) => None,
                }
                .or(fallback);
                match (chosen, result) {
                    (Some(address), _) => {
                        let endpoint = Endpoint::ip(address, port);
                        if socket.state() == SocketState::Attached {
                            if let Err(err) = socket.connect(&endpoint, &options, callback) {
                                warn!(%err, "connect after resolution failed");
                            }
                        } else {
                            callback(ConnectEvent {
                                result: Err(Error::new(ErrorKind::InvalidArgument)),
                                endpoint: Some(endpoint),
                            });
                        }
                    }
                    (None, Err(err)) => {
                        callback(ConnectEvent { result: Err(err), endpoint: None });
                    }
                    (None, Ok(_)) => callback(ConnectEvent {
                        result: Err(Error::new(ErrorKind::EndOfFile)),
                        endpoint: None,
                    }),
                }
            }),
        );
        Ok(())
    }

    /// Resolves `service` through the default resolver's port database,
    /// then connects to `host` on the selected port.
    pub fn connect_to_service<F>(
        self: &Arc<Self>,
        host: &str,
        service: &str,
        options: ConnectOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(ConnectEvent) + Send + 'static,
    {
        let resolver = crate::global::default_resolver()
            .ok_or(Error::new(ErrorKind::Unsupported))?;

        let resolve_options = crate::resolve::ResolveOptions {
            transport: options.transport,
            ip_address_type: options.ip_address_type,
            selector: None,
            deadline: options.deadline,
            recurse: options.recurse,
        };
        let weak = self.weak.clone();
        let owned_host = host.to_string();
        let port_selector = options.port_selector;
        let port_fallback = options.port_fallback;
        resolver.resolve_port(
            service,
            resolve_options,
            Box::new(move |result| {
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                let chosen = match &result {
                    Ok(ports) => crate::resolve::select(ports, port_selector),
                    Err(_) => None,
                }
                .or(port_fallback);
                match (chosen, result) {
                    (Some(port), _) => {
                        if let Err(err) =
                            socket.connect_to_name(&owned_host, port, options, callback)
                        {
                            warn!(%err, "connect after service resolution failed");
                        }
                    }
                    (None, Err(err)) => {
                        callback(ConnectEvent { result: Err(err), endpoint: None });
                    }
                    (None, Ok(_)) => callback(ConnectEvent {
                        result: Err(Error::new(ErrorKind::EndOfFile)),
                        endpoint: None,
                    }),
                }
            }),
        );
        Ok(())
    }

    /// Timer path: the connect deadline elapsed before completion.
    fn expire_connect(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.connect.is_some() {
                self.connect_finished(
                    &mut inner,
                    &mut deferred,
                    Err(Error::new(ErrorKind::TimedOut)),
                );
            }
        }
        run(deferred);
    }

    /// Timer path: re-attempt after a failed connect, on a fresh descriptor.
    fn retry_connect(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.connect.is_none() || inner.state != SocketState::Attached {
                return;
            }
            if let Err(err) = self.rebuild_fd(&mut inner) {
                self.connect_finished(&mut inner, &mut deferred, Err(err));
            } else {
                self.start_connect_attempt(&mut inner, &mut deferred);
            }
        }
        run(deferred);
    }

    /// A failed connect leaves the descriptor unusable; replace it.
    fn rebuild_fd(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        let reactor = self.reactor();
        let old = self.fd();
        let _ = reactor.detach(old);
        sys::close(old);
        inner.writable_armed = false;
        inner.readable_armed = false;

        let fd = sys::socket(self.transport)?;
        if let Err(err) = Self::prepare_fd(fd, &inner.options) {
            sys::close(fd);
            return Err(err);
        }
        self.fd.store(fd, Ordering::Relaxed);
        reactor.attach(fd, self.handler_weak())
    }

    /// Enqueues `data` for transmission; returns the entry id.
    ///
    /// `WouldBlock` reports a send queue at its high watermark.
    pub fn send(
        self: &Arc<Self>,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<u64> {
        let mut inner = self.lock_inner();
        inner.writable_for_user()?;
        if inner.state != SocketState::Active
            && inner.state != SocketState::ShuttingDownReceive
        {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let deadline = options.deadline;
        let (id, reached_high) = inner.send.enqueue(data, options, callback)?;
        if reached_high {
            self.announce_send_queue(&inner, SendQueueEvent::HighWatermark);
        }
        if let Some(deadline) = deadline {
            let weak = self.weak.clone();
            let timer = self.reactor().timers().schedule_once(deadline, move || {
                if let Some(socket) = weak.upgrade() {
                    socket.expire_send(id);
                }
            });
            inner.send.set_entry_timer(id, timer);
        }
        if !inner.writable_armed && !inner.write_limited {
            if let Err(err) = self.reactor().show_writable(self.fd()) {
                warn!(fd = self.fd(), %err, "failed to arm writable interest");
            } else {
                inner.writable_armed = true;
            }
        }
        Ok(id)
    }

    /// Posts a watermark announcement through the socket's reactor. Every
    /// announcement routes through that one executor while the socket lock
    /// is held, so handler invocations arrive in authorization order even
    /// when the authorizing threads differ.
    fn announce_send_queue(&self, inner: &Inner, event: SendQueueEvent) {
        if let Some(handler) = inner.send_queue_handler.clone() {
            self.reactor().execute(Box::new(move || handler(event)));
        }
    }

    /// Queues `progress`'s completions for dispatch and announces an
    /// authorized low-watermark event.
    fn collect_send(
        &self,
        inner: &Inner,
        progress: crate::queue::send::SendProgress,
        deferred: &mut Deferred,
    ) {
        if progress.low_watermark {
            self.announce_send_queue(inner, SendQueueEvent::LowWatermark);
        }
        for (callback, event) in progress.completions {
            deferred.push(Box::new(move || callback(event)));
        }
    }

    fn expire_send(self: &Arc<Self>, id: u64) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            let progress = inner.send.expire(id);
            self.collect_send(&inner, progress, &mut deferred);
        }
        run(deferred);
    }

    /// Registers a receive request. Completes immediately when queued data
    /// already satisfies `min_size` and no earlier waiter exists.
    pub fn receive<F>(self: &Arc<Self>, options: ReceiveOptions, callback: F) -> Result<()>
    where
        F: FnOnce(ReceiveEvent) + Send + 'static,
    {
        let mut inner = self.lock_inner();
        if let Some(error) = inner.error {
            return Err(error);
        }
        if inner.state == SocketState::Closed {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }

        let entry = CallbackEntry::new(
            Box::new(callback),
            options.token,
            options.deadline,
            options.min_size,
            options.max_size,
        );

        if inner.receive_waiters.is_empty() && inner.receive.satisfies(options.min_size) {
            entry.try_activate();
            let (data, progress) = inner
                .receive
                .splice(options.min_size, options.max_size)
                .expect("aggregate satisfies min");
            if progress.low_watermark {
                self.arm_readable_locked(&mut inner);
            }
            // Deliver on an I/O thread so completion order matches the
            // registration order seen by in-flight waiters.
            self.reactor().execute(Box::new(move || {
                entry.complete(ReceiveEvent { result: Ok(data), endpoint: None });
            }));
            return Ok(());
        }

        if inner.receive_down && inner.receive.is_empty() {
            entry.try_activate();
            self.reactor().execute(Box::new(move || {
                entry.complete(ReceiveEvent {
                    result: Err(Error::new(ErrorKind::EndOfFile)),
                    endpoint: None,
                });
            }));
            return Ok(());
        }

        if let Some(deadline) = options.deadline {
            let weak = self.weak.clone();
            let expiring = Arc::downgrade(&entry);
            let timer = self.reactor().timers().schedule_once(deadline, move || {
                if let (Some(socket), Some(entry)) = (weak.upgrade(), expiring.upgrade()) {
                    socket.expire_receive(&entry);
                }
            });
            entry.set_timer(timer);
        }
        inner.receive_waiters.push(entry);
        self.arm_readable_locked(&mut inner);
        Ok(())
    }

    fn expire_receive(self: &Arc<Self>, entry: &Arc<CallbackEntry<ReceiveEvent>>) {
        let expired = {
            let mut inner = self.lock_inner();
            if entry.try_cancel() {
                inner.receive_waiters.remove(entry);
                true
            } else {
                false
            }
        };
        if expired {
            entry.complete(ReceiveEvent {
                result: Err(Error::new(ErrorKind::TimedOut)),
                endpoint: None,
            });
        }
    }

    /// Cancels pending operations registered with `token`.
    pub fn cancel(self: &Arc<Self>, token: CancelToken) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            let progress = inner.send.cancel(token);
            self.collect_send(&inner, progress, &mut deferred);
            for entry in inner.receive_waiters.cancel(token) {
                deferred.push(Box::new(move || {
                    entry.complete(ReceiveEvent {
                        result: Err(Error::new(ErrorKind::Cancelled)),
                        endpoint: None,
                    });
                }));
            }
            if inner.connect.as_ref().is_some_and(|c| c.token == Some(token)) {
                self.connect_finished(
                    &mut inner,
                    &mut deferred,
                    Err(Error::new(ErrorKind::Cancelled)),
                );
            }
        }
        run(deferred);
    }

    /// Initiates shutdown of one direction.
    pub fn shutdown(self: &Arc<Self>, direction: ShutdownDirection) -> Result<()> {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.state == SocketState::Closed {
                return Err(Error::new(ErrorKind::InvalidArgument));
            }
            match direction {
                ShutdownDirection::Send => {
                    if inner.send_down || inner.shutdown_send_pending {
                        return Ok(());
                    }
                    if inner.send.is_empty() && !inner.send.has_zero_copy_parked() {
                        self.complete_send_shutdown(&mut inner, &mut deferred)?;
                    } else {
                        inner.shutdown_send_pending = true;
                        inner.recompute_state();
                    }
                }
                ShutdownDirection::Receive => {
                    if inner.receive_down {
                        return Ok(());
                    }
                    sys::shutdown(self.fd(), sys::ShutdownHow::Receive)?;
                    self.note_receive_down(&mut inner, &mut deferred);
                }
            }
        }
        run(deferred);
        Ok(())
    }

    fn complete_send_shutdown(
        &self,
        inner: &mut Inner,
        deferred: &mut Deferred,
    ) -> Result<()> {
        sys::shutdown(self.fd(), sys::ShutdownHow::Send)?;
        inner.send_down = true;
        inner.shutdown_send_pending = false;
        inner.recompute_state();
        if inner.writable_armed {
            let _ = self.reactor().hide_writable(self.fd());
            inner.writable_armed = false;
        }
        if let Some(handler) = inner.shutdown_handler.clone() {
            deferred.push(Box::new(move || {
                handler(ShutdownEvent { direction: ShutdownDirection::Send });
            }));
        }
        Ok(())
    }

    fn note_receive_down(&self, inner: &mut Inner, deferred: &mut Deferred) {
        inner.receive_down = true;
        if inner.readable_armed {
            let _ = self.reactor().hide_readable(self.fd());
            inner.readable_armed = false;
        }
        // Waiters that queued data can still satisfy complete normally;
        // the rest see end-of-file.
        loop {
            let Some(front) = inner.receive_waiters.front_pending() else {
                break;
            };
            let min = front.min_size();
            let max = front.max_size();
            let Some(entry) = inner.receive_waiters.pop_ready() else {
                break;
            };
            if inner.receive.satisfies(min) {
                let (data, _) = inner.receive.splice(min, max).expect("satisfied");
                deferred.push(Box::new(move || {
                    entry.complete(ReceiveEvent { result: Ok(data), endpoint: None });
                }));
            } else {
                deferred.push(Box::new(move || {
                    entry.complete(ReceiveEvent {
                        result: Err(Error::new(ErrorKind::EndOfFile)),
                        endpoint: None,
                    });
                }));
            }
        }
        if let Some(handler) = inner.shutdown_handler.clone() {
            deferred.push(Box::new(move || {
                handler(ShutdownEvent { direction: ShutdownDirection::Receive });
            }));
        }
        inner.recompute_state();
        // An already half-closed peer plus keep_half_open=false takes the
        // send side down with it.
        if !inner.options.keep_half_open
            && !inner.send_down
            && !inner.shutdown_send_pending
        {
            if inner.send.is_empty() && !inner.send.has_zero_copy_parked() {
                let _ = self.complete_send_shutdown(inner, deferred);
            } else {
                inner.shutdown_send_pending = true;
                inner.recompute_state();
            }
        }
    }

    /// Cancels everything pending and releases the descriptor.
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
            warn!(fd = self.fd(), %error, "stream socket failed");
            inner.error = Some(error);
            self.teardown(&mut inner, &mut deferred, error);
        }
        run(deferred);
    }

    /// Completes every pending operation with `error`, detaches, closes.
    fn teardown(&self, inner: &mut Inner, deferred: &mut Deferred, error: Error) {
        self.connect_finished(inner, deferred, Err(error));
        let progress = inner.send.fail_all(error);
        self.collect_send(inner, progress, deferred);
        for entry in inner.receive_waiters.drain_all() {
            deferred.push(Box::new(move || {
                entry.complete(ReceiveEvent { result: Err(error), endpoint: None });
            }));
        }
        inner.receive.clear();

        let fd = self.fd();
        let _ = self.reactor().detach(fd);
        sys::close(fd);
        inner.state = SocketState::Closed;
        inner.readable_armed = false;
        inner.writable_armed = false;
    }

    /// Moves the socket to another reactor, replaying its interest.
    pub fn migrate(self: &Arc<Self>, target: &Arc<Reactor>) -> Result<()> {
        let inner = self.lock_inner();
        let fd = self.fd();
        let old = {
            let mut reactor =
                self.reactor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let old = Arc::clone(&reactor);
            old.detach(fd)?;
            *reactor = Arc::clone(target);
            old
        };
        drop(old);
        target.attach(fd, self.handler_weak())?;
        if inner.readable_armed {
            target.show_readable(fd)?;
        }
        if inner.writable_armed {
            target.show_writable(fd)?;
        }
        Ok(())
    }

    fn reactor(&self) -> Arc<Reactor> {
        Arc::clone(&self.reactor.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn arm_readable(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        self.arm_readable_locked(&mut inner);
    }

    fn arm_readable_locked(&self, inner: &mut Inner) {
        if inner.readable_armed
            || inner.read_limited
            || inner.receive_down
            || inner.error.is_some()
            || inner.receive.saturated()
        {
            return;
        }
        match self.reactor().show_readable(self.fd()) {
            Ok(()) => inner.readable_armed = true,
            Err(err) => debug!(fd = self.fd(), %err, "failed to arm readable interest"),
        }
    }

    /// Timer path: the receive rate limiter drained enough to resume reads.
    fn resume_reads(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        inner.read_limited = false;
        self.arm_readable_locked(&mut inner);
    }

    /// Timer path: the send rate limiter drained enough to resume flushes.
    fn resume_writes(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        inner.write_limited = false;
        if !inner.send.is_empty() && !inner.writable_armed {
            if self.reactor().show_writable(self.fd()).is_ok() {
                inner.writable_armed = true;
            }
        }
    }

    fn process_readable(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.receive_down || inner.error.is_some() {
                drop(inner);
                run(deferred);
                return;
            }

            loop {
                if inner.receive.saturated() {
                    if inner.readable_armed {
                        let _ = self.reactor().hide_readable(self.fd());
                        inner.readable_armed = false;
                    }
                    break;
                }
                if let Some(limiter) = &inner.receive_limiter {
                    let now = Nanos::now();
                    if limiter.would_exceed(now) {
                        let wait = limiter.time_to_submit(now);
                        self.pause_reads(&mut inner, wait);
                        break;
                    }
                }

                match self.read_once(&mut inner) {
                    Ok(0) => {
                        self.note_receive_down(&mut inner, &mut deferred);
                        break;
                    }
                    Ok(n) => {
                        if let Some(limiter) = &mut inner.receive_limiter {
                            limiter.submit(n as u64, Nanos::now());
                        }
                        self.satisfy_receive_waiters(&mut inner, &mut deferred);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        drop(inner);
                        run(deferred);
                        self.fail(err);
                        return;
                    }
                }
            }
        }
        run(deferred);
    }

    /// One vectored read into freshly allocated pool buffers sized by the
    /// configured incoming transfer range.
    fn read_once(&self, inner: &mut Inner) -> Result<usize> {
        let buffer_size = self.pool.buffer_size();
        let max = inner
            .options
            .max_incoming_transfer_size
            .max(inner.options.min_incoming_transfer_size)
            .max(1)
            .next_multiple_of(buffer_size);
        let count = (max / buffer_size).clamp(1, sys::MAX_GATHER_BUFFERS);

        let mut buffers = Vec::with_capacity(count);
        let mut iovecs = Vec::with_capacity(count);
        for _ in 0..count {
            let buffer = self.pool.allocate();
            iovecs.push(libc::iovec {
                iov_base: buffer.data_ptr().cast(),
                iov_len: buffer_size,
            });
            buffers.push(buffer);
        }

        let (n, _) = sys::recv_msg(self.fd(), &iovecs)?;
        if n == 0 {
            return Ok(0);
        }

        let mut blob = Blob::new();
        let mut remaining = n;
        for buffer in buffers {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(buffer_size);
            blob.append_buffer(buffer, 0, take);
            remaining -= take;
        }
        let progress = inner.receive.push(Data::Blob(blob), None);
        if progress.high_watermark && inner.readable_armed {
            let _ = self.reactor().hide_readable(self.fd());
            inner.readable_armed = false;
        }
        Ok(n)
    }

    fn pause_reads(&self, inner: &mut Inner, wait: Nanos) {
        if inner.readable_armed {
            let _ = self.reactor().hide_readable(self.fd());
            inner.readable_armed = false;
        }
        inner.read_limited = true;
        let weak = self.weak.clone();
        self.reactor().timers().schedule_once(Nanos::now() + wait, move || {
            if let Some(socket) = weak.upgrade() {
                socket.resume_reads();
            }
        });
    }

    fn satisfy_receive_waiters(&self, inner: &mut Inner, deferred: &mut Deferred) {
        loop {
            let Some(front) = inner.receive_waiters.front_pending() else {
                return;
            };
            let min = front.min_size();
            let max = front.max_size();
            if !inner.receive.satisfies(min) {
                return;
            }
            let Some(entry) = inner.receive_waiters.pop_ready() else {
                return;
            };
            let (data, progress) = inner.receive.splice(min, max).expect("satisfied");
            if progress.low_watermark {
                self.arm_readable_locked(inner);
            }
            deferred.push(Box::new(move || {
                entry.complete(ReceiveEvent { result: Ok(data), endpoint: None });
            }));
        }
    }

    fn process_writable(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        let mut failure = None;
        {
            let mut inner = self.lock_inner();
            if inner.connect.is_some() {
                match sys::take_socket_error(self.fd()) {
                    Ok(None) => {
                        if inner.send.is_empty() && inner.writable_armed {
                            let _ = self.reactor().hide_writable(self.fd());
                            inner.writable_armed = false;
                        }
                        self.connect_finished(&mut inner, &mut deferred, Ok(()));
                    }
                    Ok(Some(err)) => self.connect_attempt_failed(&mut inner, &mut deferred, err),
                    Err(err) => self.connect_attempt_failed(&mut inner, &mut deferred, err),
                }
            } else {
                failure = self.flush_send(&mut inner, &mut deferred);
            }
        }
        run(deferred);
        if let Some(error) = failure {
            self.fail(error);
        }
    }

    /// Drains the send queue until the kernel pushes back. Returns a
    /// terminal error, if one occurred, for the caller to apply after
    /// releasing the lock.
    fn flush_send(&self, inner: &mut Inner, deferred: &mut Deferred) -> Option<Error> {
        loop {
            if inner.send.is_empty() {
                break;
            }
            if let Some(limiter) = &inner.send_limiter {
                let now = Nanos::now();
                if limiter.would_exceed(now) {
                    let wait = limiter.time_to_submit(now);
                    self.pause_writes(inner, wait);
                    return None;
                }
            }

            let Some(batch) =
                inner.send.prepare_batch(inner.options.max_gather_buffers, false)
            else {
                break;
            };
            let outcome = match batch {
                Batch::Gather { iovecs, zero_copy, .. } => {
                    sys::send_msg(self.fd(), &iovecs, None, zero_copy)
                        .map(|n| (n, zero_copy))
                }
                Batch::File(region) => sys::send_file(
                    self.fd(),
                    region.fd,
                    region.offset,
                    region.remaining as usize,
                )
                .map(|n| (n, false)),
            };
            match outcome {
                Ok((n, zero_copy)) => {
                    let progress = inner.send.consume(n, zero_copy);
                    self.collect_send(inner, progress, deferred);
                    if let Some(limiter) = &mut inner.send_limiter {
                        limiter.submit(n as u64, Nanos::now());
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return None,
                Err(err) => return Some(err),
            }
        }

        if inner.send.is_empty() {
            if inner.writable_armed {
                let _ = self.reactor().hide_writable(self.fd());
                inner.writable_armed = false;
            }
            if inner.shutdown_send_pending && !inner.send.has_zero_copy_parked() {
                let _ = self.complete_send_shutdown(inner, deferred);
            }
        }
        None
    }

    fn pause_writes(&self, inner: &mut Inner, wait: Nanos) {
        if inner.writable_armed {
            let _ = self.reactor().hide_writable(self.fd());
            inner.writable_armed = false;
        }
        inner.write_limited = true;
        let weak = self.weak.clone();
        self.reactor().timers().schedule_once(Nanos::now() + wait, move || {
            if let Some(socket) = weak.upgrade() {
                socket.resume_writes();
            }
        });
    }

    /// Harvests kernel zero-copy acknowledgements from the error queue.
    fn harvest_zero_copy(self: &Arc<Self>) {
        let ranges = match sys::recv_zero_copy_completions(self.fd()) {
            Ok(ranges) => ranges,
            Err(err) => {
                debug!(fd = self.fd(), %err, "error queue harvest failed");
                return;
            }
        };
        if ranges.is_empty() {
            return;
        }
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            let progress = inner.send.acknowledge_zero_copy(&ranges);
            self.collect_send(&inner, progress, &mut deferred);
            if inner.shutdown_send_pending
                && inner.send.is_empty()
                && !inner.send.has_zero_copy_parked()
            {
                let _ = self.complete_send_shutdown(&mut inner, &mut deferred);
            }
        }
        run(deferred);
    }
}

impl EventHandler for StreamSocket {
    fn handle_event(&self, event: &Event) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };

        let zero_copy_outstanding = {
            let inner = this.lock_inner();
            inner.send.has_zero_copy_outstanding()
        };
        if zero_copy_outstanding {
            this.harvest_zero_copy();
        }

        if let Some(error) = event.error {
            // During connect establishment the error feeds the retry
            // machinery; afterwards it is terminal.
            let retried = {
                let mut inner = this.lock_inner();
                if inner.connect.is_some() {
                    let mut deferred = Deferred::new();
                    this.connect_attempt_failed(&mut inner, &mut deferred, error);
                    Some(deferred)
                } else {
                    None
                }
            };
            match retried {
                Some(deferred) => run(deferred),
                None => this.fail(error),
            }
            return;
        }
        if event.writable {
            this.process_writable();
        }
        if event.readable || event.hangup {
            this.process_readable();
        }
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if inner.state != SocketState::Closed {
            let fd = self.fd();
            let _ = self.reactor().detach(fd);
            sys::close(fd);
            inner.state = SocketState::Closed;
        }
    }
}

fn run(deferred: Deferred) {
    for callback in deferred {
        callback();
    }
}
