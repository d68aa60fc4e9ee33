//! Message-oriented sockets over UDP or the local domain.
//!
//! Datagram sockets are usable as soon as they are attached: `send` with a
//! destination targets unconnected peers, `connect` pins a default peer.
//! Each received datagram forms exactly one receive-queue entry and fulfils
//! exactly one callback; send batches never span entries so message
//! boundaries survive.

use std::{
    os::fd::RawFd,
    sync::{Arc, Mutex, Weak},
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
        receive::{ReceiveEvent, ReceiveOptions, ReceiveQueue},
        send::{Batch, SendCallback, SendOptions, SendQueue},
    },
    reactor::{Event, EventHandler, Reactor},
    socket::{SendQueueEvent, ShutdownDirection, SocketState, config::DatagramSocketOptions},
    sys,
};

type Deferred = Vec<Box<dyn FnOnce() + Send>>;
type SendQueueHandler = Arc<dyn Fn(SendQueueEvent) + Send + Sync>;

struct Inner {
    state: SocketState,
    options: DatagramSocketOptions,
    send: SendQueue,
    receive: ReceiveQueue,
    receive_waiters: CallbackQueue<ReceiveEvent>,
    send_limiter: Option<RateLimiter>,
    receive_limiter: Option<RateLimiter>,
    send_queue_handler: Option<SendQueueHandler>,
    writable_armed: bool,
    readable_armed: bool,
    read_limited: bool,
    write_limited: bool,
    send_down: bool,
    receive_down: bool,
    error: Option<Error>,
}

/// An asynchronous datagram socket.
pub struct DatagramSocket {
    fd: RawFd,
    transport: Transport,
    pool: BufferPool,
    reactor: Mutex<Arc<Reactor>>,
    weak: Weak<DatagramSocket>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("fd", &self.fd)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl DatagramSocket {
    pub(crate) fn create(
        transport: Transport,
        options: DatagramSocketOptions,
        pool: BufferPool,
        reactor: Arc<Reactor>,
    ) -> Result<Arc<Self>> {
        let fd = sys::socket(transport)?;
        if let Err(err) = options.config.apply(fd) {
            sys::close(fd);
            return Err(err);
        }
        if let Some(source) = &options.source_endpoint {
            if let Err(err) = sys::bind(fd, source) {
                sys::close(fd);
                return Err(err);
            }
        }

        let send =
            SendQueue::new(options.send_queue_low_watermark, options.send_queue_high_watermark);
        let receive = ReceiveQueue::new(
            options.receive_queue_low_watermark,
            options.receive_queue_high_watermark,
        );
        let socket = Arc::new_cyclic(|weak| Self {
            fd,
            transport,
            pool,
            reactor: Mutex::new(reactor),
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                state: SocketState::Detached,
                options,
                send,
                receive,
                receive_waiters: CallbackQueue::new(),
                send_limiter: None,
                receive_limiter: None,
                send_queue_handler: None,
                writable_armed: false,
                readable_armed: false,
                read_limited: false,
                write_limited: false,
                send_down: false,
                receive_down: false,
                error: None,
            }),
        });
        socket.reactor().attach(fd, socket.handler_weak())?;
        {
            let mut inner = socket.lock_inner();
            inner.state = SocketState::Active;
        }
        socket.arm_readable();
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

    pub fn local_endpoint(&self) -> Result<Option<Endpoint>> {
        sys::local_endpoint(self.fd)
    }

    pub fn peer_endpoint(&self) -> Result<Option<Endpoint>> {
        sys::peer_endpoint(self.fd)
    }

    pub fn set_send_rate_limiter(&self, limiter: RateLimiter) {
        self.lock_inner().send_limiter = Some(limiter);
    }

    pub fn set_receive_rate_limiter(&self, limiter: RateLimiter) {
        self.lock_inner().receive_limiter = Some(limiter);
    }

    /// Registers a handler for send-queue watermark announcements,
    /// delivered on an I/O thread in authorization order.
    pub fn set_send_queue_handler<F>(&self, handler: F)
    where
        F: Fn(SendQueueEvent) + Send + Sync + 'static,
    {
        self.lock_inner().send_queue_handler = Some(Arc::new(handler));
    }

    /// Pins a default peer; subsequent sends may omit the destination and
    /// receives are filtered to this peer by the kernel.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let inner = self.lock_inner();
        if let Some(error) = inner.error {
            return Err(error);
        }
        // Datagram connect only records the peer; it completes immediately.
        match sys::connect(self.fd, endpoint) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Enqueues one datagram. `options.destination` targets a peer on
    /// unconnected sockets.
    pub fn send(
        self: &Arc<Self>,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<u64> {
        let mut inner = self.lock_inner();
        if let Some(error) = inner.error {
            return Err(error);
        }
        if inner.send_down || inner.state != SocketState::Active {
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
            if let Err(err) = self.reactor().show_writable(self.fd) {
                warn!(fd = self.fd, %err, "failed to arm writable interest");
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

    /// Registers a receive request; one queued datagram fulfils it.
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

        if inner.receive_waiters.is_empty() && !inner.receive.is_empty() {
            entry.try_activate();
            let (data, endpoint, progress) =
                inner.receive.pop_datagram().expect("non-empty");
            if progress.low_watermark {
                self.arm_readable_locked(&mut inner);
            }
            self.reactor().execute(Box::new(move || {
                entry.complete(ReceiveEvent { result: Ok(data), endpoint });
            }));
            return Ok(());
        }

        if inner.receive_down {
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
        }
        run(deferred);
    }

    pub fn shutdown(self: &Arc<Self>, direction: ShutdownDirection) -> Result<()> {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            if inner.state == SocketState::Closed {
                return Err(Error::new(ErrorKind::InvalidArgument));
            }
            match direction {
                ShutdownDirection::Send => {
                    if inner.send_down {
                        return Ok(());
                    }
                    sys::shutdown(self.fd, sys::ShutdownHow::Send)?;
                    inner.send_down = true;
                    let progress = inner.send.fail_all(Error::new(ErrorKind::Cancelled));
                    self.collect_send(&inner, progress, &mut deferred);
                    if inner.writable_armed {
                        let _ = self.reactor().hide_writable(self.fd);
                        inner.writable_armed = false;
                    }
                }
                ShutdownDirection::Receive => {
                    if inner.receive_down {
                        return Ok(());
                    }
                    sys::shutdown(self.fd, sys::ShutdownHow::Receive)?;
                    inner.receive_down = true;
                    if inner.readable_armed {
                        let _ = self.reactor().hide_readable(self.fd);
                        inner.readable_armed = false;
                    }
                    for entry in inner.receive_waiters.drain_all() {
                        deferred.push(Box::new(move || {
                            entry.complete(ReceiveEvent {
                                result: Err(Error::new(ErrorKind::EndOfFile)),
                                endpoint: None,
                            });
                        }));
                    }
                }
            }
            inner.state = match (inner.send_down, inner.receive_down) {
                (true, true) => SocketState::ShutDown,
                (true, false) => SocketState::ShuttingDownSend,
                (false, true) => SocketState::ShuttingDownReceive,
                (false, false) => inner.state,
            };
        }
        run(deferred);
        Ok(())
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
            warn!(fd = self.fd, %error, "datagram socket failed");
            inner.error = Some(error);
            self.teardown(&mut inner, &mut deferred, error);
        }
        run(deferred);
    }

    fn teardown(&self, inner: &mut Inner, deferred: &mut Deferred, error: Error) {
        let progress = inner.send.fail_all(error);
        self.collect_send(inner, progress, deferred);
        for entry in inner.receive_waiters.drain_all() {
            deferred.push(Box::new(move || {
                entry.complete(ReceiveEvent { result: Err(error), endpoint: None });
            }));
        }
        inner.receive.clear();
        let _ = self.reactor().detach(self.fd);
        sys::close(self.fd);
        inner.state = SocketState::Closed;
        inner.readable_armed = false;
        inner.writable_armed = false;
    }

    /// Moves the socket to another reactor, replaying its interest.
    pub fn migrate(self: &Arc<Self>, target: &Arc<Reactor>) -> Result<()> {
        let inner = self.lock_inner();
        let old = {
            let mut reactor =
                self.reactor.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let old = Arc::clone(&reactor);
            old.detach(self.fd)?;
            *reactor = Arc::clone(target);
            old
        };
        drop(old);
        target.attach(self.fd, self.handler_weak())?;
        if inner.readable_armed {
            target.show_readable(self.fd)?;
        }
        if inner.writable_armed {
            target.show_writable(self.fd)?;
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
        match self.reactor().show_readable(self.fd) {
            Ok(()) => inner.readable_armed = true,
            Err(err) => debug!(fd = self.fd, %err, "failed to arm readable interest"),
        }
    }

    fn resume_reads(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        inner.read_limited = false;
        self.arm_readable_locked(&mut inner);
    }

    fn resume_writes(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        inner.write_limited = false;
        if !inner.send.is_empty() && !inner.writable_armed {
            if self.reactor().show_writable(self.fd).is_ok() {
                inner.writable_armed = true;
            }
        }
    }

    fn process_readable(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        let mut failure = None;
        {
            let mut inner = self.lock_inner();
            if inner.receive_down || inner.error.is_some() {
                return;
            }

            loop {
                if inner.receive.saturated() {
                    if inner.readable_armed {
                        let _ = self.reactor().hide_readable(self.fd);
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

                match self.read_one_datagram(&mut inner) {
                    Ok(n) => {
                        if let Some(limiter) = &mut inner.receive_limiter {
                            limiter.submit(n as u64, Nanos::now());
                        }
                        self.satisfy_waiters(&mut inner, &mut deferred);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
        run(deferred);
        if let Some(error) = failure {
            self.fail(error);
        }
    }

    /// Reads exactly one datagram, scattered across pool buffers.
    fn read_one_datagram(&self, inner: &mut Inner) -> Result<usize> {
        let buffer_size = self.pool.buffer_size();
        let max = inner.options.max_incoming_transfer_size.max(1).next_multiple_of(buffer_size);
        let count = (max / buffer_size).clamp(1, sys::MAX_GATHER_BUFFERS);

        let mut buffers = Vec::with_capacity(count);
        let mut iovecs = Vec::with_capacity(count);
        for _ in 0..count {
            let buffer = self.pool.allocate();
            iovecs.push(libc::iovec { iov_base: buffer.data_ptr().cast(), iov_len: buffer_size });
            buffers.push(buffer);
        }

        let (n, source) = sys::recv_msg(self.fd, &iovecs)?;

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
        let progress = inner.receive.push(Data::Blob(blob), source);
        if progress.high_watermark && inner.readable_armed {
            let _ = self.reactor().hide_readable(self.fd);
            inner.readable_armed = false;
        }
        Ok(n)
    }

    fn pause_reads(&self, inner: &mut Inner, wait: Nanos) {
        if inner.readable_armed {
            let _ = self.reactor().hide_readable(self.fd);
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

    fn satisfy_waiters(&self, inner: &mut Inner, deferred: &mut Deferred) {
        while !inner.receive.is_empty() {
            if inner.receive_waiters.front_pending().is_none() {
                return;
            }
            let Some(entry) = inner.receive_waiters.pop_ready() else {
                return;
            };
            let (data, endpoint, progress) =
                inner.receive.pop_datagram().expect("non-empty");
            if progress.low_watermark {
                self.arm_readable_locked(inner);
            }
            deferred.push(Box::new(move || {
                entry.complete(ReceiveEvent { result: Ok(data), endpoint });
            }));
        }
    }

    fn process_writable(self: &Arc<Self>) {
        let mut deferred = Deferred::new();
        let mut failure = None;
        {
            let mut inner = self.lock_inner();
            loop {
                if inner.send.is_empty() {
                    break;
                }
                if let Some(limiter) = &inner.send_limiter {
                    let now = Nanos::now();
                    if limiter.would_exceed(now) {
                        let wait = limiter.time_to_submit(now);
                        self.pause_writes(&mut inner, wait);
                        break;
                    }
                }

                // Message-oriented: one entry per syscall.
                let Some(batch) =
                    inner.send.prepare_batch(inner.options.max_gather_buffers, true)
                else {
                    break;
                };
                let outcome = match batch {
                    Batch::Gather { iovecs, zero_copy, destination } => {
                        sys::send_msg(self.fd, &iovecs, destination.as_ref(), zero_copy)
                            .map(|n| (n, zero_copy))
                    }
                    Batch::File(region) => {
                        sys::send_file(self.fd, region.fd, region.offset, region.remaining as usize)
                            .map(|n| (n, false))
                    }
                };
                match outcome {
                    Ok((n, zero_copy)) => {
                        let progress = inner.send.consume(n, zero_copy);
                        self.collect_send(&inner, progress, &mut deferred);
                        if let Some(limiter) = &mut inner.send_limiter {
                            limiter.submit(n as u64, Nanos::now());
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            if failure.is_none() && inner.send.is_empty() && inner.writable_armed {
                let _ = self.reactor().hide_writable(self.fd);
                inner.writable_armed = false;
            }
        }
        run(deferred);
        if let Some(error) = failure {
            self.fail(error);
        }
    }

    fn pause_writes(&self, inner: &mut Inner, wait: Nanos) {
        if inner.writable_armed {
            let _ = self.reactor().hide_writable(self.fd);
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
        let ranges = match sys::recv_zero_copy_completions(self.fd) {
            Ok(ranges) => ranges,
            Err(err) => {
                debug!(fd = self.fd, %err, "error queue harvest failed");
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
        }
        run(deferred);
    }
}

impl EventHandler for DatagramSocket {
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
            this.fail(error);
            return;
        }
        if event.writable {
            this.process_writable();
        }
        if event.readable {
            this.process_readable();
        }
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if inner.state != SocketState::Closed {
            let _ = self.reactor().detach(self.fd);
            sys::close(self.fd);
            inner.state = SocketState::Closed;
        }
    }
}

fn run(deferred: Deferred) {
    for callback in deferred {
        callback();
    }
}
