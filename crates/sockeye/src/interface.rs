//! The interface: a pool of I/O worker threads driving reactors, plus
//! socket factories and load balancing.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use serde::{Deserialize, Serialize};
use sockeye_timing::{Duration, Nanos, Repeater};
use sockeye_utils::ThreadPriority;
use tracing::{debug, info, warn};

use crate::{
    buffer::BufferPool,
    endpoint::Transport,
    error::{Error, ErrorKind, Result},
    metrics::{Metric, Monitorable, MonitorableRegistry},
    reactor::Reactor,
    resolve::Resolve,
    socket::{
        DatagramSocket, ListenerSocket, StreamSocket,
        config::{DatagramSocketOptions, ListenerOptions, StreamSocketOptions},
    },
};

/// How sockets are assigned to reactors at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadBalancing {
    /// Rotate through the reactors.
    #[default]
    RoundRobin,
    /// Pick the reactor with the fewest attached sockets.
    LeastLoaded,
    /// Pin to the reactor driven by the named worker thread.
    ThreadAffinity(String),
}

/// Interface construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Worker threads. Each drives exactly one reactor.
    pub thread_count: usize,
    /// Reactors; capped by `thread_count`. Defaults to one per thread.
    pub reactor_count: Option<usize>,
    pub thread_name: String,
    pub load_balancing: LoadBalancing,
    /// Optional core pins, one per worker.
    pub cores: Option<Vec<usize>>,
    #[serde(skip)]
    pub thread_priority: ThreadPriority,
    /// Size of buffers in the interface's pool.
    pub buffer_size: usize,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            reactor_count: None,
            thread_name: "sockeye-io".to_string(),
            load_balancing: LoadBalancing::RoundRobin,
            cores: None,
            thread_priority: ThreadPriority::OsDefault,
            buffer_size: BufferPool::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Owns the worker threads and reactors behind every socket it creates.
pub struct Interface {
    config: InterfaceConfig,
    pool: BufferPool,
    reactors: Vec<Arc<Reactor>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Worker thread name to the reactor it drives.
    thread_reactors: HashMap<String, usize>,
    running: Arc<AtomicBool>,
    admitting: AtomicBool,
    round_robin: AtomicUsize,
    resolver: Mutex<Option<Arc<dyn Resolve>>>,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("config", &self.config)
            .field("reactors", &self.reactors.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Interface {
    /// Builds the reactors and starts the worker threads.
    pub fn create(config: InterfaceConfig) -> Result<Arc<Self>> {
        let thread_count = config.thread_count.max(1);
        let reactor_count = config.reactor_count.unwrap_or(thread_count).clamp(1, thread_count);

        let mut reactors = Vec::with_capacity(reactor_count);
        for index in 0..reactor_count {
            reactors.push(Reactor::with_index(index)?);
        }

        let mut thread_reactors = HashMap::new();
        for worker in 0..thread_count {
            thread_reactors.insert(format!("{}-{worker}", config.thread_name), worker % reactor_count);
        }

        let interface = Arc::new(Self {
            pool: BufferPool::new(config.buffer_size),
            reactors,
            workers: Mutex::new(Vec::with_capacity(thread_count)),
            thread_reactors,
            running: Arc::new(AtomicBool::new(true)),
            admitting: AtomicBool::new(true),
            round_robin: AtomicUsize::new(0),
            resolver: Mutex::new(None),
            config,
        });

        let mut workers =
            interface.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for worker in 0..thread_count {
            let name = format!("{}-{worker}", interface.config.thread_name);
            let reactor = Arc::clone(&interface.reactors[worker % reactor_count]);
            let running = Arc::clone(&interface.running);
            let core = interface.config.cores.as_ref().and_then(|cores| cores.get(worker).copied());
            let priority = interface.config.thread_priority;
            let collect_metrics = worker == 0;
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    sockeye_utils::thread_boot(core, priority);
                    debug!(worker = %name, "worker started");
                    drive(&reactor, &running, collect_metrics);
                    debug!(worker = %name, "worker stopped");
                })
                .map_err(|_| Error::new(ErrorKind::Limit))?;
            workers.push(handle);
        }
        drop(workers);

        MonitorableRegistry::global()
            .register(Arc::downgrade(&interface) as std::sync::Weak<dyn Monitorable>);
        info!(threads = thread_count, reactors = reactor_count, "interface started");
        Ok(interface)
    }

    /// The interface's buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Installs the resolver consulted by connect-by-name.
    pub fn set_resolver(&self, resolver: Arc<dyn Resolve>) {
        let mut slot = self.resolver.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(resolver);
    }

    pub fn resolver(&self) -> Option<Arc<dyn Resolve>> {
        self.resolver.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Chooses a reactor per the configured policy.
    pub fn choose_reactor(&self) -> Arc<Reactor> {
        self.choose_with(&self.config.load_balancing)
    }

    pub(crate) fn choose_with(&self, policy: &LoadBalancing) -> Arc<Reactor> {
        match policy {
            LoadBalancing::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                Arc::clone(&self.reactors[index % self.reactors.len()])
            }
            LoadBalancing::LeastLoaded => {
                let reactor = self
                    .reactors
                    .iter()
                    .min_by_key(|reactor| reactor.load())
                    .expect("at least one reactor");
                Arc::clone(reactor)
            }
            LoadBalancing::ThreadAffinity(thread_name) => {
                match self.thread_reactors.get(thread_name) {
                    Some(index) => Arc::clone(&self.reactors[*index]),
                    None => {
                        warn!(thread = %thread_name, "unknown affinity thread, falling back");
                        self.choose_with(&LoadBalancing::RoundRobin)
                    }
                }
            }
        }
    }

    fn check_admitting(&self) -> Result<()> {
        if self.admitting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Cancelled))
        }
    }

    /// Creates a stream socket bound to a reactor chosen by policy.
    pub fn create_stream_socket(
        &self,
        transport: Transport,
        options: StreamSocketOptions,
    ) -> Result<Arc<StreamSocket>> {
        self.check_admitting()?;
        StreamSocket::create(transport, options, self.pool.clone(), self.choose_reactor())
    }

    /// Creates a datagram socket bound to a reactor chosen by policy.
    pub fn create_datagram_socket(
        &self,
        transport: Transport,
        options: DatagramSocketOptions,
    ) -> Result<Arc<DatagramSocket>> {
        self.check_admitting()?;
        DatagramSocket::create(transport, options, self.pool.clone(), self.choose_reactor())
    }

    /// Creates a listener whose accepted sockets are spread by policy.
    pub fn create_listener_socket(
        self: &Arc<Self>,
        transport: Transport,
        options: ListenerOptions,
    ) -> Result<Arc<ListenerSocket>> {
        self.check_admitting()?;
        let placer = Arc::downgrade(self);
        let fallback = self.choose_reactor();
        let policy = options.load_balancing.clone();
        let placement = Box::new(move || match placer.upgrade() {
            Some(interface) => match &policy {
                Some(policy) => interface.choose_with(policy),
                None => interface.choose_reactor(),
            },
            None => Arc::clone(&fallback),
        });
        ListenerSocket::create(
            transport,
            options,
            self.pool.clone(),
            self.choose_reactor(),
            placement,
        )
    }

    /// Moves `socket` onto `target_reactor` (an index into this
    /// interface's reactors), replaying its interest.
    pub fn migrate_stream_socket(
        &self,
        socket: &Arc<StreamSocket>,
        target_reactor: usize,
    ) -> Result<()> {
        let target = self
            .reactors
            .get(target_reactor)
            .ok_or(Error::new(ErrorKind::InvalidArgument))?;
        socket.migrate(target)
    }

    pub fn reactor_count(&self) -> usize {
        self.reactors.len()
    }

    /// Stops admitting sockets and asks every worker to exit its wait
    /// loop. Idempotent.
    pub fn shutdown(&self) {
        self.admitting.store(false, Ordering::Release);
        if self.running.swap(false, Ordering::AcqRel) {
            info!("interface shutting down");
        }
        for reactor in &self.reactors {
            reactor.wake();
        }
    }

    /// Joins every worker thread. Call after `shutdown`.
    pub fn linger(&self) {
        let handles = {
            let mut workers =
                self.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Monitorable for Interface {
    fn object_name(&self) -> String {
        format!("interface.{}", self.config.thread_name)
    }

    fn snapshot(&self) -> Vec<Metric> {
        let mut metrics = vec![
            Metric::gauge("reactors", self.reactors.len() as i64),
            Metric::gauge("sockets", self.reactors.iter().map(|r| r.load()).sum::<usize>() as i64),
            Metric::counter("buffers_pooled", self.pool.num_pooled()),
            Metric::gauge("buffers_in_use", self.pool.num_allocated() as i64),
            Metric::gauge("buffer_bytes_in_use", self.pool.num_bytes_in_use() as i64),
        ];
        for reactor in &self.reactors {
            metrics.push(Metric::gauge("reactor_load", reactor.load() as i64));
        }
        metrics
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.shutdown();
        self.linger();
    }
}

/// One worker's loop: wait for conditions, dispatch handlers, fire due
/// timers, drain deferred work. One worker per interface also feeds the
/// monitorable registry.
fn drive(reactor: &Arc<Reactor>, running: &AtomicBool, collect_metrics: bool) {
    let mut metrics_pacer = Repeater::every(Duration::from_secs(5));
    metrics_pacer.reset();

    while running.load(Ordering::Acquire) {
        let deadline = reactor
            .next_timer_deadline()
            .unwrap_or_else(|| Nanos::now() + Nanos::from_millis(500));

        match reactor.wait(Some(deadline)) {
            Ok(events) => {
                for event in &events {
                    if let Some(handler) = reactor.handler(event.fd) {
                        handler.handle_event(event);
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!(%err, "reactor wait failed");
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }

        reactor.fire_due_timers();
        reactor.run_deferred();
        if collect_metrics && metrics_pacer.fired() {
            MonitorableRegistry::global().collect();
        }
    }

    // Final drain so work posted during shutdown still runs.
    reactor.fire_due_timers();
    reactor.run_deferred();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_stops_cleanly() {
        let interface = Interface::create(InterfaceConfig {
            thread_count: 2,
            ..InterfaceConfig::default()
        })
        .unwrap();
        assert_eq!(interface.reactor_count(), 2);

        interface.shutdown();
        interface.linger();
    }

    #[test]
    fn round_robin_rotates_reactors() {
        let interface = Interface::create(InterfaceConfig {
            thread_count: 2,
            ..InterfaceConfig::default()
        })
        .unwrap();

        let first = interface.choose_reactor();
        let second = interface.choose_reactor();
        let third = interface.choose_reactor();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));

        interface.shutdown();
        interface.linger();
    }

    #[test]
    fn admissions_stop_after_shutdown() {
        let interface = Interface::create(InterfaceConfig::default()).unwrap();
        interface.shutdown();
        let err = interface
            .create_datagram_socket(
                Transport::UdpIpv4Datagram,
                DatagramSocketOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        interface.linger();
    }

    #[test]
    fn least_loaded_prefers_idle_reactor() {
        let interface = Interface::create(InterfaceConfig {
            thread_count: 2,
            load_balancing: LoadBalancing::LeastLoaded,
            ..InterfaceConfig::default()
        })
        .unwrap();

        // Attach one socket; the next choice must avoid its reactor.
        let socket = interface
            .create_datagram_socket(Transport::UdpIpv4Datagram, DatagramSocketOptions::default())
            .unwrap();
        let busy = interface.reactors.iter().position(|r| r.load() > 0).unwrap();
        let chosen = interface.choose_reactor();
        assert!(!Arc::ptr_eq(&chosen, &interface.reactors[busy]));

        socket.close();
        interface.shutdown();
        interface.linger();
    }
}
