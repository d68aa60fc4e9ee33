use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
};

use sockeye::{
    awaiter::awaitable,
    buffer::Data,
    endpoint::{Endpoint, IpAddress, IpEndpoint, Transport},
    error::ErrorKind,
    interface::{Interface, InterfaceConfig},
    queue::{
        receive::{ReceiveEvent, ReceiveOptions},
        send::SendOptions,
    },
    resolve::{Resolve, ResolveOptions, ResolutionSource},
    socket::DatagramSocketOptions,
};
use sockeye_resolver::{
    Resolver, ResolverConfig,
    protocol::{CLASS_IN, Message, Record, RecordData, RecordType, ResponseCode},
};
use sockeye_timing::{Duration, Nanos};

const SERVED_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 7);
const SERVED_TTL: u32 = 60;

/// Answers `known.test A` queries, NXDOMAINs everything else. Returns the
/// server endpoint and a stop flag.
fn start_fake_dns(
    interface: &Arc<Interface>,
    queries_seen: Arc<AtomicUsize>,
) -> (IpEndpoint, Arc<AtomicBool>) {
    let socket = interface
        .create_datagram_socket(
            Transport::UdpIpv4Datagram,
            DatagramSocketOptions {
                source_endpoint: Some("127.0.0.1:0".parse().unwrap()),
                ..DatagramSocketOptions::default()
            },
        )
        .unwrap();
    let endpoint = match socket.local_endpoint().unwrap().unwrap() {
        Endpoint::Ip(endpoint) => endpoint,
        Endpoint::Local(_) => unreachable!(),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stopped = Arc::clone(&stop);
    std::thread::spawn(move || {
        while !stopped.load(Ordering::Acquire) {
            let (callback, awaited) = awaitable::<ReceiveEvent>();
            if socket
                .receive(
                    ReceiveOptions {
                        deadline: Some(Nanos::now() + Nanos::from_millis(100)),
                        ..ReceiveOptions::default()
                    },
                    callback,
                )
                .is_err()
            {
                return;
            }
            let Ok(event) = awaited.wait(None) else { return };
            let Ok(data) = event.result else { continue };
            let Some(source) = event.endpoint else { continue };
            let Ok(query) = Message::decode(&data.copy_to_vec()) else { continue };
            let Some(question) = query.questions.first() else { continue };
            queries_seen.fetch_add(1, Ordering::Relaxed);

            let mut response = query.clone();
            response.response = true;
            response.recursion_available = true;
            if question.name == "known.test" && question.rtype == RecordType::A {
                response.answers = vec![Record {
                    name: question.name.clone(),
                    rtype: RecordType::A,
                    rclass: CLASS_IN,
                    ttl: SERVED_TTL,
                    data: RecordData::A(SERVED_ADDRESS),
                }];
            } else {
                response.rcode = ResponseCode::NameError;
            }

            let bytes = response.encode().unwrap();
            let _ = socket.send(
                Data::Bytes(bytes),
                SendOptions {
                    destination: Some(source),
                    ..SendOptions::default()
                },
                None,
            );
        }
        socket.close();
    });

    (endpoint, stop)
}

fn resolve_blocking(
    resolver: &Arc<Resolver>,
    name: &str,
    options: ResolveOptions,
) -> sockeye::Result<sockeye::resolve::IpResolution> {
    let (tx, rx) = mpsc::channel();
    resolver.resolve_ip(
        name,
        options,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv_timeout(std::time::Duration::from_secs(30)).expect("resolution completes")
}

#[test]
fn pipeline_cache_database_and_server() {
    let interface =
        Interface::create(InterfaceConfig { thread_count: 2, ..InterfaceConfig::default() })
            .unwrap();
    let queries_seen = Arc::new(AtomicUsize::new(0));
    let (server, stop) = start_fake_dns(&interface, Arc::clone(&queries_seen));

    let resolver = Resolver::new(
        Arc::clone(&interface),
        ResolverConfig {
            servers: vec![server],
            attempts: 2,
            timeout: Duration::from_secs(2),
            ..ResolverConfig::default()
        },
    );

    // IP literals never touch the wire.
    let literal = resolve_blocking(&resolver, "192.0.2.33", ResolveOptions::default()).unwrap();
    assert_eq!(literal.addresses, vec![IpAddress::V4(Ipv4Addr::new(192, 0, 2, 33))]);

    // Overrides win over everything.
    resolver
        .overrides()
        .insert("pinned.test", IpAddress::V4(Ipv4Addr::new(192, 0, 2, 99)));
    let pinned = resolve_blocking(&resolver, "pinned.test", ResolveOptions::default()).unwrap();
    assert_eq!(pinned.source, ResolutionSource::Overrides);

    // Static database answers without a query.
    resolver
        .host_database()
        .insert("static.test", IpAddress::V4(Ipv4Addr::new(192, 0, 2, 50)));
    let fixed = resolve_blocking(&resolver, "static.test", ResolveOptions::default()).unwrap();
    assert_eq!(fixed.source, ResolutionSource::Database);
    assert_eq!(queries_seen.load(Ordering::Relaxed), 0);

    // First wire lookup hits the server and seeds the cache.
    let first = resolve_blocking(&resolver, "known.test", ResolveOptions::default()).unwrap();
    assert_eq!(first.source, ResolutionSource::NameServer);
    assert_eq!(first.addresses, vec![IpAddress::V4(SERVED_ADDRESS)]);
    assert_eq!(first.ttl, Some(u64::from(SERVED_TTL)));
    let after_first = queries_seen.load(Ordering::Relaxed);
    assert!(after_first >= 1);

    // The second lookup is a cache hit: no further queries.
    let second = resolve_blocking(&resolver, "known.test", ResolveOptions::default()).unwrap();
    assert_eq!(second.source, ResolutionSource::Cache);
    assert_eq!(second.addresses, vec![IpAddress::V4(SERVED_ADDRESS)]);
    assert_eq!(queries_seen.load(Ordering::Relaxed), after_first);

    // The reverse index learned the mapping.
    assert_eq!(
        resolver.get_domain_name(&IpAddress::V4(SERVED_ADDRESS)).as_deref(),
        Some("known.test")
    );

    // NXDOMAIN arrives as EndOfFile and seeds the negative cache.
    let missing = resolve_blocking(&resolver, "missing.test", ResolveOptions::default());
    assert_eq!(missing.unwrap_err().kind(), ErrorKind::EndOfFile);
    let after_missing = queries_seen.load(Ordering::Relaxed);
    let again = resolve_blocking(&resolver, "missing.test", ResolveOptions::default());
    assert_eq!(again.unwrap_err().kind(), ErrorKind::EndOfFile);
    assert_eq!(queries_seen.load(Ordering::Relaxed), after_missing);

    stop.store(true, Ordering::Release);
    interface.shutdown();
    interface.linger();
}

#[test]
fn unresponsive_server_times_out() {
    let interface = Interface::create(InterfaceConfig::default()).unwrap();

    // A bound socket that never answers.
    let sink = interface
        .create_datagram_socket(
            Transport::UdpIpv4Datagram,
            DatagramSocketOptions {
                source_endpoint: Some("127.0.0.1:0".parse().unwrap()),
                ..DatagramSocketOptions::default()
            },
        )
        .unwrap();
    let server = match sink.local_endpoint().unwrap().unwrap() {
        Endpoint::Ip(endpoint) => endpoint,
        Endpoint::Local(_) => unreachable!(),
    };

    let resolver = Resolver::new(
        Arc::clone(&interface),
        ResolverConfig {
            servers: vec![server],
            attempts: 1,
            timeout: Duration::from_millis(200),
            ..ResolverConfig::default()
        },
    );

    let start = Nanos::now();
    let result = resolve_blocking(&resolver, "nobody.test", ResolveOptions::default());
    assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
    assert!(start.elapsed() >= Nanos::from_millis(150));

    sink.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn connect_by_name_through_the_default_resolver() {
    use sockeye::{
        queue::accept::AcceptOptions,
        socket::{AcceptEvent, ConnectEvent, ConnectOptions, ListenerOptions, StreamSocketOptions},
    };

    let interface =
        Interface::create(InterfaceConfig { thread_count: 2, ..InterfaceConfig::default() })
            .unwrap();

    let resolver = Resolver::new(Arc::clone(&interface), ResolverConfig::default());
    resolver
        .overrides()
        .insert("pinned.local", IpAddress::V4(Ipv4Addr::LOCALHOST));
    resolver.install_as_default().unwrap();
    interface.set_resolver(resolver.clone());
    assert!(interface.resolver().is_some());

    let listener = interface
        .create_listener_socket(
            Transport::TcpIpv4Stream,
            ListenerOptions {
                source_endpoint: Some("127.0.0.1:0".parse().unwrap()),
                ..ListenerOptions::default()
            },
        )
        .unwrap();
    listener.listen().unwrap();
    let port = match listener.local_endpoint().unwrap().unwrap() {
        Endpoint::Ip(endpoint) => endpoint.port,
        Endpoint::Local(_) => unreachable!(),
    };

    let (accept_cb, accepted) = awaitable::<AcceptEvent>();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    let client = interface
        .create_stream_socket(Transport::TcpIpv4Stream, StreamSocketOptions::default())
        .unwrap();
    let (connect_cb, connected) = awaitable::<ConnectEvent>();
    client
        .connect_to_name("pinned.local", port, ConnectOptions::default(), connect_cb)
        .unwrap();

    let deadline = Some(Nanos::now() + Nanos::from_secs(10));
    connected.wait(deadline).unwrap().result.unwrap();
    let server = accepted.wait(deadline).unwrap().result.unwrap();

    // Service-name connects go through the port database.
    resolver
        .port_database()
        .insert("pinned-svc", sockeye::endpoint::TransportProtocol::Tcp, port);
    let (accept_cb, accepted_second) = awaitable::<AcceptEvent>();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    let second = interface
        .create_stream_socket(Transport::TcpIpv4Stream, StreamSocketOptions::default())
        .unwrap();
    let (connect_cb, connected_second) = awaitable::<ConnectEvent>();
    second
        .connect_to_service("pinned.local", "pinned-svc", ConnectOptions::default(), connect_cb)
        .unwrap();
    connected_second.wait(deadline).unwrap().result.unwrap();
    let second_server = accepted_second.wait(deadline).unwrap().result.unwrap();

    client.close();
    server.close();
    second.close();
    second_server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn port_lookup_uses_the_service_database() {
    let interface = Interface::create(InterfaceConfig::default()).unwrap();
    let resolver = Resolver::new(Arc::clone(&interface), ResolverConfig::default());
    resolver.port_database().insert(
        "metrics",
        sockeye::endpoint::TransportProtocol::Tcp,
        9100,
    );

    let (tx, rx) = mpsc::channel();
    resolver.resolve_port(
        "metrics",
        ResolveOptions::default(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert_eq!(rx.recv().unwrap().unwrap(), vec![9100]);

    let (tx, rx) = mpsc::channel();
    resolver.resolve_port(
        "8080",
        ResolveOptions::default(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert_eq!(rx.recv().unwrap().unwrap(), vec![8080]);

    interface.shutdown();
    interface.linger();
}
