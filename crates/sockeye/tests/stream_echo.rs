use std::sync::Arc;

use sockeye::{
    awaiter::awaitable,
    buffer::Data,
    endpoint::{Endpoint, Transport},
    interface::{Interface, InterfaceConfig},
    queue::{
        accept::AcceptOptions,
        receive::{ReceiveEvent, ReceiveOptions},
        send::SendOptions,
    },
    socket::{
        AcceptEvent, ConnectEvent, ConnectOptions, ListenerOptions, ShutdownDirection,
        SocketState, StreamSocket, StreamSocketOptions,
    },
};
use sockeye_timing::Nanos;

const MESSAGE: &[u8] = b"Hello, world!";

fn deadline() -> Option<Nanos> {
    Some(Nanos::now() + Nanos::from_secs(10))
}

fn start_interface() -> Arc<Interface> {
    Interface::create(InterfaceConfig { thread_count: 2, ..InterfaceConfig::default() }).unwrap()
}

fn listen_local(interface: &Arc<Interface>) -> (Arc<sockeye::socket::ListenerSocket>, Endpoint) {
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
    let endpoint = listener.local_endpoint().unwrap().unwrap();
    (listener, endpoint)
}

fn connect_pair(
    interface: &Arc<Interface>,
    listener: &Arc<sockeye::socket::ListenerSocket>,
    endpoint: &Endpoint,
) -> (Arc<StreamSocket>, Arc<StreamSocket>) {
    let (accept_cb, accepted) = awaitable::<AcceptEvent>();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    let client = interface
        .create_stream_socket(Transport::TcpIpv4Stream, StreamSocketOptions::default())
        .unwrap();
    let (connect_cb, connected) = awaitable::<ConnectEvent>();
    client.connect(endpoint, &ConnectOptions::default(), connect_cb).unwrap();

    connected.wait(deadline()).unwrap().result.unwrap();
    let server = accepted.wait(deadline()).unwrap().result.unwrap();
    (client, server)
}

#[test]
fn stream_echo() {
    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    client.send(Data::from(MESSAGE), SendOptions::default(), None).unwrap();

    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    server
        .receive(
            ReceiveOptions {
                min_size: MESSAGE.len(),
                max_size: MESSAGE.len(),
                deadline: deadline(),
                ..ReceiveOptions::default()
            },
            recv_cb,
        )
        .unwrap();

    let event = received.wait(deadline()).unwrap();
    let data = event.result.unwrap();
    assert_eq!(data.len(), 13);
    assert_eq!(data.copy_to_vec(), MESSAGE);

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn stream_echo_round_trip() {
    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    // Server echoes whatever arrives back to the client.
    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    server.receive(ReceiveOptions::default(), recv_cb).unwrap();
    client.send(Data::from(MESSAGE), SendOptions::default(), None).unwrap();

    let inbound = received.wait(deadline()).unwrap().result.unwrap();
    server.send(inbound, SendOptions::default(), None).unwrap();

    let (echo_cb, echoed) = awaitable::<ReceiveEvent>();
    client
        .receive(
            ReceiveOptions {
                min_size: MESSAGE.len(),
                max_size: MESSAGE.len(),
                ..ReceiveOptions::default()
            },
            echo_cb,
        )
        .unwrap();
    let echo = echoed.wait(deadline()).unwrap().result.unwrap();
    assert_eq!(echo.copy_to_vec(), MESSAGE);

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn send_completion_callback_fires() {
    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    let (send_cb, sent) = awaitable::<sockeye::queue::send::SendEvent>();
    let id = client
        .send(Data::from(MESSAGE), SendOptions::default(), Some(send_cb))
        .unwrap();

    let event = sent.wait(deadline()).unwrap();
    assert_eq!(event.id, id);
    event.result.unwrap();

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn shutdown_propagates_end_of_file() {
    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    client.send(Data::from(MESSAGE), SendOptions::default(), None).unwrap();
    client.shutdown(ShutdownDirection::Send).unwrap();

    // The queued message arrives first, then the half-close.
    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    server
        .receive(
            ReceiveOptions { min_size: MESSAGE.len(), ..ReceiveOptions::default() },
            recv_cb,
        )
        .unwrap();
    let data = received.wait(deadline()).unwrap().result.unwrap();
    assert_eq!(data.copy_to_vec(), MESSAGE);

    let (eof_cb, eof) = awaitable::<ReceiveEvent>();
    server.receive(ReceiveOptions::default(), eof_cb).unwrap();
    let event = eof.wait(deadline()).unwrap();
    assert_eq!(event.result.unwrap_err().kind(), sockeye::ErrorKind::EndOfFile);

    // keep_half_open defaults off: the server answers the peer's half-close
    // by shutting its own send side down once observed.
    let server_deadline = Nanos::now() + Nanos::from_secs(5);
    loop {
        let state = server.state();
        if state == SocketState::ShutDown || state == SocketState::Closed {
            break;
        }
        assert!(Nanos::now() < server_deadline, "server never reached ShutDown: {state:?}");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn file_region_send() {
    use std::{io::Write, os::fd::AsRawFd};

    let mut file = tempfile::tempfile().unwrap();
    let contents: Vec<u8> = (0..100_000u32).map(|v| v as u8).collect();
    file.write_all(&contents).unwrap();

    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    let region = sockeye::buffer::FileRegion {
        fd: file.as_raw_fd(),
        offset: 0,
        remaining: contents.len() as u64,
    };
    let (send_cb, sent) = awaitable::<sockeye::queue::send::SendEvent>();
    client
        .send(Data::File(region), SendOptions::default(), Some(send_cb))
        .unwrap();

    let mut collected = Vec::new();
    while collected.len() < contents.len() {
        let (recv_cb, received) = awaitable::<ReceiveEvent>();
        server.receive(ReceiveOptions::default(), recv_cb).unwrap();
        let data = received.wait(deadline()).unwrap().result.unwrap();
        collected.extend_from_slice(&data.copy_to_vec());
    }
    assert_eq!(collected, contents);
    sent.wait(deadline()).unwrap().result.unwrap();

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn migration_replays_interest() {
    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    // Bounce the server socket across every reactor, then prove traffic
    // still flows.
    for target in 0..interface.reactor_count() {
        interface.migrate_stream_socket(&server, target).unwrap();
    }

    client.send(Data::from(MESSAGE), SendOptions::default(), None).unwrap();
    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    server
        .receive(
            ReceiveOptions { min_size: MESSAGE.len(), ..ReceiveOptions::default() },
            recv_cb,
        )
        .unwrap();
    let data = received.wait(deadline()).unwrap().result.unwrap();
    assert_eq!(data.copy_to_vec(), MESSAGE);

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn send_queue_watermark_events_alternate() {
    use sockeye::socket::SendQueueEvent;

    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);

    let (accept_cb, accepted) = awaitable::<AcceptEvent>();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    // A one-byte high watermark makes every enqueue authorize the high
    // event; draining to empty authorizes the low event.
    let client = interface
        .create_stream_socket(
            Transport::TcpIpv4Stream,
            StreamSocketOptions {
                send_queue_low_watermark: 0,
                send_queue_high_watermark: 1,
                ..StreamSocketOptions::default()
            },
        )
        .unwrap();
    let (connect_cb, connected) = awaitable::<ConnectEvent>();
    client.connect(&endpoint, &ConnectOptions::default(), connect_cb).unwrap();
    connected.wait(deadline()).unwrap().result.unwrap();
    let server = accepted.wait(deadline()).unwrap().result.unwrap();

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.set_send_queue_handler(move |event| sink.lock().unwrap().push(event));

    for _ in 0..2 {
        client.send(Data::from(MESSAGE), SendOptions::default(), None).unwrap();
        let drained_by = Nanos::now() + Nanos::from_secs(5);
        while client.send_queue_size() > 0 {
            assert!(Nanos::now() < drained_by, "send queue never drained");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    let seen_by = Nanos::now() + Nanos::from_secs(5);
    loop {
        let seen = events.lock().unwrap().clone();
        if seen.len() >= 4 {
            assert_eq!(
                seen,
                vec![
                    SendQueueEvent::HighWatermark,
                    SendQueueEvent::LowWatermark,
                    SendQueueEvent::HighWatermark,
                    SendQueueEvent::LowWatermark,
                ]
            );
            break;
        }
        assert!(Nanos::now() < seen_by, "watermark events never arrived: {seen:?}");
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn receive_deadline_times_out() {
    let interface = start_interface();
    let (listener, endpoint) = listen_local(&interface);
    let (client, server) = connect_pair(&interface, &listener, &endpoint);

    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    server
        .receive(
            ReceiveOptions {
                deadline: Some(Nanos::now() + Nanos::from_millis(50)),
                ..ReceiveOptions::default()
            },
            recv_cb,
        )
        .unwrap();

    let event = received.wait(deadline()).unwrap();
    assert_eq!(event.result.unwrap_err().kind(), sockeye::ErrorKind::TimedOut);

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();
}
