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
        AcceptEvent, ConnectEvent, ConnectOptions, ListenerOptions, StreamSocketOptions,
    },
};
use sockeye_timing::Nanos;

fn deadline() -> Option<Nanos> {
    Some(Nanos::now() + Nanos::from_secs(10))
}

#[test]
fn local_stream_echo() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let endpoint = Endpoint::local(path.clone());

    let interface =
        Interface::create(InterfaceConfig { thread_count: 2, ..InterfaceConfig::default() })
            .unwrap();

    let listener = interface
        .create_listener_socket(
            Transport::LocalStream,
            ListenerOptions {
                source_endpoint: Some(endpoint.clone()),
                ..ListenerOptions::default()
            },
        )
        .unwrap();
    listener.listen().unwrap();

    let (accept_cb, accepted) = awaitable::<AcceptEvent>();
    listener.accept(AcceptOptions::default(), accept_cb).unwrap();

    let client = interface
        .create_stream_socket(Transport::LocalStream, StreamSocketOptions::default())
        .unwrap();
    let (connect_cb, connected) = awaitable::<ConnectEvent>();
    client.connect(&endpoint, &ConnectOptions::default(), connect_cb).unwrap();
    connected.wait(deadline()).unwrap().result.unwrap();

    let server = accepted.wait(deadline()).unwrap().result.unwrap();

    let message = b"over the local domain";
    client.send(Data::from(&message[..]), SendOptions::default(), None).unwrap();

    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    server
        .receive(
            ReceiveOptions { min_size: message.len(), ..ReceiveOptions::default() },
            recv_cb,
        )
        .unwrap();
    let data = received.wait(deadline()).unwrap().result.unwrap();
    assert_eq!(data.copy_to_vec(), message);

    client.close();
    server.close();
    listener.close();
    interface.shutdown();
    interface.linger();

    // The listener unlinks its bound path on close.
    assert!(!path.exists());
}
