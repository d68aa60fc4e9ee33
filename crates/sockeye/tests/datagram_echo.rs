use std::sync::Arc;

use sockeye::{
    awaiter::awaitable,
    buffer::Data,
    endpoint::Transport,
    interface::{Interface, InterfaceConfig},
    queue::{
        receive::{ReceiveEvent, ReceiveOptions},
        send::SendOptions,
    },
    socket::{DatagramSocket, DatagramSocketOptions},
};
use sockeye_timing::Nanos;

const PAYLOAD_SIZE: usize = 32 * 1024;
const ITERATIONS: usize = 10_000;

fn deadline() -> Option<Nanos> {
    Some(Nanos::now() + Nanos::from_secs(30))
}

fn bound_socket(interface: &Arc<Interface>) -> Arc<DatagramSocket> {
    interface
        .create_datagram_socket(
            Transport::UdpIpv4Datagram,
            DatagramSocketOptions {
                source_endpoint: Some("127.0.0.1:0".parse().unwrap()),
                ..DatagramSocketOptions::default()
            },
        )
        .unwrap()
}

#[test]
fn datagram_echo() {
    let interface =
        Interface::create(InterfaceConfig { thread_count: 2, ..InterfaceConfig::default() })
            .unwrap();

    let alpha = bound_socket(&interface);
    let bravo = bound_socket(&interface);
    let alpha_endpoint = alpha.local_endpoint().unwrap().unwrap();
    let bravo_endpoint = bravo.local_endpoint().unwrap().unwrap();

    let payload = vec![0x5A_u8; PAYLOAD_SIZE];

    // Strict ping-pong: at most one datagram in flight, so loopback never
    // overruns a receive buffer.
    for iteration in 0..ITERATIONS {
        alpha
            .send(
                Data::Bytes(payload.clone()),
                SendOptions {
                    destination: Some(bravo_endpoint.clone()),
                    ..SendOptions::default()
                },
                None,
            )
            .unwrap();

        let (recv_cb, received) = awaitable::<ReceiveEvent>();
        bravo.receive(ReceiveOptions::default(), recv_cb).unwrap();
        let event = received.wait(deadline()).unwrap();
        let data = event.result.unwrap();
        assert_eq!(data.len(), PAYLOAD_SIZE, "iteration {iteration}");
        assert_eq!(event.endpoint, Some(alpha_endpoint.clone()), "iteration {iteration}");

        // Echo straight back out of the received pooled buffers.
        bravo
            .send(
                data,
                SendOptions {
                    destination: Some(alpha_endpoint.clone()),
                    ..SendOptions::default()
                },
                None,
            )
            .unwrap();

        let (echo_cb, echoed) = awaitable::<ReceiveEvent>();
        alpha.receive(ReceiveOptions::default(), echo_cb).unwrap();
        let event = echoed.wait(deadline()).unwrap();
        let data = event.result.unwrap();
        assert_eq!(data.len(), PAYLOAD_SIZE, "iteration {iteration}");
        if iteration == 0 || iteration == ITERATIONS - 1 {
            assert_eq!(data.copy_to_vec(), payload, "iteration {iteration}");
        }
    }

    alpha.close();
    bravo.close();
    interface.shutdown();
    interface.linger();
}

#[test]
fn connected_datagram_sockets_skip_destinations() {
    let interface = Interface::create(InterfaceConfig::default()).unwrap();

    let alpha = bound_socket(&interface);
    let bravo = bound_socket(&interface);
    let bravo_endpoint = bravo.local_endpoint().unwrap().unwrap();

    alpha.connect(&bravo_endpoint).unwrap();
    alpha.send(Data::from(&b"ping"[..]), SendOptions::default(), None).unwrap();

    let (recv_cb, received) = awaitable::<ReceiveEvent>();
    bravo.receive(ReceiveOptions::default(), recv_cb).unwrap();
    let event = received.wait(deadline()).unwrap();
    assert_eq!(event.result.unwrap().copy_to_vec(), b"ping");

    alpha.close();
    bravo.close();
    interface.shutdown();
    interface.linger();
}
