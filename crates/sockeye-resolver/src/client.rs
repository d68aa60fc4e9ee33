//! The wire-level lookup pipeline: build a query, send it over UDP, await
//! the response, decode, retry across servers on timeout.

use std::sync::{Arc, Mutex};

use sockeye::{
    buffer::Data,
    endpoint::{Endpoint, IpAddress, IpAddressType, IpEndpoint, Transport},
    error::{Error, ErrorKind, Result},
    interface::Interface,
    queue::{
        receive::{ReceiveEvent, ReceiveOptions},
        send::SendOptions,
    },
    socket::{DatagramSocket, DatagramSocketOptions},
};
use sockeye_timing::{Duration, Nanos};
use tracing::{debug, warn};

use crate::protocol::{Message, RecordData, RecordType, ResponseCode};

/// `(address, ttl_seconds)` pairs extracted from a response.
pub(crate) type LookupAnswer = Vec<(IpAddress, u32)>;
pub(crate) type LookupCallback = Box<dyn FnOnce(Result<LookupAnswer>) + Send>;

/// Stateless handle; each lookup spins up its own socket and state.
pub(crate) struct DnsClient {
    interface: Arc<Interface>,
    servers: Vec<IpEndpoint>,
    attempts: u32,
    timeout: Duration,
}

struct Query {
    socket: Arc<DatagramSocket>,
    servers: Vec<IpEndpoint>,
    attempts: u32,
    timeout: Duration,
    name: String,
    /// Record types to try, in order.
    rtypes: Vec<RecordType>,
    rtype_index: usize,
    attempt: u32,
    id: u16,
    recursion: bool,
    deadline: Option<Nanos>,
    callback: Option<LookupCallback>,
}

impl DnsClient {
    pub(crate) fn new(
        interface: Arc<Interface>,
        servers: Vec<IpEndpoint>,
        attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self { interface, servers, attempts: attempts.max(1), timeout }
    }

    pub(crate) fn has_servers(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Starts one asynchronous lookup. The callback fires exactly once:
    /// `Ok` with records, `EndOfFile` for an authoritative empty answer,
    /// `TimedOut` after exhausted retries.
    pub(crate) fn lookup(
        &self,
        name: &str,
        family: IpAddressType,
        recursion: bool,
        deadline: Option<Nanos>,
        callback: LookupCallback,
    ) {
        if self.servers.is_empty() {
            callback(Err(Error::new(ErrorKind::Unsupported)));
            return;
        }

        let transport = match self.servers[0].address {
            IpAddress::V4(_) => Transport::UdpIpv4Datagram,
            IpAddress::V6 { .. } => Transport::UdpIpv6Datagram,
        };
        let socket = match self
            .interface
            .create_datagram_socket(transport, DatagramSocketOptions::default())
        {
            Ok(socket) => socket,
            Err(err) => {
                callback(Err(err));
                return;
            }
        };

        let rtypes = match family {
            IpAddressType::V4 => vec![RecordType::A],
            IpAddressType::V6 => vec![RecordType::Aaaa],
            IpAddressType::Any => vec![RecordType::A, RecordType::Aaaa],
        };

        let query = Arc::new(Mutex::new(Query {
            socket,
            servers: self.servers.clone(),
            attempts: self.attempts,
            timeout: self.timeout,
            name: name.to_string(),
            rtypes,
            rtype_index: 0,
            attempt: 0,
            id: 0,
            recursion,
            deadline,
            callback: Some(callback),
        }));
        send_attempt(&query);
    }
}

fn lock(query: &Arc<Mutex<Query>>) -> std::sync::MutexGuard<'_, Query> {
    query.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn send_attempt(query: &Arc<Mutex<Query>>) {
    let failure = {
        let mut state = lock(query);
        if state.callback.is_none() {
            return;
        }
        let now = Nanos::now();
        if state.deadline.is_some_and(|deadline| now >= deadline) {
            Some(Error::new(ErrorKind::TimedOut))
        } else {
            let server = state.servers[state.attempt as usize % state.servers.len()];
            state.id = rand::random::<u16>();
            let rtype = state.rtypes[state.rtype_index];
            let message = Message::query(state.id, &state.name, rtype, state.recursion);
            debug!(name = %state.name, ?rtype, %server, attempt = state.attempt, "dns query");

            match message.encode() {
                Ok(bytes) => {
                    let send = state.socket.send(
                        Data::Bytes(bytes),
                        SendOptions {
                            destination: Some(Endpoint::Ip(server)),
                            ..SendOptions::default()
                        },
                        None,
                    );
                    match send {
                        Ok(_) => {
                            let mut wait_until = now + state.timeout;
                            if let Some(deadline) = state.deadline {
                                wait_until = wait_until.min(deadline);
                            }
                            let continuation = Arc::clone(query);
                            let receive = state.socket.receive(
                                ReceiveOptions {
                                    deadline: Some(wait_until),
                                    ..ReceiveOptions::default()
                                },
                                move |event| on_response(&continuation, event),
                            );
                            receive.err()
                        }
                        Err(err) => Some(err),
                    }
                }
                Err(err) => Some(err),
            }
        }
    };
    if let Some(err) = failure {
        finish(query, Err(err));
    }
}

fn on_response(query: &Arc<Mutex<Query>>, event: ReceiveEvent) {
    enum Next {
        Done(Result<LookupAnswer>),
        Retry,
        NextType,
    }

    let next = {
        let mut state = lock(query);
        if state.callback.is_none() {
            return;
        }
        match event.result {
            Ok(data) => {
                let bytes = data.copy_to_vec();
                match Message::decode(&bytes) {
                    Ok(message) if message.response && message.id == state.id => {
                        match message.rcode {
                            ResponseCode::NoError => {
                                let wanted = state.rtypes[state.rtype_index];
                                let mut records = LookupAnswer::new();
                                for answer in &message.answers {
                                    match (&answer.data, wanted) {
                                        (RecordData::A(addr), RecordType::A) => {
                                            records.push((IpAddress::V4(*addr), answer.ttl));
                                        }
                                        (RecordData::Aaaa(addr), RecordType::Aaaa) => {
                                            records.push((
                                                IpAddress::V6 { addr: *addr, scope_id: 0 },
                                                answer.ttl,
                                            ));
                                        }
                                        _ => {}
                                    }
                                }
                                if records.is_empty() {
                                    Next::NextType
                                } else {
                                    Next::Done(Ok(records))
                                }
                            }
                            // Authoritative "no such name".
                            ResponseCode::NameError => {
                                Next::Done(Err(Error::new(ErrorKind::EndOfFile)))
                            }
                            rcode => {
                                warn!(name = %state.name, ?rcode, "dns server failure");
                                Next::Retry
                            }
                        }
                    }
                    Ok(message) => {
                        debug!(
                            got = message.id,
                            expected = state.id,
                            "mismatched dns response"
                        );
                        Next::Retry
                    }
                    Err(err) => {
                        warn!(name = %state.name, %err, "undecodable dns response");
                        Next::Retry
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => Next::Retry,
            Err(err) => Next::Done(Err(err)),
        }
    };

    match next {
        Next::Done(result) => finish(query, result),
        Next::Retry => {
            let exhausted = {
                let mut state = lock(query);
                state.attempt += 1;
                state.attempt >= state.attempts
            };
            if exhausted {
                advance_type(query, Error::new(ErrorKind::TimedOut));
            } else {
                send_attempt(query);
            }
        }
        Next::NextType => advance_type(query, Error::new(ErrorKind::EndOfFile)),
    }
}

/// Moves to the next record type or finishes with `exhausted_error`.
fn advance_type(query: &Arc<Mutex<Query>>, exhausted_error: Error) {
    let has_next = {
        let mut state = lock(query);
        if state.rtype_index + 1 < state.rtypes.len() {
            state.rtype_index += 1;
            state.attempt = 0;
            true
        } else {
            false
        }
    };
    if has_next {
        send_attempt(query);
    } else {
        finish(query, Err(exhausted_error));
    }
}

fn finish(query: &Arc<Mutex<Query>>, result: Result<LookupAnswer>) {
    let (callback, socket) = {
        let mut state = lock(query);
        (state.callback.take(), Arc::clone(&state.socket))
    };
    socket.close();
    if let Some(callback) = callback {
        callback(result);
    }
}
