//! Thin wrappers over the platform socket syscalls.
//!
//! Every wrapper returns `crate::Result`; `EINTR` is retried here so the
//! state machines above only ever see `WouldBlock` or terminal errors.

use std::{
    mem,
    net::{Ipv4Addr, Ipv6Addr},
    os::fd::RawFd,
    path::Path,
};

use crate::{
    endpoint::{Endpoint, IpAddress, IpEndpoint, Transport, TransportDomain, TransportMode},
    error::{Error, ErrorKind, Result},
};

pub(crate) const MAX_GATHER_BUFFERS: usize = 64;

/// `SO_EE_ORIGIN_ZEROCOPY` (Linux kernel constant, value 5); not yet exposed by this `libc` version.
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownHow {
    Send,
    Receive,
    Both,
}

macro_rules! syscall {
    ($call:expr) => {{
        let res = unsafe { $call };
        if res < 0 { Err(Error::last_os_error()) } else { Ok(res) }
    }};
}

macro_rules! retry_eintr {
    ($call:expr) => {{
        loop {
            let res = unsafe { $call };
            if res >= 0 {
                break Ok(res);
            }
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                break Err(err);
            }
        }
    }};
}

pub(crate) fn socket(transport: Transport) -> Result<RawFd> {
    let domain = match transport.domain() {
        TransportDomain::Ipv4 => libc::AF_INET,
        TransportDomain::Ipv6 => libc::AF_INET6,
        TransportDomain::Local => libc::AF_UNIX,
    };
    let ty = match transport.mode() {
        TransportMode::Stream => libc::SOCK_STREAM,
        TransportMode::Datagram => libc::SOCK_DGRAM,
    };
    let fd = syscall!(libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;
    Ok(fd)
}

pub(crate) fn close(fd: RawFd) {
    // EINTR on close leaves the descriptor state unspecified; retrying could
    // close a recycled fd, so the result is ignored.
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn bind(fd: RawFd, endpoint: &Endpoint) -> Result<()> {
    let (storage, len) = endpoint_to_sockaddr(endpoint)?;
    syscall!(libc::bind(fd, std::ptr::from_ref(&storage).cast(), len))?;
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: u32) -> Result<()> {
    syscall!(libc::listen(fd, backlog.min(i32::MAX as u32) as i32))?;
    Ok(())
}

pub(crate) fn accept(fd: RawFd) -> Result<(RawFd, Option<Endpoint>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted = retry_eintr!(libc::accept4(
        fd,
        std::ptr::from_mut(&mut storage).cast(),
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    Ok((accepted, sockaddr_to_endpoint(&storage, len)))
}

/// Initiates a non-blocking connect. `Err(WouldBlock)` means in progress;
/// completion is reported through writability plus an `SO_ERROR` probe.
pub(crate) fn connect(fd: RawFd, endpoint: &Endpoint) -> Result<()> {
    let (storage, len) = endpoint_to_sockaddr(endpoint)?;
    let res = unsafe { libc::connect(fd, std::ptr::from_ref(&storage).cast(), len) };
    if res == 0 {
        return Ok(());
    }
    let err = Error::last_os_error();
    // EINTR on connect leaves the attempt in progress, same as EINPROGRESS.
    if err.kind() == ErrorKind::Interrupted {
        return Err(Error::from_errno(libc::EINPROGRESS));
    }
    Err(err)
}

pub(crate) fn shutdown(fd: RawFd, how: ShutdownHow) -> Result<()> {
    let how = match how {
        ShutdownHow::Send => libc::SHUT_WR,
        ShutdownHow::Receive => libc::SHUT_RD,
        ShutdownHow::Both => libc::SHUT_RDWR,
    };
    match syscall!(libc::shutdown(fd, how)) {
        Ok(_) => Ok(()),
        // Already disconnected by the peer.
        Err(err) if err.errno() == Some(libc::ENOTCONN) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Vectored send. `destination` targets one datagram on unconnected
/// sockets; `zero_copy` requests `MSG_ZEROCOPY` (the caller tracks the
/// completion sequence).
pub(crate) fn send_msg(
    fd: RawFd,
    iov: &[libc::iovec],
    destination: Option<&Endpoint>,
    zero_copy: bool,
) -> Result<usize> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_ptr().cast_mut();
    msg.msg_iovlen = iov.len();
    if let Some(endpoint) = destination {
        let (addr, len) = endpoint_to_sockaddr(endpoint)?;
        storage = addr;
        msg.msg_name = std::ptr::from_mut(&mut storage).cast();
        msg.msg_namelen = len;
    }
    let mut flags = libc::MSG_NOSIGNAL;
    if zero_copy {
        flags |= libc::MSG_ZEROCOPY;
    }
    let n = retry_eintr!(libc::sendmsg(fd, &msg, flags))?;
    Ok(n as usize)
}

/// Vectored receive returning the source endpoint (datagram sockets).
pub(crate) fn recv_msg(fd: RawFd, iov: &[libc::iovec]) -> Result<(usize, Option<Endpoint>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::from_mut(&mut storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = iov.as_ptr().cast_mut();
    msg.msg_iovlen = iov.len();
    let n = retry_eintr!(libc::recvmsg(fd, &mut msg, 0))?;
    let endpoint = if msg.msg_namelen > 0 {
        sockaddr_to_endpoint(&storage, msg.msg_namelen)
    } else {
        None
    };
    Ok((n as usize, endpoint))
}

pub(crate) fn send_file(
    fd: RawFd,
    file_fd: RawFd,
    offset: u64,
    count: usize,
) -> Result<usize> {
    let mut off = offset as libc::off_t;
    let n = retry_eintr!(libc::sendfile(fd, file_fd, &mut off, count))?;
    Ok(n as usize)
}

/// Drains the pending socket error, translating 0 to `None`.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<Option<Error>> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        std::ptr::from_mut(&mut value).cast(),
        &mut len,
    ))?;
    if value == 0 { Ok(None) } else { Ok(Some(Error::from_errno(value))) }
}

pub(crate) fn set_option_bool(fd: RawFd, level: i32, option: i32, enabled: bool) -> Result<()> {
    set_option_int(fd, level, option, i32::from(enabled))
}

pub(crate) fn set_option_int(fd: RawFd, level: i32, option: i32, value: i32) -> Result<()> {
    syscall!(libc::setsockopt(
        fd,
        level,
        option,
        std::ptr::from_ref(&value).cast(),
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
}

pub(crate) fn set_option_linger(fd: RawFd, enabled: bool, seconds: i32) -> Result<()> {
    let value = libc::linger { l_onoff: i32::from(enabled), l_linger: seconds };
    syscall!(libc::setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_LINGER,
        std::ptr::from_ref(&value).cast(),
        mem::size_of::<libc::linger>() as libc::socklen_t,
    ))?;
    Ok(())
}

pub(crate) fn local_endpoint(fd: RawFd) -> Result<Option<Endpoint>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(libc::getsockname(fd, std::ptr::from_mut(&mut storage).cast(), &mut len))?;
    Ok(sockaddr_to_endpoint(&storage, len))
}

pub(crate) fn peer_endpoint(fd: RawFd) -> Result<Option<Endpoint>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(libc::getpeername(fd, std::ptr::from_mut(&mut storage).cast(), &mut len))?;
    Ok(sockaddr_to_endpoint(&storage, len))
}

/// Non-blocking close-on-exec pipe for reactor wakeups.
pub(crate) fn wake_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    Ok((fds[0], fds[1]))
}

pub(crate) fn pipe_notify(write_fd: RawFd) {
    let byte = 1u8;
    // A full pipe already guarantees a pending wakeup.
    unsafe {
        libc::write(write_fd, std::ptr::from_ref(&byte).cast(), 1);
    }
}

pub(crate) fn pipe_drain(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            return;
        }
    }
}

/// Harvests `MSG_ZEROCOPY` completion ranges from the error queue.
/// Returns inclusive `(lo, hi)` sequence-number ranges.
pub(crate) fn recv_zero_copy_completions(fd: RawFd) -> Result<Vec<(u32, u32)>> {
    let mut ranges = Vec::new();
    loop {
        let mut control = [0u8; 128];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len();

        let res = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
        if res < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            if err.kind() == ErrorKind::WouldBlock {
                return Ok(ranges);
            }
            return Err(err);
        }

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let ty = (*cmsg).cmsg_type;
                let is_zc = (level == libc::SOL_IP && ty == libc::IP_RECVERR)
                    || (level == libc::SOL_IPV6 && ty == libc::IPV6_RECVERR);
                if is_zc {
                    let err = &*libc::CMSG_DATA(cmsg).cast::<libc::sock_extended_err>();
                    if err.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        ranges.push((err.ee_info, err.ee_data));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
    }
}

pub(crate) fn endpoint_to_sockaddr(
    endpoint: &Endpoint,
) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match endpoint {
        Endpoint::Ip(IpEndpoint { address: IpAddress::V4(addr), port }) => {
            let sin = unsafe { &mut *std::ptr::from_mut(&mut storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = port.to_be();
            sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(addr.octets()) };
            Ok((storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
        }
        Endpoint::Ip(IpEndpoint { address: IpAddress::V6 { addr, scope_id }, port }) => {
            let sin6 =
                unsafe { &mut *std::ptr::from_mut(&mut storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr = libc::in6_addr { s6_addr: addr.octets() };
            sin6.sin6_scope_id = *scope_id;
            Ok((storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
        }
        Endpoint::Local(name) => {
            let sun = unsafe { &mut *std::ptr::from_mut(&mut storage).cast::<libc::sockaddr_un>() };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path_bytes(name.path())?;
            if bytes.len() >= sun.sun_path.len() {
                return Err(Error::new(ErrorKind::InvalidArgument));
            }
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
            Ok((storage, len as libc::socklen_t))
        }
    }
}

pub(crate) fn sockaddr_to_endpoint(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<Endpoint> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
            let addr = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(Endpoint::ip(IpAddress::V4(addr), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in6>() };
            let addr = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(Endpoint::Ip(IpEndpoint {
                address: IpAddress::V6 { addr, scope_id: sin6.sin6_scope_id },
                port: u16::from_be(sin6.sin6_port),
            }))
        }
        libc::AF_UNIX => {
            let sun = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_un>() };
            let path_len =
                (len as usize).saturating_sub(mem::size_of::<libc::sa_family_t>());
            if path_len == 0 {
                // Unbound (autobind) peer.
                return Some(Endpoint::local(""));
            }
            let bytes: Vec<u8> = sun.sun_path[..path_len]
                .iter()
                .map(|c| *c as u8)
                .take_while(|c| *c != 0)
                .collect();
            Some(Endpoint::local(String::from_utf8_lossy(&bytes).into_owned()))
        }
        _ => None,
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Result<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    Ok(path.as_os_str().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_sockaddr_round_trip() {
        let ep = Endpoint::ip(IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)), 4242);
        let (storage, len) = endpoint_to_sockaddr(&ep).unwrap();
        assert_eq!(sockaddr_to_endpoint(&storage, len), Some(ep));

        let ep = Endpoint::ip(
            IpAddress::V6 { addr: Ipv6Addr::LOCALHOST, scope_id: 3 },
            53,
        );
        let (storage, len) = endpoint_to_sockaddr(&ep).unwrap();
        assert_eq!(sockaddr_to_endpoint(&storage, len), Some(ep));
    }

    #[test]
    fn local_sockaddr_round_trip() {
        let ep = Endpoint::local("/tmp/sockeye-test.sock");
        let (storage, len) = endpoint_to_sockaddr(&ep).unwrap();
        assert_eq!(sockaddr_to_endpoint(&storage, len), Some(ep));
    }

    #[test]
    fn oversized_local_path_is_rejected() {
        let ep = Endpoint::local("/tmp/".repeat(40));
        assert!(endpoint_to_sockaddr(&ep).is_err());
    }

    #[test]
    fn socket_create_and_close() {
        let fd = socket(Transport::UdpIpv4Datagram).unwrap();
        assert!(fd >= 0);
        assert!(take_socket_error(fd).unwrap().is_none());
        close(fd);
    }
}
