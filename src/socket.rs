//! Raw TCP socket helpers.
//!
//! Everything here speaks `libc` directly: the reactor owns plain fds
//! and drives them non-blocking, so there is nothing for a higher-level
//! socket type to add.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Decode the address the kernel filled into a `sockaddr_storage`.
/// Returns `None` for a family we don't speak or a truncated length.
pub(crate) fn sockaddr_to_socket_addr(
    storage: &libc::sockaddr_storage,
    len: u32,
) -> Option<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            if (len as usize) < std::mem::size_of::<libc::sockaddr_in>() {
                return None;
            }
            let v4 = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            // s_addr sits in memory in wire order, so its native bytes
            // are already the dotted-quad octets.
            let octets = v4.sin_addr.s_addr.to_ne_bytes();
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
                u16::from_be(v4.sin_port),
            )))
        }
        libc::AF_INET6 => {
            if (len as usize) < std::mem::size_of::<libc::sockaddr_in6>() {
                return None;
            }
            let v6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(v6.sin6_addr.s6_addr),
                u16::from_be(v6.sin6_port),
                v6.sin6_flowinfo,
                v6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Encode `addr` into a `sockaddr_storage` for a socket call, returning
/// the length to pass alongside it.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> u32 {
    // Start from all-zeroes so the tail of the storage never carries
    // stale bytes past the encoded length.
    *storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in, raw);
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in6, raw);
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

/// Create a non-blocking TCP socket for an outbound connection to `remote`,
/// with TCP_NODELAY applied when requested.
pub(crate) fn create_client_socket(remote: SocketAddr, nodelay: bool) -> io::Result<RawFd> {
    let domain = if remote.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if nodelay && let Err(err) = set_nodelay(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    Ok(fd)
}

/// Set TCP_NODELAY on a socket.
pub(crate) fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind a socket to a source address (port 0).
pub(crate) fn bind_source(fd: RawFd, addr: std::net::IpAddr) -> io::Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(SocketAddr::new(addr, 0), &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Issue a non-blocking `connect()` to `remote`.
///
/// Returns `Ok(false)` when the connect finished immediately, `Ok(true)`
/// when it is in progress (the temporary error codes are absorbed), and
/// `Err` for anything else.
pub(crate) fn start_connect(fd: RawFd, remote: SocketAddr) -> io::Result<bool> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(remote, &mut storage);
    let ret =
        unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret == 0 {
        return Ok(false);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(true),
        _ => Err(err),
    }
}

/// Toggle O_NONBLOCK on a socket.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Shut down both directions of a socket. Errors are ignored; the fd may
/// already be half-closed by the peer.
pub(crate) fn shutdown_both(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

/// Query the peer address of a connected socket.
pub(crate) fn peer_address(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage, len)
        .ok_or_else(|| io::Error::other("unsupported address family"))
}

/// Fetch and clear a socket's pending error (`SO_ERROR`). Used after an
/// in-progress connect reports writability.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut optval: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if optval != 0 {
        return Err(io::Error::from_raw_os_error(optval));
    }
    Ok(())
}

/// Create a TCP listener with SO_REUSEADDR, non-blocking off (the
/// acceptor thread uses blocking `accept4`). Returns the fd and the
/// bound address (resolving port 0).
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<(RawFd, SocketAddr)> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    let local = sockaddr_to_socket_addr(&storage, len)
        .ok_or_else(|| io::Error::other("unsupported address family"))?;

    Ok((fd, local))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:9".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn connect_to_closed_port_reports_in_progress_or_error() {
        // A non-blocking connect to a local closed port either fails fast
        // (ECONNREFUSED surfaces on a later event) or reports in-progress.
        let (fd, local) = create_listener("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        unsafe {
            libc::close(fd);
        }
        let sock = create_client_socket(local, true).unwrap();
        let result = start_connect(sock, local);
        unsafe {
            libc::close(sock);
        }
        // Either outcome is acceptable here; what matters is that the
        // temporary codes were not surfaced as hard errors.
        if let Err(err) = result {
            assert_ne!(err.raw_os_error(), Some(libc::EINPROGRESS));
            assert_ne!(err.raw_os_error(), Some(libc::EAGAIN));
        }
    }
}
