//! The acceptor thread: blocking `accept4` feeding the reactor pool.
//!
//! One thread per listening address. Accepted sockets arrive
//! non-blocking and are handed to the messenger, which routes each to
//! the reactor its remote hashes to. Shutdown closes the listen fd to
//! unblock `accept4`.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::messenger::Messenger;
use crate::socket;

pub(crate) struct AcceptorHandle {
    listen_fd: RawFd,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AcceptorHandle {
    pub(crate) fn spawn(messenger: &Arc<Messenger>, addr: SocketAddr) -> Result<AcceptorHandle> {
        let (listen_fd, local_addr) =
            socket::create_listener(addr, messenger.config().backlog).map_err(Error::from)?;
        let closed = Arc::new(AtomicBool::new(false));

        let acceptor_closed = closed.clone();
        let weak = Arc::downgrade(messenger);
        let nodelay = messenger.config().tcp_nodelay;
        let thread = thread::Builder::new()
            .name(format!("{}-acceptor", messenger.name()))
            .spawn(move || {
                run_acceptor(listen_fd, nodelay, weak);
                if !acceptor_closed.swap(true, Ordering::AcqRel) {
                    unsafe {
                        libc::close(listen_fd);
                    }
                }
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                unsafe {
                    libc::close(listen_fd);
                }
                return Err(Error::from(err));
            }
        };

        Ok(AcceptorHandle {
            listen_fd,
            local_addr,
            closed,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listen fd to unblock `accept4`, then join the thread.
    pub(crate) fn shutdown(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.listen_fd);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// How long to sit out after running out of file descriptors, letting
/// in-flight closes free some up.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(10);

/// What the acceptor loop should do about a failed `accept4`.
enum AcceptDisposition {
    /// Transient (signal): try again at once.
    Retry,
    /// Fd table exhausted: pause, then try again.
    Backoff,
    /// The listen socket is gone (shutdown) or accept broke for good.
    Stop,
}

fn classify_accept_error(err: &io::Error) -> AcceptDisposition {
    match err.raw_os_error() {
        Some(libc::EINTR) => AcceptDisposition::Retry,
        Some(libc::EMFILE) | Some(libc::ENFILE) => AcceptDisposition::Backoff,
        _ => AcceptDisposition::Stop,
    }
}

/// One blocking `accept4`, yielding a non-blocking cloexec socket and
/// the peer's address.
fn accept_one(listen_fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let peer = socket::sockaddr_to_socket_addr(&storage, len)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    Ok((fd, peer))
}

/// Accept connections until the listen fd is closed or the messenger
/// goes away.
fn run_acceptor(listen_fd: RawFd, nodelay: bool, messenger: Weak<Messenger>) {
    loop {
        let (fd, peer_addr) = match accept_one(listen_fd) {
            Ok(accepted) => accepted,
            Err(err) => match classify_accept_error(&err) {
                AcceptDisposition::Retry => continue,
                AcceptDisposition::Backoff => {
                    thread::sleep(FD_EXHAUSTED_BACKOFF);
                    continue;
                }
                AcceptDisposition::Stop => return,
            },
        };

        if nodelay && let Err(err) = socket::set_nodelay(fd) {
            tracing::warn!(error = %err, "failed to set TCP_NODELAY on accepted socket");
        }

        match messenger.upgrade() {
            Some(messenger) => messenger.register_inbound_socket(fd, peer_addr),
            None => {
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        }
    }
}
