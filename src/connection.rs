//! Connections and their identity.
//!
//! A [`Connection`] wraps one non-blocking TCP socket plus the protocol
//! context framing it. The reactor holds a strong reference while the
//! connection sits in a table; every mutation happens on the reactor
//! thread, except during negotiation, when the negotiation worker is
//! the sole user.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::call::OutboundCallPtr;
use crate::context::{ConnectionContext, ResponseSink};
use crate::error::{Error, Result};
use crate::poll::Poller;
use crate::socket;

pub(crate) type ConnectionPtr = Arc<Connection>;

/// Which side initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialed out.
    Client,
    /// We accepted it.
    Server,
}

/// Identity of the user a connection acts for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserCredentials {
    real_user: String,
    effective_user: String,
}

impl UserCredentials {
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            effective_user: user.clone(),
            real_user: user,
        }
    }

    pub fn with_effective(real: impl Into<String>, effective: impl Into<String>) -> Self {
        Self {
            real_user: real.into(),
            effective_user: effective.into(),
        }
    }

    pub fn real_user(&self) -> &str {
        &self.real_user
    }

    pub fn effective_user(&self) -> &str {
        &self.effective_user
    }
}

impl std::fmt::Display for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.real_user == self.effective_user {
            write!(f, "{}", self.real_user)
        } else {
            write!(f, "{} (as {})", self.real_user, self.effective_user)
        }
    }
}

/// Key of the outbound connection table: remote endpoint, credentials,
/// and a per-remote index in `[0, num_connections_to_server)` that lets
/// the messenger open parallel connections to one remote.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    remote: SocketAddr,
    user: UserCredentials,
    idx: u8,
}

impl ConnectionId {
    pub fn new(remote: SocketAddr, user: UserCredentials, idx: u8) -> Self {
        Self { remote, user, idx }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn user_credentials(&self) -> &UserCredentials {
        &self.user
    }

    pub fn idx(&self) -> u8 {
        self.idx
    }

    /// The same identity at a different per-remote index.
    pub fn at_idx(&self, idx: u8) -> Self {
        Self {
            remote: self.remote,
            user: self.user.clone(),
            idx,
        }
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} as {} [{}]", self.remote, self.user, self.idx)
    }
}

/// One queued outbound transmission: either a call's payload or a
/// broadcast event.
struct Transfer {
    payload: Bytes,
    call: Option<OutboundCallPtr>,
}

struct ConnInner {
    context: Box<dyn ConnectionContext>,
    /// Pending transmissions, front currently being written.
    outbound: VecDeque<Transfer>,
    /// Bytes of the front transfer already written.
    write_pos: usize,
    /// Protocol responses produced while parsing inbound bytes.
    responses: VecDeque<Bytes>,
    read_buf: BytesMut,
    last_activity: Instant,
    negotiation_complete: bool,
    /// Admitted to the event loop (post-negotiation).
    registered: bool,
    /// EPOLLOUT currently armed.
    write_interest: bool,
    shutdown_status: Option<Error>,
    /// `outbound_queued` invocations, reported in dumps.
    kicks: u64,
}

/// A single TCP connection, either direction.
pub struct Connection {
    remote: SocketAddr,
    direction: Direction,
    fd: RawFd,
    credentials: Option<UserCredentials>,
    inner: Mutex<ConnInner>,
}

impl Connection {
    pub(crate) fn new(
        remote: SocketAddr,
        fd: RawFd,
        direction: Direction,
        context: Box<dyn ConnectionContext>,
        credentials: Option<UserCredentials>,
    ) -> ConnectionPtr {
        Arc::new(Connection {
            remote,
            direction,
            fd,
            credentials,
            inner: Mutex::new(ConnInner {
                context,
                outbound: VecDeque::new(),
                write_pos: 0,
                responses: VecDeque::new(),
                read_buf: BytesMut::new(),
                last_activity: Instant::now(),
                negotiation_complete: false,
                registered: false,
                write_interest: false,
                shutdown_status: None,
                kicks: 0,
            }),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The underlying socket, exposed for [`Negotiator`](crate::Negotiator)
    /// implementations. Blocking mode during negotiation, non-blocking
    /// everywhere else.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn credentials(&self) -> Option<&UserCredentials> {
        self.credentials.as_ref()
    }

    /// The peer address as the kernel reports it. Fails once the socket
    /// is dead.
    pub(crate) fn peer_address(&self) -> io::Result<SocketAddr> {
        socket::peer_address(self.fd)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Tear down this connection with `status`. Idempotent; the first
    /// status wins. Queued transfers are finalized with the status.
    pub(crate) fn shutdown(&self, status: Error) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.shutdown_status.is_some() {
                return;
            }
            tracing::debug!(conn = %self.describe(), status = %status, "shutting down connection");
            inner.shutdown_status = Some(status.clone());
            inner.responses.clear();
            inner.read_buf.clear();
            inner.write_pos = 0;
            std::mem::take(&mut inner.outbound)
        };
        socket::shutdown_both(self.fd);
        for transfer in drained {
            if let Some(call) = transfer.call {
                call.transferred(Err(status.clone()));
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown_status.is_some()
    }

    /// Whether the connection holds no pending work and may be reaped.
    pub(crate) fn idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.outbound.is_empty() && inner.responses.is_empty() && inner.context.is_idle()
    }

    pub(crate) fn last_activity_time(&self) -> Instant {
        self.inner.lock().last_activity
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity_time(&self, t: Instant) {
        self.inner.lock().last_activity = t;
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        socket::set_nonblocking(self.fd, nonblocking)
    }

    pub(crate) fn mark_negotiation_complete(&self) {
        self.inner.lock().negotiation_complete = true;
    }

    pub(crate) fn negotiation_complete(&self) -> bool {
        self.inner.lock().negotiation_complete
    }

    /// Gate for reactor exit after shutdown.
    pub(crate) fn ready_to_stop(&self) -> bool {
        self.inner.lock().context.ready_to_stop()
    }

    /// Admit the connection to the event loop for readiness. Any
    /// transfers queued during negotiation arm write interest at once.
    pub(crate) fn epoll_register(&self, poller: &Poller) -> io::Result<()> {
        poller.register(self.fd)?;
        let mut inner = self.inner.lock();
        inner.registered = true;
        if !inner.outbound.is_empty() || !inner.responses.is_empty() {
            poller.set_write_interest(self.fd, true)?;
            inner.write_interest = true;
        }
        Ok(())
    }

    // ── Outbound path ────────────────────────────────────────────────

    /// Append a call's payload to the outbound queue. A connection that
    /// is already shut down fails the call immediately.
    pub(crate) fn queue_outbound_call(&self, call: OutboundCallPtr) {
        let failed = {
            let mut inner = self.inner.lock();
            match &inner.shutdown_status {
                Some(status) => Some(status.clone()),
                None => {
                    let payload = call.payload();
                    inner.outbound.push_back(Transfer {
                        payload,
                        call: Some(call.clone()),
                    });
                    None
                }
            }
        };
        if let Some(status) = failed {
            call.transferred(Err(status));
        }
    }

    /// Append a broadcast event. Dropped silently on a shut-down
    /// connection.
    pub(crate) fn queue_outbound_data(&self, data: Bytes) {
        let mut inner = self.inner.lock();
        if inner.shutdown_status.is_some() {
            return;
        }
        inner.outbound.push_back(Transfer {
            payload: data,
            call: None,
        });
    }

    /// The per-flush kick: start (or continue) writing the queue. Called
    /// once per connection per outbound-queue flush, however many calls
    /// the flush assigned here. Before the connection is admitted to
    /// the event loop (negotiation may hold the socket in blocking
    /// mode), the queue waits; `epoll_register` arms write interest for
    /// whatever accumulated.
    pub(crate) fn outbound_queued(&self, poller: &Poller) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.kicks += 1;
            if !inner.registered || inner.shutdown_status.is_some() {
                return Ok(());
            }
        }
        self.write_ready(poller)
    }

    /// Number of `outbound_queued` kicks so far.
    pub(crate) fn kick_count(&self) -> u64 {
        self.inner.lock().kicks
    }

    // ── Readiness handlers (reactor thread) ──────────────────────────

    /// Handle readiness `(readable, writable)`. An error return means
    /// the connection must be destroyed with that status.
    pub(crate) fn process_events(
        &self,
        readable: bool,
        writable: bool,
        poller: &Poller,
    ) -> Result<()> {
        if readable {
            self.read_ready()?;
        }
        if writable {
            self.write_ready(poller)?;
        }
        Ok(())
    }

    fn read_ready(&self) -> Result<()> {
        let mut chunk = [0u8; 16 * 1024];
        let mut inner = self.inner.lock();
        if inner.shutdown_status.is_some() {
            return Ok(());
        }
        let mut eof = false;
        loop {
            let n = unsafe {
                libc::read(
                    self.fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            if n == 0 {
                eof = true;
                break;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            inner.read_buf.extend_from_slice(&chunk[..n as usize]);
            inner.last_activity = Instant::now();
        }

        // Feed the context everything buffered — frames that arrived
        // ahead of an EOF still count. Whole frames are consumed; a
        // trailing partial frame waits for the next read.
        let inner = &mut *inner;
        let consumed = inner.context.process_calls(
            &inner.read_buf,
            &mut ResponseSink {
                responses: &mut inner.responses,
            },
        )?;
        inner.read_buf.advance(consumed);

        if eof {
            return Err(Error::NetworkError("connection closed by peer".into()));
        }
        Ok(())
    }

    fn write_ready(&self, poller: &Poller) -> Result<()> {
        let mut finished: Vec<OutboundCallPtr> = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if inner.shutdown_status.is_some() {
                return Ok(());
            }
            self.flush_locked(&mut inner, poller, &mut finished)
        };
        for call in finished {
            call.transferred(Ok(()));
        }
        result
    }

    /// Write queued transfers until the queue drains or the socket
    /// stops accepting. Adjusts EPOLLOUT interest accordingly.
    fn flush_locked(
        &self,
        inner: &mut ConnInner,
        poller: &Poller,
        finished: &mut Vec<OutboundCallPtr>,
    ) -> Result<()> {
        loop {
            // Promote context responses behind already-queued transfers.
            while let Some(response) = inner.responses.pop_front() {
                inner.outbound.push_back(Transfer {
                    payload: response,
                    call: None,
                });
            }
            let Some(front) = inner.outbound.front() else {
                break;
            };
            let remaining = &front.payload[inner.write_pos..];
            if remaining.is_empty() {
                if let Some(transfer) = inner.outbound.pop_front()
                    && let Some(call) = transfer.call
                {
                    finished.push(call);
                }
                inner.write_pos = 0;
                continue;
            }
            let n = unsafe {
                libc::write(
                    self.fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.update_write_interest(inner, poller, true);
                        return Ok(());
                    }
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            inner.write_pos += n as usize;
            inner.last_activity = Instant::now();
        }
        self.update_write_interest(inner, poller, false);
        Ok(())
    }

    fn update_write_interest(&self, inner: &mut ConnInner, poller: &Poller, want: bool) {
        if !inner.registered || inner.write_interest == want {
            return;
        }
        if let Err(err) = poller.set_write_interest(self.fd, want) {
            tracing::warn!(conn = %self.describe(), error = %err, "failed to update write interest");
            return;
        }
        inner.write_interest = want;
    }

    // ── Introspection ────────────────────────────────────────────────

    pub(crate) fn describe(&self) -> String {
        match self.direction {
            Direction::Client => format!("client connection to {}", self.remote),
            Direction::Server => format!("server connection from {}", self.remote),
        }
    }

    /// Snapshot for `dump_running_rpcs`.
    pub(crate) fn dump_info(&self) -> ConnectionInfo {
        let inner = self.inner.lock();
        ConnectionInfo {
            remote: self.remote,
            direction: self.direction,
            negotiated: inner.negotiation_complete,
            queued_transfers: inner.outbound.len() + inner.responses.len(),
            outbound_kicks: inner.kicks,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One connection's entry in a [`DumpRunningRpcsResponse`](crate::DumpRunningRpcsResponse).
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub direction: Direction,
    pub negotiated: bool,
    pub queued_transfers: usize,
    pub outbound_kicks: u64,
}
