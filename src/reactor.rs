//! The reactor: one event-loop thread owning a fixed subset of the
//! messenger's connections and timers.
//!
//! Producers interact with a reactor through two small locks (the
//! pending-task queue and the outbound-call queue) plus an eventfd
//! wake; everything else — connection tables, scheduled timers, scratch
//! buffers — belongs to the reactor thread alone and is mutated only
//! there.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::call::OutboundCallPtr;
use crate::config::Config;
use crate::connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionPtr, Direction, UserCredentials,
};
use crate::error::{Error, Result};
use crate::messenger::{DumpRunningRpcsRequest, Messenger};
use crate::metrics;
use crate::negotiation::run_negotiation;
use crate::poll::{PollEvent, Poller, TICK_TOKEN, WAKE_TOKEN, Waker};
use crate::socket;
use crate::task::{DelayedTask, FunctorTask, ReactorTask, ReactorTaskPtr, RunFunctionTask};

/// Calls without a timeout still need a negotiation deadline; far
/// enough out to never fire.
const NO_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Connection counts for one reactor.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReactorMetrics {
    pub num_client_connections: usize,
    pub num_server_connections: usize,
}

struct Pending {
    tasks: Vec<ReactorTaskPtr>,
    closing: bool,
}

struct OutboundQueue {
    calls: Vec<OutboundCallPtr>,
    stopped: bool,
}

pub(crate) struct Shared {
    name: String,
    config: Config,
    messenger: Weak<Messenger>,
    waker: Waker,
    /// Cross-thread submissions, drained on wake.
    pending: Mutex<Pending>,
    /// Multi-producer queue of outbound calls, flushed in batches.
    outbound: Mutex<OutboundQueue>,
    /// The single reusable flush task (see [`ProcessOutboundQueueTask`]).
    flush_task: ReactorTaskPtr,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: Mutex<Option<thread::ThreadId>>,
}

/// Public handle to one reactor. Cheap to clone; all methods are safe
/// from any thread.
#[derive(Clone)]
pub(crate) struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    pub(crate) fn new(
        messenger: Weak<Messenger>,
        index: usize,
        config: &Config,
    ) -> Result<Reactor> {
        let waker = Waker::new()?;
        let name = format!("{}_R{:03}", config.name, index);
        tracing::info!(
            reactor = %name,
            keepalive = ?config.connection_keepalive_time,
            granularity = ?config.coarse_timer_granularity,
            "creating reactor"
        );
        Ok(Reactor {
            shared: Arc::new(Shared {
                name,
                config: config.clone(),
                messenger,
                waker,
                pending: Mutex::new(Pending {
                    tasks: Vec::new(),
                    closing: false,
                }),
                outbound: Mutex::new(OutboundQueue {
                    calls: Vec::new(),
                    stopped: false,
                }),
                flush_task: Arc::new(ProcessOutboundQueueTask),
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    /// Start the reactor thread and its event loop.
    pub(crate) fn init(&self) -> Result<()> {
        let mut thread = self.shared.thread.lock();
        debug_assert!(thread.is_none(), "reactor already started");
        let poller = Poller::new(
            self.shared.waker.clone(),
            self.shared.config.coarse_timer_granularity,
        )?;
        let mut core = Core::new(self.shared.clone(), poller);
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || core.run())
            .map_err(Error::from)?;
        *thread = Some(handle);
        Ok(())
    }

    /// Request termination. Idempotent and non-blocking; the loop tears
    /// itself down on its next drain.
    pub(crate) fn shutdown(&self) {
        {
            let mut pending = self.shared.pending.lock();
            if pending.closing {
                return;
            }
            pending.closing = true;
        }
        tracing::debug!(reactor = %self.shared.name, "shutting down reactor thread");
        self.shared.waker.wake();
    }

    /// Wait for the reactor thread to exit. Call after [`shutdown`].
    pub(crate) fn join(&self) {
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // ── Cross-thread entry points ────────────────────────────────────

    /// Submit a task. Refused submissions are finalized immediately
    /// with the shutting-down status.
    pub(crate) fn schedule_reactor_task(&self, task: ReactorTaskPtr) {
        {
            let mut pending = self.shared.pending.lock();
            if pending.closing {
                drop(pending);
                metrics::TASKS_ABORTED.increment();
                task.abort(Error::shutdown_refused());
                return;
            }
            pending.tasks.push(task);
        }
        metrics::TASKS_SCHEDULED.increment();
        self.shared.waker.wake();
    }

    pub(crate) fn schedule_reactor_functor(&self, func: impl FnOnce(&mut Core) + Send + 'static) {
        self.schedule_reactor_task(FunctorTask::new(func));
    }

    /// Hand an outbound call to this reactor. Non-blocking: the call is
    /// queued and a single flush task is scheduled when the queue was
    /// empty.
    pub(crate) fn queue_outbound_call(&self, call: OutboundCallPtr) {
        let was_empty;
        {
            let mut outbound = self.shared.outbound.lock();
            if outbound.stopped {
                drop(outbound);
                call.transferred(Err(Error::shutdown_aborted()));
                return;
            }
            was_empty = outbound.calls.is_empty();
            outbound.calls.push(call.clone());
        }
        metrics::CALLS_QUEUED.increment();
        {
            let _entered = call.span().enter();
            tracing::trace!("scheduled");
        }
        if was_empty {
            self.schedule_reactor_task(self.shared.flush_task.clone());
        }
    }

    /// Transfer ownership of an accepted socket to this reactor.
    /// Runs off-thread; registration happens via a functor task.
    pub(crate) fn register_inbound_socket(&self, fd: RawFd, remote: std::net::SocketAddr) {
        let Some(messenger) = self.shared.messenger.upgrade() else {
            unsafe {
                libc::close(fd);
            }
            return;
        };
        tracing::debug!(reactor = %self.shared.name, remote = %remote, "new inbound connection");
        let context = (messenger.context_factory())(Direction::Server);
        let conn = Connection::new(remote, fd, Direction::Server, context, None);
        metrics::CONNECTIONS_ACCEPTED.increment();
        self.schedule_reactor_functor(move |core| core.register_connection(conn));
    }

    /// Broadcast an event to every SERVER connection owned by this
    /// reactor.
    pub(crate) fn queue_event_on_all_connections(&self, event: Bytes) {
        self.schedule_reactor_functor(move |core| core.broadcast_to_server_connections(event));
    }

    /// Shut down the sockets of connections whose peer address matches.
    pub(crate) fn drop_with_remote_address(&self, addr: IpAddr) {
        self.schedule_reactor_functor(move |core| core.drop_with_remote_address(addr));
    }

    pub(crate) fn get_metrics(&self) -> Result<ReactorMetrics> {
        self.run_on_reactor_thread(|core| {
            Ok(ReactorMetrics {
                num_client_connections: core.client_conns.len(),
                num_server_connections: core.server_conns.len(),
            })
        })
    }

    pub(crate) fn dump_running_rpcs(
        &self,
        req: DumpRunningRpcsRequest,
    ) -> Result<(Vec<ConnectionInfo>, Vec<ConnectionInfo>)> {
        let _ = req;
        self.run_on_reactor_thread(|core| {
            let inbound = core.server_conns.iter().map(|c| c.dump_info()).collect();
            let outbound = core.client_conns.values().map(|c| c.dump_info()).collect();
            Ok((inbound, outbound))
        })
    }

    /// Run `func` on the reactor thread and wait for its result. Must
    /// not be called from the reactor thread itself.
    pub(crate) fn run_on_reactor_thread<T: Send + 'static>(
        &self,
        func: impl FnOnce(&mut Core) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        debug_assert!(
            *self.shared.thread_id.lock() != Some(thread::current().id()),
            "run_on_reactor_thread would deadlock on the reactor thread"
        );
        let (task, rx) = RunFunctionTask::new(func);
        self.schedule_reactor_task(task);
        rx.recv().unwrap_or_else(|_| Err(Error::shutdown_aborted()))
    }
}

/// The cached flush task shared by every outbound-queue push. Stateless
/// and reusable; aborting it is a no-op because queued calls are failed
/// by `shutdown_internal` itself.
struct ProcessOutboundQueueTask;

impl ReactorTask for ProcessOutboundQueueTask {
    fn run(self: Arc<Self>, core: &mut Core) {
        core.process_outbound_queue();
    }

    fn abort(&self, _status: Error) {}
}

// ── Reactor-thread state ────────────────────────────────────────────

/// State owned by the reactor thread. Public entry points funnel every
/// mutation of this struct through the task queue.
pub struct Core {
    shared: Arc<Shared>,
    poller: Poller,
    /// Inbound connections, registration order.
    server_conns: Vec<ConnectionPtr>,
    /// Outbound connections, keyed by (remote, credentials, index).
    client_conns: HashMap<ConnectionId, ConnectionPtr>,
    /// Connections asked to stop whose context has not drained yet.
    waiting_conns: Vec<ConnectionPtr>,
    /// Scheduled delayed tasks, ordered by deadline. Doubles as the
    /// strong-reference set and the timer queue.
    scheduled_tasks: BTreeMap<(Instant, u64), Arc<DelayedTask>>,
    /// Connections under negotiation, by watchdog deadline.
    negotiation_deadlines: BTreeMap<(Instant, u64), ConnectionPtr>,
    negotiation_seq: u64,
    /// Readiness dispatch: fd of every connection admitted to the loop.
    polled_conns: HashMap<RawFd, ConnectionPtr>,
    /// Scratch: tasks swapped out of the pending queue.
    async_handler_tasks: Vec<ReactorTaskPtr>,
    /// Scratch: calls swapped out of the outbound queue.
    processing_outbound_queue: Vec<OutboundCallPtr>,
    /// Scratch: connections touched by one flush, deduped for the kick.
    processing_connections: Vec<ConnectionPtr>,
    /// Scratch: events copied out of the poller.
    poll_events: Vec<PollEvent>,
    /// Coarse clock, updated once per tick.
    cur_time: Instant,
    #[allow(dead_code)]
    last_scan: Instant,
    stopping: bool,
    loop_broken: bool,
}

impl Core {
    fn new(shared: Arc<Shared>, poller: Poller) -> Core {
        let now = Instant::now();
        Core {
            shared,
            poller,
            server_conns: Vec::new(),
            client_conns: HashMap::new(),
            waiting_conns: Vec::new(),
            scheduled_tasks: BTreeMap::new(),
            negotiation_deadlines: BTreeMap::new(),
            negotiation_seq: 0,
            polled_conns: HashMap::new(),
            async_handler_tasks: Vec::new(),
            processing_outbound_queue: Vec::new(),
            processing_connections: Vec::new(),
            poll_events: Vec::new(),
            cur_time: now,
            last_scan: now,
            stopping: false,
            loop_broken: false,
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    // ── Event loop ───────────────────────────────────────────────────

    fn run(&mut self) {
        *self.shared.thread_id.lock() = Some(thread::current().id());
        tracing::debug!(reactor = %self.name(), "reactor thread running");

        while !self.loop_broken {
            let timeout = self
                .next_timer_deadline()
                .map(|when| when.saturating_duration_since(Instant::now()));

            let mut events = std::mem::take(&mut self.poll_events);
            if let Err(err) = self.poller.poll(timeout, &mut events) {
                tracing::error!(reactor = %self.name(), error = %err, "event loop poll failed");
                self.poll_events = events;
                break;
            }
            for ev in &events {
                match ev.token {
                    WAKE_TOKEN => {
                        self.poller.consume_wake();
                        self.async_handler();
                    }
                    TICK_TOKEN => {
                        self.poller.consume_tick();
                        self.timer_handler();
                    }
                    fd => self.connection_event(fd as RawFd, ev),
                }
            }
            self.poll_events = events;
            self.process_due_timers();
        }

        tracing::debug!(reactor = %self.name(), "reactor thread exiting");
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        let task = self.scheduled_tasks.keys().next().map(|&(when, _)| when);
        let nego = self
            .negotiation_deadlines
            .keys()
            .next()
            .map(|&(when, _)| when);
        match (task, nego) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drain the pending-task queue and run each task. A drain that
    /// observes `closing` tears the reactor down instead; the drained
    /// tasks are aborted by `shutdown_internal`. Tasks pushed while this
    /// handler runs are observed on the next wake, not this one.
    fn async_handler(&mut self) {
        debug_assert!(self.async_handler_tasks.is_empty());
        let open = {
            let mut pending = self.shared.pending.lock();
            std::mem::swap(&mut pending.tasks, &mut self.async_handler_tasks);
            !pending.closing
        };

        if !open {
            self.shutdown_internal();
            self.check_ready_to_stop();
            self.async_handler_tasks.clear();
            return;
        }

        let mut tasks = std::mem::take(&mut self.async_handler_tasks);
        for task in tasks.drain(..) {
            task.run(self);
        }
        self.async_handler_tasks = tasks;
    }

    /// The coarse tick: refresh `cur_time`, then either progress the
    /// shutdown wait or reap idle connections.
    fn timer_handler(&mut self) {
        if self.stopping {
            self.check_ready_to_stop();
            return;
        }
        self.cur_time = Instant::now();
        self.scan_idle_connections();
    }

    fn scan_idle_connections(&mut self) {
        self.last_scan = self.cur_time;
        let keepalive = self.shared.config.connection_keepalive_time;
        let mut timed_out = 0u64;
        let mut idx = 0;
        while idx < self.server_conns.len() {
            let conn = &self.server_conns[idx];
            if !conn.idle() {
                idx += 1;
                continue;
            }
            let delta = self
                .cur_time
                .saturating_duration_since(conn.last_activity_time());
            if delta > keepalive {
                let conn = self.server_conns.remove(idx);
                tracing::warn!(
                    reactor = %self.name(),
                    conn = %conn.describe(),
                    idle_for = ?delta,
                    "timing out idle connection"
                );
                conn.shutdown(Error::NetworkError(format!(
                    "connection timed out after {delta:?}"
                )));
                self.unregister_polled(&conn);
                metrics::CONNECTIONS_IDLE_TIMEOUT.increment();
                metrics::CONNECTIONS_ACTIVE.decrement();
                timed_out += 1;
            } else {
                idx += 1;
            }
        }
        if timed_out > 0 {
            tracing::debug!(reactor = %self.name(), count = timed_out, "idle scan reaped connections");
        }
    }

    fn connection_event(&mut self, fd: RawFd, ev: &PollEvent) {
        // The connection may have been destroyed earlier in this batch.
        let Some(conn) = self.polled_conns.get(&fd).cloned() else {
            return;
        };
        // Hangup and error states surface through the read path: the
        // next read reports EOF or the socket error.
        let readable = ev.readable || ev.hangup || ev.error;
        if let Err(status) = conn.process_events(readable, ev.writable, &self.poller) {
            self.destroy_connection(&conn, status);
        }
    }

    /// Expire due delayed tasks and negotiation watchdogs.
    fn process_due_timers(&mut self) {
        let now = Instant::now();

        while let Some((&(when, _), _)) = self.scheduled_tasks.first_key_value() {
            if when > now {
                break;
            }
            // The popped binding keeps the task alive across its
            // callback.
            let (_, task) = self.scheduled_tasks.pop_first().expect("checked non-empty");
            task.fire();
        }

        while let Some((&(when, _), _)) = self.negotiation_deadlines.first_key_value() {
            if when > now {
                break;
            }
            let (_, conn) = self
                .negotiation_deadlines
                .pop_first()
                .expect("checked non-empty");
            if conn.negotiation_complete() || conn.is_shutdown() {
                continue;
            }
            metrics::NEGOTIATION_TIMEOUTS.increment();
            self.destroy_connection(
                &conn,
                Error::TimedOut(format!(
                    "negotiation with {} did not complete in time",
                    conn.remote()
                )),
            );
        }
    }

    pub(crate) fn insert_scheduled_task(&mut self, deadline: Instant, task: Arc<DelayedTask>) {
        self.scheduled_tasks.insert((deadline, task.id().0), task);
    }

    // ── Connection acquisition ───────────────────────────────────────

    /// Register an accepted SERVER connection: start its negotiation
    /// under the configured deadline and add it to the inbound table.
    pub(crate) fn register_connection(&mut self, conn: ConnectionPtr) {
        let deadline = Instant::now() + self.shared.config.rpc_negotiation_timeout;
        if let Err(err) = self.start_connection_negotiation(&conn, deadline) {
            tracing::error!(reactor = %self.name(), error = %err, "server connection negotiation failed");
            self.destroy_connection(&conn, err);
            return;
        }
        self.server_conns.push(conn);
        metrics::CONNECTIONS_ACTIVE.increment();
    }

    /// Look up the CLIENT connection for `conn_id`, dialing a new one
    /// if absent.
    fn find_or_start_connection(
        &mut self,
        conn_id: &ConnectionId,
        deadline: Instant,
    ) -> Result<ConnectionPtr> {
        if let Some(conn) = self.client_conns.get(conn_id) {
            return Ok(conn.clone());
        }

        // An out-of-range index could never be unlinked by the
        // destroy-time probe; refuse it up front.
        if conn_id.idx() >= self.shared.config.num_connections_to_server {
            return Err(Error::IllegalState(format!(
                "connection index {} is outside [0, {})",
                conn_id.idx(),
                self.shared.config.num_connections_to_server
            )));
        }

        let remote = conn_id.remote();
        tracing::debug!(reactor = %self.name(), remote = %remote, "creating new connection");

        let messenger = self
            .shared
            .messenger
            .upgrade()
            .ok_or_else(|| Error::ServiceUnavailable("Client RPC Messenger shutting down".into()))?;

        let config = &self.shared.config;
        let fd = socket::create_client_socket(remote, config.tcp_nodelay).map_err(|err| {
            tracing::warn!(remote = %remote, error = %err, "failed to create outbound socket");
            Error::from(err)
        })?;

        // Source binding: the explicit override wins; otherwise the
        // family-matched outbound address, when one is configured.
        let bind_addr = match config.local_ip_for_outbound_sockets {
            Some(ip) if ip.is_ipv4() == remote.is_ipv4() => Some(ip),
            Some(_) => None,
            None => {
                if remote.is_ipv4() {
                    (!config.outbound_address_v4.is_unspecified())
                        .then_some(IpAddr::V4(config.outbound_address_v4))
                } else {
                    (!config.outbound_address_v6.is_unspecified())
                        .then_some(IpAddr::V6(config.outbound_address_v6))
                }
            }
        };
        if let Some(addr) = bind_addr
            && let Err(err) = socket::bind_source(fd, addr)
        {
            tracing::warn!(bind = %addr, error = %err, "outbound bind failed");
        }

        match socket::start_connect(fd, remote) {
            Ok(in_progress) => {
                tracing::debug!(remote = %remote, in_progress, "connect started");
            }
            Err(err) => {
                tracing::warn!(remote = %remote, error = %err, "connect failed");
                unsafe {
                    libc::close(fd);
                }
                return Err(err.into());
            }
        }

        let context = (messenger.context_factory())(Direction::Client);
        let conn = Connection::new(
            remote,
            fd,
            Direction::Client,
            context,
            Some(conn_id.user_credentials().clone()),
        );

        match self.start_connection_negotiation(&conn, deadline) {
            // A friendlier message than the pool's own "shutting down".
            Err(err) if err.is_illegal_state() => {
                return Err(Error::ServiceUnavailable(
                    "Client RPC Messenger shutting down".into(),
                ));
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        self.client_conns.insert(conn_id.clone(), conn.clone());
        metrics::CONNECTIONS_DIALED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        Ok(conn)
    }

    /// Submit the handshake to the negotiation pool and arm the
    /// deadline watchdog. The caller's deadline is capped by the
    /// configured negotiation timeout.
    fn start_connection_negotiation(
        &mut self,
        conn: &ConnectionPtr,
        deadline: Instant,
    ) -> Result<()> {
        let deadline = deadline.min(Instant::now() + self.shared.config.rpc_negotiation_timeout);
        let messenger = self
            .shared
            .messenger
            .upgrade()
            .ok_or_else(|| Error::IllegalState("messenger is gone".into()))?;
        let negotiator = messenger.negotiator();
        let reactor = Reactor {
            shared: self.shared.clone(),
        };
        let job_conn = conn.clone();
        messenger.negotiation_pool().submit(move || {
            let status = run_negotiation(negotiator.as_ref(), &job_conn, deadline);
            reactor.schedule_reactor_functor(move |core| {
                core.complete_connection_negotiation(job_conn, status);
            });
        })?;

        self.negotiation_seq += 1;
        self.negotiation_deadlines
            .insert((deadline, self.negotiation_seq), conn.clone());
        Ok(())
    }

    /// Negotiation outcome, back on the reactor thread. Success admits
    /// the connection to the event loop; failure destroys it.
    pub(crate) fn complete_connection_negotiation(
        &mut self,
        conn: ConnectionPtr,
        status: Result<()>,
    ) {
        if conn.is_shutdown() {
            // The watchdog or a reactor shutdown got here first.
            return;
        }
        if let Err(err) = status {
            metrics::NEGOTIATION_FAILURES.increment();
            self.destroy_connection(&conn, err);
            return;
        }
        if let Err(err) = conn.set_nonblocking(true) {
            tracing::error!(
                conn = %conn.describe(),
                error = %err,
                "unable to restore non-blocking mode after negotiation"
            );
            self.destroy_connection(&conn, err.into());
            return;
        }
        conn.mark_negotiation_complete();
        self.clear_negotiation_watch(&conn);
        if let Err(err) = conn.epoll_register(&self.poller) {
            self.destroy_connection(&conn, err.into());
            return;
        }
        self.polled_conns.insert(conn.raw_fd(), conn);
    }

    /// Shut down `conn` with `status` and unlink it from whichever
    /// table matches its direction. For CLIENT connections every index
    /// in `[0, num_connections_to_server)` is probed; finding none is
    /// an invariant violation.
    pub(crate) fn destroy_connection(&mut self, conn: &ConnectionPtr, status: Error) {
        tracing::debug!(
            reactor = %self.name(),
            conn = %conn.describe(),
            status = %status,
            "destroying connection"
        );

        let retained = conn.clone();
        retained.shutdown(status);
        self.unregister_polled(&retained);
        self.clear_negotiation_watch(&retained);

        match retained.direction() {
            Direction::Client => {
                let creds = retained
                    .credentials()
                    .cloned()
                    .unwrap_or_else(|| UserCredentials::new(""));
                let base = ConnectionId::new(retained.remote(), creds, 0);
                let mut erased = false;
                for idx in 0..self.shared.config.num_connections_to_server {
                    let id = base.at_idx(idx);
                    if let Some(existing) = self.client_conns.get(&id)
                        && Arc::ptr_eq(existing, &retained)
                    {
                        self.client_conns.remove(&id);
                        erased = true;
                    }
                }
                if !erased {
                    tracing::warn!(conn = %retained.describe(), "connection not found under any index");
                    for (id, entry) in &self.client_conns {
                        tracing::warn!(id = %id, conn = %entry.describe(), "client table entry");
                    }
                    panic!(
                        "couldn't find connection for any index to {}",
                        retained.describe()
                    );
                }
                metrics::CONNECTIONS_ACTIVE.decrement();
            }
            Direction::Server => {
                if let Some(pos) = self
                    .server_conns
                    .iter()
                    .position(|entry| Arc::ptr_eq(entry, &retained))
                {
                    self.server_conns.remove(pos);
                    metrics::CONNECTIONS_ACTIVE.decrement();
                }
            }
        }
        metrics::CONNECTIONS_DESTROYED.increment();
    }

    fn unregister_polled(&mut self, conn: &ConnectionPtr) {
        if self.polled_conns.remove(&conn.raw_fd()).is_some() {
            self.poller.deregister(conn.raw_fd());
        }
    }

    fn clear_negotiation_watch(&mut self, conn: &ConnectionPtr) {
        self.negotiation_deadlines
            .retain(|_, entry| !Arc::ptr_eq(entry, conn));
    }

    // ── Outbound call pump ───────────────────────────────────────────

    /// Compute the call's deadline, find or dial its connection, and
    /// queue the payload. Returns the connection for the post-flush
    /// kick, or `None` when the call failed.
    fn assign_outbound_call(&mut self, call: OutboundCallPtr) -> Option<ConnectionPtr> {
        let deadline = match call.controller().timeout() {
            Some(timeout) => Instant::now() + timeout,
            None => {
                tracing::warn!(
                    conn_id = %call.conn_id(),
                    "outbound call has no timeout set"
                );
                Instant::now() + NO_DEADLINE
            }
        };

        match self.find_or_start_connection(call.conn_id(), deadline) {
            Err(status) => {
                call.set_failed(status);
                None
            }
            Ok(conn) => {
                conn.queue_outbound_call(call);
                Some(conn)
            }
        }
    }

    /// The flush: swap out the producer-facing queue, assign every
    /// call, then kick each distinct connection exactly once.
    pub(crate) fn process_outbound_queue(&mut self) {
        debug_assert!(self.processing_outbound_queue.is_empty());
        {
            let mut outbound = self.shared.outbound.lock();
            std::mem::swap(&mut outbound.calls, &mut self.processing_outbound_queue);
        }
        if self.processing_outbound_queue.is_empty() {
            return;
        }

        self.processing_connections
            .reserve(self.processing_outbound_queue.len());
        let mut calls = std::mem::take(&mut self.processing_outbound_queue);
        for call in calls.drain(..) {
            if let Some(conn) = self.assign_outbound_call(call) {
                self.processing_connections.push(conn);
            }
        }
        self.processing_outbound_queue = calls;

        // One kick per distinct connection, however many calls a batch
        // put on it.
        let mut conns = std::mem::take(&mut self.processing_connections);
        conns.sort_unstable_by_key(|conn| Arc::as_ptr(conn) as usize);
        conns.dedup_by(|a, b| Arc::ptr_eq(a, b));
        for conn in conns.drain(..) {
            if let Err(status) = conn.outbound_queued(&self.poller) {
                self.destroy_connection(&conn, status);
            }
        }
        self.processing_connections = conns;
    }

    // ── Broadcast and drop ───────────────────────────────────────────

    pub(crate) fn broadcast_to_server_connections(&mut self, event: Bytes) {
        let conns = self.server_conns.clone();
        for conn in conns {
            conn.queue_outbound_data(event.clone());
            if let Err(status) = conn.outbound_queued(&self.poller) {
                self.destroy_connection(&conn, status);
            }
        }
    }

    /// Shut down the sockets of all connections whose peer matches
    /// `addr`. The readiness path then reports the error and destroys
    /// them through the usual route.
    pub(crate) fn drop_with_remote_address(&mut self, addr: IpAddr) {
        for conn in self
            .server_conns
            .iter()
            .chain(self.client_conns.values())
        {
            let peer = match conn.peer_address() {
                Ok(peer) => peer,
                Err(err) => {
                    tracing::warn!(conn = %conn.describe(), error = %err, "failed to get peer address");
                    continue;
                }
            };
            if peer.ip() != addr {
                continue;
            }
            socket::shutdown_both(conn.raw_fd());
            tracing::info!(conn = %conn.describe(), "dropped connection");
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Reactor-thread teardown, triggered by the drain that observes
    /// `closing`.
    fn shutdown_internal(&mut self) {
        self.stopping = true;
        let service_unavailable = Error::shutdown_refused();
        let aborted = Error::shutdown_aborted();

        // 1. Outbound connections.
        tracing::debug!(reactor = %self.name(), "tearing down outbound connections");
        let client_conns = std::mem::take(&mut self.client_conns);
        for (_, conn) in client_conns {
            conn.shutdown(service_unavailable.clone());
            self.unregister_polled(&conn);
            metrics::CONNECTIONS_ACTIVE.decrement();
            if !conn.ready_to_stop() {
                self.waiting_conns.push(conn);
            }
        }

        // 2. Inbound connections.
        tracing::debug!(reactor = %self.name(), "tearing down inbound connections");
        let server_conns = std::mem::take(&mut self.server_conns);
        for conn in server_conns {
            conn.shutdown(service_unavailable.clone());
            self.unregister_polled(&conn);
            metrics::CONNECTIONS_ACTIVE.decrement();
            if !conn.ready_to_stop() {
                tracing::info!(conn = %conn.describe(), "waiting for connection to stop");
                self.waiting_conns.push(conn);
            }
        }

        // 3. Scheduled delayed tasks. These are not in the pending
        //    queue: they were already run (that is, scheduled).
        let scheduled = std::mem::take(&mut self.scheduled_tasks);
        for (_, task) in scheduled {
            task.abort(aborted.clone());
        }
        self.negotiation_deadlines.clear();

        // 4. Tasks drained into the current async-handler buffer but
        //    never run.
        for task in &self.async_handler_tasks {
            task.abort(aborted.clone());
        }

        // 5. Stop the outbound queue and fail whatever it still holds.
        {
            let mut outbound = self.shared.outbound.lock();
            outbound.stopped = true;
            std::mem::swap(&mut outbound.calls, &mut self.processing_outbound_queue);
        }
        let calls = std::mem::take(&mut self.processing_outbound_queue);
        for call in calls {
            call.transferred(Err(aborted.clone()));
        }
    }

    /// Drop every waiting connection whose context has drained; break
    /// the loop once none remain.
    fn check_ready_to_stop(&mut self) {
        self.waiting_conns.retain(|conn| !conn.ready_to_stop());
        if self.waiting_conns.is_empty() {
            tracing::debug!(reactor = %self.name(), "all connections stopped, breaking event loop");
            self.loop_broken = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::OutboundCall;
    use crate::config::ConfigBuilder;
    use crate::messenger::Messenger;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;

    fn single_reactor_messenger(name: &str) -> Arc<Messenger> {
        let config = ConfigBuilder::new(name)
            .reactors(1)
            .negotiation_threads(1)
            .num_connections_to_server(4)
            .coarse_timer_granularity(Duration::from_secs(3600))
            .connection_keepalive_time(Duration::from_secs(5))
            .build()
            .unwrap();
        Messenger::new(config).unwrap()
    }

    fn call_to(remote: SocketAddr, idx: u8) -> OutboundCallPtr {
        Arc::new(OutboundCall::new(
            ConnectionId::new(remote, UserCredentials::new("u"), idx),
            crate::context::DelimitedContext::encode(b""),
            Some(Duration::from_secs(5)),
        ))
    }

    #[test]
    fn coalesced_flush_kicks_each_connection_once() {
        let messenger = single_reactor_messenger("flush");
        let reactor = messenger.reactor(0).clone();

        let listeners: Vec<TcpListener> = (0..3)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let remotes: Vec<SocketAddr> =
            listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        // Stuff one batch directly and schedule the flush once: the
        // deterministic equivalent of several producers landing in one
        // tick.
        let batch = [remotes[0], remotes[0], remotes[1], remotes[1], remotes[2]];
        {
            let mut outbound = reactor.shared.outbound.lock();
            for remote in batch {
                outbound.calls.push(call_to(remote, 0));
            }
        }
        reactor.schedule_reactor_task(reactor.shared.flush_task.clone());

        // FIFO within one producer: the flush has run by the time this
        // round trip completes.
        let kicks = reactor
            .run_on_reactor_thread(|core| {
                Ok(core
                    .client_conns
                    .values()
                    .map(|conn| conn.kick_count())
                    .collect::<Vec<_>>())
            })
            .unwrap();

        assert_eq!(kicks.len(), 3, "five calls over three remotes dial three sockets");
        assert!(kicks.iter().all(|&k| k == 1), "one kick per connection, got {kicks:?}");

        messenger.shutdown();
    }

    #[test]
    fn keepalive_reap_is_strictly_greater() {
        let messenger = single_reactor_messenger("reap");
        let reactor = messenger.reactor(0).clone();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (sock, peer) = listener.accept().unwrap();
        messenger.register_inbound_socket(sock.into_raw_fd(), peer);

        let keepalive = Duration::from_secs(5);
        let (at_boundary, past_boundary) = reactor
            .run_on_reactor_thread(move |core| {
                assert_eq!(core.server_conns.len(), 1);
                core.cur_time = Instant::now();

                // Idle for exactly the keep-alive: kept (strict >).
                core.server_conns[0].set_last_activity_time(core.cur_time - keepalive);
                core.scan_idle_connections();
                let at_boundary = core.server_conns.len();

                // One tick's worth past it: reaped.
                if let Some(conn) = core.server_conns.first() {
                    conn.set_last_activity_time(
                        core.cur_time - keepalive - Duration::from_millis(1),
                    );
                }
                core.scan_idle_connections();
                Ok((at_boundary, core.server_conns.len()))
            })
            .unwrap();

        assert_eq!(at_boundary, 1);
        assert_eq!(past_boundary, 0);
        drop(client);
        messenger.shutdown();
    }

    #[test]
    fn parallel_connection_indices_create_distinct_entries() {
        let messenger = single_reactor_messenger("indices");
        let reactor = messenger.reactor(0).clone();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        for idx in 0..4 {
            reactor.queue_outbound_call(call_to(addr, idx));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let count = reactor
                .run_on_reactor_thread(|core| Ok(core.client_conns.len()))
                .unwrap();
            if count == 4 {
                break;
            }
            assert!(Instant::now() < deadline, "only {count} of 4 connections appeared");
            thread::sleep(Duration::from_millis(10));
        }

        let metrics = messenger.metrics().unwrap();
        assert_eq!(metrics[0].num_client_connections, 4);
        messenger.shutdown();
    }
}
