//! The messenger: owner of the reactor pool.
//!
//! A messenger runs a fixed number of reactors and hashes connection
//! ids across them, so one connection is always driven by one thread.
//! It also owns the negotiation worker pool and the registry of
//! delayed tasks cancellable by id.

use crate::task::ReactorTask;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::acceptor::AcceptorHandle;
use crate::call::OutboundCall;
use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionInfo};
use crate::context::{ContextFactory, DelimitedContext};
use crate::error::{Error, Result};
use crate::negotiation::{NegotiationPool, Negotiator, NoopNegotiator};
use crate::reactor::{Reactor, ReactorMetrics};
use crate::task::{DelayedTask, DelayedTaskId};

/// Request for a dump of a messenger's running RPC state.
#[derive(Clone, Copy, Debug, Default)]
pub struct DumpRunningRpcsRequest {
    /// Reserved for protocols that attach call traces to the dump.
    pub include_traces: bool,
}

/// Per-connection records gathered from every reactor.
#[derive(Debug, Default)]
pub struct DumpRunningRpcsResponse {
    pub inbound_connections: Vec<ConnectionInfo>,
    pub outbound_connections: Vec<ConnectionInfo>,
}

/// Owner of a fixed pool of reactors and their collaborators.
pub struct Messenger {
    name: String,
    config: Config,
    reactors: Vec<Reactor>,
    negotiation_pool: NegotiationPool,
    negotiator: Arc<dyn Negotiator>,
    context_factory: ContextFactory,
    scheduled_tasks: Mutex<HashMap<DelayedTaskId, Arc<DelayedTask>>>,
    next_task_id: AtomicU64,
    next_reactor: AtomicUsize,
    acceptors: Mutex<Vec<AcceptorHandle>>,
    closing: AtomicBool,
}

impl Messenger {
    /// Build and start a messenger with the default protocol seam: the
    /// length-delimited context and the trivial negotiator.
    pub fn new(config: Config) -> Result<Arc<Messenger>> {
        Self::with_protocol(config, DelimitedContext::factory(), Arc::new(NoopNegotiator))
    }

    /// Build and start a messenger with a specific protocol context
    /// factory and negotiator.
    pub fn with_protocol(
        config: Config,
        context_factory: ContextFactory,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Arc<Messenger>> {
        config.validate()?;
        let negotiation_pool = NegotiationPool::new(&config.name, config.negotiation_threads)
            .map_err(Error::from)?;

        let mut reactor_err = None;
        let messenger = Arc::new_cyclic(|weak: &Weak<Messenger>| {
            let mut reactors = Vec::with_capacity(config.num_reactors);
            for index in 0..config.num_reactors {
                match Reactor::new(weak.clone(), index, &config) {
                    Ok(reactor) => reactors.push(reactor),
                    Err(err) => {
                        reactor_err = Some(err);
                        break;
                    }
                }
            }
            Messenger {
                name: config.name.clone(),
                config: config.clone(),
                reactors,
                negotiation_pool,
                negotiator,
                context_factory,
                scheduled_tasks: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(1),
                next_reactor: AtomicUsize::new(0),
                acceptors: Mutex::new(Vec::new()),
                closing: AtomicBool::new(false),
            }
        });

        if let Some(err) = reactor_err {
            messenger.shutdown();
            return Err(err);
        }
        for reactor in &messenger.reactors {
            if let Err(err) = reactor.init() {
                messenger.shutdown();
                return Err(err);
            }
        }
        tracing::info!(messenger = %messenger.name, reactors = messenger.reactors.len(), "messenger started");
        Ok(messenger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn negotiation_pool(&self) -> &NegotiationPool {
        &self.negotiation_pool
    }

    pub(crate) fn negotiator(&self) -> Arc<dyn Negotiator> {
        self.negotiator.clone()
    }

    pub(crate) fn context_factory(&self) -> &ContextFactory {
        &self.context_factory
    }

    #[cfg(test)]
    pub(crate) fn reactor(&self, index: usize) -> &Reactor {
        &self.reactors[index]
    }

    fn reactor_for(&self, conn_id: &ConnectionId) -> &Reactor {
        let mut hasher = DefaultHasher::new();
        conn_id.hash(&mut hasher);
        &self.reactors[(hasher.finish() % self.reactors.len() as u64) as usize]
    }

    fn reactor_for_remote(&self, remote: SocketAddr) -> &Reactor {
        let mut hasher = DefaultHasher::new();
        remote.hash(&mut hasher);
        &self.reactors[(hasher.finish() % self.reactors.len() as u64) as usize]
    }

    // ── Calls and events ─────────────────────────────────────────────

    /// Hand an outbound call to the reactor owning its connection id.
    /// Non-blocking; the call's terminal notification reports the
    /// outcome.
    pub fn queue_outbound_call(&self, call: OutboundCall) {
        let call = Arc::new(call);
        self.reactor_for(call.conn_id()).queue_outbound_call(call);
    }

    /// Broadcast an event to every SERVER connection on every reactor.
    pub fn queue_event_on_all_connections(&self, event: Bytes) {
        for reactor in &self.reactors {
            reactor.queue_event_on_all_connections(event.clone());
        }
    }

    /// Transfer an accepted socket to the reactor its remote hashes to.
    pub fn register_inbound_socket(&self, fd: RawFd, remote: SocketAddr) {
        self.reactor_for_remote(remote)
            .register_inbound_socket(fd, remote);
    }

    /// Shut down the sockets of every connection whose peer matches
    /// `addr`, on every reactor.
    pub fn drop_connections_from(&self, addr: IpAddr) {
        for reactor in &self.reactors {
            reactor.drop_with_remote_address(addr);
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Gather per-connection dump records from every reactor.
    /// Synchronous round trip through each reactor thread.
    pub fn dump_running_rpcs(
        &self,
        req: DumpRunningRpcsRequest,
    ) -> Result<DumpRunningRpcsResponse> {
        let mut resp = DumpRunningRpcsResponse::default();
        for reactor in &self.reactors {
            let (inbound, outbound) = reactor.dump_running_rpcs(req)?;
            resp.inbound_connections.extend(inbound);
            resp.outbound_connections.extend(outbound);
        }
        Ok(resp)
    }

    /// Connection counts per reactor. Synchronous round trip through
    /// each reactor thread.
    pub fn metrics(&self) -> Result<Vec<ReactorMetrics>> {
        self.reactors.iter().map(|r| r.get_metrics()).collect()
    }

    // ── Delayed tasks ────────────────────────────────────────────────

    /// Schedule `func` to run after `delay` on one of the reactors.
    /// `func` receives `Ok(())` when the timer fires, or the abort
    /// status when cancelled; exactly one of the two happens.
    pub fn schedule_delayed_task(
        self: &Arc<Self>,
        delay: Duration,
        func: impl FnOnce(Result<()>) + Send + 'static,
    ) -> DelayedTaskId {
        let id = DelayedTaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let task = DelayedTask::new(func, delay, id, Arc::downgrade(self));
        self.scheduled_tasks.lock().insert(id, task.clone());
        let index = self.next_reactor.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[index].schedule_reactor_task(task);
        id
    }

    /// Cancel a delayed task. Returns true when the task was still
    /// pending and its closure ran with the abort status.
    pub fn abort_delayed_task(&self, id: DelayedTaskId) -> bool {
        let task = self.scheduled_tasks.lock().remove(&id);
        match task {
            Some(task) => {
                task.abort(Error::Aborted("delayed task aborted".into()));
                true
            }
            None => false,
        }
    }

    /// Forget a settled task's id. Called by the task itself once its
    /// closure has been claimed.
    pub(crate) fn remove_scheduled_task(&self, id: DelayedTaskId) {
        self.scheduled_tasks.lock().remove(&id);
    }

    // ── Acceptors ────────────────────────────────────────────────────

    /// Listen on `addr` and feed accepted sockets into the reactor
    /// pool. Returns the bound address (resolving port 0).
    pub fn add_acceptor(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::shutdown_refused());
        }
        let handle = AcceptorHandle::spawn(self, addr)?;
        let local = handle.local_addr();
        self.acceptors.lock().push(handle);
        tracing::info!(messenger = %self.name, addr = %local, "acceptor listening");
        Ok(local)
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop everything: acceptors, the negotiation pool, then every
    /// reactor. Blocks until the reactor threads have joined. Idempotent.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(messenger = %self.name, "messenger shutting down");

        let acceptors = std::mem::take(&mut *self.acceptors.lock());
        for mut acceptor in acceptors {
            acceptor.shutdown();
        }

        self.negotiation_pool.shutdown();

        for reactor in &self.reactors {
            reactor.shutdown();
        }
        for reactor in &self.reactors {
            reactor.join();
            tracing::debug!(reactor = %reactor.name(), "reactor thread joined");
        }

        // Tasks that never reached a reactor still settle exactly once.
        let leftover: Vec<_> = {
            let mut tasks = self.scheduled_tasks.lock();
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in leftover {
            task.abort(Error::shutdown_aborted());
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}
