//! Off-thread connection negotiation.
//!
//! Negotiation is the only work the reactor deliberately hands off its
//! thread: the handshake may block, and the event loop may not. A fixed
//! pool of workers runs [`Negotiator::negotiate`] with the socket in
//! blocking mode; the outcome re-enters the reactor through its task
//! queue.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// A pluggable per-connection handshake.
///
/// Runs on a negotiation worker with the connection's socket in
/// blocking mode. Implementations must respect `deadline` (typically
/// via socket timeouts); the reactor additionally enforces it with a
/// watchdog, so overrunning the deadline costs the connection.
pub trait Negotiator: Send + Sync + 'static {
    fn negotiate(&self, conn: &Connection, deadline: Instant) -> Result<()>;
}

/// The trivial handshake: accept every connection immediately.
pub struct NoopNegotiator;

impl Negotiator for NoopNegotiator {
    fn negotiate(&self, _conn: &Connection, _deadline: Instant) -> Result<()> {
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed worker pool running negotiation jobs.
///
/// `submit` fails with [`Error::IllegalState`] once the pool has been
/// stopped; callers translate that to their own shutting-down status.
pub(crate) struct NegotiationPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl NegotiationPool {
    pub(crate) fn new(name: &str, threads: usize) -> std::io::Result<NegotiationPool> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-negotiator-{i}"))
                .spawn(move || {
                    // Sender dropped at shutdown; recv errors out and the
                    // worker exits.
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(NegotiationPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let tx = self.tx.lock();
        match &*tx {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| Error::IllegalState("negotiation pool is shutting down".into())),
            None => Err(Error::IllegalState(
                "negotiation pool is shutting down".into(),
            )),
        }
    }

    /// Stop accepting jobs and join the workers. Queued jobs finish
    /// first.
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

/// The body of a negotiation job: drive the handshake under its
/// deadline, then post the outcome back to the reactor.
pub(crate) fn run_negotiation(
    negotiator: &dyn Negotiator,
    conn: &Arc<Connection>,
    deadline: Instant,
) -> Result<()> {
    // The handshake gets a blocking socket; the reactor restores
    // non-blocking mode on completion.
    conn.set_nonblocking(false)
        .map_err(|err| Error::NetworkError(format!("cannot enter blocking mode: {err}")))?;

    let status = negotiator.negotiate(conn, deadline);
    match status {
        Ok(()) if Instant::now() > deadline => Err(Error::TimedOut(format!(
            "negotiation with {} overran its deadline",
            conn.remote()
        ))),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn pool_runs_submitted_jobs() {
        let pool = NegotiationPool::new("test", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn submit_after_shutdown_is_illegal_state() {
        let pool = NegotiationPool::new("test", 1).unwrap();
        pool.shutdown();
        let err = pool.submit(|| {}).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn queued_jobs_finish_before_shutdown_returns() {
        let pool = NegotiationPool::new("test", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
