//! Outbound RPC calls.
//!
//! The reactor treats a call as opaque: it reads the connection id and
//! the controller's timeout, hands the payload to a connection, and
//! delivers exactly one terminal notification.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::ConnectionId;
use crate::error::{Error, Result};

pub(crate) type OutboundCallPtr = Arc<OutboundCall>;

type CompletionFn = Box<dyn FnOnce(Result<()>) + Send>;

/// Per-call knobs supplied by the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcController {
    timeout: Option<Duration>,
}

impl RpcController {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// The call deadline, `None` meaning "no deadline".
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A single RPC awaiting assignment to a connection and an eventual
/// terminal notification.
///
/// Exactly one of the terminal paths fires, no matter how submission,
/// delivery, and shutdown interleave: `set_failed` (could not be
/// assigned), or `transferred` (left the process, or was cancelled
/// after assignment).
pub struct OutboundCall {
    conn_id: ConnectionId,
    payload: Bytes,
    controller: RpcController,
    span: tracing::Span,
    completion: Mutex<Option<CompletionFn>>,
}

impl OutboundCall {
    pub fn new(conn_id: ConnectionId, payload: Bytes, timeout: Option<Duration>) -> OutboundCall {
        let span = tracing::debug_span!("outbound_call", remote = %conn_id.remote());
        OutboundCall {
            conn_id,
            payload,
            controller: RpcController::new(timeout),
            span,
            completion: Mutex::new(None),
        }
    }

    /// Attach a completion callback, invoked exactly once with the
    /// call's terminal status.
    pub fn on_completion(self, f: impl FnOnce(Result<()>) + Send + 'static) -> OutboundCall {
        *self.completion.lock() = Some(Box::new(f));
        self
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn controller(&self) -> &RpcController {
        &self.controller
    }

    pub(crate) fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Terminal: the call could not be assigned to a connection.
    pub(crate) fn set_failed(&self, err: Error) {
        self.finalize(Err(err));
    }

    /// Terminal: the transfer finished with the given status.
    pub(crate) fn transferred(&self, result: Result<()>) {
        self.finalize(result);
    }

    fn finalize(&self, result: Result<()>) {
        let callback = self.completion.lock().take();
        let Some(callback) = callback else {
            // Already finalized; later notifications lose the race.
            return;
        };
        if result.is_err() {
            crate::metrics::CALLS_ABORTED.increment();
        }
        let _entered = self.span.enter();
        tracing::debug!(result = ?result, "call finalized");
        callback(result);
    }
}

impl std::fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundCall")
            .field("conn_id", &self.conn_id)
            .field("len", &self.payload.len())
            .field("timeout", &self.controller.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::UserCredentials;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_call() -> OutboundCall {
        OutboundCall::new(
            ConnectionId::new(
                "127.0.0.1:9".parse().unwrap(),
                UserCredentials::new("u"),
                0,
            ),
            Bytes::from_static(b"x"),
            Some(Duration::from_secs(5)),
        )
    }

    #[test]
    fn completion_fires_once() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let call = test_call().on_completion(|_| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        call.set_failed(Error::shutdown_aborted());
        call.transferred(Ok(()));
        call.set_failed(Error::shutdown_aborted());
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_notification_wins() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let call = test_call().on_completion(move |result| {
            tx.send(result).unwrap();
        });
        call.transferred(Ok(()));
        call.transferred(Err(Error::shutdown_aborted()));
        assert!(rx.recv().unwrap().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
