//! Reactor tasks: the unit of cross-thread work handoff.
//!
//! A task is finalized exactly once, by `run` on the reactor thread or
//! by `abort` from whichever thread loses the race to a shutdown or a
//! cancellation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::messenger::Messenger;
use crate::reactor::Core;

pub(crate) type ReactorTaskPtr = Arc<dyn ReactorTask>;

/// A polymorphic work unit executed on the reactor thread.
pub(crate) trait ReactorTask: Send + Sync {
    /// Execute on the reactor thread.
    fn run(self: Arc<Self>, core: &mut Core);

    /// Finalize without running: the reactor refused or cancelled the
    /// task.
    fn abort(&self, status: Error);
}

// ── Functor task ─────────────────────────────────────────────────────

type Functor = Box<dyn FnOnce(&mut Core) + Send>;

/// Runs an arbitrary closure on the reactor thread. Abort drops the
/// closure unrun.
pub(crate) struct FunctorTask {
    func: Mutex<Option<Functor>>,
}

impl FunctorTask {
    pub(crate) fn new(func: impl FnOnce(&mut Core) + Send + 'static) -> ReactorTaskPtr {
        Arc::new(FunctorTask {
            func: Mutex::new(Some(Box::new(func))),
        })
    }
}

impl ReactorTask for FunctorTask {
    fn run(self: Arc<Self>, core: &mut Core) {
        if let Some(func) = self.func.lock().take() {
            func(core);
        }
    }

    fn abort(&self, _status: Error) {
        self.func.lock().take();
    }
}

// ── Run-function task ────────────────────────────────────────────────

type RunFunction<T> = Box<dyn FnOnce(&mut Core) -> Result<T> + Send>;

/// Runs a closure on the reactor thread and hands its result back to a
/// waiting producer thread. Abort delivers the abort status instead.
pub(crate) struct RunFunctionTask<T: Send + 'static> {
    func: Mutex<Option<RunFunction<T>>>,
    tx: crossbeam_channel::Sender<Result<T>>,
}

impl<T: Send + 'static> RunFunctionTask<T> {
    pub(crate) fn new(
        func: impl FnOnce(&mut Core) -> Result<T> + Send + 'static,
    ) -> (Arc<Self>, crossbeam_channel::Receiver<Result<T>>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Arc::new(RunFunctionTask {
                func: Mutex::new(Some(Box::new(func))),
                tx,
            }),
            rx,
        )
    }
}

impl<T: Send + 'static> ReactorTask for RunFunctionTask<T> {
    fn run(self: Arc<Self>, core: &mut Core) {
        if let Some(func) = self.func.lock().take() {
            let _ = self.tx.send(func(core));
        }
    }

    fn abort(&self, status: Error) {
        if self.func.lock().take().is_some() {
            let _ = self.tx.send(Err(status));
        }
    }
}

// ── Delayed task ─────────────────────────────────────────────────────

/// Identity of a scheduled delayed task, cancellable through
/// [`Messenger::abort_delayed_task`](crate::Messenger::abort_delayed_task).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DelayedTaskId(pub(crate) u64);

type DelayedFn = Box<dyn FnOnce(Result<()>) + Send>;

struct DelayedState {
    done: bool,
    func: Option<DelayedFn>,
}

/// A single-shot timer bound to a user closure.
///
/// `run` (a normal reactor task) arms the timer by inserting the task
/// into the reactor's scheduled map; expiry runs `func(Ok(()))` on the
/// reactor thread. `abort` settles the task from any thread. The
/// task-internal mutex serializes the two, and is held across `func`
/// so no second invocation can interleave.
pub(crate) struct DelayedTask {
    id: DelayedTaskId,
    delay: Duration,
    messenger: Weak<Messenger>,
    state: Mutex<DelayedState>,
}

impl DelayedTask {
    pub(crate) fn new(
        func: impl FnOnce(Result<()>) + Send + 'static,
        delay: Duration,
        id: DelayedTaskId,
        messenger: Weak<Messenger>,
    ) -> Arc<DelayedTask> {
        Arc::new(DelayedTask {
            id,
            delay,
            messenger,
            state: Mutex::new(DelayedState {
                done: false,
                func: Some(Box::new(func)),
            }),
        })
    }

    pub(crate) fn id(&self) -> DelayedTaskId {
        self.id
    }

    /// Timer expiry, on the reactor thread. The caller has already
    /// removed the map entry and holds a strong reference for the
    /// duration of the callback.
    pub(crate) fn fire(&self) {
        self.finalize(Ok(()));
    }

    fn finalize(&self, result: Result<()>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        if let Some(messenger) = self.messenger.upgrade() {
            messenger.remove_scheduled_task(self.id);
        }
        if let Some(func) = state.func.take() {
            func(result);
        }
    }
}

impl ReactorTask for DelayedTask {
    fn run(self: Arc<Self>, core: &mut Core) {
        // Hold the task mutex across scheduling: an abort racing in
        // from another thread waits until the timer entry exists.
        let state = self.state.lock();
        if state.done {
            // An abort won the race before we reached the reactor.
            return;
        }
        let deadline = std::time::Instant::now() + self.delay;
        core.insert_scheduled_task(deadline, self.clone());
        drop(state);
    }

    fn abort(&self, status: Error) {
        self.finalize(Err(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delayed_task_abort_settles_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let task = DelayedTask::new(
            move |result| {
                assert!(result.is_err());
                calls2.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(10),
            DelayedTaskId(1),
            Weak::new(),
        );
        task.abort(Error::Aborted("cancelled".into()));
        task.abort(Error::Aborted("cancelled again".into()));
        task.fire();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delayed_task_fire_beats_late_abort() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let task = DelayedTask::new(
            move |result| {
                assert!(result.is_ok());
                calls2.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(1),
            DelayedTaskId(2),
            Weak::new(),
        );
        task.fire();
        task.abort(Error::Aborted("too late".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_abort_and_fire_invoke_exactly_once() {
        for _ in 0..64 {
            let calls = Arc::new(AtomicUsize::new(0));
            let calls2 = calls.clone();
            let task = DelayedTask::new(
                move |_| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_secs(1),
                DelayedTaskId(3),
                Weak::new(),
            );
            let t1 = {
                let task = task.clone();
                std::thread::spawn(move || task.abort(Error::Aborted("race".into())))
            };
            let t2 = {
                let task = task.clone();
                std::thread::spawn(move || task.fire())
            };
            t1.join().unwrap();
            t2.join().unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
