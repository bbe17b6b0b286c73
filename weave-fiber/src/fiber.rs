use std::{
    any::Any,
    cell::{Cell, RefCell},
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::mpsc::{sync_channel, Receiver, SyncSender},
    thread::{self, JoinHandle},
};

use weave_core::WeaveError;

/// What `Suspension::suspend` receives when the scheduler resumes it.
pub(crate) enum ResumeMsg {
    Value(Box<dyn Any + Send>),
    Error(Box<dyn std::error::Error + Send + Sync>),
}

/// What the fiber thread reports back across the rendezvous channel.
pub(crate) enum FiberEvent {
    Suspended,
    Done(thread::Result<Box<dyn Any + Send>>),
}

/// The fiber-side half of a suspension: parks the calling thread and
/// hands control back to whichever thread holds the matching
/// [`FiberHandle`].
///
/// Constructed only inside the closure passed to [`spawn`]; a
/// `Suspension` is never shared across threads, matching the spec's
/// "strictly owned by its fiber's creator" rule.
pub struct Suspension {
    resume_rx: Receiver<ResumeMsg>,
    event_tx: SyncSender<FiberEvent>,
}

impl Suspension {
    /// Hand control back to the scheduler and block until resumed.
    ///
    /// Returns the value supplied to `resume(v)`, or the error supplied
    /// to `throw(e)`. There is no "called from the scheduler fiber"
    /// failure mode to check here: a `Suspension` only ever exists on a
    /// dedicated fiber thread, never on the scheduler's own thread.
    pub fn suspend<T: 'static>(&self) -> Result<T, WeaveError> {
        self.event_tx
            .send(FiberEvent::Suspended)
            .map_err(|_| WeaveError::LifecycleError("scheduler side of fiber is gone".into()))?;
        match self.resume_rx.recv() {
            Ok(ResumeMsg::Value(value)) => value.downcast::<T>().map(|b| *b).map_err(|_| {
                WeaveError::LifecycleError(
                    "suspend() was resumed with a value of an unexpected type".into(),
                )
            }),
            Ok(ResumeMsg::Error(err)) => Err(WeaveError::UserCallbackError(err)),
            Err(_) => Err(WeaveError::LifecycleError(
                "scheduler side of fiber is gone".into(),
            )),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FiberStatus {
    Suspended,
    Completed,
}

/// The scheduler-side handle to a spawned fiber.
///
/// Owns the other end of the rendezvous channels. `resume_now`/
/// `throw_now` block the calling thread until the fiber reaches its
/// next `suspend()` or returns — the emulation described in §5.1 of
/// the expanded spec, reinstating "exactly one of {scheduler, fiber} is
/// ever actually running" even though two OS threads are involved.
pub struct FiberHandle<R> {
    resume_tx: SyncSender<ResumeMsg>,
    event_rx: Receiver<FiberEvent>,
    join: RefCell<Option<JoinHandle<()>>>,
    status: Cell<FiberStatus>,
    final_result: RefCell<Option<thread::Result<Box<dyn Any + Send>>>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Send + 'static> FiberHandle<R> {
    /// `true` once the fiber body has returned (or panicked).
    pub fn is_completed(&self) -> bool {
        self.status.get() == FiberStatus::Completed
    }

    /// Resume the fiber with `value`, blocking until it next suspends
    /// or completes.
    pub fn resume_now<T: Send + 'static>(&self, value: T) -> Result<(), WeaveError> {
        self.drive(ResumeMsg::Value(Box::new(value)))
    }

    /// Resume the fiber by raising `error` at its suspend point,
    /// blocking until it next suspends or completes.
    pub fn throw_now<E: std::error::Error + Send + Sync + 'static>(
        &self,
        error: E,
    ) -> Result<(), WeaveError> {
        self.drive(ResumeMsg::Error(Box::new(error)))
    }

    fn drive(&self, msg: ResumeMsg) -> Result<(), WeaveError> {
        weave_log::instrument!(weave_log::Level::TRACE, "weave_fiber::drive");
        if self.is_completed() {
            return Err(WeaveError::LifecycleError(
                "cannot resume a fiber that has already completed".into(),
            ));
        }
        self.resume_tx.send(msg).map_err(|_| {
            WeaveError::LifecycleError("fiber thread is gone".to_string())
        })?;
        match self.event_rx.recv() {
            Ok(FiberEvent::Suspended) => Ok(()),
            Ok(FiberEvent::Done(result)) => {
                self.status.set(FiberStatus::Completed);
                *self.final_result.borrow_mut() = Some(result);
                Ok(())
            }
            Err(_) => Err(WeaveError::LifecycleError("fiber thread is gone".into())),
        }
    }

    /// Take the fiber's final result. `None` until [`is_completed`]
    /// returns `true`, and only ever `Some` once.
    ///
    /// [`is_completed`]: Self::is_completed
    pub fn take_result(&self) -> Option<thread::Result<R>> {
        self.final_result.borrow_mut().take().map(|res| {
            res.map(|boxed| {
                *boxed
                    .downcast::<R>()
                    .expect("fiber result type mismatch: spawn::<R> invariant violated")
            })
        })
    }
}

impl<R> Drop for FiberHandle<R> {
    fn drop(&mut self) {
        if let Some(join) = self.join.borrow_mut().take() {
            // Dropping `resume_tx` unblocks any pending `suspend()` with
            // a channel-closed error, so the thread always winds down.
            drop(join.join());
        }
    }
}

/// Spawn a new fiber running `body` on a dedicated OS thread.
///
/// Blocks the calling thread until `body` reaches its first
/// `suspend()` call or returns — the same way calling a real stackful
/// coroutine for the first time runs it up to its first yield.
pub fn spawn<R, F>(body: F) -> FiberHandle<R>
where
    R: Send + 'static,
    F: FnOnce(&Suspension) -> R + Send + 'static,
{
    let (resume_tx, resume_rx) = sync_channel::<ResumeMsg>(0);
    let (event_tx, event_rx) = sync_channel::<FiberEvent>(0);

    let thread_event_tx = event_tx.clone();
    let join = thread::Builder::new()
        .name("weave-fiber".into())
        .spawn(move || {
            let suspension = Suspension {
                resume_rx,
                event_tx: event_tx.clone(),
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| body(&suspension)));
            let boxed: thread::Result<Box<dyn Any + Send>> =
                outcome.map(|value| Box::new(value) as Box<dyn Any + Send>);
            let _ = thread_event_tx.send(FiberEvent::Done(boxed));
        })
        .expect("failed to spawn weave fiber thread");

    let first = event_rx
        .recv()
        .expect("fiber thread died before its first signal");

    let (status, final_result) = match first {
        FiberEvent::Suspended => (FiberStatus::Suspended, None),
        FiberEvent::Done(result) => (FiberStatus::Completed, Some(result)),
    };

    FiberHandle {
        resume_tx,
        event_rx,
        join: RefCell::new(Some(join)),
        status: Cell::new(status),
        final_result: RefCell::new(final_result),
        _marker: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_runs_to_completion_without_suspending() {
        let handle = spawn::<i32, _>(|_suspension| 42);
        assert!(handle.is_completed());
        assert_eq!(handle.take_result().unwrap().unwrap(), 42);
    }

    #[test]
    fn fiber_suspends_and_resumes_with_a_value() {
        let handle = spawn::<i32, _>(|suspension| {
            let got: i32 = suspension.suspend().unwrap();
            got + 1
        });
        assert!(!handle.is_completed());
        handle.resume_now(41).unwrap();
        assert!(handle.is_completed());
        assert_eq!(handle.take_result().unwrap().unwrap(), 42);
    }

    #[test]
    fn throw_propagates_as_user_callback_error_inside_the_fiber() {
        #[derive(Debug)]
        struct Boom;
        impl std::fmt::Display for Boom {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "boom")
            }
        }
        impl std::error::Error for Boom {}

        let handle = spawn::<bool, _>(|suspension| {
            let result: Result<i32, WeaveError> = suspension.suspend();
            matches!(result, Err(WeaveError::UserCallbackError(_)))
        });
        handle.throw_now(Boom).unwrap();
        assert!(handle.take_result().unwrap().unwrap());
    }

    #[test]
    fn resume_after_completion_is_a_lifecycle_error() {
        let handle = spawn::<i32, _>(|_| 1);
        assert!(handle.is_completed());
        let err = handle.resume_now(0).unwrap_err();
        assert!(matches!(err, WeaveError::LifecycleError(_)));
    }

    #[test]
    fn panicking_fiber_reports_completion_via_take_result() {
        let handle = spawn::<i32, _>(|_| panic!("fiber exploded"));
        assert!(handle.is_completed());
        assert!(handle.take_result().unwrap().is_err());
    }
}
