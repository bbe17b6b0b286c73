use std::{cell::RefCell, rc::Rc};

use weave::{Runtime, WeaveError};

#[test]
fn defer_then_delay_ordering() {
    let runtime = Runtime::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let order_a = order.clone();
    let order_b = order.clone();
    runtime.defer(move |_id| order_a.borrow_mut().push("deferred"));
    runtime.delay(0.01, move |_id| order_b.borrow_mut().push("delayed"));
    runtime.run().unwrap();
    assert_eq!(*order.borrow(), vec!["deferred", "delayed"]);
}

#[test]
fn cancelled_callback_never_fires() {
    let runtime = Runtime::new().unwrap();
    let fired = Rc::new(RefCell::new(false));
    let fired_cb = fired.clone();
    let id = runtime.delay(0.01, move |_id| *fired_cb.borrow_mut() = true);
    runtime.cancel(id);
    runtime.run().unwrap();
    assert!(!*fired.borrow());
}

#[test]
fn enabling_a_cancelled_id_is_an_invalid_callback_error() {
    let runtime = Runtime::new().unwrap();
    let id = runtime.defer(|_| {});
    runtime.cancel(id);
    let err = runtime.enable(id).unwrap_err();
    assert!(matches!(err, WeaveError::InvalidCallback { .. }));
}

// Both fiber tests below trigger the resume/throw from a `delay(0.0,
// ...)` callback rather than before `run()`: scheduling a resume only
// queues a microtask (§5's "resume() never runs its target before
// returning" guarantee), and a microtask alone does not keep the loop
// alive, so a second, later-firing `delay` is registered to give the
// loop a reason to take the extra iteration that drains it.

#[test]
fn fiber_suspends_and_is_resumed_through_the_runtime() {
    let runtime = Runtime::new().unwrap();
    let suspension = Rc::new(runtime.spawn_fiber::<i32, _>(|s| {
        let got: i32 = s.suspend().unwrap();
        got + 1
    }));
    assert!(!suspension.is_completed());

    let runtime_for_resume = runtime.clone();
    let suspension_for_resume = suspension.clone();
    runtime.delay(0.0, move |_id| {
        runtime_for_resume.resume(&suspension_for_resume, 41).unwrap();
    });

    let suspension_for_check = suspension.clone();
    runtime.delay(0.02, move |_id| {
        assert!(suspension_for_check.is_completed());
    });

    runtime.run().unwrap();
    assert!(suspension.is_completed());
    assert_eq!(
        Rc::try_unwrap(suspension).ok().unwrap().take_result().unwrap().unwrap(),
        42
    );
}

#[test]
fn fiber_throw_propagates_as_user_callback_error_inside_the_fiber() {
    #[derive(Debug)]
    struct Boom;
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }
    impl std::error::Error for Boom {}

    let runtime = Runtime::new().unwrap();
    let suspension = Rc::new(runtime.spawn_fiber::<bool, _>(|s| {
        let result: Result<i32, WeaveError> = s.suspend();
        matches!(result, Err(WeaveError::UserCallbackError(_)))
    }));

    let runtime_for_throw = runtime.clone();
    let suspension_for_throw = suspension.clone();
    runtime.delay(0.0, move |_id| {
        runtime_for_throw.throw(&suspension_for_throw, Boom).unwrap();
    });

    let suspension_for_check = suspension.clone();
    runtime.delay(0.02, move |_id| {
        assert!(suspension_for_check.is_completed());
    });

    runtime.run().unwrap();
    assert!(Rc::try_unwrap(suspension).ok().unwrap().take_result().unwrap().unwrap());
}

// A real signal, not just the registration plumbing: `on_signal` resumes
// a suspended fiber, `libc::raise` delivers the signal from inside this
// very process/thread, and the loop is expected to carry it through to
// the fiber asynchronously. Same dual-registration reasoning as the two
// fiber tests above: the `on_signal` record itself keeps the loop alive
// until the signal is drained, but the `resume()` it triggers only queues
// a microtask, so a further `delay` is registered to give the loop one
// more iteration to drain it.
#[cfg(unix)]
#[test]
fn fiber_is_resumed_by_a_real_posix_signal_while_suspended() {
    let runtime = Runtime::new().unwrap();
    let suspension = Rc::new(runtime.spawn_fiber::<i32, _>(|s| {
        let got: i32 = s.suspend().unwrap();
        got + 1
    }));
    assert!(!suspension.is_completed());

    let runtime_for_signal = runtime.clone();
    let suspension_for_signal = suspension.clone();
    runtime
        .on_signal(libc::SIGUSR1, move |_id, _signo| {
            runtime_for_signal.resume(&suspension_for_signal, 41).unwrap();
        })
        .unwrap();

    let suspension_for_check = suspension.clone();
    runtime.delay(0.05, move |_id| {
        assert!(suspension_for_check.is_completed());
    });

    // Fired after the loop is already blocked waiting on the armed
    // signal, from a `delay(0.0, ...)` callback rather than before
    // `run()`, so `raise` lands once the backend is actually listening.
    runtime.delay(0.0, |_id| unsafe {
        libc::raise(libc::SIGUSR1);
    });

    runtime.run().unwrap();
    assert!(suspension.is_completed());
    assert_eq!(
        Rc::try_unwrap(suspension).ok().unwrap().take_result().unwrap().unwrap(),
        42
    );
}
