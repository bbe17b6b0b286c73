use std::{cell::RefCell, rc::Rc};

use weave_core::{CallbackArgs, CallbackKind, CallbackRecord, Result, WeaveError};
use weave_driver::{Backend, Driver, DriverBuilder};

/// A deliberately minimal `Backend` for exercising `Driver`'s own state
/// machine in isolation, the way `compio-runtime/tests/custom_loop.rs`
/// drives `compio_runtime::Runtime` against a stub proactor. It only
/// tracks a fake clock and a list of timer records, since `Driver` owns
/// all the interesting logic under test here.
struct TestBackend {
    clock: Rc<RefCell<f64>>,
    timers: Vec<Rc<CallbackRecord>>,
    next_sequence: u64,
}

impl TestBackend {
    fn new(clock: Rc<RefCell<f64>>) -> Self {
        Self {
            clock,
            timers: Vec::new(),
            next_sequence: 0,
        }
    }
}

impl Backend for TestBackend {
    type Handle = ();

    fn now(&self) -> f64 {
        *self.clock.borrow()
    }

    fn supports_signals(&self) -> bool {
        false
    }

    fn next_timer_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    fn activate(&mut self, record: &Rc<CallbackRecord>) -> Result<()> {
        if record.kind().is_timer() {
            self.timers.push(record.clone());
        }
        Ok(())
    }

    fn deactivate(&mut self, record: &Rc<CallbackRecord>) {
        self.timers.retain(|r| r.id() != record.id());
    }

    fn dispatch(&mut self, blocking: bool) -> Result<Vec<(Rc<CallbackRecord>, CallbackArgs)>> {
        // Deterministic test clock: advance just enough to make the
        // earliest timer due, rather than actually sleeping.
        if blocking {
            if let Some(min) = self
                .timers
                .iter()
                .filter_map(|r| match &*r.kind() {
                    CallbackKind::Timer { expiration, .. } => Some(expiration.get()),
                    _ => None,
                })
                .fold(None, |acc: Option<f64>, e| Some(acc.map_or(e, |a| a.min(e))))
            {
                let mut clock = self.clock.borrow_mut();
                if *clock < min {
                    *clock = min;
                }
            }
        }
        let now = self.now();
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|r| matches!(&*r.kind(), CallbackKind::Timer { expiration, .. } if expiration.get() <= now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            let key = |r: &Rc<CallbackRecord>| match &*r.kind() {
                CallbackKind::Timer {
                    expiration,
                    sequence,
                    ..
                } => (expiration.get(), sequence.get()),
                _ => unreachable!(),
            };
            key(a).partial_cmp(&key(b)).unwrap()
        });
        self.timers.retain(|r| !due.iter().any(|d| d.id() == r.id()));
        Ok(due.into_iter().map(|r| (r, CallbackArgs::None)).collect())
    }

    fn handle(&self) -> Option<()> {
        None
    }
}

fn new_driver() -> Rc<RefCell<Driver<TestBackend>>> {
    let clock = Rc::new(RefCell::new(0.0));
    DriverBuilder::new().build_shared(TestBackend::new(clock))
}

#[test]
fn s1_defer_ordering() {
    let driver = new_driver();
    let order = Rc::new(RefCell::new(Vec::new()));
    let order_a = order.clone();
    let order_b = order.clone();
    driver.borrow_mut().defer(move |_id| order_a.borrow_mut().push("A"));
    driver.borrow_mut().defer(move |_id| order_b.borrow_mut().push("B"));
    Driver::run_shared(&driver).unwrap();
    assert_eq!(*order.borrow(), vec!["A", "B"]);
}

#[test]
fn s2_delay_monotonicity() {
    let driver = new_driver();
    let order = Rc::new(RefCell::new(Vec::new()));
    let order_a = order.clone();
    let order_b = order.clone();
    driver.borrow_mut().delay(0.05, move |_id| order_a.borrow_mut().push("A"));
    driver.borrow_mut().delay(0.01, move |_id| order_b.borrow_mut().push("B"));
    Driver::run_shared(&driver).unwrap();
    assert_eq!(*order.borrow(), vec!["B", "A"]);
}

#[test]
fn s3_repeat_then_cancel_from_a_sibling_callback() {
    let driver = new_driver();
    let count = Rc::new(RefCell::new(0));
    let count_cb = count.clone();
    let id = driver.borrow_mut().repeat(0.01, move |_id| *count_cb.borrow_mut() += 1).unwrap();

    // The cancelling callback reaches back into the driver reentrantly,
    // through the same shared handle `run_shared` hands callbacks --
    // this is exactly the S3 scenario ("delay(...) cancels a sibling
    // repeat timer").
    let driver_for_cancel = driver.clone();
    driver.borrow_mut().delay(0.035, move |_id| {
        driver_for_cancel.borrow_mut().cancel(id);
    });

    Driver::run_shared(&driver).unwrap();
    assert_eq!(*count.borrow(), 3);
}

#[test]
fn repeat_rejects_non_positive_interval() {
    let driver = new_driver();
    let err = driver.borrow_mut().repeat(0.0, |_| {}).unwrap_err();
    assert!(matches!(err, WeaveError::LifecycleError(_)));
}

#[test]
fn s5_invalid_return_reaches_error_handler() {
    let driver = new_driver();
    let seen = Rc::new(RefCell::new(None));
    let seen_handler = seen.clone();
    driver.borrow_mut().set_error_handler(Some(Box::new(move |err| {
        *seen_handler.borrow_mut() = Some(err);
    })));
    driver
        .borrow_mut()
        .defer_raw(|_id, _args| weave_core::CallbackOutcome::Invalid("bogus".into()));
    Driver::run_shared(&driver).unwrap();
    assert!(matches!(*seen.borrow(), Some(WeaveError::InvalidCallback { .. })));
}

#[test]
fn cancel_is_a_no_op_on_unknown_id() {
    let driver = new_driver();
    driver.borrow_mut().defer(|_| {});
    Driver::run_shared(&driver).unwrap();
    let bogus = weave_core::IdGenerator::new().next();
    driver.borrow_mut().cancel(bogus); // must not panic
}

#[test]
fn enable_disable_round_trip_preserves_enabled_state() {
    let driver = new_driver();
    let id = driver.borrow_mut().repeat(1.0, |_| {}).unwrap();
    driver.borrow_mut().disable(id).unwrap();
    driver.borrow_mut().enable(id).unwrap();
    assert_eq!(driver.borrow_mut().enable(id).unwrap(), id);
}

#[test]
fn unreferencing_the_last_referenced_callback_stops_the_loop() {
    let driver = new_driver();
    let id = driver.borrow_mut().repeat(0.01, |_| {}).unwrap();
    driver.borrow_mut().unreference(id).unwrap();
    // No referenced+enabled callback remains, so run() returns promptly
    // instead of looping forever.
    Driver::run_shared(&driver).unwrap();
}

#[test]
fn run_fails_if_reentered() {
    let driver = new_driver();
    let driver_inner = driver.clone();
    driver.borrow_mut().defer(move |_id| {
        let err = Driver::run_shared(&driver_inner).unwrap_err();
        assert!(matches!(err, WeaveError::LifecycleError(_)));
    });
    Driver::run_shared(&driver).unwrap();
}
