#![cfg(unix)]

use std::{cell::RefCell, io::Write, os::unix::io::AsRawFd, rc::Rc, time::Duration};

use weave_core::WeaveError;
use weave_driver::{Driver, DriverBuilder};
use weave_select::SelectBackend;

fn new_driver() -> Rc<RefCell<Driver<SelectBackend>>> {
    DriverBuilder::new().build_shared(SelectBackend::new())
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
    let driver_for_cancel = driver.clone();
    driver.borrow_mut().delay(0.035, move |_id| {
        driver_for_cancel.borrow_mut().cancel(id);
    });
    Driver::run_shared(&driver).unwrap();
    assert_eq!(*count.borrow(), 3);
}

#[test]
fn readable_pipe_fires_onreadable_exactly_once_per_write() {
    let (mut reader, mut writer) = os_pipe::pipe().unwrap();
    let fd = reader.as_raw_fd();
    let driver = new_driver();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_cb = seen.clone();
    let driver_for_cb = driver.clone();
    driver.borrow_mut().on_readable(fd, move |_id, stream| {
        // `reader` still owns this fd; read through the raw descriptor
        // directly rather than constructing a second owning handle.
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(stream, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        seen_cb.borrow_mut().push(n.max(0) as usize);
        driver_for_cb.borrow_mut().stop();
    });
    writer.write_all(b"hi").unwrap();
    Driver::run_shared(&driver).unwrap();
    assert_eq!(*seen.borrow(), vec![2]);
    drop(reader);
}

#[test]
fn unsupported_signal_is_never_returned_by_select_backend() {
    // SelectBackend always supports signals (§4.4); the "unsupported"
    // path is exercised by backends that don't, which this crate has
    // none of.
    let driver = new_driver();
    assert!(driver.borrow_mut().on_signal(libc::SIGUSR2, |_, _| {}).is_ok());
}

#[test]
fn repeat_rejects_non_positive_interval() {
    let driver = new_driver();
    let err = driver.borrow_mut().repeat(0.0, |_| {}).unwrap_err();
    assert!(matches!(err, WeaveError::LifecycleError(_)));
}

#[test]
fn run_returns_promptly_when_nothing_keeps_it_alive() {
    let driver = new_driver();
    driver.borrow_mut().defer(|_| {});
    let start = std::time::Instant::now();
    Driver::run_shared(&driver).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}
