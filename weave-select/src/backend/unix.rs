use std::{
    collections::HashMap,
    io,
    mem::MaybeUninit,
    os::unix::io::RawFd,
    time::Duration,
};

use std::rc::Rc;

use weave_core::{CallbackArgs, CallbackId, CallbackKind, CallbackRecord, Clock, Result, TimerQueue, WeaveError};
use weave_driver::Backend;

use crate::signal;

/// A fallback poll interval used only when `dispatch` would otherwise
/// block forever with nothing but signal registrations outstanding
/// (§4.4 step 8): `select(2)` has no way to learn about a signal
/// delivered to the self-pipe on another thread, so an unbounded
/// registrations-only wait would never wake up to re-check. Any small
/// interval works; this one is generous enough to keep CPU use
/// negligible while still being responsive in tests.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

type RecordMap = HashMap<CallbackId, Rc<CallbackRecord>>;

/// The always-available cross-platform backend (§4.4), built directly
/// on `select(2)` the way the source's own reference backend is.
pub struct SelectBackend {
    clock: Clock,
    read_callbacks: HashMap<RawFd, RecordMap>,
    write_callbacks: HashMap<RawFd, RecordMap>,
    signal_callbacks: HashMap<i32, RecordMap>,
    timers: TimerQueue,
    arm_token: Option<u64>,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            read_callbacks: HashMap::new(),
            write_callbacks: HashMap::new(),
            signal_callbacks: HashMap::new(),
            timers: TimerQueue::new(),
            arm_token: None,
        }
    }

    fn check_fd_limit(fd: RawFd) -> Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(WeaveError::FdLimitExceeded {
                limit: libc::FD_SETSIZE,
                fd,
            });
        }
        Ok(())
    }

    fn max_fd(&self) -> RawFd {
        self.read_callbacks
            .keys()
            .chain(self.write_callbacks.keys())
            .copied()
            .max()
            .unwrap_or(-1)
    }

    fn compute_timeout(&self, blocking: bool) -> Option<Duration> {
        if !blocking {
            return Some(Duration::ZERO);
        }
        let mut timeout = if let Some(peek) = self.timers.peek() {
            let now = self.now();
            Some(Duration::from_secs_f64((peek - now).max(0.0)))
        } else {
            None
        };
        let has_streams = !self.read_callbacks.is_empty() || !self.write_callbacks.is_empty();
        if timeout.is_none() && !has_streams {
            timeout = Some(SIGNAL_POLL_INTERVAL);
        }
        timeout
    }

    fn select(&self, timeout: Option<Duration>) -> Result<(Vec<RawFd>, Vec<RawFd>)> {
        let mut readfds = unsafe { MaybeUninit::<libc::fd_set>::zeroed().assume_init() };
        let mut writefds = unsafe { MaybeUninit::<libc::fd_set>::zeroed().assume_init() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
        }
        for &fd in self.read_callbacks.keys() {
            unsafe { libc::FD_SET(fd, &mut readfds) };
        }
        for &fd in self.write_callbacks.keys() {
            unsafe { libc::FD_SET(fd, &mut writefds) };
        }
        let nfds = self.max_fd() + 1;

        let mut c_timeout = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let timeout_ptr = c_timeout
            .as_mut()
            .map_or(std::ptr::null_mut(), |t| t as *mut libc::timeval);

        let ready = unsafe {
            libc::select(
                nfds,
                &mut readfds,
                &mut writefds,
                std::ptr::null_mut(),
                timeout_ptr,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            // §4.4 step 3: EINTR is empty readiness, not a failure.
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok((Vec::new(), Vec::new()));
            }
            return Err(WeaveError::BackendError(err));
        }

        let mut readable = Vec::new();
        for &fd in self.read_callbacks.keys() {
            if unsafe { libc::FD_ISSET(fd, &readfds) } {
                readable.push(fd);
            }
        }
        let mut writable = Vec::new();
        for &fd in self.write_callbacks.keys() {
            if unsafe { libc::FD_ISSET(fd, &writefds) } {
                writable.push(fd);
            }
        }
        Ok((readable, writable))
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SelectBackend {
    type Handle = ();

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn supports_signals(&self) -> bool {
        true
    }

    fn next_timer_sequence(&mut self) -> u64 {
        self.timers.next_sequence()
    }

    fn activate(&mut self, record: &Rc<CallbackRecord>) -> Result<()> {
        match &*record.kind() {
            CallbackKind::Timer { .. } => {
                self.timers.insert(record.clone());
            }
            CallbackKind::StreamReadable { stream } => {
                Self::check_fd_limit(*stream)?;
                self.read_callbacks
                    .entry(*stream)
                    .or_default()
                    .insert(record.id(), record.clone());
            }
            CallbackKind::StreamWritable { stream } => {
                Self::check_fd_limit(*stream)?;
                self.write_callbacks
                    .entry(*stream)
                    .or_default()
                    .insert(record.id(), record.clone());
            }
            CallbackKind::Signal { signo } => {
                let signo = *signo;
                if !self.signal_callbacks.contains_key(&signo)
                    || self.signal_callbacks[&signo].is_empty()
                {
                    signal::install(signo);
                }
                self.signal_callbacks
                    .entry(signo)
                    .or_default()
                    .insert(record.id(), record.clone());
            }
            CallbackKind::Deferred => {}
        }
        Ok(())
    }

    fn deactivate(&mut self, record: &Rc<CallbackRecord>) {
        match &*record.kind() {
            CallbackKind::Timer { .. } => self.timers.remove(record.id()),
            CallbackKind::StreamReadable { stream } => {
                if let Some(map) = self.read_callbacks.get_mut(stream) {
                    map.remove(&record.id());
                    if map.is_empty() {
                        self.read_callbacks.remove(stream);
                    }
                }
            }
            CallbackKind::StreamWritable { stream } => {
                if let Some(map) = self.write_callbacks.get_mut(stream) {
                    map.remove(&record.id());
                    if map.is_empty() {
                        self.write_callbacks.remove(stream);
                    }
                }
            }
            CallbackKind::Signal { signo } => {
                if let Some(map) = self.signal_callbacks.get_mut(signo) {
                    map.remove(&record.id());
                    if map.is_empty() {
                        self.signal_callbacks.remove(signo);
                        signal::uninstall(*signo);
                    }
                }
            }
            CallbackKind::Deferred => {}
        }
    }

    fn dispatch(&mut self, blocking: bool) -> Result<Vec<(Rc<CallbackRecord>, CallbackArgs)>> {
        weave_log::instrument!(weave_log::Level::TRACE, "weave_select::dispatch");
        let timeout = self.compute_timeout(blocking);
        let mut ready = Vec::new();

        // Step 2/3/5: stream readiness, EINTR folded to empty readiness.
        if !self.read_callbacks.is_empty() || !self.write_callbacks.is_empty() {
            let (readable, writable) = self.select(timeout)?;
            for fd in readable {
                if let Some(map) = self.read_callbacks.get(&fd) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Stream(fd)));
                    }
                }
            }
            for fd in writable {
                if let Some(map) = self.write_callbacks.get(&fd) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Stream(fd)));
                    }
                }
            }
        } else if let Some(timeout) = timeout {
            // Step 8: nothing to select(2) on; sleep in userspace so a
            // bounded signal-poll interval or a zero/immediate timeout
            // is still honored without a spurious syscall.
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
        }

        // Step 6: due timers, in (expiration, insertion_sequence) order.
        let now = self.now();
        while let Some(record) = self.timers.extract(now) {
            ready.push((record, CallbackArgs::None));
        }

        // Step 7: delivered signals, only while this backend is topmost.
        if let Some(token) = self.arm_token {
            for signo in signal::drain_pending(token) {
                if let Some(map) = self.signal_callbacks.get(&signo) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Signal(signo)));
                    }
                }
            }
        }

        Ok(ready)
    }

    fn handle(&self) -> Option<()> {
        None
    }

    fn on_loop_enter(&mut self) {
        self.arm_token = Some(signal::arm());
    }

    fn on_loop_exit(&mut self) {
        if let Some(token) = self.arm_token.take() {
            signal::disarm(token);
        }
    }
}

impl Drop for SelectBackend {
    fn drop(&mut self) {
        // Loop destruction (§4.5) must free every native registration;
        // for us that means releasing any signal handler this backend
        // was the last live registrant for.
        let signos: Vec<i32> = self.signal_callbacks.keys().copied().collect();
        for signo in signos {
            if let Some(map) = self.signal_callbacks.remove(&signo) {
                if !map.is_empty() {
                    signal::uninstall(signo);
                }
            }
        }
        if let Some(token) = self.arm_token.take() {
            signal::disarm(token);
        }
    }
}
