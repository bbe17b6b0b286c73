use std::{
    collections::{HashMap, HashSet},
    io,
    os::unix::io::{AsRawFd, BorrowedFd, RawFd},
    rc::Rc,
    time::Duration,
};

use polling::{Event, Events, Poller};
use weave_core::{CallbackArgs, CallbackId, CallbackKind, CallbackRecord, Clock, Result, TimerQueue, WeaveError};
use weave_driver::Backend;

/// See `weave_select::backend::SIGNAL_POLL_INTERVAL` for the rationale:
/// neither `select(2)` nor `polling`'s epoll/kqueue wait can observe a
/// signal delivered to the self-pipe's background thread, so a
/// registrations-only wait still needs a bounded fallback to notice it.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

type RecordMap = HashMap<CallbackId, Rc<CallbackRecord>>;

/// `Backend` built on the `polling` crate's epoll/kqueue/IOCP
/// abstraction (§4.5), trading `select(2)`'s `FD_SETSIZE` scan-and-scale
/// limits for native readiness notification while presenting the same
/// trait surface as `SelectBackend`.
pub struct NativeBackend {
    clock: Clock,
    poller: Poller,
    events: Events,
    read_callbacks: HashMap<RawFd, RecordMap>,
    write_callbacks: HashMap<RawFd, RecordMap>,
    signal_callbacks: HashMap<i32, RecordMap>,
    timers: TimerQueue,
    registered: HashSet<RawFd>,
    arm_token: Option<u64>,
}

impl NativeBackend {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            clock: Clock::new(),
            poller: Poller::new()?,
            events: Events::new(),
            read_callbacks: HashMap::new(),
            write_callbacks: HashMap::new(),
            signal_callbacks: HashMap::new(),
            timers: TimerQueue::new(),
            registered: HashSet::new(),
            arm_token: None,
        })
    }

    fn want_read(&self, fd: RawFd) -> bool {
        self.read_callbacks.get(&fd).is_some_and(|m| !m.is_empty())
    }

    fn want_write(&self, fd: RawFd) -> bool {
        self.write_callbacks.get(&fd).is_some_and(|m| !m.is_empty())
    }

    /// Adds, renews, or removes this fd's poller registration so it
    /// matches the union of interest its live callbacks currently want.
    /// `polling` registrations fire once and must be re-armed, so this
    /// also doubles as the "renew" step after each wakeup (mirrors
    /// `compio_driver`'s poll backend's own `renew`).
    fn sync_interest(&mut self, fd: RawFd) -> Result<()> {
        let want_read = self.want_read(fd);
        let want_write = self.want_write(fd);
        if !want_read && !want_write {
            if self.registered.remove(&fd) {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                self.poller.delete(borrowed).map_err(WeaveError::BackendError)?;
            }
            return Ok(());
        }
        let mut event = Event::none(fd as usize);
        event.readable = want_read;
        event.writable = want_write;
        if self.registered.insert(fd) {
            // SAFETY: `fd` stays open and owned by the caller for as
            // long as any callback referencing it is registered; it is
            // removed from `registered` and deleted the moment the last
            // one is.
            unsafe { self.poller.add(fd, event) }.map_err(WeaveError::BackendError)?;
        } else {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.poller.modify(borrowed, event).map_err(WeaveError::BackendError)?;
        }
        Ok(())
    }

    fn compute_timeout(&self, blocking: bool) -> Option<Duration> {
        if !blocking {
            return Some(Duration::ZERO);
        }
        let mut timeout = self.timers.peek().map(|peek| {
            let now = self.now();
            Duration::from_secs_f64((peek - now).max(0.0))
        });
        if timeout.is_none() && self.registered.is_empty() {
            timeout = Some(SIGNAL_POLL_INTERVAL);
        }
        timeout
    }
}

impl Backend for NativeBackend {
    type Handle = RawFd;

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
                let stream = *stream;
                self.read_callbacks.entry(stream).or_default().insert(record.id(), record.clone());
                self.sync_interest(stream)?;
            }
            CallbackKind::StreamWritable { stream } => {
                let stream = *stream;
                self.write_callbacks.entry(stream).or_default().insert(record.id(), record.clone());
                self.sync_interest(stream)?;
            }
            CallbackKind::Signal { signo } => {
                let signo = *signo;
                if self.signal_callbacks.get(&signo).map_or(true, |m| m.is_empty()) {
                    weave_select::signal::install(signo);
                }
                self.signal_callbacks.entry(signo).or_default().insert(record.id(), record.clone());
            }
            CallbackKind::Deferred => {}
        }
        Ok(())
    }

    fn deactivate(&mut self, record: &Rc<CallbackRecord>) {
        match &*record.kind() {
            CallbackKind::Timer { .. } => self.timers.remove(record.id()),
            CallbackKind::StreamReadable { stream } => {
                let stream = *stream;
                if let Some(map) = self.read_callbacks.get_mut(&stream) {
                    map.remove(&record.id());
                }
                let _ = self.sync_interest(stream);
            }
            CallbackKind::StreamWritable { stream } => {
                let stream = *stream;
                if let Some(map) = self.write_callbacks.get_mut(&stream) {
                    map.remove(&record.id());
                }
                let _ = self.sync_interest(stream);
            }
            CallbackKind::Signal { signo } => {
                if let Some(map) = self.signal_callbacks.get_mut(signo) {
                    map.remove(&record.id());
                    if map.is_empty() {
                        self.signal_callbacks.remove(signo);
                        weave_select::signal::uninstall(*signo);
                    }
                }
            }
            CallbackKind::Deferred => {}
        }
    }

    fn dispatch(&mut self, blocking: bool) -> Result<Vec<(Rc<CallbackRecord>, CallbackArgs)>> {
        weave_log::instrument!(weave_log::Level::TRACE, "weave_native::dispatch");
        let timeout = self.compute_timeout(blocking);
        let mut ready = Vec::new();

        self.events.clear();
        self.poller.wait(&mut self.events, timeout).map_err(WeaveError::BackendError)?;
        let fired: Vec<Event> = self.events.iter().collect();
        for event in fired {
            let fd = event.key as RawFd;
            if event.readable {
                if let Some(map) = self.read_callbacks.get(&fd) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Stream(fd)));
                    }
                }
            }
            if event.writable {
                if let Some(map) = self.write_callbacks.get(&fd) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Stream(fd)));
                    }
                }
            }
            // `polling` registrations are oneshot; re-arm for whatever
            // interest these callbacks still want.
            let _ = self.sync_interest(fd);
        }

        let now = self.now();
        while let Some(record) = self.timers.extract(now) {
            ready.push((record, CallbackArgs::None));
        }

        if let Some(token) = self.arm_token {
            for signo in weave_select::signal::drain_pending(token) {
                if let Some(map) = self.signal_callbacks.get(&signo) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Signal(signo)));
                    }
                }
            }
        }

        Ok(ready)
    }

    fn handle(&self) -> Option<RawFd> {
        Some(self.poller.as_raw_fd())
    }

    fn on_loop_enter(&mut self) {
        self.arm_token = Some(weave_select::signal::arm());
    }

    fn on_loop_exit(&mut self) {
        if let Some(token) = self.arm_token.take() {
            weave_select::signal::disarm(token);
        }
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        let signos: Vec<i32> = self.signal_callbacks.keys().copied().collect();
        for signo in signos {
            if let Some(map) = self.signal_callbacks.remove(&signo) {
                if !map.is_empty() {
                    weave_select::signal::uninstall(signo);
                }
            }
        }
        if let Some(token) = self.arm_token.take() {
            weave_select::signal::disarm(token);
        }
    }
}
