use std::{collections::HashMap, io, rc::Rc, time::Duration};

use once_cell::sync::Lazy;
use windows_sys::Win32::Networking::WinSock::{
    select, WSACleanup, WSAGetLastError, WSAStartup, SOCKET, SOCKET_ERROR, WSADATA, WSAEINTR,
};

use weave_core::{
    CallbackArgs, CallbackId, CallbackKind, CallbackRecord, Clock, RawStream, Result, TimerQueue,
    WeaveError,
};
use weave_driver::Backend;

/// Winsock's own `fd_set` is an array of handles plus a count, not the
/// bitmask `select(2)` uses on Unix, and `FD_SETSIZE` is 64 rather than
/// a per-process resource limit. `windows-sys` exposes the struct shape
/// but, unlike the libc crate, no `FD_SET`/`FD_ISSET` helpers, so those
/// are reimplemented here directly against the fields.
const FD_SETSIZE: usize = 64;

#[repr(C)]
struct RawFdSet {
    fd_count: u32,
    fd_array: [SOCKET; FD_SETSIZE],
}

impl RawFdSet {
    fn empty() -> Self {
        Self {
            fd_count: 0,
            fd_array: [0; FD_SETSIZE],
        }
    }

    fn insert(&mut self, socket: SOCKET) -> Result<()> {
        if self.fd_count as usize >= FD_SETSIZE {
            return Err(WeaveError::FdLimitExceeded {
                limit: FD_SETSIZE,
                fd: socket as i32,
            });
        }
        self.fd_array[self.fd_count as usize] = socket;
        self.fd_count += 1;
        Ok(())
    }

    fn contains(&self, socket: SOCKET) -> bool {
        self.fd_array[..self.fd_count as usize].contains(&socket)
    }
}

#[repr(C)]
struct Timeval {
    tv_sec: i32,
    tv_usec: i32,
}

/// A fallback poll interval used only when `dispatch` would otherwise
/// block forever with nothing registered to wait on. The driver never
/// calls `dispatch(true)` unless `any_keeps_loop_alive()` holds, so this
/// is a last-resort guard rather than a path this backend relies on; it
/// exists so a future registration kind added here can't turn into an
/// indefinite hang by omission.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct WinsockInit;

impl WinsockInit {
    fn new() -> Self {
        let mut data: WSADATA = unsafe { std::mem::zeroed() };
        let code = unsafe { WSAStartup(0x202, &mut data) };
        if code != 0 {
            panic!("WSAStartup failed with error {code}");
        }
        Self
    }
}

impl Drop for WinsockInit {
    fn drop(&mut self) {
        unsafe { WSACleanup() };
    }
}

static WINSOCK: Lazy<WinsockInit> = Lazy::new(WinsockInit::new);

type RecordMap = HashMap<CallbackId, Rc<CallbackRecord>>;

/// The cross-platform fallback backend's Windows half: sockets only
/// (winsock's `select` has no notion of the pipes/files `select(2)`
/// accepts on Unix), and no signal support, since POSIX signal delivery
/// has no Windows equivalent for this backend to arm.
pub struct SelectBackend {
    clock: Clock,
    read_callbacks: HashMap<RawStream, RecordMap>,
    write_callbacks: HashMap<RawStream, RecordMap>,
    timers: TimerQueue,
}

impl SelectBackend {
    pub fn new() -> Self {
        Lazy::force(&WINSOCK);
        Self {
            clock: Clock::new(),
            read_callbacks: HashMap::new(),
            write_callbacks: HashMap::new(),
            timers: TimerQueue::new(),
        }
    }

    fn compute_timeout(&self, blocking: bool) -> Option<Duration> {
        if !blocking {
            return Some(Duration::ZERO);
        }
        if let Some(peek) = self.timers.peek() {
            let now = self.now();
            return Some(Duration::from_secs_f64((peek - now).max(0.0)));
        }
        if self.read_callbacks.is_empty() && self.write_callbacks.is_empty() {
            return Some(IDLE_POLL_INTERVAL);
        }
        None
    }

    fn select(&self, timeout: Option<Duration>) -> Result<(Vec<RawStream>, Vec<RawStream>)> {
        let mut readfds = RawFdSet::empty();
        let mut writefds = RawFdSet::empty();
        // `except` catches a failed non-blocking connect on Windows,
        // which never signals writable the way it would on Unix; fold
        // it into the writable set the way §4.4 calls for.
        let mut exceptfds = RawFdSet::empty();
        for &stream in self.read_callbacks.keys() {
            readfds.insert(stream as SOCKET)?;
        }
        for &stream in self.write_callbacks.keys() {
            writefds.insert(stream as SOCKET)?;
            exceptfds.insert(stream as SOCKET)?;
        }

        let mut c_timeout = timeout.map(|d| Timeval {
            tv_sec: d.as_secs() as i32,
            tv_usec: d.subsec_micros() as i32,
        });
        let timeout_ptr = c_timeout
            .as_mut()
            .map_or(std::ptr::null(), |t| t as *const Timeval)
            as *const windows_sys::Win32::Networking::WinSock::TIMEVAL;

        let ready = unsafe {
            select(
                0,
                &mut readfds as *mut RawFdSet as *mut _,
                &mut writefds as *mut RawFdSet as *mut _,
                &mut exceptfds as *mut RawFdSet as *mut _,
                timeout_ptr,
            )
        };

        if ready == SOCKET_ERROR {
            let code = unsafe { WSAGetLastError() };
            if code == WSAEINTR {
                return Ok((Vec::new(), Vec::new()));
            }
            return Err(WeaveError::BackendError(io::Error::from_raw_os_error(code)));
        }

        let mut readable = Vec::new();
        for &stream in self.read_callbacks.keys() {
            if readfds.contains(stream as SOCKET) {
                readable.push(stream);
            }
        }
        let mut writable = Vec::new();
        for &stream in self.write_callbacks.keys() {
            if writefds.contains(stream as SOCKET) || exceptfds.contains(stream as SOCKET) {
                writable.push(stream);
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
        false
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
                self.read_callbacks
                    .entry(*stream)
                    .or_default()
                    .insert(record.id(), record.clone());
            }
            CallbackKind::StreamWritable { stream } => {
                self.write_callbacks
                    .entry(*stream)
                    .or_default()
                    .insert(record.id(), record.clone());
            }
            CallbackKind::Signal { .. } => {
                return Err(WeaveError::UnsupportedFeature("signals".into()));
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
            CallbackKind::Signal { .. } | CallbackKind::Deferred => {}
        }
    }

    fn dispatch(&mut self, blocking: bool) -> Result<Vec<(Rc<CallbackRecord>, CallbackArgs)>> {
        weave_log::instrument!(weave_log::Level::TRACE, "weave_select::windows::dispatch");
        let timeout = self.compute_timeout(blocking);
        let mut ready = Vec::new();

        if !self.read_callbacks.is_empty() || !self.write_callbacks.is_empty() {
            let (readable, writable) = self.select(timeout)?;
            for stream in readable {
                if let Some(map) = self.read_callbacks.get(&stream) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Stream(stream)));
                    }
                }
            }
            for stream in writable {
                if let Some(map) = self.write_callbacks.get(&stream) {
                    for record in map.values() {
                        ready.push((record.clone(), CallbackArgs::Stream(stream)));
                    }
                }
            }
        } else if let Some(timeout) = timeout {
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
        }

        let now = self.now();
        while let Some(record) = self.timers.extract(now) {
            ready.push((record, CallbackArgs::None));
        }

        Ok(ready)
    }

    fn handle(&self) -> Option<()> {
        None
    }
}
