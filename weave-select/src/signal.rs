//! Process-global POSIX signal plumbing shared by [`crate::SelectBackend`]
//! and, through this crate, `weave-native`'s `NativeBackend`.
//!
//! Grounded directly on `compio-signal`'s unix self-pipe: a background
//! thread blocks on a pipe fed by an `extern "C"` signal handler and
//! turns raw signal numbers into queued work, so the actual handler
//! function does nothing but a single `write(2)` — the only thing safe
//! to do from within a signal handler.
//!
//! Unlike the teacher, which lets every listener for a signal number
//! receive every delivery, §4.5/§9 require exactly one loop instance at
//! a time to have its signal events armed: whichever backend most
//! recently entered `run()` is topmost and is the only one that drains
//! deliveries, LIFO. Backends below it in the stack simply leave their
//! pending deliveries queued until they become topmost again.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use once_cell::sync::Lazy;
use os_pipe::{PipeReader, PipeWriter};

struct SelfPipe {
    sender: PipeWriter,
}

impl SelfPipe {
    fn new() -> io::Result<Self> {
        let (receiver, sender) = os_pipe::pipe()?;
        std::thread::spawn(move || drain_thread(receiver));
        Ok(Self { sender })
    }

    fn send(&self, sig: i32) -> io::Result<()> {
        (&self.sender).write_all(&sig.to_ne_bytes())
    }
}

static PIPE: Lazy<SelfPipe> = Lazy::new(|| SelfPipe::new().expect("failed to create signal self-pipe"));

unsafe extern "C" fn signal_handler(sig: i32) {
    let _ = PIPE.send(sig);
}

fn drain_thread(mut receiver: PipeReader) {
    let mut buf = [0u8; 4];
    while receiver.read_exact(&mut buf).is_ok() {
        let sig = i32::from_ne_bytes(buf);
        STATE.lock().unwrap().pending.push_back(sig);
    }
}

#[derive(Default)]
struct State {
    /// Reference count of live registrations per signo, across every
    /// backend in the process; the OS-level handler is installed on the
    /// first and torn down on the last.
    installed: HashMap<i32, usize>,
    /// Raw signal numbers delivered but not yet claimed by whichever
    /// backend is topmost.
    pending: VecDeque<i32>,
    /// Arm tokens, most-recently-armed last.
    armed: Vec<u64>,
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::default()));
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Installs the process-wide handler for `sig` if this is the first live
/// registration for it. Ref-counted so unrelated backends/registrations
/// for the same signo don't fight over installing/uninstalling.
pub fn install(sig: i32) {
    let mut state = STATE.lock().unwrap();
    let count = state.installed.entry(sig).or_insert(0);
    if *count == 0 {
        let _ = &*PIPE; // make sure the draining thread exists first
        unsafe { libc::signal(sig, signal_handler as usize) };
    }
    *count += 1;
}

/// Undoes one [`install`] call; restores `SIG_DFL` once the last live
/// registration for `sig` is gone.
pub fn uninstall(sig: i32) {
    let mut state = STATE.lock().unwrap();
    if let Some(count) = state.installed.get_mut(&sig) {
        *count -= 1;
        if *count == 0 {
            state.installed.remove(&sig);
            unsafe { libc::signal(sig, libc::SIG_DFL) };
        }
    }
}

/// Arms a new backend instance, pushing it to the top of the LIFO
/// arming stack, and returns its token.
pub fn arm() -> u64 {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    STATE.lock().unwrap().armed.push(token);
    token
}

/// Disarms a previously-armed token. A no-op if it is not present
/// (already disarmed, or never armed).
pub fn disarm(token: u64) {
    STATE.lock().unwrap().armed.retain(|&t| t != token);
}

fn is_topmost(state: &State, token: u64) -> bool {
    state.armed.last() == Some(&token)
}

/// Drains every queued raw signal number, but only if `token` is
/// currently topmost; otherwise leaves the queue untouched for whoever
/// is.
pub fn drain_pending(token: u64) -> Vec<i32> {
    let mut state = STATE.lock().unwrap();
    if !is_topmost(&state, token) {
        return Vec::new();
    }
    state.pending.drain(..).collect()
}
