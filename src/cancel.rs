//! Cancellation monitor.
//!
//! Cancellation requests arrive asynchronously, from another thread or a
//! signal handler, and are only observed at safepoints inside the running
//! script. The monitor is a single atomic byte so that signalling never
//! blocks and never allocates.
//!
//! ```text
//!   Idle --signal--> Signaled(kind) --check--> Consumed(kind) --acknowledge--> Idle
//!                         ^                          |
//!                         +--------- signal ---------+
//! ```
//!
//! A termination request, pending or consumed, absorbs later cancels.
//!
//! A consumed request stays visible: every later safepoint raises it again
//! until it is acknowledged, either by a handler that explicitly catches
//! class "57" or by the top-level call boundary.

use crate::error::{codes, Severity};
use crate::exception::BridgedException;
use crossbeam::channel::{self, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE: u8 = 0;
const CANCEL: u8 = 1;
const TERMINATE: u8 = 2;
const KIND_MASK: u8 = 0x0f;
const CONSUMED: u8 = 0x10;

/// The kind of interruption requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interrupt {
    /// Cancel the running statement.
    Cancel,
    /// Terminate the session.
    Terminate,
}

impl Interrupt {
    fn bits(self) -> u8 {
        match self {
            Interrupt::Cancel => CANCEL,
            Interrupt::Terminate => TERMINATE,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits & KIND_MASK {
            CANCEL => Some(Interrupt::Cancel),
            TERMINATE => Some(Interrupt::Terminate),
            _ => None,
        }
    }

    /// The exception raised when this interrupt is observed.
    pub fn to_exception(self) -> BridgedException {
        match self {
            Interrupt::Cancel => BridgedException::new(
                Severity::Error,
                codes::QUERY_CANCELED,
                "canceling statement due to user request",
            ),
            Interrupt::Terminate => BridgedException::new(
                Severity::Fatal,
                codes::ADMIN_SHUTDOWN,
                "terminating connection due to administrator command",
            ),
        }
    }
}

/// Observable state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Nothing pending.
    Idle,
    /// Requested but not yet observed by the script.
    Signaled(Interrupt),
    /// Observed at a safepoint and not yet acknowledged.
    Consumed(Interrupt),
}

/// Lock-free cancellation flag shared between the session and its handles.
#[derive(Debug, Default)]
pub struct CancellationMonitor {
    state: AtomicU8,
}

impl CancellationMonitor {
    /// Creates an idle monitor.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Requests an interruption. Safe to call from any thread or a signal
    /// handler. Termination is never downgraded to cancellation, even after
    /// it was consumed.
    pub fn signal(&self, kind: Interrupt) {
        let want = kind.bits();
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                let held = cur & KIND_MASK;
                if held == TERMINATE || (cur & CONSUMED == 0 && held >= want) {
                    None
                } else {
                    Some(want)
                }
            });
    }

    /// Current state.
    pub fn state(&self) -> MonitorState {
        let cur = self.state.load(Ordering::SeqCst);
        match Interrupt::from_bits(cur) {
            None => MonitorState::Idle,
            Some(kind) if cur & CONSUMED != 0 => MonitorState::Consumed(kind),
            Some(kind) => MonitorState::Signaled(kind),
        }
    }

    /// Safepoint check. Consumes a pending request and returns the
    /// interruption to raise, if any.
    pub fn check(&self) -> Option<Interrupt> {
        loop {
            let cur = self.state.load(Ordering::SeqCst);
            let kind = Interrupt::from_bits(cur)?;
            if cur & CONSUMED != 0 {
                return Some(kind);
            }
            if self
                .state
                .compare_exchange(cur, CONSUMED | cur, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                log::debug!("interrupt {:?} observed at safepoint", kind);
                return Some(kind);
            }
        }
    }

    /// Withdraws a request of `kind` that has not been observed yet.
    pub fn withdraw(&self, kind: Interrupt) -> bool {
        self.state
            .compare_exchange(kind.bits(), IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clears a consumed request. A request signaled after it was consumed
    /// stays pending.
    pub fn acknowledge(&self) {
        let cur = self.state.load(Ordering::SeqCst);
        if cur & CONSUMED != 0 {
            let _ = self
                .state
                .compare_exchange(cur, IDLE, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

/// Cloneable, thread-safe handle used to interrupt a session.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    monitor: Arc<CancellationMonitor>,
}

impl CancelHandle {
    pub(crate) fn new(monitor: Arc<CancellationMonitor>) -> Self {
        Self { monitor }
    }

    /// Cancels the running statement, or the next one if none is running.
    pub fn cancel(&self) {
        self.monitor.signal(Interrupt::Cancel);
    }

    /// Terminates the session at its next safepoint.
    pub fn terminate(&self) {
        self.monitor.signal(Interrupt::Terminate);
    }

    /// True when a request has not been observed yet.
    pub fn is_pending(&self) -> bool {
        matches!(self.monitor.state(), MonitorState::Signaled(_))
    }

    /// Cancels after `timeout` unless the returned watchdog is dropped first.
    pub fn cancel_after(&self, timeout: Duration) -> Watchdog {
        let (disarm, disarmed) = channel::bounded::<()>(1);
        let fired = Arc::new(AtomicBool::new(false));
        let handle = self.clone();
        let fired_flag = Arc::clone(&fired);

        let thread = thread::spawn(move || {
            crossbeam::select! {
                recv(disarmed) -> _ => {}
                recv(channel::after(timeout)) -> _ => {
                    log::debug!("statement timeout of {:?} expired", timeout);
                    fired_flag.store(true, Ordering::SeqCst);
                    handle.cancel();
                }
            }
        });

        Watchdog {
            disarm: Some(disarm),
            thread: Some(thread),
            fired,
        }
    }
}

/// Timer that cancels a session when it expires. Dropping it disarms it.
pub struct Watchdog {
    disarm: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    /// True if the timer expired.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Closing the channel wakes the timer thread.
        drop(self.disarm.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
