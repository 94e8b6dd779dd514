//! Waitable event shared across process boundaries.
//!
//! A `PlatformEvent` wraps a handle-table event. Synchronous waits block the
//! caller; asynchronous waits hand the block to a worker thread which runs
//! the registered callback when the event fires or the timeout lapses. Both
//! outcomes funnel through one completion path, so a `cancel` racing a
//! `notify` suppresses the callback exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::handle::PlatformHandle;
use crate::parcel::Parcel;
use crate::sys::{self, Pid, WaitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Synchronous,
    Asynchronous,
}

type Callback = Arc<dyn Fn(&PlatformEvent) + Send + Sync>;

#[derive(Default)]
struct State {
    cancelled: bool,
    wait_callback: Option<Callback>,
    time_callback: Option<Callback>,
}

pub struct PlatformEvent {
    handle: Mutex<PlatformHandle>,
    state: Mutex<State>,
}

impl PlatformEvent {
    pub fn new(owner_pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(PlatformHandle::new(owner_pid)),
            state: Mutex::new(State::default()),
        })
    }

    /// Allocate the underlying OS event. A second call keeps the first one.
    pub fn create(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_null() {
            handle.set_handle(sys::create_event());
        }
    }

    pub fn handle(&self) -> sys::RawHandle {
        self.handle.lock().unwrap().handle()
    }

    pub fn is_null(&self) -> bool {
        self.handle.lock().unwrap().is_null()
    }

    /// Callback invoked when an asynchronous wait completes by firing.
    pub fn set_wait_callback(&self, callback: impl Fn(&PlatformEvent) + Send + Sync + 'static) {
        self.state.lock().unwrap().wait_callback = Some(Arc::new(callback));
    }

    /// Callback invoked when an asynchronous wait completes by timeout.
    pub fn set_time_callback(&self, callback: impl Fn(&PlatformEvent) + Send + Sync + 'static) {
        self.state.lock().unwrap().time_callback = Some(Arc::new(callback));
    }

    /// Wait without a deadline. Returns the outcome for synchronous waits;
    /// asynchronous waits return `None` immediately and complete through the
    /// callbacks.
    pub fn wait(self: &Arc<Self>, mode: WaitMode) -> Option<WaitResult> {
        self.platform_wait(None, mode)
    }

    /// Wait with a deadline. Same completion contract as [`wait`](Self::wait).
    pub fn wait_for(self: &Arc<Self>, timeout: Duration, mode: WaitMode) -> Option<WaitResult> {
        self.platform_wait(Some(timeout), mode)
    }

    pub fn notify(&self) {
        if let Some(event) = sys::lookup_event(self.handle()) {
            event.notify();
        }
    }

    /// Abandon a pending asynchronous wait. The waiter is woken but its
    /// callback is swallowed, even if a real `notify` lands first.
    pub fn cancel(&self) {
        let raw = {
            let mut state = self.state.lock().unwrap();
            state.cancelled = true;
            self.handle()
        };
        if let Some(event) = sys::lookup_event(raw) {
            event.notify();
        }
    }

    fn platform_wait(self: &Arc<Self>, timeout: Option<Duration>, mode: WaitMode) -> Option<WaitResult> {
        let Some(event) = sys::lookup_event(self.handle()) else {
            warn!("wait on an event that was never created");
            return None;
        };
        match mode {
            WaitMode::Synchronous => Some(event.wait(timeout)),
            WaitMode::Asynchronous => {
                let this = Arc::clone(self);
                std::thread::spawn(move || {
                    let result = event.wait(timeout);
                    this.fired(result == WaitResult::TimedOut);
                });
                None
            }
        }
    }

    /// Single completion path for asynchronous waits. Runs on the worker
    /// thread, never on the looper.
    fn fired(&self, is_timeout: bool) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                state.cancelled = false;
                return;
            }
            if is_timeout {
                state.time_callback.clone()
            } else {
                state.wait_callback.clone()
            }
        };
        if let Some(callback) = callback {
            callback(self);
        }
    }

    pub fn write_to_parcel(&self, dest: &mut Parcel) -> Result<()> {
        self.handle.lock().unwrap().write_to_parcel(dest)
    }

    pub fn read_from_parcel(&self, source: &mut Parcel) -> Result<()> {
        self.handle.lock().unwrap().read_from_parcel(source)
    }
}
