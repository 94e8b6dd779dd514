//! Emulated OS leaves: process identity, the process-wide handle table, raw
//! events and per-endpoint delivery ports.
//!
//! Everything above this module is portable; these are the only primitives a
//! real platform port would replace (handle duplication, wait/notify, and the
//! per-destination delivery queue).

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;

pub type Pid = u64;
pub type RawHandle = u64;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn live_processes() -> &'static DashMap<Pid, ()> {
    static LIVE: OnceLock<DashMap<Pid, ()>> = OnceLock::new();
    LIVE.get_or_init(DashMap::new)
}

fn handle_table() -> &'static DashMap<RawHandle, Resource> {
    static TABLE: OnceLock<DashMap<RawHandle, Resource>> = OnceLock::new();
    TABLE.get_or_init(DashMap::new)
}

/// Mint a live process identity. Retired again by [`unregister_process`].
pub fn register_process() -> Pid {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    live_processes().insert(pid, ());
    pid
}

pub fn unregister_process(pid: Pid) {
    live_processes().remove(&pid);
}

pub fn is_alive(pid: Pid) -> bool {
    live_processes().contains_key(&pid)
}

#[derive(Clone)]
pub enum Resource {
    Event(std::sync::Arc<RawEvent>),
    Port(std::sync::Arc<Port>),
}

fn insert_resource(resource: Resource) -> RawHandle {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    handle_table().insert(handle, resource);
    handle
}

pub fn create_event() -> RawHandle {
    insert_resource(Resource::Event(std::sync::Arc::new(RawEvent::new())))
}

pub fn register_port(port: std::sync::Arc<Port>) -> RawHandle {
    insert_resource(Resource::Port(port))
}

pub fn lookup_event(handle: RawHandle) -> Option<std::sync::Arc<RawEvent>> {
    match handle_table().get(&handle).map(|r| r.clone()) {
        Some(Resource::Event(event)) => Some(event),
        _ => None,
    }
}

pub fn lookup_port(handle: RawHandle) -> Option<std::sync::Arc<Port>> {
    match handle_table().get(&handle).map(|r| r.clone()) {
        Some(Resource::Port(port)) => Some(port),
        _ => None,
    }
}

/// Duplicate a handle for transfer. The local copy stays open; the duplicate
/// refers to the same underlying resource.
pub fn duplicate_handle(handle: RawHandle) -> Option<RawHandle> {
    let resource = handle_table().get(&handle).map(|r| r.clone())?;
    Some(insert_resource(resource))
}

/// Duplicate a handle received from `source_pid` into the current process.
/// Fails if the source process has exited or the handle is stale.
pub fn duplicate_from(source_pid: Pid, handle: RawHandle) -> Option<RawHandle> {
    if source_pid == 0 || handle == 0 || !is_alive(source_pid) {
        return None;
    }
    duplicate_handle(handle)
}

/// Closing an unknown or already-closed handle is a no-op.
pub fn close_handle(handle: RawHandle) {
    handle_table().remove(&handle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Fired,
    TimedOut,
}

/// Auto-reset wait/notify primitive. A `notify` wakes exactly one pending or
/// future `wait`; waiting consumes the signal.
pub struct RawEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl RawEvent {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Block until notified, or until `timeout` elapses. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let mut signaled = self.signaled.lock().unwrap();
        match timeout {
            None => {
                while !*signaled {
                    signaled = self.cond.wait(signaled).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*signaled {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    let (guard, _) = self.cond.wait_timeout(signaled, deadline - now).unwrap();
                    signaled = guard;
                }
            }
        }
        *signaled = false;
        WaitResult::Fired
    }
}

impl Default for RawEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// One delivery message. `holds` carries resources whose ownership a sent
/// parcel transferred to the transport; they are dropped once the destination
/// finishes dispatching.
pub struct Message {
    pub code: i32,
    pub data: Vec<u8>,
    pub reply_to: RawHandle,
    pub flags: u32,
    pub holds: Vec<Box<dyn Any + Send>>,
}

/// FIFO delivery queue for one endpoint. Posting preserves send order, which
/// is what gives one-way transactions their per-destination ordering.
pub struct Port {
    queue: Mutex<VecDeque<Message>>,
    event: RawEvent,
}

impl Port {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            event: RawEvent::new(),
        }
    }

    pub fn post(&self, message: Message) {
        self.queue.lock().unwrap().push_back(message);
        self.event.notify();
    }

    pub fn try_pop(&self) -> Option<Message> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Wake the port's waiter without posting a message. Used when a message
    /// is consumed on one thread and its outcome lands somewhere another
    /// thread checks.
    pub fn wake(&self) {
        self.event.notify();
    }

    /// Wait for the next post, or until `timeout`. Spurious wakeups are fine;
    /// callers re-check the queue.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        if !self.queue.lock().unwrap().is_empty() {
            return WaitResult::Fired;
        }
        self.event.wait(timeout)
    }
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn event_is_auto_reset() {
        let event = RawEvent::new();
        event.notify();
        assert_eq!(event.wait(Some(Duration::from_millis(10))), WaitResult::Fired);
        assert_eq!(
            event.wait(Some(Duration::from_millis(10))),
            WaitResult::TimedOut
        );
    }

    #[test]
    fn event_wakes_waiter_across_threads() {
        let event = Arc::new(RawEvent::new());
        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait(Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        event.notify();
        assert_eq!(waiter.join().unwrap(), WaitResult::Fired);
    }

    #[test]
    fn duplicate_from_dead_process_fails() {
        let pid = register_process();
        let handle = create_event();
        assert!(duplicate_from(pid, handle).is_some());

        unregister_process(pid);
        assert!(duplicate_from(pid, handle).is_none());
        close_handle(handle);
    }

    #[test]
    fn duplicated_event_shares_state() {
        let handle = create_event();
        let dup = duplicate_handle(handle).unwrap();
        assert_ne!(handle, dup);

        lookup_event(handle).unwrap().notify();
        assert_eq!(
            lookup_event(dup).unwrap().wait(Some(Duration::from_millis(10))),
            WaitResult::Fired
        );
        close_handle(handle);
        close_handle(dup);
    }

    #[test]
    fn port_preserves_fifo_order() {
        let port = Port::new();
        for code in 0..4 {
            port.post(Message {
                code,
                data: Vec::new(),
                reply_to: 0,
                flags: 0,
                holds: Vec::new(),
            });
        }
        for code in 0..4 {
            assert_eq!(port.try_pop().unwrap().code, code);
        }
        assert!(port.try_pop().is_none());
    }
}
