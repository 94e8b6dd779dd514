//! Per-process composition root: identity, the process's own binder
//! endpoint, the root binder, the object registry, and ordered transaction
//! dispatch to registered message clients.

use std::sync::{Arc, Mutex, Weak};

use crate::binder::{Binder, BinderClient, TransactionFlags};
use crate::parcel::Parcel;
use crate::registry::Registry;
use crate::sys::{self, Pid, RawHandle};

/// A participant in process-level dispatch. Clients are offered incoming
/// transactions in registration order; the first to handle one wins.
pub trait MessageClient: Send + Sync + 'static {
    fn on_timer(&self) {}
    fn on_transaction(
        &self,
        code: i32,
        data: &mut Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> bool;
}

pub struct Process {
    pid: Pid,
    self_binder: Arc<Binder>,
    root_binder: Arc<Binder>,
    registry: Registry,
    clients: Mutex<Vec<Arc<dyn MessageClient>>>,
}

impl Process {
    /// Start the root process: it is its own root and hosts every service
    /// channel registered on it.
    pub fn new_root() -> Arc<Process> {
        Self::new(None)
    }

    /// Start a satellite process connected to the root endpoint `root`.
    pub fn connect(root: RawHandle) -> Arc<Process> {
        Self::new(Some(root))
    }

    fn new(root: Option<RawHandle>) -> Arc<Process> {
        let pid = sys::register_process();
        let client = Arc::new(ProcessClient {
            process: Mutex::new(Weak::new()),
        });
        let self_binder = Binder::create(client.clone());
        let root_binder = match root {
            Some(handle) => self_binder.adopt(handle),
            None => self_binder.clone(),
        };
        let process = Arc::new(Process {
            pid,
            self_binder,
            root_binder,
            registry: Registry::new(),
            clients: Mutex::new(Vec::new()),
        });
        *client.process.lock().unwrap() = Arc::downgrade(&process);
        process
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_root(&self) -> bool {
        self.root_binder.handle() == self.self_binder.handle()
    }

    /// This process's own endpoint.
    pub fn self_binder(&self) -> &Arc<Binder> {
        &self.self_binder
    }

    /// The root endpoint: the self binder in the root process, a proxy
    /// everywhere else.
    pub fn root_binder(&self) -> &Arc<Binder> {
        &self.root_binder
    }

    pub fn handle(&self) -> RawHandle {
        self.self_binder.handle()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Adopt a remote endpoint, routed through this process's binder.
    pub fn adopt_binder(&self, handle: RawHandle) -> Arc<Binder> {
        self.self_binder.adopt(handle)
    }

    /// Arm the repeating process timer; every message client's `on_timer`
    /// runs each tick.
    pub fn set_timeout(&self) -> bool {
        self.self_binder.start()
    }

    /// Arm a one-shot process timer.
    pub fn set_timeout_at(&self, delay: std::time::Duration) -> bool {
        self.self_binder.start_at(delay)
    }

    pub fn append_message_client(&self, client: Arc<dyn MessageClient>) {
        self.clients.lock().unwrap().push(client);
    }

    pub fn remove_message_client(&self, client: &Arc<dyn MessageClient>) {
        self.clients
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, client));
    }

    /// Shut the endpoint down. Terminal.
    pub fn close(&self) {
        self.self_binder.close();
    }

    fn snapshot_clients(&self) -> Vec<Arc<dyn MessageClient>> {
        self.clients.lock().unwrap().clone()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
        sys::unregister_process(self.pid);
    }
}

/// Binder client of the process endpoint; forwards into the message-client
/// list. Separate from `Process` so the binder does not keep the process
/// alive.
struct ProcessClient {
    process: Mutex<Weak<Process>>,
}

impl ProcessClient {
    fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().unwrap().upgrade()
    }
}

impl BinderClient for ProcessClient {
    fn on_timer(&self) {
        let Some(process) = self.process() else { return };
        for client in process.snapshot_clients() {
            client.on_timer();
        }
    }

    fn on_transaction(
        &self,
        code: i32,
        data: &mut Parcel,
        mut reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> bool {
        let Some(process) = self.process() else { return false };
        for client in process.snapshot_clients() {
            if client.on_transaction(code, data, reply.as_deref_mut(), flags) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Selective {
        accept: i32,
        hits: AtomicI32,
        ticks: AtomicI32,
    }

    impl Selective {
        fn new(accept: i32) -> Arc<Self> {
            Arc::new(Self {
                accept,
                hits: AtomicI32::new(0),
                ticks: AtomicI32::new(0),
            })
        }
    }

    impl MessageClient for Selective {
        fn on_timer(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_transaction(
            &self,
            code: i32,
            _data: &mut Parcel,
            _reply: Option<&mut Parcel>,
            _flags: TransactionFlags,
        ) -> bool {
            if code != self.accept {
                return false;
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn root_is_its_own_root() {
        let root = Process::new_root();
        assert!(root.is_root());
        assert_eq!(root.root_binder().handle(), root.handle());

        let satellite = Process::connect(root.handle());
        assert!(!satellite.is_root());
        assert_eq!(satellite.root_binder().handle(), root.handle());
        assert_ne!(satellite.pid(), root.pid());
    }

    #[test]
    fn first_matching_client_wins() {
        let process = Process::new_root();
        let first = Selective::new(1);
        let second = Selective::new(2);
        process.append_message_client(first.clone());
        process.append_message_client(second.clone());

        let mut data = Parcel::new();
        process
            .self_binder()
            .transact(2, &mut data, None, TransactionFlags::empty())
            .unwrap();
        assert_eq!(first.hits.load(Ordering::SeqCst), 0);
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);

        let mut data = Parcel::new();
        process
            .self_binder()
            .transact(1, &mut data, None, TransactionFlags::empty())
            .unwrap();
        assert_eq!(first.hits.load(Ordering::SeqCst), 1);
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_broadcasts_to_every_client() {
        let process = Process::new_root();
        let first = Selective::new(1);
        let second = Selective::new(2);
        process.append_message_client(first.clone());
        process.append_message_client(second.clone());

        assert!(process.set_timeout());
        std::thread::sleep(std::time::Duration::from_millis(100));
        process.self_binder().stop();

        assert!(first.ticks.load(Ordering::SeqCst) >= 2);
        assert!(second.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn removed_client_no_longer_sees_transactions() {
        let process = Process::new_root();
        let client = Selective::new(3);
        let as_message_client: Arc<dyn MessageClient> = client.clone();
        process.append_message_client(as_message_client.clone());
        process.remove_message_client(&as_message_client);

        let mut data = Parcel::new();
        process
            .self_binder()
            .transact(3, &mut data, None, TransactionFlags::empty())
            .unwrap();
        assert_eq!(client.hits.load(Ordering::SeqCst), 0);
    }
}
