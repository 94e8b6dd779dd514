//! Service channel: the host/client protocol that keeps one kind of service
//! object consistent across processes.
//!
//! One channel per shared service type per process. The root process runs the
//! channel in the Host role and owns every authoritative object; all other
//! processes run Client channels holding mirrors. Every payload leads with
//! the channel's service name so several channels can share one endpoint;
//! a channel that reads a foreign name rewinds the parcel and declines, which
//! lets first-match-wins dispatch offer the transaction to the next channel.

use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, error, warn};

use crate::binder::{transaction_code, TransactionFlags, PROTO_SERVICE};
use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::object::{write_object, ServiceObject};
use crate::parcel::Parcel;
use crate::process::{MessageClient, Process};
use crate::registry::ObjectUid;
use crate::sys::Pid;

pub const CREATE_OBJECT: i32 = transaction_code(PROTO_SERVICE, 1);
pub const IMPORT_OBJECT: i32 = transaction_code(PROTO_SERVICE, 2);
pub const UPDATE_OBJECT: i32 = transaction_code(PROTO_SERVICE, 3);
pub const NOTIFY_OBJECT: i32 = transaction_code(PROTO_SERVICE, 4);
pub const REMOVE_OBJECT: i32 = transaction_code(PROTO_SERVICE, 5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

pub type ObjectFactory =
    Box<dyn Fn(&Arc<ServiceChannel>) -> Arc<dyn ServiceObject> + Send + Sync>;

pub struct ServiceChannel {
    process: Weak<Process>,
    weak_self: OnceLock<Weak<ServiceChannel>>,
    role: Role,
    name: String,
    factory: ObjectFactory,
}

impl ServiceChannel {
    /// Create the channel for `name` on `process` and register it for
    /// transaction dispatch. The role follows the process: the root hosts,
    /// everyone else mirrors.
    pub fn register(
        process: &Arc<Process>,
        name: impl Into<String>,
        factory: impl Fn(&Arc<ServiceChannel>) -> Arc<dyn ServiceObject> + Send + Sync + 'static,
    ) -> Arc<ServiceChannel> {
        let role = if process.is_root() {
            Role::Host
        } else {
            Role::Client
        };
        let channel = Arc::new(ServiceChannel {
            process: Arc::downgrade(process),
            weak_self: OnceLock::new(),
            role,
            name: name.into(),
            factory: Box::new(factory),
        });
        let _ = channel.weak_self.set(Arc::downgrade(&channel));
        process.append_message_client(channel.clone());
        channel
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn process(&self) -> Result<Arc<Process>> {
        self.process.upgrade().ok_or(Error::Closed)
    }

    fn make_object(&self) -> Result<Arc<dyn ServiceObject>> {
        let this = self
            .weak_self
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::Closed)?;
        Ok((self.factory)(&this))
    }

    /// Create a shared object from constructor arguments in `init`. On the
    /// host the object is built directly; on a client the request travels to
    /// the root and the reply is imported as a mirror.
    pub fn create(&self, init: &mut Parcel) -> Result<Arc<dyn ServiceObject>> {
        match self.role {
            Role::Host => self.host_create(init),
            Role::Client => {
                let mut request = Parcel::new();
                request.write_str(&self.name);
                request.write_pid(self.process()?.pid());
                request.write_bytes(init.as_slice());
                let mut reply = Parcel::new();
                self.process()?.root_binder().transact(
                    CREATE_OBJECT,
                    &mut request,
                    Some(&mut reply),
                    TransactionFlags::empty(),
                )?;
                self.import_object(&mut reply)?
                    .ok_or(Error::ObjectNotFound(0))
            }
        }
    }

    fn host_create(&self, init: &mut Parcel) -> Result<Arc<dyn ServiceObject>> {
        debug_assert_eq!(self.role, Role::Host);
        let object = self.make_object()?;
        object.create_from_parcel(init)?;
        self.process()?.registry().add(&object);
        debug!(uid = object.core().uid(), name = %self.name, "service object created");
        Ok(object)
    }

    /// Read one object reference from `source`. A zero uid reads as `None`.
    /// Importing a uid this process already knows yields the existing
    /// instance; a new uid builds a mirror and announces interest to the
    /// host.
    pub fn import_object(&self, source: &mut Parcel) -> Result<Option<Arc<dyn ServiceObject>>> {
        let uid = source.read_i32()?;
        if uid == 0 {
            return Ok(None);
        }
        let process = self.process()?;
        if let Some(existing) = process.registry().get(uid) {
            return Ok(Some(existing));
        }
        if self.role == Role::Host {
            // The host owns every live object; an unknown uid here means the
            // object already died.
            return Err(Error::ObjectGone(uid));
        }
        let object = self.make_object()?;
        object.core().set_uid(uid);
        process.registry().add(&object);
        self.announce_import(&object)?;
        debug!(uid, name = %self.name, "service object imported");
        Ok(Some(object))
    }

    fn announce_import(&self, object: &Arc<dyn ServiceObject>) -> Result<()> {
        let process = self.process()?;
        let mut request = Parcel::new();
        request.write_str(&self.name);
        request.write_i32(object.core().uid());
        request.write_pid(process.pid());
        let mut reply = Parcel::new();
        process.root_binder().transact(
            IMPORT_OBJECT,
            &mut request,
            Some(&mut reply),
            TransactionFlags::empty(),
        )?;
        // The reply carries the authoritative state for the fresh mirror.
        object.read_from_parcel(&mut reply)
    }

    /// Apply `data` to the authoritative copy of `uid` and propagate the
    /// result: other importers get a one-way notification, the caller's
    /// mirror adopts the replied state.
    pub fn update(&self, uid: ObjectUid, data: &Bundle) -> Result<()> {
        let process = self.process()?;
        match self.role {
            Role::Host => {
                let object = process.registry().get(uid).ok_or(Error::ObjectNotFound(uid))?;
                object.update_from_bundle(data, process.pid())?;
                self.notify(uid, process.pid())
            }
            Role::Client => {
                let mut request = Parcel::new();
                request.write_str(&self.name);
                request.write_i32(uid);
                request.write_pid(process.pid());
                request.write_parcelable(data)?;
                let mut reply = Parcel::new();
                process.root_binder().transact(
                    UPDATE_OBJECT,
                    &mut request,
                    Some(&mut reply),
                    TransactionFlags::empty(),
                )?;
                let object = process.registry().get(uid).ok_or(Error::ObjectNotFound(uid))?;
                object.read_from_parcel(&mut reply)
            }
        }
    }

    /// Push the current state of `uid` to every importing process except
    /// `sender_pid`. Host only; a client has nothing authoritative to push.
    pub fn notify(&self, uid: ObjectUid, sender_pid: Pid) -> Result<()> {
        if self.role != Role::Host {
            return Err(Error::InvalidRole(Role::Host));
        }
        let process = self.process()?;
        let object = process.registry().get(uid).ok_or(Error::ObjectNotFound(uid))?;
        debug!(uid, sender_pid, "broadcasting update notification");
        for (pid, endpoint) in process.registry().importers_except(uid, sender_pid) {
            let mut notification = Parcel::new();
            notification.write_str(&self.name);
            notification.write_i32(uid);
            notification.write_pid(sender_pid);
            write_object(&mut notification, &object)?;
            let target = process.self_binder().adopt(endpoint);
            if let Err(err) = target.transact(
                NOTIFY_OBJECT,
                &mut notification,
                None,
                TransactionFlags::ONE_WAY,
            ) {
                error!(uid, pid, %err, "couldn't notify remote service object");
            }
        }
        Ok(())
    }

    /// The object under `uid` died in this process: deregister it and, on a
    /// client, withdraw this process's interest with the host. One-way so an
    /// object may die inside any dispatch without blocking.
    pub(crate) fn remove(&self, uid: ObjectUid) {
        let Ok(process) = self.process() else { return };
        if self.role == Role::Client {
            let mut request = Parcel::new();
            request.write_str(&self.name);
            request.write_i32(uid);
            request.write_pid(process.pid());
            if let Err(err) =
                process
                    .root_binder()
                    .transact(REMOVE_OBJECT, &mut request, None, TransactionFlags::ONE_WAY)
            {
                error!(uid, %err, "couldn't withdraw interest with service host");
            }
        }
        process.registry().remove(uid);
    }

    pub(crate) fn mint_uid(&self) -> Result<ObjectUid> {
        let process = self.process()?;
        debug_assert!(process.is_root());
        Ok(process.registry().mint_uid())
    }

    pub(crate) fn registry_ref(&self, uid: ObjectUid) -> Result<()> {
        self.process()?.registry().ref_(uid)
    }

    pub(crate) fn registry_deref(&self, uid: ObjectUid) {
        if let Ok(process) = self.process() {
            process.registry().deref(uid);
        }
    }

    fn handle_verb(
        &self,
        code: i32,
        data: &mut Parcel,
        reply: Option<&mut Parcel>,
        _flags: TransactionFlags,
    ) -> Result<bool> {
        match (self.role, code) {
            (Role::Host, CREATE_OBJECT) => {
                let pid = data.read_pid()?;
                let mut init = Parcel::from_bytes(data.read_bytes()?);
                let object = self.host_create(&mut init)?;
                // Record the creator's interest before replying, so the
                // object stays pinned while the reply is in flight.
                let endpoint = data.origin().map(|origin| origin.handle()).unwrap_or(0);
                let process = self.process()?;
                process
                    .registry()
                    .import_to_process(object.core().uid(), pid, endpoint)?;
                if let Some(reply) = reply {
                    write_object(reply, &object)?;
                }
                Ok(true)
            }
            (Role::Host, IMPORT_OBJECT) => {
                let uid = data.read_i32()?;
                let pid = data.read_pid()?;
                let endpoint = data.origin().map(|origin| origin.handle()).unwrap_or(0);
                let process = self.process()?;
                process.registry().import_to_process(uid, pid, endpoint)?;
                let object = process.registry().get(uid).ok_or(Error::ObjectGone(uid))?;
                if let Some(reply) = reply {
                    write_object(reply, &object)?;
                }
                Ok(true)
            }
            (Role::Host, UPDATE_OBJECT) => {
                let uid = data.read_i32()?;
                let sender_pid = data.read_pid()?;
                let bundle: Bundle = data.read_parcelable()?;
                let process = self.process()?;
                let object = process.registry().get(uid).ok_or(Error::ObjectGone(uid))?;
                object.update_from_bundle(&bundle, sender_pid)?;
                self.notify(uid, sender_pid)?;
                if let Some(reply) = reply {
                    write_object(reply, &object)?;
                }
                Ok(true)
            }
            (Role::Host, REMOVE_OBJECT) => {
                let uid = data.read_i32()?;
                let pid = data.read_pid()?;
                self.process()?.registry().remove_from_process(uid, pid);
                Ok(true)
            }
            (Role::Client, NOTIFY_OBJECT) => {
                let uid = data.read_i32()?;
                let sender_pid = data.read_pid()?;
                let process = self.process()?;
                if sender_pid == process.pid() {
                    error!(uid, "update notification bounced back to its sender");
                    return Ok(true);
                }
                if let Some(object) = process.registry().get(uid) {
                    object.read_from_parcel(data)?;
                } else {
                    debug!(uid, "notification for an object this process no longer holds");
                }
                Ok(true)
            }
            (role, code) => {
                warn!(?role, code, "verb not valid for this channel's role, dropped");
                Ok(true)
            }
        }
    }
}

impl MessageClient for ServiceChannel {
    fn on_transaction(
        &self,
        code: i32,
        data: &mut Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> bool {
        if !matches!(
            code,
            CREATE_OBJECT | IMPORT_OBJECT | UPDATE_OBJECT | NOTIFY_OBJECT | REMOVE_OBJECT
        ) {
            return false;
        }
        let saved = data.read_pos();
        let name = match data.read_str() {
            Ok(name) => name,
            Err(_) => {
                data.seek(saved);
                return false;
            }
        };
        if name != self.name {
            data.seek(saved);
            return false;
        }
        match self.handle_verb(code, data, reply, flags) {
            Ok(handled) => handled,
            Err(err) => {
                error!(code, name = %self.name, %err, "service transaction failed");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectCore;
    use std::sync::Mutex;

    struct Counter {
        core: ObjectCore,
        value: Mutex<i64>,
    }

    impl Counter {
        fn new(channel: &Arc<ServiceChannel>) -> Arc<dyn ServiceObject> {
            Arc::new(Counter {
                core: ObjectCore::new(channel),
                value: Mutex::new(0),
            })
        }

        fn value(&self) -> i64 {
            *self.value.lock().unwrap()
        }
    }

    impl ServiceObject for Counter {
        fn core(&self) -> &ObjectCore {
            &self.core
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn create_from_parcel(&self, source: &mut Parcel) -> Result<()> {
            self.core.assign_new_uid()?;
            *self.value.lock().unwrap() = source.read_i64().unwrap_or(0);
            Ok(())
        }

        fn update_from_bundle(&self, data: &Bundle, _sender_pid: Pid) -> Result<()> {
            if let Some(delta) = data.get_long("add") {
                *self.value.lock().unwrap() += delta;
            }
            Ok(())
        }

        fn read_from_parcel(&self, source: &mut Parcel) -> Result<()> {
            let uid = source.read_i32()?;
            self.core.set_uid(uid);
            *self.value.lock().unwrap() = source.read_i64()?;
            Ok(())
        }

        fn write_to_parcel(&self, dest: &mut Parcel) -> Result<()> {
            dest.write_i32(self.core.uid());
            dest.write_i64(self.value());
            Ok(())
        }
    }

    fn counter_channel(process: &Arc<Process>) -> Arc<ServiceChannel> {
        ServiceChannel::register(process, "counter", Counter::new)
    }

    #[test]
    fn host_create_mints_monotonic_uids() {
        let process = Process::new_root();
        let channel = counter_channel(&process);

        let mut init = Parcel::new();
        init.write_i64(5);
        let first = channel.create(&mut init).unwrap();

        let mut init = Parcel::new();
        init.write_i64(9);
        let second = channel.create(&mut init).unwrap();

        assert!(second.core().uid() > first.core().uid());
        let counter = first.as_any().downcast_ref::<Counter>().unwrap();
        assert_eq!(counter.value(), 5);
    }

    #[test]
    fn host_update_applies_the_bundle() {
        let process = Process::new_root();
        let channel = counter_channel(&process);

        let mut init = Parcel::new();
        init.write_i64(10);
        let object = channel.create(&mut init).unwrap();

        let mut bundle = Bundle::new();
        bundle.put_long("add", 32);
        object.update(&bundle).unwrap();

        let counter = object.as_any().downcast_ref::<Counter>().unwrap();
        assert_eq!(counter.value(), 42);
    }

    #[test]
    fn notify_requires_the_host_role() {
        let root = Process::new_root();
        let satellite = Process::connect(root.handle());
        let channel = counter_channel(&satellite);
        assert_eq!(channel.role(), Role::Client);
        assert!(matches!(
            channel.notify(1, satellite.pid()),
            Err(Error::InvalidRole(Role::Host))
        ));
    }

    #[test]
    fn foreign_name_rewinds_and_declines() {
        let process = Process::new_root();
        let channel = counter_channel(&process);

        let mut data = Parcel::new();
        data.write_str("other-service");
        data.write_i32(1);
        assert!(!channel.on_transaction(IMPORT_OBJECT, &mut data, None, TransactionFlags::empty()));
        assert_eq!(data.read_str().unwrap(), "other-service");
    }
}
