//! Per-process registry of live service objects.
//!
//! Each entry tracks one object under its uid, with an explicit ref count on
//! top of `Arc`: while any remote process (or in-flight parcel) holds a
//! registry ref, the entry pins the object strongly. When the count drops to
//! zero the pin demotes to a weak reference, so the object can die the moment
//! local owners let go, yet can be resurrected as long as one is alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::object::ServiceObject;
use crate::sys::{Pid, RawHandle};

pub type ObjectUid = i32;

struct RefState {
    ref_count: usize,
    strong: Option<Arc<dyn ServiceObject>>,
    weak: Weak<dyn ServiceObject>,
}

/// Ref-counted pin on one registered object.
pub struct ServiceObjectRef {
    uid: ObjectUid,
    state: Mutex<RefState>,
}

impl ServiceObjectRef {
    fn new(object: &Arc<dyn ServiceObject>) -> Self {
        Self {
            uid: object.core().uid(),
            state: Mutex::new(RefState {
                ref_count: 0,
                strong: None,
                weak: Arc::downgrade(object),
            }),
        }
    }

    /// Take a ref, resurrecting the strong pin from the weak one if needed.
    /// Fails once the object is gone for good.
    pub fn ref_(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.strong.is_none() {
            let strong = state.weak.upgrade().ok_or(Error::ObjectGone(self.uid))?;
            state.strong = Some(strong);
        }
        state.ref_count += 1;
        Ok(())
    }

    /// Drop a ref. Returns the demoted strong pin when the count reaches
    /// zero; the caller drops it outside any registry lock.
    #[must_use]
    pub fn deref(&self) -> Option<Arc<dyn ServiceObject>> {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.ref_count > 0, "unbalanced deref on object {}", self.uid);
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 {
            if let Some(strong) = state.strong.take() {
                state.weak = Arc::downgrade(&strong);
                return Some(strong);
            }
        }
        None
    }

    /// Peek without changing the count.
    pub fn get(&self) -> Option<Arc<dyn ServiceObject>> {
        let state = self.state.lock().unwrap();
        state.strong.clone().or_else(|| state.weak.upgrade())
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.state.lock().unwrap().ref_count
    }
}

struct ObjectEntry {
    reference: ServiceObjectRef,
    /// Interested remote processes, with the endpoint each registered from.
    importers: HashMap<Pid, RawHandle>,
}

pub struct Registry {
    entries: DashMap<ObjectUid, ObjectEntry>,
    next_uid: AtomicI32,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_uid: AtomicI32::new(1),
        }
    }

    /// Mint a fresh uid. Monotonic, never reused. Root process only.
    pub fn mint_uid(&self) -> ObjectUid {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an object under its uid. Registering an already-known uid is
    /// a no-op so repeated imports converge on the first entry.
    pub fn add(&self, object: &Arc<dyn ServiceObject>) {
        let uid = object.core().uid();
        debug_assert!(uid != 0);
        self.entries.entry(uid).or_insert_with(|| {
            debug!(uid, "service object registered");
            ObjectEntry {
                reference: ServiceObjectRef::new(object),
                importers: HashMap::new(),
            }
        });
    }

    pub fn get(&self, uid: ObjectUid) -> Option<Arc<dyn ServiceObject>> {
        self.entries.get(&uid).and_then(|entry| entry.reference.get())
    }

    pub fn contains(&self, uid: ObjectUid) -> bool {
        self.entries.contains_key(&uid)
    }

    /// Drop the entry entirely. Called when the object itself is destroyed.
    pub fn remove(&self, uid: ObjectUid) {
        if self.entries.remove(&uid).is_some() {
            debug!(uid, "service object deregistered");
        }
    }

    pub fn ref_(&self, uid: ObjectUid) -> Result<()> {
        let entry = self.entries.get(&uid).ok_or(Error::ObjectNotFound(uid))?;
        entry.reference.ref_()
    }

    pub fn deref(&self, uid: ObjectUid) {
        // The demoted pin must drop after the map guard is released; its
        // destructor may come back here to remove the entry.
        let demoted = match self.entries.get(&uid) {
            Some(entry) => entry.reference.deref(),
            None => {
                warn!(uid, "deref of an unregistered object");
                None
            }
        };
        drop(demoted);
    }

    /// Record `pid`'s interest in `uid`. The first registration per process
    /// takes one registry ref; [`remove_from_process`](Self::remove_from_process)
    /// gives it back.
    pub fn import_to_process(&self, uid: ObjectUid, pid: Pid, endpoint: RawHandle) -> Result<()> {
        let mut entry = self.entries.get_mut(&uid).ok_or(Error::ObjectNotFound(uid))?;
        if entry.importers.contains_key(&pid) {
            return Ok(());
        }
        entry.reference.ref_()?;
        entry.importers.insert(pid, endpoint);
        debug!(uid, pid, "object imported to process");
        Ok(())
    }

    pub fn remove_from_process(&self, uid: ObjectUid, pid: Pid) {
        let demoted = match self.entries.get_mut(&uid) {
            Some(mut entry) => {
                if entry.importers.remove(&pid).is_none() {
                    return;
                }
                debug!(uid, pid, "object removed from process");
                entry.reference.deref()
            }
            None => None,
        };
        drop(demoted);
    }

    /// Importing processes of `uid`, excluding `sender`.
    pub fn importers_except(&self, uid: ObjectUid, sender: Pid) -> Vec<(Pid, RawHandle)> {
        match self.entries.get(&uid) {
            Some(entry) => entry
                .importers
                .iter()
                .filter(|(pid, _)| **pid != sender)
                .map(|(pid, endpoint)| (*pid, *endpoint))
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectCore;
    use crate::parcel::Parcel;

    struct Plain {
        core: ObjectCore,
    }

    impl ServiceObject for Plain {
        fn core(&self) -> &ObjectCore {
            &self.core
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn plain(uid: ObjectUid) -> Arc<dyn ServiceObject> {
        let core = ObjectCore::detached();
        core.set_uid(uid);
        Arc::new(Plain { core })
    }

    #[test]
    fn minted_uids_are_monotonic() {
        let registry = Registry::new();
        let first = registry.mint_uid();
        let second = registry.mint_uid();
        assert!(second > first);
    }

    #[test]
    fn zero_refs_demote_to_weak_and_resurrect() {
        let object = plain(1);
        let reference = ServiceObjectRef::new(&object);

        reference.ref_().unwrap();
        assert_eq!(reference.count(), 1);

        // Drop the only outside owner; the registry ref keeps it alive.
        let weak = Arc::downgrade(&object);
        drop(object);
        assert!(weak.upgrade().is_some());

        // Demote, resurrect while a local owner exists again.
        let revived = reference.get().unwrap();
        drop(reference.deref());
        assert!(weak.upgrade().is_some());
        reference.ref_().unwrap();
        drop(revived);
        assert_eq!(reference.count(), 1);
    }

    #[test]
    fn ref_after_destruction_fails() {
        let object = plain(2);
        let reference = ServiceObjectRef::new(&object);
        drop(object);
        assert!(matches!(reference.ref_(), Err(Error::ObjectGone(2))));
    }

    #[test]
    fn one_ref_per_importing_process() {
        let registry = Registry::new();
        let object = plain(3);
        registry.add(&object);

        registry.import_to_process(3, 10, 100).unwrap();
        registry.import_to_process(3, 10, 100).unwrap();
        registry.import_to_process(3, 11, 101).unwrap();

        // Object survives its local owner while importers remain.
        let weak = Arc::downgrade(&object);
        drop(object);
        assert!(weak.upgrade().is_some());

        registry.remove_from_process(3, 10);
        assert!(weak.upgrade().is_some());
        registry.remove_from_process(3, 11);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn importers_except_skips_the_sender() {
        let registry = Registry::new();
        let object = plain(4);
        registry.add(&object);
        registry.import_to_process(4, 20, 200).unwrap();
        registry.import_to_process(4, 21, 201).unwrap();

        let mut others = registry.importers_except(4, 20);
        others.sort();
        assert_eq!(others, vec![(21, 201)]);
    }

    #[test]
    fn registered_object_round_trips_its_uid() {
        let object = plain(5);
        let mut parcel = Parcel::new();
        object.write_to_parcel(&mut parcel).unwrap();
        assert_eq!(parcel.read_i32().unwrap(), 5);
    }
}
