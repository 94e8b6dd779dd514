//! Service objects: state shared across processes under one registry uid.
//!
//! A concrete object embeds an [`ObjectCore`] that carries its uid and a
//! back-reference to the channel it lives on. The core's destructor is the
//! object's exit path: it deregisters the uid and, on a client, tells the
//! host this process lost interest.

use std::any::Any;
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, error};

use crate::bundle::Bundle;
use crate::channel::ServiceChannel;
use crate::error::{Error, Result};
use crate::parcel::Parcel;
use crate::registry::ObjectUid;
use crate::sys::Pid;

pub trait ServiceObject: Send + Sync + 'static {
    fn core(&self) -> &ObjectCore;
    fn as_any(&self) -> &dyn Any;

    /// Initialize a brand-new object from constructor arguments. Host side
    /// only; mints the uid. Overrides read their initial state after calling
    /// `self.core().assign_new_uid()`.
    fn create_from_parcel(&self, _source: &mut Parcel) -> Result<()> {
        self.core().assign_new_uid()
    }

    /// Apply an update request on the authoritative copy. Host side only.
    fn update_from_bundle(&self, _data: &Bundle, sender_pid: Pid) -> Result<()> {
        debug!(
            uid = self.core().uid(),
            sender_pid, "service object update requested"
        );
        Ok(())
    }

    /// Apply serialized state. Overrides read the uid first (the default
    /// body), then their own fields in write order.
    fn read_from_parcel(&self, source: &mut Parcel) -> Result<()> {
        let uid = source.read_i32()?;
        self.core().set_uid(uid);
        Ok(())
    }

    /// Serialize full state: the uid, then the fields `read_from_parcel`
    /// expects.
    fn write_to_parcel(&self, dest: &mut Parcel) -> Result<()> {
        dest.write_i32(self.core().uid());
        Ok(())
    }

    /// Push local changes to the authoritative copy and fan the result out
    /// to every other interested process.
    fn update(&self, data: &Bundle) -> Result<()> {
        let channel = self.core().channel().ok_or(Error::Closed)?;
        channel.update(self.core().uid(), data)
    }
}

/// Serialize an object reference: the parcel pins a registry ref for the
/// transfer, then carries the object's state.
pub fn write_object(dest: &mut Parcel, object: &Arc<dyn ServiceObject>) -> Result<()> {
    dest.hold_object(Arc::clone(object))?;
    object.write_to_parcel(dest)
}

pub struct ObjectCore {
    uid: OnceLock<ObjectUid>,
    channel: Weak<ServiceChannel>,
}

impl ObjectCore {
    pub fn new(channel: &Arc<ServiceChannel>) -> Self {
        Self {
            uid: OnceLock::new(),
            channel: Arc::downgrade(channel),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            uid: OnceLock::new(),
            channel: Weak::new(),
        }
    }

    /// The object's uid; 0 until assigned.
    pub fn uid(&self) -> ObjectUid {
        self.uid.get().copied().unwrap_or(0)
    }

    /// Assign the uid exactly once. A conflicting second assignment is a
    /// protocol violation; the first value wins.
    pub fn set_uid(&self, uid: ObjectUid) {
        if self.uid.set(uid).is_err() && self.uid() != uid {
            error!(
                assigned = self.uid(),
                rejected = uid,
                "object uid assigned twice with different values"
            );
        }
    }

    pub fn channel(&self) -> Option<Arc<ServiceChannel>> {
        self.channel.upgrade()
    }

    /// Mint and assign a fresh uid from the root registry.
    pub fn assign_new_uid(&self) -> Result<()> {
        let channel = self.channel().ok_or(Error::Closed)?;
        self.set_uid(channel.mint_uid()?);
        Ok(())
    }

    /// Take a registry ref on this object (parcel transfer, remote import).
    pub fn ref_(&self) -> Result<()> {
        let channel = self.channel().ok_or(Error::Closed)?;
        channel.registry_ref(self.uid())
    }

    /// Give a registry ref back.
    pub fn deref(&self) {
        if let Some(channel) = self.channel() {
            channel.registry_deref(self.uid());
        }
    }
}

impl Drop for ObjectCore {
    fn drop(&mut self) {
        let uid = self.uid();
        if uid == 0 {
            return;
        }
        debug!(uid, "service object is being removed");
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(uid);
        }
    }
}
