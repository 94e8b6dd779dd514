//! Typed envelope for a single transaction's payload.
//!
//! A parcel owns more than bytes: OS handles parked in it for transfer and
//! strong references to service objects it serialized. While the parcel is
//! unsent, dropping it releases all of that (an undelivered message must not
//! leak resources or leave dangling refs). A transport that sends the parcel
//! takes ownership of the holds via [`Parcel::take_holds`] and then marks it
//! sent.

use std::any::Any;
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian};
use tracing::warn;

use crate::binder::Binder;
use crate::bytes::ByteBuffer;
use crate::error::{Error, Result};
use crate::object::ServiceObject;
use crate::sys::{self, Pid, RawHandle};

/// A value with an agreed field-by-field wire layout. Both ends must read
/// fields in exactly the order they were written; there is no schema.
pub trait Parcelable: Sized {
    fn write_to_parcel(&self, dest: &mut Parcel) -> Result<()>;
    fn read_from_parcel(source: &mut Parcel) -> Result<Self>;
}

/// Registry reference held on behalf of an in-flight parcel. Dropping it
/// releases the ref in the owning process's registry.
pub(crate) struct HeldObject {
    object: Arc<dyn ServiceObject>,
}

impl Drop for HeldObject {
    fn drop(&mut self) {
        self.object.core().deref();
    }
}

/// Handle owned by an in-flight message; closed when the message is done.
pub(crate) struct HeldHandle(pub(crate) RawHandle);

impl Drop for HeldHandle {
    fn drop(&mut self) {
        sys::close_handle(self.0);
    }
}

#[derive(Default)]
pub struct Parcel {
    buffer: ByteBuffer,
    held_handles: Vec<RawHandle>,
    held_objects: Vec<HeldObject>,
    origin: Option<Arc<Binder>>,
    sent: bool,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parcel from a contiguous incoming byte block.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut parcel = Self::new();
        parcel.buffer.replace(data);
        parcel
    }

    /// Replace the contents entirely (an arriving reply overwrites the
    /// caller's waiting parcel) and rewind the cursors.
    pub fn replace_with(&mut self, data: Vec<u8>) {
        self.buffer.replace(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.as_slice().to_vec()
    }

    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    pub fn read_pos(&self) -> usize {
        self.buffer.read_pos()
    }

    pub fn seek(&mut self, pos: usize) {
        self.buffer.seek(pos);
    }

    // Scalars. Alignment is the natural alignment of each type, matching the
    // writer on the other end of the channel.

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.write(&[value], 1);
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.buffer.read(1, 1)?[0])
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.write(&value.to_ne_bytes(), 2);
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(NativeEndian::read_u16(self.buffer.read(2, 2)?))
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buffer.write(&value.to_ne_bytes(), 2);
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(NativeEndian::read_i16(self.buffer.read(2, 2)?))
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.write(&value.to_ne_bytes(), 4);
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(NativeEndian::read_i32(self.buffer.read(4, 4)?))
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.write(&value.to_ne_bytes(), 8);
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(NativeEndian::read_i64(self.buffer.read(8, 8)?))
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.write(&value.to_ne_bytes(), 8);
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(NativeEndian::read_u64(self.buffer.read(8, 8)?))
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buffer.write(&value.to_ne_bytes(), 4);
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(NativeEndian::read_f32(self.buffer.read(4, 4)?))
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.write(&value.to_ne_bytes(), 8);
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(NativeEndian::read_f64(self.buffer.read(8, 8)?))
    }

    pub fn write_pid(&mut self, pid: Pid) {
        self.write_u64(pid);
    }

    pub fn read_pid(&mut self) -> Result<Pid> {
        self.read_u64()
    }

    pub fn write_handle(&mut self, handle: RawHandle) {
        self.write_u64(handle);
    }

    pub fn read_handle(&mut self) -> Result<RawHandle> {
        self.read_u64()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.write_array(bytes, 1);
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.buffer.read_array(1)?.to_vec())
    }

    pub fn write_str(&mut self, value: &str) {
        self.buffer.write_array(value.as_bytes(), 1);
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.buffer.read_array(1)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidString)
    }

    pub fn write_parcelable<P: Parcelable>(&mut self, value: &P) -> Result<()> {
        value.write_to_parcel(self)
    }

    pub fn read_parcelable<P: Parcelable>(&mut self) -> Result<P> {
        P::read_from_parcel(self)
    }

    // Held resources.

    /// Park a handle in the parcel. Closed on drop unless the parcel is sent.
    pub fn hold_handle(&mut self, handle: RawHandle) {
        self.held_handles.push(handle);
    }

    /// Acquire a registry ref on `object` for this parcel's lifetime.
    /// Released on drop unless the parcel is sent.
    pub fn hold_object(&mut self, object: Arc<dyn ServiceObject>) -> Result<()> {
        object.core().ref_()?;
        self.held_objects.push(HeldObject { object });
        Ok(())
    }

    /// Mark the payload as handed to the transport. The transport takes the
    /// holds first, so a sent parcel owns nothing left to release.
    pub fn set_sent(&mut self) {
        debug_assert!(
            self.held_handles.is_empty() && self.held_objects.is_empty(),
            "parcel marked sent before its holds were taken"
        );
        self.sent = true;
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Move the held resources out, as opaque drop-guards the transport
    /// attaches to the in-flight message.
    pub(crate) fn take_holds(&mut self) -> Vec<Box<dyn Any + Send>> {
        let mut holds: Vec<Box<dyn Any + Send>> = Vec::new();
        for object in self.held_objects.drain(..) {
            holds.push(Box::new(object));
        }
        for handle in self.held_handles.drain(..) {
            holds.push(Box::new(HeldHandle(handle)));
        }
        holds
    }

    /// The binder that delivered this parcel, when it arrived over a channel.
    pub fn set_origin(&mut self, binder: Arc<Binder>) {
        self.origin = Some(binder);
    }

    pub fn origin(&self) -> Option<Arc<Binder>> {
        self.origin.clone()
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        if self.sent {
            // Ownership moved to the transport. A sent parcel whose holds
            // were never taken must not release them behind its back.
            for object in self.held_objects.drain(..) {
                std::mem::forget(object);
            }
            self.held_handles.clear();
            return;
        }
        if !self.held_handles.is_empty() || !self.held_objects.is_empty() {
            warn!(
                handles = self.held_handles.len(),
                objects = self.held_objects.len(),
                "parcel dropped unsent; releasing held resources"
            );
        }
        for handle in self.held_handles.drain(..) {
            sys::close_handle(handle);
        }
        // held_objects deref through HeldObject::drop.
    }
}
