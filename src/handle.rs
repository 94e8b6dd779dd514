//! Ownership wrapper around one OS resource handle.
//!
//! Writing a handle to a parcel duplicates it for transfer and keeps the
//! local copy open; reading asks the OS to duplicate out of the source
//! process. A failed duplication (source process exited, stale handle) leaves
//! the handle null, and the owner treats the resource as unavailable.

use tracing::warn;

use crate::error::Result;
use crate::parcel::Parcel;
use crate::sys::{self, Pid, RawHandle};

pub const NULL_HANDLE: RawHandle = 0;

pub struct PlatformHandle {
    handle: RawHandle,
    owner_pid: Pid,
}

impl PlatformHandle {
    /// An empty handle owned by `owner_pid` (the current process's pid).
    pub fn new(owner_pid: Pid) -> Self {
        Self {
            handle: NULL_HANDLE,
            owner_pid,
        }
    }

    /// Take ownership of an already-open handle.
    pub fn from_raw(handle: RawHandle, owner_pid: Pid) -> Self {
        Self { handle, owner_pid }
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn is_null(&self) -> bool {
        self.handle == NULL_HANDLE
    }

    pub fn owner_pid(&self) -> Pid {
        self.owner_pid
    }

    /// Release the OS handle. Zeroed afterwards, so a second close (or the
    /// destructor after an explicit close) is a no-op.
    pub fn close(&mut self) {
        if self.handle != NULL_HANDLE {
            sys::close_handle(self.handle);
            self.handle = NULL_HANDLE;
        }
    }

    /// Replace the owned handle, closing any previous one first.
    pub fn set_handle(&mut self, handle: RawHandle) {
        self.close();
        self.handle = handle;
    }

    /// Duplicate for transfer and write `(owner_pid, duplicate)`. The
    /// duplicate is parked in the parcel: closed if the parcel is never sent,
    /// handed to the transport otherwise.
    pub fn write_to_parcel(&self, dest: &mut Parcel) -> Result<()> {
        let duplicated = sys::duplicate_handle(self.handle).unwrap_or(NULL_HANDLE);
        if duplicated == NULL_HANDLE && self.handle != NULL_HANDLE {
            warn!(handle = self.handle, "handle duplication for transfer failed");
        }
        dest.write_pid(self.owner_pid);
        dest.write_handle(duplicated);
        if duplicated != NULL_HANDLE {
            dest.hold_handle(duplicated);
        }
        Ok(())
    }

    /// Read `(source_pid, handle)` and duplicate into this process. On
    /// failure the handle becomes null and the caller must treat the
    /// resource as unavailable.
    pub fn read_from_parcel(&mut self, source: &mut Parcel) -> Result<()> {
        let source_pid = source.read_pid()?;
        let remote = source.read_handle()?;
        let duplicated = sys::duplicate_from(source_pid, remote);
        if duplicated.is_none() {
            warn!(source_pid, remote, "handle duplication from source process failed");
        }
        self.set_handle(duplicated.unwrap_or(NULL_HANDLE));
        Ok(())
    }
}

impl Drop for PlatformHandle {
    fn drop(&mut self) {
        self.close();
    }
}
