//! Binder endpoints: the local endpoint that owns a provider looper, and
//! lightweight proxies that address a remote endpoint by handle.
//!
//! A proxy has no transport of its own; it routes every transaction through
//! the local binder it was adopted from. Two binders denote the same endpoint
//! exactly when their handles are equal.

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::parcel::Parcel;
use crate::provider::BinderProvider;
use crate::sys::{self, Message, RawHandle};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        /// Fire and forget: no reply slot, per-destination FIFO ordering.
        const ONE_WAY = 1;
    }
}

/// Transaction codes are partitioned per protocol so unrelated dispatchers
/// never collide on a code.
pub const fn transaction_code(protocol: i32, code: i32) -> i32 {
    (protocol << 16) | code
}

pub const PROTO_BINDER: i32 = 0;
pub const PROTO_SERVICE: i32 = 1;

/// Carries a reply payload back to a synchronously waiting sender.
pub const REPLY_TRANSACTION: i32 = transaction_code(PROTO_BINDER, 1);
/// Looper shutdown marker, never sent across processes.
pub(crate) const EXIT_TRANSACTION: i32 = transaction_code(PROTO_BINDER, 2);

/// Callbacks a local binder delivers from its looper thread.
pub trait BinderClient: Send + Sync + 'static {
    fn on_create(&self) {}
    fn on_destroy(&self) {}
    fn on_timer(&self) {}

    /// Handle one incoming transaction. `reply` is present exactly when the
    /// sender waits. Return `false` to decline; a declined synchronous
    /// transaction still produces an empty reply so the sender unblocks.
    fn on_transaction(
        &self,
        code: i32,
        data: &mut Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> bool;
}

struct EmptyBinderClient;

impl BinderClient for EmptyBinderClient {
    fn on_transaction(&self, _: i32, _: &mut Parcel, _: Option<&mut Parcel>, _: TransactionFlags) -> bool {
        false
    }
}

enum Kind {
    Local { provider: BinderProvider },
    Proxy { local: Weak<Binder> },
}

pub struct Binder {
    handle: RawHandle,
    client: Arc<dyn BinderClient>,
    kind: Kind,
}

impl Binder {
    /// Create a local endpoint: registers a delivery port and spawns the
    /// looper thread that feeds `client`.
    pub fn create(client: Arc<dyn BinderClient>) -> Arc<Binder> {
        let provider = BinderProvider::create();
        let handle = provider.handle();
        let binder = Arc::new(Binder {
            handle,
            client,
            kind: Kind::Local { provider },
        });
        if let Kind::Local { provider } = &binder.kind {
            provider.start_looper(Arc::downgrade(&binder));
        }
        binder
    }

    /// Adopt a remote endpoint by handle. The proxy routes through the local
    /// binder `self` belongs to.
    pub fn adopt(self: &Arc<Self>, handle: RawHandle) -> Arc<Binder> {
        let local = match &self.kind {
            Kind::Local { .. } => Arc::downgrade(self),
            Kind::Proxy { local } => local.clone(),
        };
        Arc::new(Binder {
            handle,
            client: Arc::new(EmptyBinderClient),
            kind: Kind::Proxy { local },
        })
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, Kind::Local { .. })
    }

    pub(crate) fn client(&self) -> &Arc<dyn BinderClient> {
        &self.client
    }

    pub(crate) fn provider(&self) -> Option<&BinderProvider> {
        match &self.kind {
            Kind::Local { provider } => Some(provider),
            Kind::Proxy { .. } => None,
        }
    }

    /// Send a transaction to this endpoint. On a local binder the client is
    /// invoked directly on the calling thread; on a proxy the owning local
    /// binder's provider carries it over.
    pub fn transact(
        &self,
        code: i32,
        data: &mut Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        match &self.kind {
            Kind::Local { .. } => {
                self.client.on_transaction(code, data, reply, flags);
                Ok(())
            }
            Kind::Proxy { local } => {
                let local = local.upgrade().ok_or(Error::Closed)?;
                match local.provider() {
                    Some(provider) => provider.transact(&local, self.handle, code, data, reply, flags),
                    None => Err(Error::Closed),
                }
            }
        }
    }

    /// Arm the periodic timer. Local binders only.
    pub fn start(&self) -> bool {
        self.provider().map(BinderProvider::start).unwrap_or(false)
    }

    /// Arm a one-shot timer firing after `delay`. Local binders only.
    pub fn start_at(&self, delay: std::time::Duration) -> bool {
        self.provider()
            .map(|provider| provider.start_at(delay))
            .unwrap_or(false)
    }

    pub fn stop(&self) {
        if let Some(provider) = self.provider() {
            provider.stop();
        }
    }

    /// Tear the endpoint down: the port is unregistered and the looper
    /// joined. Terminal; further transacts to this endpoint fail.
    pub fn close(&self) {
        if let Some(provider) = self.provider() {
            provider.close();
        }
    }

    /// Deliver one incoming message to the client, producing and sending the
    /// reply when the sender waits for one. Replies themselves never reach
    /// here; the provider routes them into the waiting transaction's slot.
    pub(crate) fn dispatch(self: &Arc<Self>, message: Message) {
        let Message {
            code,
            data,
            reply_to,
            flags,
            holds,
        } = message;
        let flags = TransactionFlags::from_bits_truncate(flags);
        let mut data = Parcel::from_bytes(data);

        if reply_to != 0 {
            data.set_origin(self.adopt(reply_to));
            let mut reply = Parcel::new();
            if !self.client.on_transaction(code, &mut data, Some(&mut reply), flags) {
                debug!(code, "transaction unhandled, replying empty");
            }
            match sys::lookup_port(reply_to) {
                Some(port) => {
                    let reply_holds = reply.take_holds();
                    reply.set_sent();
                    port.post(Message {
                        code: REPLY_TRANSACTION,
                        data: reply.to_vec(),
                        reply_to: 0,
                        flags: TransactionFlags::ONE_WAY.bits(),
                        holds: reply_holds,
                    });
                }
                None => error!(reply_to, "couldn't send reply, sender is gone"),
            }
        } else if !self.client.on_transaction(code, &mut data, None, flags) {
            debug!(code, "one-way transaction unhandled");
        }

        // Resources the sender transferred stay alive until dispatch is done.
        drop(holds);
    }
}

impl fmt::Debug for Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Local { .. } => "local",
            Kind::Proxy { .. } => "proxy",
        };
        f.debug_struct("Binder")
            .field("handle", &self.handle)
            .field("kind", &kind)
            .finish()
    }
}

impl PartialEq for Binder {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Binder {}

impl Drop for Binder {
    fn drop(&mut self) {
        if let Kind::Local { provider } = &self.kind {
            provider.close();
        }
    }
}
