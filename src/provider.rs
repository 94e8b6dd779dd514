//! Transport provider behind every local binder: one delivery port, one
//! looper thread, and the synchronous transact pump.
//!
//! The port has a single consumer at a time. The looper drains it while the
//! endpoint is idle; a thread blocked in a synchronous `transact` takes the
//! consumer role over and pumps the port itself, so nested incoming
//! transactions are dispatched inline on the waiting thread and the reply is
//! picked up the moment it lands. One outstanding synchronous transaction per
//! endpoint; a second one started from inside the pump is refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::binder::{Binder, TransactionFlags, EXIT_TRANSACTION, REPLY_TRANSACTION};
use crate::error::{Error, Result};
use crate::parcel::Parcel;
use crate::sys::{self, Message, Port, RawHandle};

/// Period of the repeating timer armed by [`BinderProvider::start`].
pub const TIMER_INTERVAL: Duration = Duration::from_millis(10);

/// Idle poll cap for the looper and the reply pump.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Timer {
    Off,
    Periodic { interval: Duration, next: Instant },
    OneShot { at: Instant },
}

impl Timer {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Timer::Off => None,
            Timer::Periodic { next, .. } => Some(*next),
            Timer::OneShot { at } => Some(*at),
        }
    }

    fn fired(&mut self, now: Instant) {
        match self {
            Timer::Off => {}
            Timer::Periodic { interval, next } => *next = now + *interval,
            Timer::OneShot { .. } => *self = Timer::Off,
        }
    }
}

enum Claim {
    /// This thread became the consumer and must release.
    Claimed,
    /// This thread already is the consumer (pump within a dispatch).
    Reentrant,
    /// Another thread is draining the port.
    Busy,
}

/// Slot for the reply of the one outstanding synchronous transaction.
/// Whichever thread pops the reply off the port parks it here; the blocked
/// sender picks it up.
enum PendingReply {
    Idle,
    Waiting,
    Received(Message),
}

pub struct BinderProvider {
    port: Arc<Port>,
    handle: RawHandle,
    consumer: Mutex<Option<ThreadId>>,
    awaiting_reply: AtomicBool,
    pending_reply: Mutex<PendingReply>,
    timer: Mutex<Timer>,
    closed: Arc<AtomicBool>,
    looper: Mutex<Option<JoinHandle<()>>>,
}

impl BinderProvider {
    pub fn create() -> Self {
        let port = Arc::new(Port::new());
        let handle = sys::register_port(Arc::clone(&port));
        Self {
            port,
            handle,
            consumer: Mutex::new(None),
            awaiting_reply: AtomicBool::new(false),
            pending_reply: Mutex::new(PendingReply::Idle),
            timer: Mutex::new(Timer::Off),
            closed: Arc::new(AtomicBool::new(false)),
            looper: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    /// Spawn the looper for `binder`. Called once, right after the owning
    /// binder is constructed; the looper holds only a weak reference so the
    /// endpoint can still be dropped.
    pub(crate) fn start_looper(&self, binder: Weak<Binder>) {
        let port = Arc::clone(&self.port);
        let closed = Arc::clone(&self.closed);
        let mut looper = self.looper.lock().unwrap();
        debug_assert!(looper.is_none());
        *looper = Some(thread::spawn(move || looper_main(binder, port, closed)));
    }

    /// Arm the repeating timer; `on_timer` fires every [`TIMER_INTERVAL`].
    pub fn start(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        *self.timer.lock().unwrap() = Timer::Periodic {
            interval: TIMER_INTERVAL,
            next: Instant::now() + TIMER_INTERVAL,
        };
        true
    }

    /// Arm a one-shot timer that fires once after `delay`.
    pub fn start_at(&self, delay: Duration) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        *self.timer.lock().unwrap() = Timer::OneShot {
            at: Instant::now() + delay,
        };
        true
    }

    pub fn stop(&self) {
        *self.timer.lock().unwrap() = Timer::Off;
    }

    /// Terminal teardown: unregister the port, stop and join the looper.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.port.post(Message {
            code: EXIT_TRANSACTION,
            data: Vec::new(),
            reply_to: 0,
            flags: 0,
            holds: Vec::new(),
        });
        let looper = self.looper.lock().unwrap().take();
        if let Some(looper) = looper {
            if looper.thread().id() != thread::current().id() {
                let _ = looper.join();
            }
        }
        sys::close_handle(self.handle);
    }

    /// Carry one transaction from the local binder `local` to `destination`.
    ///
    /// One-way sends post and return. Synchronous sends mark this endpoint as
    /// awaiting, pump the own port until the reply lands, and dispatch any
    /// other incoming transaction inline while blocked.
    pub(crate) fn transact(
        &self,
        local: &Arc<Binder>,
        destination: RawHandle,
        code: i32,
        data: &mut Parcel,
        mut reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let dest_port = sys::lookup_port(destination).ok_or(Error::DeadBinder(destination))?;
        let holds = data.take_holds();
        data.set_sent();
        let payload = data.to_vec();

        if flags.contains(TransactionFlags::ONE_WAY) {
            dest_port.post(Message {
                code,
                data: payload,
                reply_to: 0,
                flags: flags.bits(),
                holds,
            });
            return Ok(());
        }

        if self.awaiting_reply.swap(true, Ordering::SeqCst) {
            return Err(Error::NestedTransaction);
        }
        *self.pending_reply.lock().unwrap() = PendingReply::Waiting;
        let _awaiting = AwaitGuard(self);

        trace!(destination, code, "synchronous transact, pumping for reply");
        dest_port.post(Message {
            code,
            data: payload,
            reply_to: self.handle,
            flags: flags.bits(),
            holds,
        });

        loop {
            match self.claim() {
                Claim::Busy => {
                    // The looper is mid-drain; it backs off once it sees the
                    // consumer slot taken on its next pass.
                    thread::sleep(Duration::from_millis(1));
                }
                claim => {
                    while let Some(message) = self.port.try_pop() {
                        if message.code == REPLY_TRANSACTION && message.reply_to == 0 {
                            self.deliver_reply(message);
                            break;
                        }
                        local.dispatch(message);
                    }
                    if matches!(claim, Claim::Claimed) {
                        self.release();
                    }
                }
            }
            if let Some(message) = self.take_reply() {
                if let Some(reply) = reply.as_deref_mut() {
                    reply.replace_with(message.data);
                }
                return Ok(());
            }
            if sys::lookup_port(destination).is_none() {
                return Err(Error::DeadReply);
            }
            self.port.wait(Some(POLL_INTERVAL));
        }
    }

    /// Park a received reply in the waiting transaction's slot and wake the
    /// sender. A reply with no waiting transaction is stray and dropped.
    pub(crate) fn deliver_reply(&self, message: Message) {
        let mut pending = self.pending_reply.lock().unwrap();
        if matches!(*pending, PendingReply::Waiting) {
            *pending = PendingReply::Received(message);
            drop(pending);
            self.port.wake();
        } else {
            warn!("stray reply with no waiting transaction, dropped");
        }
    }

    fn take_reply(&self) -> Option<Message> {
        let mut pending = self.pending_reply.lock().unwrap();
        match std::mem::replace(&mut *pending, PendingReply::Idle) {
            PendingReply::Received(message) => Some(message),
            other => {
                *pending = other;
                None
            }
        }
    }

    fn claim(&self) -> Claim {
        let mut consumer = self.consumer.lock().unwrap();
        let me = thread::current().id();
        match *consumer {
            None => {
                *consumer = Some(me);
                Claim::Claimed
            }
            Some(owner) if owner == me => Claim::Reentrant,
            Some(_) => Claim::Busy,
        }
    }

    fn release(&self) {
        *self.consumer.lock().unwrap() = None;
    }

    fn timer_due(&self) -> bool {
        let mut timer = self.timer.lock().unwrap();
        match timer.deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                timer.fired(Instant::now());
                true
            }
            _ => false,
        }
    }

    fn wait_budget(&self) -> Duration {
        let deadline = self.timer.lock().unwrap().deadline();
        match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        }
    }
}

struct AwaitGuard<'a>(&'a BinderProvider);

impl Drop for AwaitGuard<'_> {
    fn drop(&mut self) {
        *self.0.pending_reply.lock().unwrap() = PendingReply::Idle;
        self.0.awaiting_reply.store(false, Ordering::SeqCst);
    }
}

fn looper_main(binder: Weak<Binder>, port: Arc<Port>, closed: Arc<AtomicBool>) {
    if let Some(binder) = binder.upgrade() {
        binder.client().on_create();
    } else {
        return;
    }

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let Some(strong) = binder.upgrade() else { return };
        let Some(provider) = strong.provider() else { return };

        if provider.timer_due() {
            strong.client().on_timer();
        }

        let mut exit = false;
        if let Claim::Claimed = provider.claim() {
            while let Some(message) = port.try_pop() {
                if message.code == EXIT_TRANSACTION {
                    exit = true;
                    break;
                }
                if message.code == REPLY_TRANSACTION && message.reply_to == 0 {
                    // A reply for a transact blocked on another thread.
                    provider.deliver_reply(message);
                    continue;
                }
                strong.dispatch(message);
            }
            provider.release();
        }

        let budget = provider.wait_budget();
        // Don't keep the endpoint alive while blocked.
        drop(strong);
        if exit {
            break;
        }
        port.wait(Some(budget));
    }

    if let Some(binder) = binder.upgrade() {
        binder.client().on_destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BinderClient;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex as StdMutex;

    struct Echo;

    impl BinderClient for Echo {
        fn on_transaction(
            &self,
            code: i32,
            data: &mut Parcel,
            reply: Option<&mut Parcel>,
            _flags: TransactionFlags,
        ) -> bool {
            if let Some(reply) = reply {
                let value = data.read_i32().unwrap_or(0);
                reply.write_i32(code);
                reply.write_i32(value * 2);
            }
            true
        }
    }

    struct Collector {
        seen: StdMutex<Vec<i32>>,
    }

    impl BinderClient for Collector {
        fn on_transaction(
            &self,
            code: i32,
            _data: &mut Parcel,
            _reply: Option<&mut Parcel>,
            _flags: TransactionFlags,
        ) -> bool {
            self.seen.lock().unwrap().push(code);
            true
        }
    }

    #[test]
    fn synchronous_transact_round_trips_a_reply() {
        let server = Binder::create(Arc::new(Echo));
        let client = Binder::create(Arc::new(Echo));
        let proxy = client.adopt(server.handle());

        let mut data = Parcel::new();
        data.write_i32(21);
        let mut reply = Parcel::new();
        proxy
            .transact(99, &mut data, Some(&mut reply), TransactionFlags::empty())
            .unwrap();
        assert_eq!(reply.read_i32().unwrap(), 99);
        assert_eq!(reply.read_i32().unwrap(), 42);

        client.close();
        server.close();
    }

    #[test]
    fn one_way_preserves_send_order() {
        let collector = Arc::new(Collector {
            seen: StdMutex::new(Vec::new()),
        });
        let server = Binder::create(collector.clone());
        let client = Binder::create(Arc::new(Echo));
        let proxy = client.adopt(server.handle());

        for code in 100..110 {
            let mut data = Parcel::new();
            proxy
                .transact(code, &mut data, None, TransactionFlags::ONE_WAY)
                .unwrap();
        }
        // Flush: a synchronous transact completes only after everything
        // queued ahead of it was dispatched.
        let mut data = Parcel::new();
        let mut reply = Parcel::new();
        proxy
            .transact(0, &mut data, Some(&mut reply), TransactionFlags::empty())
            .unwrap();

        let seen = collector.seen.lock().unwrap();
        let codes: Vec<i32> = seen.iter().copied().filter(|c| *c >= 100).collect();
        assert_eq!(codes, (100..110).collect::<Vec<i32>>());

        client.close();
        server.close();
    }

    #[test]
    fn reply_consumed_by_the_looper_reaches_the_waiter() {
        struct Sleeper;
        impl BinderClient for Sleeper {
            fn on_transaction(
                &self,
                code: i32,
                _: &mut Parcel,
                _: Option<&mut Parcel>,
                _: TransactionFlags,
            ) -> bool {
                if code == 50 {
                    thread::sleep(Duration::from_millis(150));
                }
                true
            }
        }

        let a = Binder::create(Arc::new(Sleeper));
        let b = Binder::create(Arc::new(Echo));

        // Park A's looper in a slow dispatch; it is then the thread that
        // pops the reply to the transact below off A's port.
        let self_proxy = a.adopt(a.handle());
        let mut data = Parcel::new();
        self_proxy
            .transact(50, &mut data, None, TransactionFlags::ONE_WAY)
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        let proxy = a.adopt(b.handle());
        let mut data = Parcel::new();
        data.write_i32(21);
        let mut reply = Parcel::new();
        proxy
            .transact(99, &mut data, Some(&mut reply), TransactionFlags::empty())
            .unwrap();
        assert_eq!(reply.read_i32().unwrap(), 99);
        assert_eq!(reply.read_i32().unwrap(), 42);

        a.close();
        b.close();
    }

    #[test]
    fn transact_to_a_closed_endpoint_fails() {
        let server = Binder::create(Arc::new(Echo));
        let client = Binder::create(Arc::new(Echo));
        let proxy = client.adopt(server.handle());
        server.close();

        let mut data = Parcel::new();
        let result = proxy.transact(1, &mut data, None, TransactionFlags::ONE_WAY);
        assert!(matches!(result, Err(Error::DeadBinder(_))));
        client.close();
    }

    #[test]
    fn periodic_timer_fires_repeatedly() {
        struct Ticker {
            ticks: AtomicI32,
        }
        impl BinderClient for Ticker {
            fn on_timer(&self) {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
            fn on_transaction(&self, _: i32, _: &mut Parcel, _: Option<&mut Parcel>, _: TransactionFlags) -> bool {
                false
            }
        }

        let ticker = Arc::new(Ticker {
            ticks: AtomicI32::new(0),
        });
        let binder = Binder::create(ticker.clone());
        assert!(binder.start());
        thread::sleep(Duration::from_millis(120));
        binder.stop();
        assert!(ticker.ticks.load(Ordering::SeqCst) >= 3);
        binder.close();
    }

    #[test]
    fn unhandled_synchronous_transaction_still_replies() {
        struct Decline;
        impl BinderClient for Decline {
            fn on_transaction(&self, _: i32, _: &mut Parcel, _: Option<&mut Parcel>, _: TransactionFlags) -> bool {
                false
            }
        }

        let server = Binder::create(Arc::new(Decline));
        let client = Binder::create(Arc::new(Decline));
        let proxy = client.adopt(server.handle());

        let mut data = Parcel::new();
        let mut reply = Parcel::new();
        proxy
            .transact(5, &mut data, Some(&mut reply), TransactionFlags::empty())
            .unwrap();
        assert!(reply.is_empty());

        client.close();
        server.close();
    }

    #[test]
    fn nested_synchronous_transact_is_refused() {
        // A's handler runs inside A's own reply pump; a synchronous call
        // issued from there would need a second outstanding reply slot.
        struct PingBack {
            peer: StdMutex<Option<Arc<Binder>>>,
            nested: Arc<StdMutex<Option<Error>>>,
        }
        impl BinderClient for PingBack {
            fn on_transaction(
                &self,
                code: i32,
                _data: &mut Parcel,
                reply: Option<&mut Parcel>,
                _flags: TransactionFlags,
            ) -> bool {
                if code == 1 {
                    if let Some(peer) = self.peer.lock().unwrap().clone() {
                        let mut data = Parcel::new();
                        let mut nested_reply = Parcel::new();
                        let result = peer.transact(
                            2,
                            &mut data,
                            Some(&mut nested_reply),
                            TransactionFlags::empty(),
                        );
                        if let Err(error) = result {
                            *self.nested.lock().unwrap() = Some(error);
                        }
                    }
                }
                if let Some(reply) = reply {
                    reply.write_i32(code);
                }
                true
            }
        }
        struct Relay {
            origin_code: i32,
        }
        impl BinderClient for Relay {
            fn on_transaction(
                &self,
                code: i32,
                data: &mut Parcel,
                reply: Option<&mut Parcel>,
                _flags: TransactionFlags,
            ) -> bool {
                // Bounce a synchronous request back at the sender while it
                // is still blocked on this one.
                if code == self.origin_code {
                    if let Some(origin) = data.origin() {
                        let mut ping = Parcel::new();
                        let mut ping_reply = Parcel::new();
                        let _ = origin.transact(
                            1,
                            &mut ping,
                            Some(&mut ping_reply),
                            TransactionFlags::empty(),
                        );
                    }
                }
                if let Some(reply) = reply {
                    reply.write_i32(0);
                }
                true
            }
        }

        let nested = Arc::new(StdMutex::new(None));
        let a_client = Arc::new(PingBack {
            peer: StdMutex::new(None),
            nested: nested.clone(),
        });
        let a = Binder::create(a_client.clone());
        let b = Binder::create(Arc::new(Relay { origin_code: 7 }));
        *a_client.peer.lock().unwrap() = Some(a.adopt(b.handle()));

        let proxy = a.adopt(b.handle());
        let mut data = Parcel::new();
        let mut reply = Parcel::new();
        proxy
            .transact(7, &mut data, Some(&mut reply), TransactionFlags::empty())
            .unwrap();

        assert!(matches!(
            *nested.lock().unwrap(),
            Some(Error::NestedTransaction)
        ));
        a.close();
        b.close();
    }
}
