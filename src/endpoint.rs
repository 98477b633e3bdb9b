//! The endpoint base: socket ownership, the two background workers, the shared scalar
//! state both workers and callers touch, and the single dispatch point that routes a
//! decoded frame to a [`Role`]'s handler.
//!
//! The shape here is `quinn-proto::endpoint::Endpoint`'s, generalized along the axis its
//! own REDESIGN FLAGS note calls for: instead of one concrete `Endpoint` owning a
//! `Connection` per peer and a `Context` that accumulates outgoing datagrams and events for
//! the caller to drain, `EndpointCore<R>` is parameterized by a `Role` (`ServerRole` or
//! `ClientRole`) and each dispatch produces an `Outcome<R::Event>`, the same
//! accumulate-then-flush idea narrowed to this protocol's six frame types and applied to a
//! role trait instead of a single hardcoded state machine.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use slog::{debug, error, trace, warn, Logger};

use crate::codec::{self, Decoded, Frame};
use crate::error::{OpenError, SendError};
use crate::events::{Delivery, Signal};
use crate::ip::PublicIpResolver;
use crate::ticker::TickLimiter;

pub const DEFAULT_TICK_RATE_HZ: u32 = 64;
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;

/// Scalar state touched by both workers and the calling thread. One mutex covers all of
/// it, per the concurrency model's requirement that these fields share a single lock
/// (or atomics of appropriate width) rather than each getting its own.
pub struct Shared {
    pub id: u32,
    pub public_ip: u32,
    pub local_ip: Option<Ipv4Addr>,
    pub port: u16,
    pub password: String,
    pub needs_password: bool,
    pub connection_open: bool,
    pub connection_time: f64,
    pub timeout: f64,
    pub tick_rate: u32,
    pub sending_packets: bool,
}

impl Shared {
    fn new(public_ip: u32) -> Self {
        Shared {
            id: public_ip,
            public_ip,
            local_ip: None,
            port: 0,
            password: String::new(),
            needs_password: false,
            connection_open: false,
            connection_time: 0.0,
            timeout: DEFAULT_TIMEOUT_SECS,
            tick_rate: DEFAULT_TICK_RATE_HZ,
            sending_packets: true,
        }
    }
}

/// Events the endpoint base itself can fire, independent of which role is attached.
/// Mirrors §6's endpoint-level event list.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    DataReceived { payload: Bytes, sender_id: u32 },
    ConnectionOpen,
    ConnectionClose { reason: String },
    UpdateRateChanged(u32),
    TimeoutChanged(f64),
    PortChanged(u16),
    PasswordChanged(String),
}

/// The endpoint-level named signals a caller can subscribe to, regardless of role.
pub struct CoreSignals {
    pub data_received: Signal<(Bytes, u32)>,
    pub update_rate_changed: Signal<u32>,
    pub timeout_changed: Signal<f64>,
    pub port_changed: Signal<u16>,
    pub password_changed: Signal<String>,
    pub connection_open: Signal<()>,
    pub connection_close: Signal<String>,
}

impl CoreSignals {
    fn new() -> Self {
        CoreSignals {
            data_received: Signal::new(),
            update_rate_changed: Signal::new(),
            timeout_changed: Signal::new(),
            port_changed: Signal::new(),
            password_changed: Signal::new(),
            connection_open: Signal::new(),
            connection_close: Signal::new(),
        }
    }

    fn dispatch(&self, event: CoreEvent, mode: Delivery) {
        match event {
            CoreEvent::DataReceived { payload, sender_id } => {
                self.data_received.fire((payload, sender_id), mode)
            }
            CoreEvent::ConnectionOpen => self.connection_open.fire((), mode),
            CoreEvent::ConnectionClose { reason } => self.connection_close.fire(reason, mode),
            CoreEvent::UpdateRateChanged(n) => self.update_rate_changed.fire(n, mode),
            CoreEvent::TimeoutChanged(s) => self.timeout_changed.fire(s, mode),
            CoreEvent::PortChanged(p) => self.port_changed.fire(p, mode),
            CoreEvent::PasswordChanged(s) => self.password_changed.fire(s, mode),
        }
    }
}

/// Accumulates the side effects of handling one frame or one tick: outgoing datagrams,
/// endpoint-level events, and role-specific events. Flushed by `EndpointCore` once the
/// role's handler returns, exactly as `quinn-proto`'s `Context` accumulates into `ctx.io`
/// and `ctx.events` for `Endpoint::poll` to drain.
pub struct Outcome<E> {
    sends: Vec<(SocketAddr, Bytes)>,
    core_events: Vec<CoreEvent>,
    role_events: Vec<E>,
}

impl<E> Outcome<E> {
    fn new() -> Self {
        Outcome {
            sends: Vec::new(),
            core_events: Vec::new(),
            role_events: Vec::new(),
        }
    }

    pub fn send(&mut self, to: SocketAddr, frame: &Frame) {
        self.sends.push((to, frame.encode()));
    }

    pub fn core_event(&mut self, event: CoreEvent) {
        self.core_events.push(event);
    }

    pub fn role_event(&mut self, event: E) {
        self.role_events.push(event);
    }
}

/// The six frame handlers plus the two timer hooks a role must supply. `EndpointCore`
/// performs the single per-tag dispatch; the role only ever sees a mutable [`Shared`] and
/// an [`Outcome`] to record effects into. See the REDESIGN FLAGS note on deep inheritance
/// for role dispatch.
pub trait Role: Send + 'static {
    type Event: Send + 'static;

    fn on_data(&mut self, shared: &mut Shared, from: SocketAddr, payload: Bytes, out: &mut Outcome<Self::Event>);
    fn on_connection_request(&mut self, shared: &mut Shared, from: SocketAddr, out: &mut Outcome<Self::Event>);
    fn on_connection_close(
        &mut self,
        shared: &mut Shared,
        from: SocketAddr,
        reason: String,
        out: &mut Outcome<Self::Event>,
    );
    fn on_connection_confirm(
        &mut self,
        shared: &mut Shared,
        from: SocketAddr,
        assigned_id: u32,
        out: &mut Outcome<Self::Event>,
    );
    fn on_password_request(&mut self, shared: &mut Shared, from: SocketAddr, out: &mut Outcome<Self::Event>);
    fn on_password(
        &mut self,
        shared: &mut Shared,
        from: SocketAddr,
        secret: String,
        out: &mut Outcome<Self::Event>,
    );

    /// Default no-op: an unrecognized tag is dropped per §4.1, with no peer-visible reply.
    fn on_unknown(&mut self, shared: &mut Shared, from: SocketAddr, body: Bytes, out: &mut Outcome<Self::Event>) {
        let _ = (shared, from, body, out);
    }

    fn on_tick(&mut self, shared: &mut Shared, delta_secs: f64, out: &mut Outcome<Self::Event>);
    fn on_second(&mut self, shared: &mut Shared, out: &mut Outcome<Self::Event>);

    /// Delivers a role event produced by a handler above to that role's own subscribers.
    fn dispatch_event(&self, event: Self::Event, mode: Delivery);
}

struct Workers {
    stop: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// Owns the UDP socket, the worker threads, and the role. Both `Server` and `Client` are
/// thin public facades around `Arc<EndpointCore<R>>`.
pub struct EndpointCore<R: Role> {
    log: Logger,
    shared: Mutex<Shared>,
    role: Mutex<R>,
    socket: Mutex<Option<Arc<std::net::UdpSocket>>>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Option<Workers>>,
    send_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
    signals: CoreSignals,
}

impl<R: Role> EndpointCore<R> {
    pub fn new(log: Logger, role: R, resolver: &dyn PublicIpResolver) -> Self {
        let public_ip = resolver.resolve(Duration::from_secs(1)).unwrap_or(0);
        EndpointCore {
            log,
            shared: Mutex::new(Shared::new(public_ip)),
            role: Mutex::new(role),
            socket: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(None),
            send_hook: Mutex::new(None),
            signals: CoreSignals::new(),
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn signals(&self) -> &CoreSignals {
        &self.signals
    }

    pub fn with_role<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut self.role.lock().unwrap())
    }

    pub fn with_shared<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> T {
        f(&mut self.shared.lock().unwrap())
    }

    pub fn id(&self) -> u32 {
        self.shared.lock().unwrap().id
    }

    pub fn set_id(&self, id: u32) {
        self.shared.lock().unwrap().id = id;
    }

    pub fn public_ip(&self) -> u32 {
        self.shared.lock().unwrap().public_ip
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.shared.lock().unwrap().local_ip
    }

    pub fn port(&self) -> u16 {
        self.shared.lock().unwrap().port
    }

    pub fn connection_time(&self) -> f64 {
        self.shared.lock().unwrap().connection_time
    }

    pub fn connection_open(&self) -> bool {
        self.shared.lock().unwrap().connection_open
    }

    pub fn receiving_packets(&self) -> bool {
        self.workers.lock().unwrap().is_some()
    }

    pub fn sending_packets(&self) -> bool {
        self.shared.lock().unwrap().sending_packets
    }

    pub fn needs_password(&self) -> bool {
        self.shared.lock().unwrap().needs_password
    }

    pub fn password(&self) -> String {
        self.shared.lock().unwrap().password.clone()
    }

    pub fn timeout(&self) -> f64 {
        self.shared.lock().unwrap().timeout
    }

    pub fn update_interval(&self) -> u32 {
        self.shared.lock().unwrap().tick_rate
    }

    /// No-op while open, per §4.2's connection-gating invariant.
    pub fn set_port(&self, port: u16) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            if shared.connection_open {
                false
            } else {
                shared.port = port;
                true
            }
        };
        if changed {
            self.signals.port_changed.fire(port, Delivery::Immediate);
        }
    }

    pub fn set_password(&self, password: String) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            if shared.connection_open {
                false
            } else {
                shared.password = password.clone();
                true
            }
        };
        if changed {
            self.signals.password_changed.fire(password, Delivery::Immediate);
        }
    }

    /// No-op while open, per §4.2's connection-gating invariant.
    pub fn set_needs_password(&self, needs: bool) {
        let mut shared = self.shared.lock().unwrap();
        if !shared.connection_open {
            shared.needs_password = needs;
        }
    }

    pub fn set_timeout(&self, seconds: f64) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            if shared.connection_open {
                false
            } else {
                shared.timeout = seconds;
                true
            }
        };
        if changed {
            self.signals.timeout_changed.fire(seconds, Delivery::Immediate);
        }
    }

    pub fn set_update_interval(&self, ticks_per_second: u32) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            if shared.connection_open {
                false
            } else {
                shared.tick_rate = ticks_per_second.max(1);
                true
            }
        };
        if changed {
            self.signals
                .update_rate_changed
                .fire(ticks_per_second, Delivery::Immediate);
        }
    }

    pub fn set_sending_packets(&self, enabled: bool) {
        let mut shared = self.shared.lock().unwrap();
        if !shared.connection_open {
            shared.sending_packets = enabled;
        }
    }

    pub fn set_packet_send_hook(&self, hook: Option<Box<dyn Fn() + Send>>) {
        if self.shared.lock().unwrap().connection_open {
            return;
        }
        *self.send_hook.lock().unwrap() = hook;
    }

    /// Binds the socket. On success, `port` reflects the bound local port (the OS-chosen
    /// ephemeral port for a client that asked for port 0).
    pub fn bind(&self, addr: SocketAddr) -> Result<(), OpenError> {
        let socket = std::net::UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.port = local.port();
            if let SocketAddr::V4(v4) = local {
                shared.local_ip = Some(*v4.ip());
            }
        }
        *self.socket.lock().unwrap() = Some(Arc::new(socket));
        Ok(())
    }

    pub fn socket(&self) -> Option<Arc<std::net::UdpSocket>> {
        self.socket.lock().unwrap().clone()
    }

    pub fn send_frame(&self, to: SocketAddr, frame: &Frame) -> Result<(), SendError> {
        let socket = self.socket().ok_or(SendError::NotOpen)?;
        let bytes = frame.encode();
        socket
            .send_to(&bytes, to)
            .map(|_| ())
            .map_err(|source| SendError::Io {
                len: bytes.len(),
                to,
                source,
            })
    }

    pub fn start_workers(self: &Arc<Self>) {
        self.stop.store(false, Ordering::SeqCst);

        let receiver_core = self.clone();
        let receiver = thread::Builder::new()
            .name("endpoint-receiver".into())
            .spawn(move || receiver_core.receiver_loop())
            .expect("spawning the receiver thread");

        let ticker_core = self.clone();
        let ticker = thread::Builder::new()
            .name("endpoint-ticker".into())
            .spawn(move || ticker_core.ticker_loop())
            .expect("spawning the ticker thread");

        *self.workers.lock().unwrap() = Some(Workers {
            stop: self.stop.clone(),
            receiver,
            ticker,
        });
    }

    /// Signals both workers to stop, sends a self-addressed datagram to unblock a
    /// blocking receive, joins both, and drops the socket. Safe to call more than once.
    pub fn stop_and_join(&self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(socket) = self.socket() {
            if let Ok(local) = socket.local_addr() {
                // The send error here (e.g. the socket was already half-torn-down) is
                // swallowed: this datagram only exists to unblock our own receiver.
                let _ = socket.send_to(&Frame::Data(Bytes::new()).encode(), local);
            }
        }

        if let Some(workers) = self.workers.lock().unwrap().take() {
            workers.stop.store(true, Ordering::SeqCst);
            let _ = workers.receiver.join();
            let _ = workers.ticker.join();
        }

        *self.socket.lock().unwrap() = None;
    }

    fn receiver_loop(self: Arc<Self>) {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return,
        };
        let mut buf = [0u8; 65_536];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if self.stop.load(Ordering::SeqCst) {
                        debug!(self.log, "receiver stopping on self-addressed sentinel");
                        return;
                    }
                    self.handle_datagram(from, &buf[..len]);
                }
                Err(e) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                    if is_fatal_recv_error(&e) {
                        error!(self.log, "receive error, ending worker"; "error" => %e);
                        return;
                    }
                    warn!(self.log, "recoverable receive error, continuing"; "error" => %e);
                }
            }
        }
    }

    fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!(self.log, "datagram received"; "from" => %from, "len" => datagram.len());
        let decoded = codec::decode(datagram);
        let mut outcome = Outcome::new();
        {
            let mut shared = self.shared.lock().unwrap();
            let mut role = self.role.lock().unwrap();
            match decoded {
                Decoded::Frame(Frame::Data(payload)) => {
                    role.on_data(&mut shared, from, payload, &mut outcome)
                }
                Decoded::Frame(Frame::ConnectionRequest) => {
                    role.on_connection_request(&mut shared, from, &mut outcome)
                }
                Decoded::Frame(Frame::ConnectionClose(reason)) => {
                    role.on_connection_close(&mut shared, from, reason, &mut outcome)
                }
                Decoded::Frame(Frame::ConnectionConfirm(assigned_id)) => {
                    role.on_connection_confirm(&mut shared, from, assigned_id, &mut outcome)
                }
                Decoded::Frame(Frame::PasswordRequest) => {
                    role.on_password_request(&mut shared, from, &mut outcome)
                }
                Decoded::Frame(Frame::Password(secret)) => {
                    role.on_password(&mut shared, from, secret, &mut outcome)
                }
                Decoded::Unknown(body) => {
                    warn!(self.log, "dropping unrecognized datagram"; "from" => %from, "len" => body.len());
                    role.on_unknown(&mut shared, from, body, &mut outcome);
                }
            }
        }
        self.apply_outcome(outcome);
    }

    fn ticker_loop(self: Arc<Self>) {
        let tick_rate = self.shared.lock().unwrap().tick_rate;
        let mut limiter = TickLimiter::from_hz(tick_rate.max(1));
        let mut last_instant = Instant::now();
        let mut second_accumulator = 0.0f64;

        loop {
            limiter.wait();
            if self.stop.load(Ordering::SeqCst) {
                return;
            }

            let now = Instant::now();
            let delta = now.duration_since(last_instant).as_secs_f64();
            last_instant = now;

            let mut outcome = Outcome::new();
            {
                let mut shared = self.shared.lock().unwrap();
                shared.connection_time += delta;
                let mut role = self.role.lock().unwrap();
                role.on_tick(&mut shared, delta, &mut outcome);

                second_accumulator += delta;
                if second_accumulator >= 1.0 {
                    second_accumulator -= 1.0;
                    role.on_second(&mut shared, &mut outcome);
                }
            }
            self.apply_outcome(outcome);

            if self.sending_packets() {
                let hook = self.send_hook.lock().unwrap();
                if let Some(hook) = hook.as_ref() {
                    hook();
                }
            }
        }
    }

    fn apply_outcome(&self, outcome: Outcome<R::Event>) {
        if !outcome.sends.is_empty() {
            if let Some(socket) = self.socket() {
                for (to, bytes) in outcome.sends {
                    if let Err(e) = socket.send_to(&bytes, to) {
                        warn!(self.log, "failed to send datagram"; "to" => %to, "error" => %e);
                    }
                }
            }
        }
        for event in outcome.core_events {
            self.signals.dispatch(event, Delivery::Deferred);
        }
        if !outcome.role_events.is_empty() {
            let role = self.role.lock().unwrap();
            for event in outcome.role_events {
                role.dispatch_event(event, Delivery::Deferred);
            }
        }
    }
}

impl<R: Role> Drop for EndpointCore<R> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Error kinds that do not indicate the socket descriptor itself has become unusable; the
/// receive loop logs these and keeps serving other peers rather than tearing the worker
/// down over one bad datagram.
fn is_fatal_recv_error(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
impl<E> Outcome<E> {
    pub fn sends_for_test(&self) -> &[(SocketAddr, Bytes)] {
        &self.sends
    }
    pub fn role_events_for_test(&self) -> &[E] {
        &self.role_events
    }
    pub fn core_events_for_test(&self) -> &[CoreEvent] {
        &self.core_events
    }
}

/// Constructors a role module's unit tests use to exercise `Role` handlers directly,
/// without standing up a whole `EndpointCore` (socket, threads). Not part of the public API.
#[cfg(test)]
pub(crate) mod test_support {
    use super::{Outcome, Shared};

    pub fn fresh_shared(public_ip: u32) -> Shared {
        Shared::new(public_ip)
    }

    pub fn fresh_outcome<E>() -> Outcome<E> {
        Outcome::new()
    }
}
