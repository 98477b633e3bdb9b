//! The client role: one connection to exactly one server address, a handshake driver, and
//! password retry bookkeeping.
//!
//! Grounded on `examples/original_source/include/Networking/Client.hpp` and
//! `src/Networking/Client.cpp` for the handshake/password-retry/timeout-without-notification
//! semantics (a client that stops hearing from its server simply closes locally; it never
//! gets to send a `ConnectionClose` to a peer that may no longer exist).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use slog::Logger;

use crate::codec::Frame;
use crate::endpoint::{CoreEvent, EndpointCore, Outcome, Role, Shared};
use crate::error::SendError;
use crate::events::{Delivery, Signal};
use crate::ip::{PublicIpResolver, RouteProbeResolver};

fn addr_as_u32(addr: SocketAddr) -> u32 {
    match addr {
        SocketAddr::V4(v4) => u32::from(*v4.ip()),
        SocketAddr::V6(_) => 0,
    }
}

struct ClientState {
    server: Option<SocketAddrV4>,
    wrong_password: bool,
    time_since_last_packet: f64,
}

impl ClientState {
    fn new() -> Self {
        ClientState {
            server: None,
            wrong_password: false,
            time_since_last_packet: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    PasswordRequest,
    ServerPortChanged(u16),
    ServerIpChanged(u32),
}

#[derive(Clone)]
pub struct ClientSignals {
    pub password_request: Signal<()>,
    pub server_port_changed: Signal<u16>,
    pub server_ip_changed: Signal<u32>,
}

impl ClientSignals {
    fn new() -> Self {
        ClientSignals {
            password_request: Signal::new(),
            server_port_changed: Signal::new(),
            server_ip_changed: Signal::new(),
        }
    }
}

pub struct ClientRole {
    log: Logger,
    state: ClientState,
    signals: ClientSignals,
}

impl ClientRole {
    fn new(log: Logger) -> Self {
        ClientRole {
            log,
            state: ClientState::new(),
            signals: ClientSignals::new(),
        }
    }
}

impl Role for ClientRole {
    type Event = ClientEvent;

    fn on_data(&mut self, shared: &mut Shared, from: SocketAddr, payload: Bytes, out: &mut Outcome<Self::Event>) {
        self.state.time_since_last_packet = 0.0;
        out.core_event(CoreEvent::DataReceived {
            payload,
            sender_id: addr_as_u32(from),
        });
        let _ = shared;
    }

    fn on_connection_request(&mut self, _shared: &mut Shared, from: SocketAddr, _out: &mut Outcome<Self::Event>) {
        slog::debug!(self.log, "ignoring unexpected ConnectionRequest"; "from" => %from);
    }

    fn on_connection_close(
        &mut self,
        shared: &mut Shared,
        _from: SocketAddr,
        reason: String,
        out: &mut Outcome<Self::Event>,
    ) {
        shared.connection_open = false;
        self.state.wrong_password = false;
        self.state.time_since_last_packet = 0.0;
        out.core_event(CoreEvent::ConnectionClose { reason });
    }

    fn on_connection_confirm(
        &mut self,
        shared: &mut Shared,
        _from: SocketAddr,
        assigned_id: u32,
        out: &mut Outcome<Self::Event>,
    ) {
        shared.connection_open = true;
        shared.connection_time = 0.0;
        shared.id = assigned_id;
        self.state.time_since_last_packet = 0.0;
        out.core_event(CoreEvent::ConnectionOpen);
    }

    fn on_password_request(&mut self, shared: &mut Shared, _from: SocketAddr, out: &mut Outcome<Self::Event>) {
        if shared.needs_password {
            self.state.wrong_password = true;
        } else {
            shared.needs_password = true;
        }
        out.role_event(ClientEvent::PasswordRequest);
    }

    fn on_password(&mut self, _shared: &mut Shared, from: SocketAddr, _secret: String, _out: &mut Outcome<Self::Event>) {
        slog::debug!(self.log, "ignoring unexpected Password"; "from" => %from);
    }

    fn on_tick(&mut self, shared: &mut Shared, delta_secs: f64, out: &mut Outcome<Self::Event>) {
        if !shared.connection_open {
            return;
        }
        self.state.time_since_last_packet += delta_secs;
        if self.state.time_since_last_packet > shared.timeout {
            // The peer is presumed unreachable: close locally without sending anything.
            shared.connection_open = false;
            self.state.time_since_last_packet = 0.0;
            out.core_event(CoreEvent::ConnectionClose {
                reason: "Timedout".to_string(),
            });
        }
    }

    fn on_second(&mut self, _shared: &mut Shared, _out: &mut Outcome<Self::Event>) {}

    fn dispatch_event(&self, event: Self::Event, mode: Delivery) {
        match event {
            ClientEvent::PasswordRequest => self.signals.password_request.fire((), mode),
            ClientEvent::ServerPortChanged(p) => self.signals.server_port_changed.fire(p, mode),
            ClientEvent::ServerIpChanged(ip) => self.signals.server_ip_changed.fire(ip, mode),
        }
    }
}

/// Public façade for the client role. Cheap to clone (`Arc` internally).
#[derive(Clone)]
pub struct Client {
    core: Arc<EndpointCore<ClientRole>>,
    client_signals: ClientSignals,
}

impl Client {
    pub fn new(log: Logger) -> Self {
        Self::with_resolver(log, &RouteProbeResolver::default())
    }

    pub fn with_resolver(log: Logger, resolver: &dyn PublicIpResolver) -> Self {
        let role = ClientRole::new(log.clone());
        let client_signals = role.signals.clone();
        Client {
            core: Arc::new(EndpointCore::new(log, role, resolver)),
            client_signals,
        }
    }

    // -- configuration (no-op while open) --
    pub fn set_port(&self, port: u16) {
        self.core.set_port(port);
    }
    pub fn set_timeout(&self, seconds: f64) {
        self.core.set_timeout(seconds);
    }
    pub fn set_update_interval(&self, ticks_per_second: u32) {
        self.core.set_update_interval(ticks_per_second);
    }
    pub fn set_packet_send_hook(&self, hook: Option<Box<dyn Fn() + Send>>) {
        self.core.set_packet_send_hook(hook);
    }
    pub fn set_sending_packets(&self, enabled: bool) {
        self.core.set_sending_packets(enabled);
    }

    /// No-op while open. Either argument may be omitted to leave that half unchanged.
    pub fn set_server_data(&self, ip: Option<Ipv4Addr>, port: Option<u16>) {
        if self.core.connection_open() {
            return;
        }
        let updated = self.core.with_role(|role| {
            let mut addr = role
                .state
                .server
                .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            if let Some(ip) = ip {
                addr = SocketAddrV4::new(ip, addr.port());
            }
            if let Some(port) = port {
                addr = SocketAddrV4::new(*addr.ip(), port);
            }
            role.state.server = Some(addr);
            addr
        });
        if ip.is_some() {
            self.client_signals
                .server_ip_changed
                .fire(u32::from(*updated.ip()), Delivery::Immediate);
        }
        if port.is_some() {
            self.client_signals
                .server_port_changed
                .fire(updated.port(), Delivery::Immediate);
        }
    }

    // -- observation --
    pub fn id(&self) -> u32 {
        self.core.id()
    }
    pub fn public_ip(&self) -> u32 {
        self.core.public_ip()
    }
    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.core.local_ip()
    }
    pub fn port(&self) -> u16 {
        self.core.port()
    }
    pub fn connection_time(&self) -> f64 {
        self.core.connection_time()
    }
    pub fn connection_open(&self) -> bool {
        self.core.connection_open()
    }
    pub fn receiving_packets(&self) -> bool {
        self.core.receiving_packets()
    }
    pub fn sending_packets(&self) -> bool {
        self.core.sending_packets()
    }
    pub fn needs_password(&self) -> bool {
        self.core.needs_password()
    }
    pub fn update_interval(&self) -> u32 {
        self.core.update_interval()
    }
    pub fn timeout(&self) -> f64 {
        self.core.timeout()
    }
    pub fn was_incorrect_password(&self) -> bool {
        self.core.with_role(|role| role.state.wrong_password)
    }
    pub fn time_since_last_packet(&self) -> f64 {
        self.core.with_role(|role| role.state.time_since_last_packet)
    }
    pub fn server_ip(&self) -> Option<Ipv4Addr> {
        self.core.with_role(|role| role.state.server.map(|a| *a.ip()))
    }
    pub fn server_port(&self) -> Option<u16> {
        self.core.with_role(|role| role.state.server.map(|a| a.port()))
    }

    // -- lifecycle --
    /// Requires `set_server_data` to have been called first. Binds an ephemeral local port
    /// if the workers are not already running, special-cases a loopback server address (so
    /// a later `ConnectionConfirm` doesn't overwrite the client's id with the server's own
    /// public-address id), and sends `ConnectionRequest`. Returns whether the send
    /// succeeded; the connection is not open until `ConnectionConfirm` arrives.
    pub fn try_open_connection(&self) -> bool {
        let server = match self.core.with_role(|role| role.state.server) {
            Some(server) => server,
            None => return false,
        };

        if !self.core.receiving_packets() {
            let bind_addr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
            if self.core.bind(bind_addr).is_err() {
                return false;
            }
            self.core.start_workers();
        }

        if *server.ip() == Ipv4Addr::LOCALHOST {
            self.core.set_id(u32::from(Ipv4Addr::LOCALHOST));
        }

        self.core
            .send_frame(SocketAddr::V4(server), &Frame::ConnectionRequest)
            .is_ok()
    }

    /// If open, sends `ConnectionClose(reason)`, resets handshake state, stops the
    /// workers, and fires `connection_close`. A second call is a no-op (§8 property 8).
    pub fn close_connection(&self, reason: &str) {
        if !self.core.connection_open() {
            return;
        }
        if let Some(server) = self.core.with_role(|role| role.state.server) {
            let _ = self
                .core
                .send_frame(SocketAddr::V4(server), &Frame::ConnectionClose(reason.to_string()));
        }
        self.core.with_role(|role| {
            role.state.server = None;
            role.state.wrong_password = false;
            role.state.time_since_last_packet = 0.0;
        });
        self.core.with_shared(|shared| {
            shared.connection_open = false;
            shared.needs_password = false;
            shared.connection_time = 0.0;
            shared.id = shared.public_ip;
        });
        self.core.stop_and_join();
        self.core
            .signals()
            .connection_close
            .fire(reason.to_string(), Delivery::Immediate);
    }

    // -- password flow --
    /// Stores the password (a no-op while open, per the endpoint's connection-gating
    /// invariant) and transmits it regardless of open/closed state; `was_incorrect_password`
    /// is cleared optimistically.
    pub fn set_and_send_password(&self, secret: String) {
        self.core.set_password(secret.clone());
        self.core.with_role(|role| role.state.wrong_password = false);
        if let Some(server) = self.core.with_role(|role| role.state.server) {
            let _ = self.core.send_frame(SocketAddr::V4(server), &Frame::Password(secret));
        }
    }

    pub fn send_password_to_server(&self) -> bool {
        let server = match self.core.with_role(|role| role.state.server) {
            Some(server) => server,
            None => return false,
        };
        self.core
            .send_frame(SocketAddr::V4(server), &Frame::Password(self.core.password()))
            .is_ok()
    }

    pub fn send_to_server(&self, frame: &Frame) -> Result<(), SendError> {
        let server = self
            .core
            .with_role(|role| role.state.server)
            .ok_or(SendError::NoServerAddress)?;
        self.core.send_frame(SocketAddr::V4(server), frame)
    }

    // -- events --
    pub fn data_received(&self) -> &Signal<(Bytes, u32)> {
        &self.core.signals().data_received
    }
    pub fn connection_open_signal(&self) -> &Signal<()> {
        &self.core.signals().connection_open
    }
    pub fn connection_close(&self) -> &Signal<String> {
        &self.core.signals().connection_close
    }
    pub fn update_rate_changed(&self) -> &Signal<u32> {
        &self.core.signals().update_rate_changed
    }
    pub fn timeout_changed(&self) -> &Signal<f64> {
        &self.core.signals().timeout_changed
    }
    pub fn port_changed(&self) -> &Signal<u16> {
        &self.core.signals().port_changed
    }
    pub fn password_request(&self) -> &Signal<()> {
        &self.client_signals.password_request
    }
    pub fn server_port_changed(&self) -> &Signal<u16> {
        &self.client_signals.server_port_changed
    }
    pub fn server_ip_changed(&self) -> &Signal<u32> {
        &self.client_signals.server_ip_changed
    }
}
