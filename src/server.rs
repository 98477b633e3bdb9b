//! The server role: accepts connections from many peers, keyed by client identity.
//!
//! Grounded on `examples/original_source/include/Networking/Server.hpp` and
//! `src/Networking/Server.cpp` for admission rules, per-tick/per-second bookkeeping, and
//! broadcast/blacklist semantics, and on `include/Networking/ClientData.hpp` for the record
//! fields. The client table itself follows `quinn-proto::endpoint::Endpoint`'s use of
//! `fnv::FnvHashMap` for its connection table, substituting a `Slab`-free direct key (the
//! remote address's IPv4-as-u32) since this protocol never needs to allocate or recycle a
//! handle the way a `Slab`-indexed connection id does.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fnv::FnvHashMap;
use slog::{debug, Logger};

use crate::codec::Frame;
use crate::endpoint::{EndpointCore, Outcome, Role, Shared};
use crate::error::OpenError;
use crate::events::{Delivery, Signal};
use crate::ip::{PublicIpResolver, RouteProbeResolver};

/// A server-side client identity: the peer's IPv4 address as a big-endian integer, per
/// §4.3. Two peers behind the same NAT or on loopback collide on this value; see the
/// REDESIGN FLAGS note on client identity for the known limitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

impl ClientId {
    fn from_addr(addr: SocketAddr) -> Option<ClientId> {
        match addr {
            SocketAddr::V4(v4) => Some(ClientId(u32::from(*v4.ip()))),
            SocketAddr::V6(_) => None,
        }
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A read-only snapshot of one client's bookkeeping, returned from `clients`/`client_data`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientView {
    pub id: ClientId,
    pub port: u16,
    pub connection_time: f64,
    pub time_since_last_packet: f64,
    pub packets_per_second: u32,
}

struct ClientRecord {
    addr: SocketAddr,
    connection_time: f64,
    time_since_last_packet: f64,
    packets_sent_this_interval: u32,
    packets_per_second: u32,
}

impl ClientRecord {
    fn new(addr: SocketAddr) -> Self {
        ClientRecord {
            addr,
            connection_time: 0.0,
            time_since_last_packet: 0.0,
            packets_sent_this_interval: 0,
            packets_per_second: 0,
        }
    }

    fn view(&self, id: ClientId) -> ClientView {
        ClientView {
            id,
            port: match self.addr {
                SocketAddr::V4(v4) => v4.port(),
                SocketAddr::V6(v6) => v6.port(),
            },
            connection_time: self.connection_time,
            time_since_last_packet: self.time_since_last_packet,
            packets_per_second: self.packets_per_second,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId, String),
}

#[derive(Clone)]
pub struct ServerSignals {
    pub client_connected: Signal<ClientId>,
    pub client_disconnected: Signal<(ClientId, String)>,
}

impl ServerSignals {
    fn new() -> Self {
        ServerSignals {
            client_connected: Signal::new(),
            client_disconnected: Signal::new(),
        }
    }
}

pub struct ServerRole {
    log: Logger,
    clients: FnvHashMap<ClientId, ClientRecord>,
    allow_connections: Arc<AtomicBool>,
    signals: ServerSignals,
}

impl ServerRole {
    fn new(log: Logger, allow_connections: Arc<AtomicBool>) -> Self {
        ServerRole {
            log,
            clients: FnvHashMap::default(),
            allow_connections,
            signals: ServerSignals::new(),
        }
    }

    fn touch(&mut self, id: ClientId) {
        if let Some(record) = self.clients.get_mut(&id) {
            record.time_since_last_packet = 0.0;
        }
    }

    fn admit_or_challenge(
        &mut self,
        shared: &mut Shared,
        from: SocketAddr,
        out: &mut Outcome<ServerEvent>,
    ) {
        let id = match ClientId::from_addr(from) {
            Some(id) => id,
            None => return,
        };
        if self.clients.contains_key(&id) {
            out.send(from, &Frame::ConnectionConfirm(id.0));
            return;
        }
        if !self.allow_connections.load(Ordering::SeqCst) {
            return;
        }
        if shared.needs_password {
            out.send(from, &Frame::PasswordRequest);
            return;
        }
        self.admit(id, from, out);
    }

    fn admit(&mut self, id: ClientId, from: SocketAddr, out: &mut Outcome<ServerEvent>) {
        debug!(self.log, "admitting client"; "id" => %id, "from" => %from);
        self.clients.insert(id, ClientRecord::new(from));
        out.send(from, &Frame::ConnectionConfirm(id.0));
        out.role_event(ServerEvent::ClientConnected(id));
    }

    fn remove(&mut self, id: ClientId, reason: &str, out: &mut Outcome<ServerEvent>) {
        if self.clients.remove(&id).is_some() {
            out.role_event(ServerEvent::ClientDisconnected(id, reason.to_string()));
        }
    }

    pub fn clients_snapshot(&self) -> Vec<ClientView> {
        self.clients.iter().map(|(id, rec)| rec.view(*id)).collect()
    }

    pub fn client_view(&self, id: ClientId) -> Option<ClientView> {
        self.clients.get(&id).map(|rec| rec.view(id))
    }

    pub fn clients_len(&self) -> usize {
        self.clients.len()
    }

    pub fn client_addr(&self, id: ClientId) -> Option<SocketAddr> {
        self.clients.get(&id).map(|rec| rec.addr)
    }

    pub fn all_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn remove_for_facade(&mut self, id: ClientId) -> Option<SocketAddr> {
        self.clients.remove(&id).map(|rec| rec.addr)
    }

    pub fn drain_for_facade(&mut self) -> Vec<(ClientId, SocketAddr)> {
        self.clients.drain().map(|(id, rec)| (id, rec.addr)).collect()
    }
}

impl Role for ServerRole {
    type Event = ServerEvent;

    fn on_data(&mut self, shared: &mut Shared, from: SocketAddr, payload: Bytes, out: &mut Outcome<Self::Event>) {
        match ClientId::from_addr(from) {
            Some(id) if self.clients.contains_key(&id) => {
                self.touch(id);
                if let Some(record) = self.clients.get_mut(&id) {
                    record.packets_sent_this_interval += 1;
                }
                out.core_event(crate::endpoint::CoreEvent::DataReceived {
                    payload,
                    sender_id: id.0,
                });
            }
            _ => self.admit_or_challenge(shared, from, out),
        }
    }

    fn on_connection_request(&mut self, shared: &mut Shared, from: SocketAddr, out: &mut Outcome<Self::Event>) {
        if let Some(id) = ClientId::from_addr(from) {
            self.touch(id);
        }
        self.admit_or_challenge(shared, from, out);
    }

    fn on_connection_close(
        &mut self,
        _shared: &mut Shared,
        from: SocketAddr,
        reason: String,
        out: &mut Outcome<Self::Event>,
    ) {
        if let Some(id) = ClientId::from_addr(from) {
            self.remove(id, &reason, out);
        }
    }

    fn on_connection_confirm(&mut self, _shared: &mut Shared, from: SocketAddr, _assigned_id: u32, _out: &mut Outcome<Self::Event>) {
        debug!(self.log, "ignoring unexpected ConnectionConfirm"; "from" => %from);
    }

    fn on_password_request(&mut self, _shared: &mut Shared, from: SocketAddr, _out: &mut Outcome<Self::Event>) {
        debug!(self.log, "ignoring unexpected PasswordRequest"; "from" => %from);
    }

    fn on_password(
        &mut self,
        shared: &mut Shared,
        from: SocketAddr,
        secret: String,
        out: &mut Outcome<Self::Event>,
    ) {
        let id = match ClientId::from_addr(from) {
            Some(id) => id,
            None => return,
        };
        if self.clients.contains_key(&id) {
            self.touch(id);
            return;
        }
        if !self.allow_connections.load(Ordering::SeqCst) {
            return;
        }
        if secret == shared.password {
            self.admit(id, from, out);
        } else {
            out.send(from, &Frame::PasswordRequest);
        }
    }

    fn on_tick(&mut self, shared: &mut Shared, delta_secs: f64, out: &mut Outcome<Self::Event>) {
        let timeout = shared.timeout;
        let mut timed_out = Vec::new();
        for (id, record) in self.clients.iter_mut() {
            record.connection_time += delta_secs;
            record.time_since_last_packet += delta_secs;
            if record.time_since_last_packet > timeout {
                timed_out.push((*id, record.addr));
            }
        }
        for (id, addr) in timed_out {
            out.send(addr, &Frame::ConnectionClose("Timedout".to_string()));
            self.remove(id, "Timedout", out);
        }
    }

    fn on_second(&mut self, _shared: &mut Shared, _out: &mut Outcome<Self::Event>) {
        for record in self.clients.values_mut() {
            record.packets_per_second = record.packets_sent_this_interval;
            record.packets_sent_this_interval = 0;
        }
    }

    fn dispatch_event(&self, event: Self::Event, mode: Delivery) {
        match event {
            ServerEvent::ClientConnected(id) => self.signals.client_connected.fire(id, mode),
            ServerEvent::ClientDisconnected(id, reason) => {
                self.signals.client_disconnected.fire((id, reason), mode)
            }
        }
    }
}

/// Public façade for the server role. Cheap to clone (`Arc` internally); every clone talks
/// to the same endpoint.
#[derive(Clone)]
pub struct Server {
    core: Arc<EndpointCore<ServerRole>>,
    allow_connections: Arc<AtomicBool>,
    server_signals: ServerSignals,
}

impl Server {
    pub fn new(log: Logger) -> Self {
        Self::with_resolver(log, &RouteProbeResolver::default())
    }

    pub fn with_resolver(log: Logger, resolver: &dyn PublicIpResolver) -> Self {
        let allow_connections = Arc::new(AtomicBool::new(true));
        let role = ServerRole::new(log.clone(), allow_connections.clone());
        let server_signals = role.signals.clone();
        Server {
            core: Arc::new(EndpointCore::new(log, role, resolver)),
            allow_connections,
            server_signals,
        }
    }

    // -- configuration (no-op while open) --
    pub fn set_port(&self, port: u16) {
        self.core.set_port(port);
    }
    /// No-op while open, per §4.2's connection-gating invariant. Setting `required` to
    /// `false` with no `password` clears the stored password too, so a later
    /// `set_password_required(true, None)` can't resurrect a stale secret.
    pub fn set_password_required(&self, required: bool, password: Option<String>) {
        self.core.set_needs_password(required);
        match password {
            Some(password) => self.core.set_password(password),
            None if !required => self.core.set_password(String::new()),
            None => {}
        }
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
    /// May be called from any thread at any time; admission is not required to be atomic
    /// with in-flight frame processing (§5).
    pub fn allow_client_connection(&self, allowed: bool) {
        self.allow_connections.store(allowed, Ordering::SeqCst);
    }

    // -- observation --
    pub fn id(&self) -> u32 {
        self.core.id()
    }
    pub fn public_ip(&self) -> u32 {
        self.core.public_ip()
    }
    pub fn local_ip(&self) -> Option<std::net::Ipv4Addr> {
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
    pub fn password(&self) -> String {
        self.core.password()
    }
    pub fn update_interval(&self) -> u32 {
        self.core.update_interval()
    }
    pub fn timeout(&self) -> f64 {
        self.core.timeout()
    }
    pub fn clients(&self) -> Vec<ClientView> {
        self.core.with_role(|role| role.clients_snapshot())
    }
    pub fn clients_size(&self) -> usize {
        self.core.with_role(|role| role.clients_len())
    }
    pub fn client_data(&self, id: ClientId) -> Option<ClientView> {
        self.core.with_role(|role| role.client_view(id))
    }

    // -- lifecycle --
    /// Binds the given port and starts the receiver/ticker workers. Returns `false` (and
    /// leaves the endpoint closed) if the bind fails, e.g. the port is already in use.
    pub fn try_open_connection(&self, port: u16) -> bool {
        if self.core.connection_open() {
            return true;
        }
        let addr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port);
        match self.core.bind(addr) {
            Ok(()) => {
                self.core.with_shared(|s| s.connection_open = true);
                self.core.start_workers();
                true
            }
            Err(OpenError::Bind(_)) | Err(OpenError::NoServerAddress) => false,
        }
    }

    /// Disconnects every client with "Server Closing", resets state, stops the workers,
    /// and fires `connection_close`. A second call is a no-op (§8 property 8).
    pub fn close_connection(&self) {
        if !self.core.connection_open() {
            return;
        }
        self.disconnect_all_clients("Server Closing");
        self.core.with_shared(|s| s.connection_open = false);
        self.core.stop_and_join();
        self.core
            .signals()
            .connection_close
            .fire("Server Closing".to_string(), Delivery::Immediate);
    }

    pub fn disconnect_all_clients(&self, reason: &str) {
        let removed = self.core.with_role(|role| role.drain_for_facade());
        for (id, addr) in removed {
            let _ = self.core.send_frame(addr, &Frame::ConnectionClose(reason.to_string()));
            self.server_signals
                .client_disconnected
                .fire((id, reason.to_string()), Delivery::Immediate);
        }
    }

    pub fn disconnect_client(&self, id: ClientId, reason: &str) -> bool {
        let addr = self.core.with_role(|role| role.remove_for_facade(id));
        match addr {
            Some(addr) => {
                let _ = self.core.send_frame(addr, &Frame::ConnectionClose(reason.to_string()));
                self.server_signals
                    .client_disconnected
                    .fire((id, reason.to_string()), Delivery::Immediate);
                true
            }
            None => false,
        }
    }

    /// Sends to every client not in `blacklist`. Per-peer send failures are logged and do
    /// not abort the broadcast (§4.3: "order unspecified", no retry per §7).
    pub fn send_to_all(&self, frame: &Frame, blacklist: &[ClientId]) {
        let targets: Vec<SocketAddr> = self.core.with_role(|role| {
            role.all_ids()
                .into_iter()
                .filter(|id| !blacklist.contains(id))
                .filter_map(|id| role.client_addr(id))
                .collect()
        });
        for addr in targets {
            let _ = self.core.send_frame(addr, frame);
        }
    }

    /// Returns whether `id` was a known client (and, if so, a send was attempted).
    pub fn send_to(&self, frame: &Frame, id: ClientId) -> bool {
        let addr = self.core.with_role(|role| role.client_addr(id));
        match addr {
            Some(addr) => {
                let _ = self.core.send_frame(addr, frame);
                true
            }
            None => false,
        }
    }

    // -- events --
    pub fn data_received(&self) -> &Signal<(Bytes, u32)> {
        &self.core.signals().data_received
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
    pub fn password_changed(&self) -> &Signal<String> {
        &self.core.signals().password_changed
    }
    pub fn client_connected(&self) -> &Signal<ClientId> {
        &self.server_signals.client_connected
    }
    pub fn client_disconnected(&self) -> &Signal<(ClientId, String)> {
        &self.server_signals.client_disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn client_id_from_ipv4_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(ClientId::from_addr(addr), Some(ClientId(0x7f00_0001)));
    }

    #[test]
    fn admits_passwordless_request_and_fires_connected() {
        let log = Logger::root(slog::Discard, slog::o!());
        let allow = Arc::new(AtomicBool::new(true));
        let mut role = ServerRole::new(log, allow);
        let mut shared = shared_for_test();
        let mut out = Outcome::<ServerEvent>::new_for_test();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        role.on_connection_request(&mut shared, from, &mut out);
        assert_eq!(role.clients_len(), 1);
        assert_matches!(out.role_events_for_test()[0], ServerEvent::ClientConnected(_));
    }

    #[test]
    fn repeated_connection_request_is_idempotent() {
        let log = Logger::root(slog::Discard, slog::o!());
        let allow = Arc::new(AtomicBool::new(true));
        let mut role = ServerRole::new(log, allow);
        let mut shared = shared_for_test();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let mut out1 = Outcome::<ServerEvent>::new_for_test();
        role.on_connection_request(&mut shared, from, &mut out1);
        let mut out2 = Outcome::<ServerEvent>::new_for_test();
        role.on_connection_request(&mut shared, from, &mut out2);

        assert_eq!(role.clients_len(), 1);
        assert!(out2.role_events_for_test().is_empty());
        assert_eq!(out2.sends_for_test().len(), 1);
    }

    #[test]
    fn password_required_challenges_then_admits() {
        let log = Logger::root(slog::Discard, slog::o!());
        let allow = Arc::new(AtomicBool::new(true));
        let mut role = ServerRole::new(log, allow);
        let mut shared = shared_for_test();
        shared.needs_password = true;
        shared.password = "hunter2".to_string();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let mut out1 = Outcome::<ServerEvent>::new_for_test();
        role.on_connection_request(&mut shared, from, &mut out1);
        assert_eq!(role.clients_len(), 0);

        let mut out2 = Outcome::<ServerEvent>::new_for_test();
        role.on_password(&mut shared, from, "wrong".to_string(), &mut out2);
        assert_eq!(role.clients_len(), 0);

        let mut out3 = Outcome::<ServerEvent>::new_for_test();
        role.on_password(&mut shared, from, "hunter2".to_string(), &mut out3);
        assert_eq!(role.clients_len(), 1);
    }

    #[test]
    fn tick_disconnects_on_timeout() {
        let log = Logger::root(slog::Discard, slog::o!());
        let allow = Arc::new(AtomicBool::new(true));
        let mut role = ServerRole::new(log, allow);
        let mut shared = shared_for_test();
        shared.timeout = 1.0;
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut out = Outcome::<ServerEvent>::new_for_test();
        role.on_connection_request(&mut shared, from, &mut out);

        let mut tick_out = Outcome::<ServerEvent>::new_for_test();
        role.on_tick(&mut shared, 2.0, &mut tick_out);

        assert_eq!(role.clients_len(), 0);
        assert!(tick_out
            .role_events_for_test()
            .iter()
            .any(|e| matches!(e, ServerEvent::ClientDisconnected(_, reason) if reason == "Timedout")));
    }

    #[test]
    fn packets_per_second_rolls_over_each_second() {
        let log = Logger::root(slog::Discard, slog::o!());
        let allow = Arc::new(AtomicBool::new(true));
        let mut role = ServerRole::new(log, allow);
        let mut shared = shared_for_test();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut out = Outcome::<ServerEvent>::new_for_test();
        role.on_connection_request(&mut shared, from, &mut out);
        let id = ClientId::from_addr(from).unwrap();

        for _ in 0..10 {
            let mut data_out = Outcome::<ServerEvent>::new_for_test();
            role.on_data(&mut shared, from, Bytes::new(), &mut data_out);
        }
        let mut second_out = Outcome::<ServerEvent>::new_for_test();
        role.on_second(&mut shared, &mut second_out);
        assert_eq!(role.client_view(id).unwrap().packets_per_second, 10);

        let mut second_out2 = Outcome::<ServerEvent>::new_for_test();
        role.on_second(&mut shared, &mut second_out2);
        assert_eq!(role.client_view(id).unwrap().packets_per_second, 0);
    }

    fn shared_for_test() -> Shared {
        crate::endpoint::test_support::fresh_shared(0x7f00_0001)
    }

    impl<E> Outcome<E> {
        fn new_for_test() -> Self {
            crate::endpoint::test_support::fresh_outcome()
        }
    }
}
