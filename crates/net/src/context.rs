//! The process-owned networking context and its per-tick driver.
//!
//! One [`NetContext`] per process holds the socket, the connection registry,
//! the replication engine, the RPC registry and the session manager. The
//! host game calls [`NetContext::update`] once per tick:
//!
//! ```text
//! update()
//!   ├─ pump inbound datagrams (bounded per tick)
//!   │    ├─ ack bookkeeping, duplicate drop
//!   │    ├─ reliable stream reordering
//!   │    └─ apply: handshake / spawn / update / rpc / control
//!   ├─ timers: hello retry, connect timeout, ping, failure sweep
//!   └─ flush outbound
//!        ├─ replication updates per connection (byte budget)
//!        ├─ reliable (re)sends
//!        ├─ standalone acks
//!        └─ discovery broadcasts
//! ```
//!
//! Nothing blocks and nothing runs on another thread; timeouts are
//! wall-clock so they progress even when the game clock is paused.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::NetError;
use crate::connection::{
    Connection, ConnectionRegistry, ConnectionState, DatagramManifest, HostId, INVALID_HOST_ID,
    NetHost,
};
use crate::message::{
    DEFAULT_PORT, Datagram, FieldUpdate, Message, MessageHeader, PROTOCOL_VERSION, RejectReason,
};
use crate::replication::{NetId, ObjectFactory, ReplicationEngine, UpdateManifest};
use crate::rpc::{self, NetFuncType, RpcHandler, RpcRegistry, RpcTarget};
use crate::session::{DiscoveredSession, SessionInfo, SessionManager};
use crate::stats::{NetworkStats, PacketLossSimulation, rand_u64};
use crate::transport::{NetSocket, addr_to_u32};
use crate::value::{NetValue, NetValueKind};

/// Role of the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetStatus {
    /// No session: standalone play. The local host is its own authority.
    Local,
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Identifies the game build; peers with a different id reject each
    /// other during the handshake.
    pub game_id: u64,
    /// Port a server binds and discovery broadcasts target.
    pub port: u16,
    /// Send only fields that changed since the peer's last acked snapshot.
    /// When off, every update carries every field and is authoritative.
    pub incremental: bool,
    /// Outbound replication bytes per connection per tick.
    pub update_budget_bytes: usize,
    /// Inbound datagrams processed per tick before yielding.
    pub max_datagrams_per_tick: usize,
    pub connect_timeout: Duration,
    pub hello_interval: Duration,
    pub resend_interval: Duration,
    pub max_resend_count: u32,
    pub max_reliable_age: Duration,
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    pub search_duration: Duration,
    pub search_send_interval: Duration,
    pub advertise_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            game_id: 0x00EB_0001,
            port: DEFAULT_PORT,
            incremental: true,
            update_budget_bytes: 8192,
            max_datagrams_per_tick: 256,
            connect_timeout: Duration::from_secs(5),
            hello_interval: Duration::from_millis(500),
            resend_interval: Duration::from_millis(100),
            max_resend_count: 10,
            max_reliable_age: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            search_duration: Duration::from_secs(3),
            search_send_interval: Duration::from_millis(500),
            advertise_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle hooks the host game installs. Invoked synchronously inside the
/// tick; they must not block.
#[derive(Default)]
pub struct NetCallbacks {
    /// Server: a client completed the handshake.
    pub on_connect: Option<Box<dyn FnMut(&NetHost)>>,
    /// Client: the server accepted us and assigned our host id.
    pub on_accept: Option<Box<dyn FnMut(HostId, &SessionInfo)>>,
    /// Client: the connection attempt failed.
    pub on_reject: Option<Box<dyn FnMut(RejectReason)>>,
    /// Either side: a peer went away (graceful, kicked or timed out).
    pub on_disconnect: Option<Box<dyn FnMut(&NetHost)>>,
    /// Client: the server kicked us.
    pub on_kick: Option<Box<dyn FnMut(&NetHost)>>,
    /// Server: final say over a prospective client after the capacity and
    /// version checks pass. Returning false rejects it.
    pub accept_hook: Option<Box<dyn FnMut(&NetHost) -> bool>>,
}

pub struct NetContext {
    status: NetStatus,
    config: NetConfig,
    socket: Option<NetSocket>,
    registry: ConnectionRegistry,
    /// Client side: the one connection to the server.
    server: Option<Connection>,
    local_host_id: HostId,
    replication: ReplicationEngine,
    rpcs: RpcRegistry,
    session: SessionManager,
    joined: Option<SessionInfo>,
    /// Unreliable updates can outrun the reliable Spawn that announces
    /// their object; they wait here until the Spawn applies.
    pending_updates: HashMap<NetId, Vec<FieldUpdate>>,
    pub callbacks: NetCallbacks,
    pub loss_sim: PacketLossSimulation,
    stats: NetworkStats,
    online_id: u64,
    connect_deadline: Option<Instant>,
    last_hello: Option<Instant>,
    last_ping: Option<Instant>,
    tick: u64,
}

impl NetContext {
    pub fn new(config: NetConfig) -> Self {
        let incremental = config.incremental;
        Self {
            status: NetStatus::Local,
            registry: ConnectionRegistry::new(0, config.connection_timeout),
            config,
            socket: None,
            server: None,
            local_host_id: INVALID_HOST_ID,
            replication: ReplicationEngine::new(incremental),
            rpcs: RpcRegistry::new(),
            session: SessionManager::new(),
            joined: None,
            pending_updates: HashMap::new(),
            callbacks: NetCallbacks::default(),
            loss_sim: PacketLossSimulation::default(),
            stats: NetworkStats::default(),
            online_id: rand_u64(),
            connect_deadline: None,
            last_hello: None,
            last_ping: None,
            tick: 0,
        }
    }

    /// Swap in a non-LAN discovery backend. Must be called before hosting
    /// or searching.
    pub fn set_discovery_backend(&mut self, backend: Box<dyn crate::session::Discovery>) {
        self.session = SessionManager::with_backend(backend);
    }

    // ----- session lifecycle -------------------------------------------------

    /// Bind the server socket and start advertising the session.
    pub fn open_session(&mut self, info: SessionInfo) -> Result<(), NetError> {
        if self.status != NetStatus::Local {
            return Err(NetError::InvalidState("already hosting or connected"));
        }

        let socket = NetSocket::bind(("0.0.0.0", self.config.port))?;
        socket.set_broadcast(true)?;
        log::info!(
            "session '{}' open on {} (max {} players)",
            info.name,
            socket.local_addr(),
            info.max_players
        );

        self.registry =
            ConnectionRegistry::new(info.max_players as usize, self.config.connection_timeout);
        self.session.open(info);
        self.socket = Some(socket);
        self.status = NetStatus::Server;
        self.local_host_id = INVALID_HOST_ID;
        Ok(())
    }

    /// Notify every client and tear the session down.
    pub fn close_session(&mut self) {
        if self.status != NetStatus::Server {
            return;
        }
        if let Some(socket) = self.socket.as_ref() {
            for conn in self.registry.iter_mut() {
                if conn.state == ConnectionState::Connected {
                    let _ = Self::send_to_connection(
                        socket,
                        &mut self.stats,
                        &self.loss_sim,
                        conn,
                        Message::Disconnect,
                        None,
                        None,
                    );
                }
            }
        }
        log::info!("session closed");
        self.registry = ConnectionRegistry::new(0, self.config.connection_timeout);
        self.session.close();
        self.socket = None;
        self.status = NetStatus::Local;
    }

    /// Begin connecting to a server. The Hello repeats at a fixed interval
    /// until Accept, Reject or the attempt times out.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), NetError> {
        if self.status != NetStatus::Local {
            return Err(NetError::InvalidState("already hosting or connected"));
        }
        if self.socket.is_none() {
            let socket = NetSocket::bind_ephemeral()?;
            socket.set_broadcast(true)?;
            self.socket = Some(socket);
        }

        log::info!("connecting to {addr}");
        let now = Instant::now();
        let mut conn = Connection::new(addr, INVALID_HOST_ID);

        if let Some(socket) = self.socket.as_ref() {
            let _ = Self::send_to_connection(
                socket,
                &mut self.stats,
                &self.loss_sim,
                &mut conn,
                Message::Hello {
                    game_id: self.config.game_id,
                    online_id: self.online_id,
                },
                None,
                None,
            );
        }

        self.server = Some(conn);
        self.status = NetStatus::Client;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        self.last_hello = Some(now);
        Ok(())
    }

    /// Leave the session. Cancelling a still-pending connect just discards
    /// the attempt.
    pub fn disconnect(&mut self) {
        match self.status {
            NetStatus::Client => {
                if let (Some(socket), Some(conn)) = (self.socket.as_ref(), self.server.as_mut()) {
                    if conn.state == ConnectionState::Connected {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            Message::Disconnect,
                            None,
                            None,
                        );
                    }
                }
                self.reset_client();
            }
            NetStatus::Server => self.close_session(),
            NetStatus::Local => {}
        }
    }

    /// Server: remove a client, telling it why.
    pub fn kick(&mut self, host_id: HostId) {
        if self.status != NetStatus::Server {
            return;
        }
        if let (Some(socket), Some(conn)) = (self.socket.as_ref(), self.registry.get_mut(host_id))
        {
            let _ = Self::send_to_connection(
                socket,
                &mut self.stats,
                &self.loss_sim,
                conn,
                Message::Kick,
                None,
                None,
            );
        }
        if let Some(mut conn) = self.registry.remove(host_id) {
            conn.state = ConnectionState::Disconnecting;
            log::info!("kicked client {host_id}");
            self.dec_player_count();
            if let Some(cb) = self.callbacks.on_disconnect.as_mut() {
                cb(&conn.host);
            }
        }
    }

    // ----- discovery ---------------------------------------------------------

    pub fn begin_session_search(&mut self) -> Result<(), NetError> {
        if self.status != NetStatus::Local {
            return Err(NetError::InvalidState("cannot search while in a session"));
        }
        if self.socket.is_none() {
            let socket = NetSocket::bind_ephemeral()?;
            socket.set_broadcast(true)?;
            self.socket = Some(socket);
        }
        self.session
            .begin_search(Instant::now(), self.config.search_duration);
        Ok(())
    }

    pub fn end_session_search(&mut self) {
        self.session.end_search();
    }

    pub fn is_searching(&self) -> bool {
        self.session.is_searching()
    }

    pub fn sessions(&self) -> Vec<DiscoveredSession> {
        self.session.sessions()
    }

    pub fn join_session(&mut self, session: &DiscoveredSession) -> Result<(), NetError> {
        self.session.end_search();
        self.connect(session.addr)
    }

    // ----- replication api ---------------------------------------------------

    pub fn register_class(&mut self, name: impl Into<String>, factory: ObjectFactory) {
        self.replication.register_class(name, factory);
    }

    /// Authority only: create a networked object and announce it reliably
    /// to every connection.
    pub fn spawn_object(&mut self, class: &str, owner: HostId) -> Result<NetId, NetError> {
        if !self.is_authority() {
            return Err(NetError::InvalidState("only the authority spawns objects"));
        }
        let net_id = self.replication.spawn(class, owner)?;
        let now = Instant::now();
        for conn in self.registry.iter_mut() {
            if conn.state == ConnectionState::Connected {
                conn.outbound.push(
                    Message::Spawn {
                        net_id,
                        class: class.to_string(),
                        owner,
                    },
                    now,
                );
            }
        }
        Ok(net_id)
    }

    /// Authority only: destroy an object and announce it reliably.
    pub fn destroy_object(&mut self, net_id: NetId) -> Result<(), NetError> {
        if !self.is_authority() {
            return Err(NetError::InvalidState("only the authority destroys objects"));
        }
        if !self.replication.destroy(net_id) {
            return Err(NetError::UnknownObject(net_id));
        }
        let now = Instant::now();
        for conn in self.registry.iter_mut() {
            conn.cursor.forget(net_id);
            if conn.state == ConnectionState::Connected {
                conn.outbound.push(Message::Destroy { net_id }, now);
            }
        }
        Ok(())
    }

    pub fn set_field(
        &mut self,
        net_id: NetId,
        index: usize,
        value: NetValue,
    ) -> Result<(), NetError> {
        self.replication.set_field(net_id, index, value).map(|_| ())
    }

    pub fn object(&self, net_id: NetId) -> Option<&crate::replication::NetObject> {
        self.replication.get(net_id)
    }

    pub fn object_mut(&mut self, net_id: NetId) -> Option<&mut crate::replication::NetObject> {
        self.replication.get_mut(net_id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &crate::replication::NetObject> {
        self.replication.objects()
    }

    // ----- rpc api -----------------------------------------------------------

    pub fn register_func(
        &mut self,
        name: impl Into<String>,
        kind: NetFuncType,
        reliable: bool,
        params: Vec<NetValueKind>,
        handler: RpcHandler,
    ) -> Result<u8, NetError> {
        self.rpcs.register(name, kind, reliable, params, handler)
    }

    pub fn func_index(&self, name: &str) -> Option<u8> {
        self.rpcs.index_of(name)
    }

    /// Invoke a registered function on a networked object. Execution and
    /// transmission follow the routing table for the function's type.
    pub fn invoke(&mut self, func: u8, net_id: NetId, args: &[NetValue]) -> Result<(), NetError> {
        self.rpcs.check_args(func, args)?;
        let (kind, reliable) = {
            let f = self.rpcs.get(func).ok_or(NetError::UnknownFunc(func))?;
            (f.kind, f.reliable)
        };
        let owner = self
            .replication
            .get(net_id)
            .ok_or(NetError::UnknownObject(net_id))?
            .owner;

        let Some(route) = rpc::route_call(kind, self.status, owner, self.local_host_id) else {
            debug_assert!(false, "rpc invoked on an object this host does not own");
            log::warn!("dropping rpc {func} on object {net_id}: not the owner");
            return Err(NetError::InvalidState("rpc not callable from this host"));
        };

        if route.execute_local {
            self.rpcs.execute(func, net_id, args);
        }
        if route.target == RpcTarget::None {
            return Ok(());
        }

        let message = Message::Rpc {
            net_id,
            func,
            args: args.to_vec(),
        };
        let now = Instant::now();
        let Some(socket) = self.socket.as_ref() else {
            return Err(NetError::InvalidState("no active session"));
        };

        match route.target {
            RpcTarget::None => {}
            RpcTarget::Server => {
                if let Some(conn) = self.server.as_mut() {
                    if reliable {
                        conn.outbound.push(message, now);
                    } else {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            message,
                            None,
                            None,
                        );
                    }
                }
            }
            RpcTarget::Host(id) => match self.registry.get_mut(id) {
                Some(conn) if conn.state == ConnectionState::Connected => {
                    if reliable {
                        conn.outbound.push(message, now);
                    } else {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            message,
                            None,
                            None,
                        );
                    }
                }
                _ => log::warn!("rpc {func} targets host {id} which is not connected"),
            },
            RpcTarget::AllClients => {
                for conn in self.registry.iter_mut() {
                    if conn.state != ConnectionState::Connected {
                        continue;
                    }
                    if reliable {
                        conn.outbound.push(message.clone(), now);
                    } else {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            message.clone(),
                            None,
                            None,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn invoke_by_name(
        &mut self,
        name: &str,
        net_id: NetId,
        args: &[NetValue],
    ) -> Result<(), NetError> {
        let func = self
            .rpcs
            .index_of(name)
            .ok_or(NetError::InvalidState("unknown rpc name"))?;
        self.invoke(func, net_id, args)
    }

    // ----- accessors ---------------------------------------------------------

    pub fn status(&self) -> NetStatus {
        self.status
    }

    /// The authority owns the HostId and NetId spaces; that is the server,
    /// or the local host in standalone play.
    pub fn is_authority(&self) -> bool {
        self.status != NetStatus::Client
    }

    pub fn local_host_id(&self) -> HostId {
        self.local_host_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|s| s.local_addr())
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn connected_count(&self) -> usize {
        match self.status {
            NetStatus::Server => self.registry.connected_count(),
            NetStatus::Client => self
                .server
                .as_ref()
                .filter(|c| c.state == ConnectionState::Connected)
                .map_or(0, |_| 1),
            NetStatus::Local => 0,
        }
    }

    pub fn connected_hosts(&self) -> Vec<NetHost> {
        self.registry
            .iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.host)
            .collect()
    }

    pub fn connection_rtt(&self, host_id: HostId) -> Option<f32> {
        self.registry.get(host_id).map(|c| c.rtt_ms())
    }

    pub fn is_connected(&self) -> bool {
        match self.status {
            NetStatus::Client => self
                .server
                .as_ref()
                .is_some_and(|c| c.state == ConnectionState::Connected),
            NetStatus::Server => true,
            NetStatus::Local => false,
        }
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session.local()
    }

    pub fn joined_session(&self) -> Option<&SessionInfo> {
        self.joined.as_ref()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    // ----- the tick ----------------------------------------------------------

    /// Drive the whole subsystem for one game tick.
    pub fn update(&mut self) {
        let now = Instant::now();
        self.tick = self.tick.wrapping_add(1);

        self.pump_inbound(now);
        self.check_timers(now);
        self.flush_outbound(now);
    }

    fn pump_inbound(&mut self, now: Instant) {
        for _ in 0..self.config.max_datagrams_per_tick {
            let received = {
                let Some(socket) = self.socket.as_mut() else {
                    return;
                };
                match socket.recv_from() {
                    Ok(Some((data, addr))) => Some((data.to_vec(), addr)),
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("socket receive error: {e}");
                        None
                    }
                }
            };
            let Some((data, addr)) = received else {
                return;
            };

            self.stats.datagrams_received += 1;
            self.stats.bytes_received += data.len() as u64;

            let datagram = match Datagram::decode(&data) {
                Ok(d) => d,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    log::debug!("dropping malformed datagram from {addr}: {e}");
                    continue;
                }
            };

            if datagram.header.version != PROTOCOL_VERSION {
                // A mismatched build gets an explicit Reject for its Hello
                // so it fails fast instead of timing out.
                if matches!(datagram.message, Message::Hello { .. })
                    && self.status == NetStatus::Server
                {
                    if let Some(socket) = self.socket.as_ref() {
                        Self::send_unconnected(
                            socket,
                            &mut self.stats,
                            addr,
                            Message::Reject {
                                reason: RejectReason::VersionMismatch,
                            },
                        );
                    }
                }
                log::debug!(
                    "dropping datagram from {addr} with protocol v{}",
                    datagram.header.version
                );
                continue;
            }

            match self.status {
                NetStatus::Server => self.server_receive(datagram, addr, data.len(), now),
                NetStatus::Client => self.client_receive(datagram, addr, data.len(), now),
                NetStatus::Local => self.local_receive(datagram, addr, now),
            }
        }
    }

    fn server_receive(&mut self, datagram: Datagram, addr: SocketAddr, len: usize, now: Instant) {
        if let Some(conn) = self.registry.get_by_addr_mut(&addr) {
            if !conn.receive_tracker.record(datagram.header.sequence) {
                return;
            }
            conn.process_acks(datagram.header.ack, datagram.header.ack_bits);
            conn.bytes_received += len as u64;
            conn.touch();
            if !matches!(datagram.message, Message::Ack) {
                conn.need_ack = true;
            }

            let host_id = conn.host.id;
            let deliver = match datagram.reliable {
                Some(seq) => conn.inbound.accept(seq, datagram.message),
                None => vec![datagram.message],
            };
            for message in deliver {
                self.apply_server_message(host_id, addr, message, now);
            }
            return;
        }

        match datagram.message {
            Message::Hello { game_id, online_id } => {
                self.server_handshake(addr, datagram.header.sequence, game_id, online_id, now);
            }
            Message::SessionSearch { game_id } => self.answer_search(addr, game_id),
            Message::SessionNotice { .. } => {}
            other => {
                log::trace!("ignoring {:?} from unknown host {addr}", other.kind());
            }
        }
    }

    fn server_handshake(
        &mut self,
        addr: SocketAddr,
        hello_seq: u32,
        game_id: u64,
        online_id: u64,
        now: Instant,
    ) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        if game_id != self.config.game_id {
            log::warn!("rejecting {addr}: different game id");
            Self::send_unconnected(
                socket,
                &mut self.stats,
                addr,
                Message::Reject {
                    reason: RejectReason::GameMismatch,
                },
            );
            return;
        }

        let session = match self.session.local() {
            Some(s) => s.clone(),
            None => return,
        };
        if session.is_full() || self.registry.at_capacity() {
            log::info!("rejecting {addr}: session full");
            Self::send_unconnected(
                socket,
                &mut self.stats,
                addr,
                Message::Reject {
                    reason: RejectReason::Full,
                },
            );
            return;
        }

        let candidate = {
            let (ip, port) = addr_to_u32(addr);
            NetHost {
                ip,
                port,
                id: INVALID_HOST_ID,
                online_id,
            }
        };
        if let Some(hook) = self.callbacks.accept_hook.as_mut() {
            if !hook(&candidate) {
                log::info!("rejecting {addr}: refused by accept hook");
                Self::send_unconnected(
                    socket,
                    &mut self.stats,
                    addr,
                    Message::Reject {
                        reason: RejectReason::Refused,
                    },
                );
                return;
            }
        }

        let Ok(conn) = self.registry.get_or_create_pending(addr) else {
            Self::send_unconnected(
                socket,
                &mut self.stats,
                addr,
                Message::Reject {
                    reason: RejectReason::Full,
                },
            );
            return;
        };

        conn.host.online_id = online_id;
        conn.receive_tracker.record(hello_seq);
        conn.touch();
        conn.state = ConnectionState::Connected;
        let host = conn.host;

        log::info!("client {} connected from {addr}", host.id);
        let _ = Self::send_to_connection(
            socket,
            &mut self.stats,
            &self.loss_sim,
            conn,
            Message::Accept {
                host_id: host.id,
                session,
            },
            None,
            None,
        );

        // A late joiner gets every live object announced up front; the
        // field values follow through the normal update path.
        for object in self.replication.objects() {
            if object.replicates() {
                conn.outbound.push(
                    Message::Spawn {
                        net_id: object.net_id,
                        class: object.class.clone(),
                        owner: object.owner,
                    },
                    now,
                );
            }
        }

        if let Some(info) = self.session.local_mut() {
            info.player_count = info.player_count.saturating_add(1);
        }
        if let Some(cb) = self.callbacks.on_connect.as_mut() {
            cb(&host);
        }
    }

    fn apply_server_message(
        &mut self,
        host_id: HostId,
        addr: SocketAddr,
        message: Message,
        _now: Instant,
    ) {
        match message {
            // Our Accept was lost; repeat it.
            Message::Hello { .. } => {
                let session = match self.session.local() {
                    Some(s) => s.clone(),
                    None => return,
                };
                let Some(socket) = self.socket.as_ref() else {
                    return;
                };
                if let Some(conn) = self.registry.get_mut(host_id) {
                    let _ = Self::send_to_connection(
                        socket,
                        &mut self.stats,
                        &self.loss_sim,
                        conn,
                        Message::Accept { host_id, session },
                        None,
                        None,
                    );
                }
            }
            Message::Disconnect => {
                if let Some(mut conn) = self.registry.remove(host_id) {
                    conn.state = ConnectionState::Disconnecting;
                    log::info!("client {host_id} disconnected");
                    self.dec_player_count();
                    if let Some(cb) = self.callbacks.on_disconnect.as_mut() {
                        cb(&conn.host);
                    }
                }
            }
            Message::Ping { timestamp_ms } => {
                let Some(socket) = self.socket.as_ref() else {
                    return;
                };
                if let Some(conn) = self.registry.get_mut(host_id) {
                    let _ = Self::send_to_connection(
                        socket,
                        &mut self.stats,
                        &self.loss_sim,
                        conn,
                        Message::Pong { timestamp_ms },
                        None,
                        None,
                    );
                }
            }
            Message::Rpc { net_id, func, args } => {
                self.execute_remote_rpc(host_id, net_id, func, args);
            }
            Message::SessionSearch { game_id } => self.answer_search(addr, game_id),
            Message::Ack | Message::Pong { .. } => {}
            other => {
                log::debug!(
                    "unexpected {:?} from client {host_id}, dropping",
                    other.kind()
                );
            }
        }
    }

    fn client_receive(&mut self, datagram: Datagram, addr: SocketAddr, len: usize, now: Instant) {
        let deliver = {
            let Some(conn) = self.server.as_mut() else {
                return;
            };
            if conn.host.addr() != addr {
                log::trace!("dropping datagram from {addr}: not the server");
                return;
            }
            if !conn.receive_tracker.record(datagram.header.sequence) {
                return;
            }
            conn.process_acks(datagram.header.ack, datagram.header.ack_bits);
            conn.bytes_received += len as u64;
            conn.touch();
            if !matches!(datagram.message, Message::Ack) {
                conn.need_ack = true;
            }
            match datagram.reliable {
                Some(seq) => conn.inbound.accept(seq, datagram.message),
                None => vec![datagram.message],
            }
        };

        for message in deliver {
            self.apply_client_message(message, now);
        }
    }

    fn apply_client_message(&mut self, message: Message, _now: Instant) {
        match message {
            Message::Accept { host_id, session } => {
                let connecting = self
                    .server
                    .as_ref()
                    .is_some_and(|c| c.state == ConnectionState::Connecting);
                if !connecting {
                    return;
                }
                if let Some(conn) = self.server.as_mut() {
                    conn.state = ConnectionState::Connected;
                }
                self.local_host_id = host_id;
                self.connect_deadline = None;
                log::info!("accepted into '{}' as host {host_id}", session.name);
                if let Some(cb) = self.callbacks.on_accept.as_mut() {
                    cb(host_id, &session);
                }
                self.joined = Some(session);
            }
            Message::Reject { reason } => {
                let connecting = self
                    .server
                    .as_ref()
                    .is_some_and(|c| c.state == ConnectionState::Connecting);
                if !connecting {
                    return;
                }
                log::warn!("connection rejected: {}", reason.as_str());
                if let Some(cb) = self.callbacks.on_reject.as_mut() {
                    cb(reason);
                }
                self.reset_client();
            }
            Message::Disconnect => {
                log::info!("server closed the connection");
                let host = self.server.as_ref().map(|c| c.host);
                if let (Some(cb), Some(host)) = (self.callbacks.on_disconnect.as_mut(), host) {
                    cb(&host);
                }
                self.reset_client();
            }
            Message::Kick => {
                log::warn!("kicked by server");
                let host = self.server.as_ref().map(|c| c.host);
                if let (Some(cb), Some(host)) = (self.callbacks.on_kick.as_mut(), host) {
                    cb(&host);
                }
                self.reset_client();
            }
            Message::Spawn {
                net_id,
                class,
                owner,
            } => {
                if let Err(e) = self.replication.insert_remote(net_id, &class, owner) {
                    log::warn!("cannot spawn '{class}' ({net_id}): {e}");
                    return;
                }
                if let Some(pending) = self.pending_updates.remove(&net_id) {
                    if let Err(e) = self.replication.apply_update(net_id, &pending) {
                        log::warn!("dropping buffered updates for object {net_id}: {e}");
                    }
                }
            }
            Message::Destroy { net_id } => {
                self.pending_updates.remove(&net_id);
                self.replication.destroy(net_id);
            }
            Message::Update { net_id, fields } => {
                let total = fields.len();
                match self.replication.apply_update(net_id, &fields) {
                    Ok(applied) => {
                        self.stats.stale_updates_dropped += (total - applied) as u64;
                    }
                    Err(NetError::UnknownObject(_)) => {
                        // The reliable Spawn announcing this object is still
                        // in flight; hold the values until it lands.
                        if self.pending_updates.len() < 64
                            || self.pending_updates.contains_key(&net_id)
                        {
                            let entry = self.pending_updates.entry(net_id).or_default();
                            if entry.len() < 256 {
                                entry.extend(fields);
                            }
                        } else {
                            log::debug!("pending update buffer full, dropping {net_id}");
                        }
                    }
                    Err(e) => {
                        self.stats.decode_errors += 1;
                        log::warn!("dropping update for object {net_id}: {e}");
                    }
                }
            }
            Message::Rpc { net_id, func, args } => {
                self.execute_remote_rpc(INVALID_HOST_ID, net_id, func, args);
            }
            Message::Ping { timestamp_ms } => {
                let Some(socket) = self.socket.as_ref() else {
                    return;
                };
                if let Some(conn) = self.server.as_mut() {
                    let _ = Self::send_to_connection(
                        socket,
                        &mut self.stats,
                        &self.loss_sim,
                        conn,
                        Message::Pong { timestamp_ms },
                        None,
                        None,
                    );
                }
            }
            Message::Pong { timestamp_ms } => {
                let rtt = now_ms().saturating_sub(timestamp_ms);
                log::trace!("ping rtt {rtt} ms");
            }
            Message::Ack => {}
            other => {
                log::debug!("unexpected {:?} from server, dropping", other.kind());
            }
        }
    }

    fn local_receive(&mut self, datagram: Datagram, addr: SocketAddr, now: Instant) {
        if let Message::SessionNotice { game_id, session } = datagram.message {
            if game_id == self.config.game_id {
                self.session.note_session(addr, session, now);
            }
        }
    }

    fn execute_remote_rpc(
        &mut self,
        sender: HostId,
        net_id: NetId,
        func: u8,
        args: Vec<NetValue>,
    ) {
        let Some(f) = self.rpcs.get(func) else {
            log::warn!("rpc with unknown index {func}, dropping");
            return;
        };
        let kind = f.kind;

        if !rpc::accepts_remote(kind, self.status) {
            log::warn!("rpc '{func}' of type {kind:?} not executable here, dropping");
            return;
        }
        if !self.rpcs.args_match(func, &args) {
            log::warn!("rpc {func} arrived with mismatched arguments, dropping");
            return;
        }
        let Some(object) = self.replication.get(net_id) else {
            log::debug!("rpc {func} targets unknown object {net_id}, dropping");
            return;
        };
        // Only the owner of an object may drive its server functions.
        if self.status == NetStatus::Server
            && kind == NetFuncType::Server
            && object.owner != sender
        {
            log::warn!(
                "client {sender} called server rpc on object {net_id} owned by {}",
                object.owner
            );
            return;
        }

        self.rpcs.execute(func, net_id, &args);
    }

    fn answer_search(&mut self, addr: SocketAddr, game_id: u64) {
        if game_id != self.config.game_id {
            return;
        }
        let Some(info) = self.session.local().cloned() else {
            return;
        };
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        Self::send_unconnected(
            socket,
            &mut self.stats,
            addr,
            Message::SessionNotice {
                game_id,
                session: info,
            },
        );
    }

    fn check_timers(&mut self, now: Instant) {
        self.session.expire_search(now);

        match self.status {
            NetStatus::Client => {
                let state = self.server.as_ref().map(|c| c.state);
                match state {
                    Some(ConnectionState::Connecting) => {
                        if self.connect_deadline.is_some_and(|d| now >= d) {
                            log::warn!("connection attempt timed out");
                            if let Some(cb) = self.callbacks.on_reject.as_mut() {
                                cb(RejectReason::Timeout);
                            }
                            self.reset_client();
                            return;
                        }
                        let due = self
                            .last_hello
                            .is_none_or(|t| now.duration_since(t) >= self.config.hello_interval);
                        if due {
                            if let (Some(socket), Some(conn)) =
                                (self.socket.as_ref(), self.server.as_mut())
                            {
                                let _ = Self::send_to_connection(
                                    socket,
                                    &mut self.stats,
                                    &self.loss_sim,
                                    conn,
                                    Message::Hello {
                                        game_id: self.config.game_id,
                                        online_id: self.online_id,
                                    },
                                    None,
                                    None,
                                );
                            }
                            self.last_hello = Some(now);
                        }
                    }
                    Some(ConnectionState::Connected) => {
                        let ping_due = self
                            .last_ping
                            .is_none_or(|t| now.duration_since(t) >= self.config.ping_interval);
                        if ping_due {
                            if let (Some(socket), Some(conn)) =
                                (self.socket.as_ref(), self.server.as_mut())
                            {
                                let _ = Self::send_to_connection(
                                    socket,
                                    &mut self.stats,
                                    &self.loss_sim,
                                    conn,
                                    Message::Ping {
                                        timestamp_ms: now_ms(),
                                    },
                                    None,
                                    None,
                                );
                            }
                            self.last_ping = Some(now);
                        }

                        let failed = self.server.as_ref().is_some_and(|c| {
                            c.is_timed_out(self.config.connection_timeout)
                                || c.outbound.exhausted(
                                    now,
                                    self.config.max_resend_count,
                                    self.config.max_reliable_age,
                                )
                        });
                        if failed {
                            log::warn!("server connection lost");
                            let host = self.server.as_ref().map(|c| c.host);
                            if let (Some(cb), Some(host)) =
                                (self.callbacks.on_disconnect.as_mut(), host)
                            {
                                cb(&host);
                            }
                            self.reset_client();
                        }
                    }
                    _ => {}
                }
            }
            NetStatus::Server => {
                let removed = self.registry.sweep_failed(
                    now,
                    self.config.max_resend_count,
                    self.config.max_reliable_age,
                );
                for conn in removed {
                    log::info!("client {} lost (timeout or retry exhaustion)", conn.host.id);
                    self.dec_player_count();
                    if let Some(cb) = self.callbacks.on_disconnect.as_mut() {
                        cb(&conn.host);
                    }
                }
            }
            NetStatus::Local => {}
        }
    }

    fn flush_outbound(&mut self, now: Instant) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        match self.status {
            NetStatus::Server => {
                let tick = self.tick;
                let budget = self.config.update_budget_bytes;
                for conn in self.registry.iter_mut() {
                    if conn.state != ConnectionState::Connected {
                        continue;
                    }

                    // Reliables go first so a Spawn precedes the first
                    // updates for its object whenever possible.
                    for (seq, message, resend) in
                        conn.outbound.take_due(now, self.config.resend_interval)
                    {
                        if resend {
                            self.stats.reliable_resends += 1;
                        }
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            message,
                            Some(seq),
                            None,
                        );
                    }

                    for (message, manifest) in
                        self.replication.build_updates(&mut conn.cursor, tick, budget)
                    {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            message,
                            None,
                            Some(manifest),
                        );
                    }

                    if conn.need_ack {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            Message::Ack,
                            None,
                            None,
                        );
                    }
                }

                // Broadcast needs a well-known port; an ephemeral bind can
                // still be discovered through directed search requests.
                if self.config.port != 0
                    && self
                        .session
                        .advertise_due(now, self.config.advertise_interval)
                {
                    if let Some(info) = self.session.local().cloned() {
                        let addr = SocketAddr::from((Ipv4Addr::BROADCAST, self.config.port));
                        Self::send_unconnected(
                            socket,
                            &mut self.stats,
                            addr,
                            Message::SessionNotice {
                                game_id: self.config.game_id,
                                session: info,
                            },
                        );
                    }
                }
            }
            NetStatus::Client => {
                if let Some(conn) = self.server.as_mut() {
                    for (seq, message, resend) in
                        conn.outbound.take_due(now, self.config.resend_interval)
                    {
                        if resend {
                            self.stats.reliable_resends += 1;
                        }
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            message,
                            Some(seq),
                            None,
                        );
                    }

                    if conn.need_ack {
                        let _ = Self::send_to_connection(
                            socket,
                            &mut self.stats,
                            &self.loss_sim,
                            conn,
                            Message::Ack,
                            None,
                            None,
                        );
                    }

                    self.stats.rtt_ms = conn.ack_tracker.srtt();
                    self.stats.rtt_variance = conn.ack_tracker.rtt_var();
                }
            }
            NetStatus::Local => {
                if self.config.port != 0
                    && self
                        .session
                        .search_send_due(now, self.config.search_send_interval)
                {
                    let addr = SocketAddr::from((Ipv4Addr::BROADCAST, self.config.port));
                    Self::send_unconnected(
                        socket,
                        &mut self.stats,
                        addr,
                        Message::SessionSearch {
                            game_id: self.config.game_id,
                        },
                    );
                }
            }
        }
    }

    // ----- send helpers ------------------------------------------------------

    fn send_to_connection(
        socket: &NetSocket,
        stats: &mut NetworkStats,
        loss_sim: &PacketLossSimulation,
        conn: &mut Connection,
        message: Message,
        reliable_seq: Option<u32>,
        update: Option<UpdateManifest>,
    ) -> io::Result<()> {
        let sequence = conn.next_sequence();
        let (ack, ack_bits) = conn.receive_tracker.ack_data();
        let plain_ack = matches!(message, Message::Ack);

        let datagram = Datagram {
            header: MessageHeader::new(sequence, ack, ack_bits),
            reliable: reliable_seq,
            message,
        };
        let bytes = match datagram.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("refusing to send oversized or invalid message: {e}");
                return Ok(());
            }
        };

        // Pure acks are not themselves acked, so don't wait on them.
        if !plain_ack {
            conn.ack_tracker.track(sequence);
        }
        conn.register_in_flight(
            sequence,
            DatagramManifest {
                reliable: reliable_seq,
                update,
            },
        );
        conn.need_ack = false;
        conn.last_send_time = Instant::now();

        if loss_sim.should_drop() {
            log::trace!("simulated loss of datagram {sequence}");
            return Ok(());
        }

        let sent = socket.send_to(&bytes, conn.host.addr())?;
        stats.datagrams_sent += 1;
        stats.bytes_sent += sent as u64;
        conn.bytes_sent += sent as u64;
        Ok(())
    }

    /// Send outside any connection (rejects, discovery traffic).
    fn send_unconnected(
        socket: &NetSocket,
        stats: &mut NetworkStats,
        addr: SocketAddr,
        message: Message,
    ) {
        let datagram = Datagram {
            header: MessageHeader::new(0, 0, 0),
            reliable: None,
            message,
        };
        match datagram.encode() {
            Ok(bytes) => match socket.send_to(&bytes, addr) {
                Ok(sent) => {
                    stats.datagrams_sent += 1;
                    stats.bytes_sent += sent as u64;
                }
                Err(e) => log::debug!("send to {addr} failed: {e}"),
            },
            Err(e) => log::error!("refusing to send invalid message: {e}"),
        }
    }

    fn reset_client(&mut self) {
        self.server = None;
        self.socket = None;
        self.status = NetStatus::Local;
        self.local_host_id = INVALID_HOST_ID;
        self.connect_deadline = None;
        self.last_hello = None;
        self.last_ping = None;
        self.joined = None;
        // Everything we knew was mirrored from the server.
        self.pending_updates.clear();
        self.replication.clear();
    }

    fn dec_player_count(&mut self) {
        if let Some(info) = self.session.local_mut() {
            info.player_count = info.player_count.saturating_sub(1);
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NetConfig {
        NetConfig {
            port: 0,
            ..NetConfig::default()
        }
    }

    #[test]
    fn test_standalone_is_authority() {
        let ctx = NetContext::new(test_config());
        assert_eq!(ctx.status(), NetStatus::Local);
        assert!(ctx.is_authority());
        assert_eq!(ctx.local_host_id(), INVALID_HOST_ID);
    }

    #[test]
    fn test_open_and_close_session() {
        let mut ctx = NetContext::new(test_config());
        ctx.open_session(SessionInfo::default()).unwrap();
        assert_eq!(ctx.status(), NetStatus::Server);
        assert!(ctx.local_addr().is_some());
        assert!(ctx.open_session(SessionInfo::default()).is_err());

        ctx.close_session();
        assert_eq!(ctx.status(), NetStatus::Local);
        assert!(ctx.local_addr().is_none());
    }

    #[test]
    fn test_standalone_spawn_and_rpc_execute_locally() {
        let mut ctx = NetContext::new(test_config());
        ctx.register_class(
            "marker",
            Box::new(|obj| {
                obj.declare_field(NetValueKind::I32);
            }),
        );

        let calls = std::rc::Rc::new(std::cell::RefCell::new(0));
        let sink = std::rc::Rc::clone(&calls);
        let func = ctx
            .register_func(
                "poke",
                NetFuncType::Multicast,
                false,
                vec![],
                Box::new(move |_, _| *sink.borrow_mut() += 1),
            )
            .unwrap();

        let id = ctx.spawn_object("marker", INVALID_HOST_ID).unwrap();
        ctx.set_field(id, 0, NetValue::I32(9)).unwrap();
        assert_eq!(ctx.object(id).unwrap().field(0), Some(&NetValue::I32(9)));

        ctx.invoke(func, id, &[]).unwrap();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn test_spawn_refused_on_client_status() {
        let mut ctx = NetContext::new(test_config());
        ctx.register_class("marker", Box::new(|_| {}));
        ctx.connect("127.0.0.1:9".parse().unwrap()).unwrap();
        assert_eq!(ctx.status(), NetStatus::Client);
        assert!(ctx.spawn_object("marker", INVALID_HOST_ID).is_err());
        ctx.disconnect();
        assert_eq!(ctx.status(), NetStatus::Local);
    }
}
