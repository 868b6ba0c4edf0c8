//! Remote host identity, per-connection protocol state and the registry the
//! server keeps of its clients.
//!
//! ```text
//! ┌──────────────┐    Hello sent/received     ┌──────────────┐
//! │ Disconnected │ ──────────────────────────▶│  Connecting  │
//! └──────────────┘                            └──────────────┘
//!        ▲                                           │
//!        │ timeout / Reject            (server side) │ capacity + accept hook
//!        │                                           ▼
//!        │                                    ┌───────────────┐
//!        │◀───────────────────────────────────│ PendingAccept │
//!        │                                    └───────────────┘
//!        │                                           │ Accept sent
//!        │      Disconnect / Kick / timeout          ▼
//!        │                                    ┌──────────────┐
//!        └◀───────────────────────────────────│  Connected   │
//!              (via Disconnecting)            └──────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::reliability::{AckTracker, ReceiveTracker, ReliableInbound, ReliableOutbound};
use crate::replication::{ReplicationCursor, UpdateManifest};
use crate::transport::{addr_to_u32, u32_to_addr};

/// Small integer identifying a connected peer, assigned by the server.
/// Unique among currently connected peers and never reused while the peer
/// stays connected. 0 is the server / invalid sentinel.
pub type HostId = u32;

pub const INVALID_HOST_ID: HostId = 0;

/// Identity of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHost {
    pub ip: u32,
    pub port: u16,
    pub id: HostId,
    /// Opaque platform identifier used by non-IP discovery backends.
    pub online_id: u64,
}

impl NetHost {
    pub fn from_addr(addr: SocketAddr, id: HostId) -> Self {
        let (ip, port) = addr_to_u32(addr);
        Self {
            ip,
            port,
            id,
            online_id: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        u32_to_addr(self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Server side only: a Hello arrived and the accept decision (capacity,
    /// user hook) is being made.
    PendingAccept,
    Connected,
    Disconnecting,
}

/// What an outbound datagram was carrying, kept until the peer acks it.
#[derive(Debug, Clone, Default)]
pub struct DatagramManifest {
    pub reliable: Option<u32>,
    pub update: Option<UpdateManifest>,
}

impl DatagramManifest {
    pub fn is_empty(&self) -> bool {
        self.reliable.is_none() && self.update.is_none()
    }
}

/// All protocol state for one remote peer.
pub struct Connection {
    pub host: NetHost,
    pub state: ConnectionState,
    pub ack_tracker: AckTracker,
    pub receive_tracker: ReceiveTracker,
    pub outbound: ReliableOutbound,
    pub inbound: ReliableInbound,
    pub cursor: ReplicationCursor,
    pub last_receive_time: Instant,
    pub last_send_time: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Set when a datagram arrived this tick; cleared once an ack-bearing
    /// datagram goes back out.
    pub need_ack: bool,
    next_datagram_seq: u32,
    in_flight: HashMap<u32, DatagramManifest>,
}

impl Connection {
    pub fn new(addr: SocketAddr, id: HostId) -> Self {
        let now = Instant::now();
        Self {
            host: NetHost::from_addr(addr, id),
            state: ConnectionState::Connecting,
            ack_tracker: AckTracker::new(256),
            receive_tracker: ReceiveTracker::new(),
            outbound: ReliableOutbound::new(),
            inbound: ReliableInbound::new(),
            cursor: ReplicationCursor::default(),
            last_receive_time: now,
            last_send_time: now,
            bytes_sent: 0,
            bytes_received: 0,
            need_ack: false,
            // Sequence 0 is never sent so an all-zero header acks nothing.
            next_datagram_seq: 1,
            in_flight: HashMap::new(),
        }
    }

    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_datagram_seq;
        self.next_datagram_seq = self.next_datagram_seq.wrapping_add(1);
        seq
    }

    pub fn register_in_flight(&mut self, sequence: u32, manifest: DatagramManifest) {
        if !manifest.is_empty() {
            self.in_flight.insert(sequence, manifest);
            // Bound the map against a peer that never acks.
            if self.in_flight.len() > 1024 {
                let oldest = self.in_flight.keys().copied().min();
                if let Some(oldest) = oldest {
                    self.in_flight.remove(&oldest);
                }
            }
        }
    }

    /// Fold an inbound header's ack data into our send-side state: release
    /// acknowledged reliable messages and advance the replication cursor
    /// for update payloads the peer has confirmed.
    pub fn process_acks(&mut self, ack: u32, ack_bits: u32) {
        for sequence in self.ack_tracker.process_ack(ack, ack_bits) {
            if let Some(manifest) = self.in_flight.remove(&sequence) {
                if let Some(reliable_seq) = manifest.reliable {
                    self.outbound.ack(reliable_seq);
                }
                if let Some(update) = manifest.update {
                    self.cursor.mark_acked(&update);
                }
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn rtt_ms(&self) -> f32 {
        self.ack_tracker.srtt()
    }
}

/// The server's table of known peers: at most one connection per address,
/// host ids allocated monotonically so an id is never reused while its peer
/// is connected.
pub struct ConnectionRegistry {
    by_addr: HashMap<SocketAddr, HostId>,
    connections: HashMap<HostId, Connection>,
    next_host_id: HostId,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            by_addr: HashMap::new(),
            connections: HashMap::new(),
            next_host_id: 1,
            max_clients,
            timeout,
        }
    }

    pub fn set_max_clients(&mut self, max_clients: usize) {
        self.max_clients = max_clients;
    }

    pub fn at_capacity(&self) -> bool {
        self.connections.len() >= self.max_clients
    }

    /// Look up the connection for `addr`, creating one in `PendingAccept`
    /// for an unknown sender. Fails when the table is full.
    pub fn get_or_create_pending(&mut self, addr: SocketAddr) -> Result<&mut Connection, ()> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Ok(self.connections.get_mut(&id).expect("index out of sync"));
        }

        if self.at_capacity() {
            return Err(());
        }

        let id = self.next_host_id;
        self.next_host_id = self.next_host_id.wrapping_add(1);

        let mut connection = Connection::new(addr, id);
        connection.state = ConnectionState::PendingAccept;
        self.connections.insert(id, connection);
        self.by_addr.insert(addr, id);

        Ok(self.connections.get_mut(&id).expect("just inserted"))
    }

    pub fn get(&self, id: HostId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: HostId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.by_addr.get(addr).and_then(|id| self.connections.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        if let Some(&id) = self.by_addr.get(addr) {
            self.connections.get_mut(&id)
        } else {
            None
        }
    }

    pub fn remove(&mut self, id: HostId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        self.by_addr.remove(&connection.host.addr());
        Some(connection)
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<Connection> {
        let id = self.by_addr.remove(addr)?;
        self.connections.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Remove every connection that timed out or exhausted its reliable
    /// retry budget. Returns the removed connections so lifecycle callbacks
    /// can fire.
    pub fn sweep_failed(
        &mut self,
        now: Instant,
        max_sends: u32,
        max_age: Duration,
    ) -> Vec<Connection> {
        let failed: Vec<HostId> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                c.is_timed_out(self.timeout) || c.outbound.exhausted(now, max_sends, max_age)
            })
            .map(|(&id, _)| id)
            .collect();

        failed
            .into_iter()
            .filter_map(|id| {
                let mut connection = self.remove(id)?;
                connection.state = ConnectionState::Disconnecting;
                Some(connection)
            })
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.connections.len()
    }
}
