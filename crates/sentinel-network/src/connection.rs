//! Connection admission and lifecycle bookkeeping.
//!
//! The swarm owns the sockets; the [`ConnectionManager`] decides which
//! connections may exist. Every check and state change happens under the
//! peer table lock, so concurrent dials and accepts can never push the
//! number of connecting plus connected peers past `max_peers`.

use libp2p::{Multiaddr, PeerId};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::peers::{ConnectionState, Direction, SharedPeerTable};

/// Caps the backoff exponent so the multiplication cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    table: SharedPeerTable,
    max_peers: usize,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl ConnectionManager {
    pub fn new(table: SharedPeerTable, max_peers: usize, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self { table, max_peers, backoff_base, backoff_max }
    }

    pub fn table(&self) -> &SharedPeerTable {
        &self.table
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// `base * 2^failures`, capped at `backoff_max`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(MAX_BACKOFF_EXPONENT);
        self.backoff_base.checked_mul(factor).unwrap_or(self.backoff_max).min(self.backoff_max)
    }

    /// Claim a slot for an outbound dial.
    ///
    /// Rejected (never queued) when the peer is banned, backing off, already
    /// connecting or connected, or when every slot is taken.
    pub fn reserve_dial(&self, peer: PeerId, addr: Option<Multiaddr>) -> Result<(), ConnectionError> {
        let mut table = self.table.lock();
        if table.scores.is_banned(&peer) {
            return Err(ConnectionError::Banned);
        }
        let now = Instant::now();
        if let Some(entry) = table.get(&peer) {
            if entry.connection.is_active() {
                return Err(ConnectionError::AlreadyConnected);
            }
            if let Some(until) = entry.backoff_until.filter(|u| *u > now) {
                return Err(ConnectionError::BackingOff { remaining: until - now });
            }
        }
        let active = table.count_in(ConnectionState::Connecting) + table.count_in(ConnectionState::Connected);
        if active >= self.max_peers {
            return Err(ConnectionError::PeerLimitReached { max: self.max_peers });
        }

        let entry = table.entry_mut(peer);
        entry.connection = ConnectionState::Connecting;
        entry.direction = Some(Direction::Outbound);
        if addr.is_some() {
            entry.addr = addr;
        }
        debug!(%peer, active = active + 1, "connection: dial reserved");
        Ok(())
    }

    /// Admit an established connection.
    ///
    /// An outbound connection turns its reservation into a connection; an
    /// inbound one needs a free slot. On error the caller closes the
    /// connection.
    pub fn accept(&self, peer: PeerId, direction: Direction, addr: Option<Multiaddr>) -> Result<(), ConnectionError> {
        let mut table = self.table.lock();
        if table.scores.is_banned(&peer) {
            return Err(ConnectionError::Banned);
        }
        let state = table.get(&peer).map(|e| e.connection);
        match state {
            Some(ConnectionState::Connected) => return Err(ConnectionError::AlreadyConnected),
            Some(ConnectionState::Connecting) => {}
            _ => {
                let active =
                    table.count_in(ConnectionState::Connecting) + table.count_in(ConnectionState::Connected);
                if active >= self.max_peers {
                    debug!(%peer, active, "connection: refusing, at capacity");
                    return Err(ConnectionError::PeerLimitReached { max: self.max_peers });
                }
            }
        }

        let entry = table.entry_mut(peer);
        entry.connection = ConnectionState::Connected;
        entry.direction = Some(direction);
        entry.dial_failures = 0;
        entry.backoff_until = None;
        entry.last_seen = Instant::now();
        if addr.is_some() && entry.addr.is_none() {
            entry.addr = addr;
        }
        let connected = table.count_in(ConnectionState::Connected);
        info!(%peer, ?direction, connected, "connection: peer connected");
        Ok(())
    }

    /// An outbound dial failed before establishment.
    pub fn dial_failed(&self, peer: &PeerId) {
        let mut table = self.table.lock();
        let Some(entry) = table.peers.get_mut(peer) else { return };
        if entry.connection != ConnectionState::Connecting {
            return;
        }
        entry.dial_failures = entry.dial_failures.saturating_add(1);
        let backoff = self.backoff_for(entry.dial_failures);
        entry.connection = ConnectionState::Disconnected;
        entry.backoff_until = Some(Instant::now() + backoff);
        debug!(%peer, failures = entry.dial_failures, ?backoff, "connection: dial failed");
        if entry.record.is_none() {
            table.remove(peer);
        }
    }

    /// The last connection to `peer` closed.
    ///
    /// Entries without a record are forgotten; the rest become
    /// `Disconnected` with a backoff before they can be dialed again.
    pub fn disconnected(&self, peer: &PeerId) {
        let mut table = self.table.lock();
        let Some(entry) = table.peers.get_mut(peer) else { return };
        if !entry.connection.is_active() {
            return;
        }
        let backoff = self.backoff_for(entry.dial_failures);
        entry.connection = ConnectionState::Disconnected;
        entry.direction = None;
        entry.backoff_until = Some(Instant::now() + backoff);
        let keep = entry.record.is_some();
        if !keep {
            table.remove(peer);
            table.scores.forget_if_neutral(peer);
        }
        let connected = table.count_in(ConnectionState::Connected);
        info!(%peer, connected, "connection: peer disconnected");
    }

    pub fn peer_count(&self) -> usize {
        self.table.lock().count_in(ConnectionState::Connected)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let table = self.table.lock();
        table
            .peers
            .values()
            .filter(|e| e.connection == ConnectionState::Connected)
            .map(|e| e.peer_id)
            .collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.table.lock().get(peer).is_some_and(|e| e.connection == ConnectionState::Connected)
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.table.lock().scores.is_banned(peer)
    }

    /// Apply a penalty. `true` if the peer is now banned.
    pub fn penalize(&self, peer: &PeerId, penalty: i64) -> bool {
        self.table.lock().scores.penalize(peer, penalty)
    }

    pub fn score(&self, peer: &PeerId) -> i64 {
        self.table.lock().scores.score(peer)
    }

    pub fn reward(&self, peer: &PeerId, bonus: i64) {
        self.table.lock().scores.reward(peer, bonus);
    }

    pub fn unban_expired(&self) -> Vec<PeerId> {
        self.table.lock().scores.unban_expired()
    }

    /// Forget scores idle for `idle`, keeping connecting and connected peers.
    pub fn prune_scores(&self, idle: Duration) -> usize {
        let mut table = self.table.lock();
        let active: HashSet<PeerId> =
            table.peers.values().filter(|e| e.connection.is_active()).map(|e| e.peer_id).collect();
        table.scores.prune_idle(idle, |p| active.contains(p))
    }

    /// Dial address known for `peer`, if any.
    pub fn addr_of(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.table.lock().get(peer).and_then(|e| e.addr.clone())
    }
}
