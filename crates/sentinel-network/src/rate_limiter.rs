//! Per-peer, per-method sliding-window limits on inbound requests.
//!
//! Each peer has one [`VecDeque`] of request timestamps per RPC method. A
//! check prunes entries older than the 60 second window and compares the
//! remaining count with the method's limit; recording appends `now`.

use libp2p::PeerId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::protocol::RpcMethod;

const WINDOW: Duration = Duration::from_secs(60);

/// Requests allowed per peer per window.
pub fn limit_for(method: RpcMethod) -> usize {
    match method {
        RpcMethod::Status => 5,
        RpcMethod::Goodbye => 5,
        RpcMethod::Ping => 30,
        RpcMethod::MetaData => 30,
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    peers: HashMap<PeerId, HashMap<RpcMethod, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(queue: &mut VecDeque<Instant>, now: Instant) {
        let Some(cutoff) = now.checked_sub(WINDOW) else { return };
        while queue.front().is_some_and(|t| *t <= cutoff) {
            queue.pop_front();
        }
    }

    /// `true` if `peer` may send another `method` request now.
    pub fn check(&mut self, peer: &PeerId, method: RpcMethod) -> bool {
        let queue = self.peers.entry(*peer).or_default().entry(method).or_default();
        Self::prune(queue, Instant::now());
        let limit = limit_for(method);
        let ok = queue.len() < limit;
        if !ok {
            debug!(%peer, method = method.name(), count = queue.len(), limit,
                "rate_limiter: limit exceeded");
        }
        ok
    }

    pub fn record(&mut self, peer: &PeerId, method: RpcMethod) {
        self.peers
            .entry(*peer)
            .or_default()
            .entry(method)
            .or_default()
            .push_back(Instant::now());
    }

    /// Check and, if allowed, record in one step.
    pub fn admit(&mut self, peer: &PeerId, method: RpcMethod) -> bool {
        let ok = self.check(peer, method);
        if ok {
            self.record(peer, method);
        }
        ok
    }

    /// Drop all state for a peer (call on disconnect).
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_limit_passes() {
        let mut rl = RateLimiter::new();
        let peer = PeerId::random();
        for _ in 0..limit_for(RpcMethod::Ping) {
            assert!(rl.admit(&peer, RpcMethod::Ping));
        }
        assert!(!rl.check(&peer, RpcMethod::Ping));
    }

    #[test]
    fn methods_are_limited_independently() {
        let mut rl = RateLimiter::new();
        let peer = PeerId::random();
        for _ in 0..limit_for(RpcMethod::Status) {
            rl.record(&peer, RpcMethod::Status);
        }
        assert!(!rl.check(&peer, RpcMethod::Status));
        assert!(rl.check(&peer, RpcMethod::MetaData));
    }

    #[test]
    fn window_slides() {
        let mut rl = RateLimiter::new();
        let peer = PeerId::random();
        let Some(old) = Instant::now().checked_sub(WINDOW + Duration::from_secs(1)) else {
            return;
        };
        let queue = rl.peers.entry(peer).or_default().entry(RpcMethod::Goodbye).or_default();
        for _ in 0..limit_for(RpcMethod::Goodbye) {
            queue.push_back(old);
        }
        assert!(rl.check(&peer, RpcMethod::Goodbye));
    }

    #[test]
    fn peers_are_isolated_and_removable() {
        let mut rl = RateLimiter::new();
        let a = PeerId::random();
        let b = PeerId::random();
        for _ in 0..limit_for(RpcMethod::Ping) {
            rl.record(&a, RpcMethod::Ping);
        }
        assert!(!rl.check(&a, RpcMethod::Ping));
        assert!(rl.check(&b, RpcMethod::Ping));
        rl.remove_peer(&a);
        assert!(rl.check(&a, RpcMethod::Ping));
    }
}
