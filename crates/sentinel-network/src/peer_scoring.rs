//! Peer scoring and banning.
//!
//! Peers that send undecodable gossip, malformed responses, time out or
//! exceed request rate limits accumulate negative score. At or below
//! [`BAN_THRESHOLD`] a peer is banned for [`BAN_DURATION`]: it is
//! disconnected and neither dialed nor accepted until the ban lapses.
//! Useful behaviour earns positive score, capped at `+100`.

use libp2p::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Penalty for a gossip payload that fails to decode.
pub const PENALTY_INVALID_GOSSIP: i64 = -100;
/// Penalty for a response that fails codec validation.
pub const PENALTY_RPC_DECODE: i64 = -50;
/// Penalty for exceeding a request rate limit.
pub const PENALTY_RATE_LIMITED: i64 = -25;
/// Penalty for a request that timed out.
pub const PENALTY_TIMEOUT: i64 = -10;

/// Score threshold at which a peer is banned.
pub const BAN_THRESHOLD: i64 = -200;

/// How long a ban lasts.
pub const BAN_DURATION: Duration = Duration::from_secs(60 * 60);

/// Unbanned scores untouched for this long are dropped.
pub const SCORE_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Bonus for a gossip message accepted by the engine.
pub const BONUS_VALID_GOSSIP: i64 = 1;
/// Bonus for a well-formed response.
pub const BONUS_VALID_RESPONSE: i64 = 2;

const MAX_SCORE: i64 = 100;

#[derive(Debug, Clone)]
pub struct PeerScore {
    /// Cumulative score (starts at 0, negative is bad).
    pub score: i64,
    /// When the peer was banned, if it currently is.
    pub banned_at: Option<Instant>,
    pub total_penalties: u64,
    pub total_bonuses: u64,
    /// Last penalty or bonus.
    pub last_updated: Instant,
}

impl PeerScore {
    fn new() -> Self {
        Self { score: 0, banned_at: None, total_penalties: 0, total_bonuses: 0, last_updated: Instant::now() }
    }
}

/// Scores for every peer the node has dealt with.
///
/// Lives inside the peer table so that ban checks and connection state
/// changes happen under the same lock.
#[derive(Debug, Default)]
pub struct PeerScoreBoard {
    scores: HashMap<PeerId, PeerScore>,
}

impl PeerScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a penalty. Returns `true` if this call banned the peer.
    pub fn penalize(&mut self, peer: &PeerId, penalty: i64) -> bool {
        let entry = self.scores.entry(*peer).or_insert_with(PeerScore::new);
        if entry.banned_at.is_some() {
            return false;
        }

        entry.score = entry.score.saturating_add(penalty);
        entry.last_updated = Instant::now();
        entry.total_penalties = entry.total_penalties.saturating_add(penalty.unsigned_abs());
        debug!(%peer, score = entry.score, penalty, "peer_score: penalty applied");

        if entry.score <= BAN_THRESHOLD {
            entry.banned_at = Some(Instant::now());
            warn!(%peer, score = entry.score, "peer_score: peer banned");
            return true;
        }
        false
    }

    pub fn reward(&mut self, peer: &PeerId, bonus: i64) {
        let entry = self.scores.entry(*peer).or_insert_with(PeerScore::new);
        entry.score = entry.score.saturating_add(bonus).min(MAX_SCORE);
        entry.last_updated = Instant::now();
        entry.total_bonuses = entry.total_bonuses.saturating_add(bonus.unsigned_abs());
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.scores
            .get(peer)
            .and_then(|ps| ps.banned_at)
            .is_some_and(|at| at.elapsed() < BAN_DURATION)
    }

    pub fn score(&self, peer: &PeerId) -> i64 {
        self.scores.get(peer).map_or(0, |ps| ps.score)
    }

    /// Lift every ban older than [`BAN_DURATION`], resetting the score to 0.
    pub fn unban_expired(&mut self) -> Vec<PeerId> {
        let mut unbanned = Vec::new();
        for (peer, ps) in self.scores.iter_mut() {
            if ps.banned_at.is_some_and(|at| at.elapsed() >= BAN_DURATION) {
                ps.banned_at = None;
                ps.score = 0;
                unbanned.push(*peer);
                info!(%peer, "peer_score: ban expired");
            }
        }
        unbanned
    }

    /// Forget a peer that is neither banned nor penalized.
    pub fn forget_if_neutral(&mut self, peer: &PeerId) {
        if self.scores.get(peer).is_some_and(|ps| ps.banned_at.is_none() && ps.score >= 0) {
            self.scores.remove(peer);
        }
    }

    /// Drop unbanned entries idle for `idle` or longer, except those `keep`
    /// selects. Returns the number dropped.
    pub fn prune_idle(&mut self, idle: Duration, keep: impl Fn(&PeerId) -> bool) -> usize {
        let before = self.scores.len();
        self.scores
            .retain(|peer, ps| ps.banned_at.is_some() || ps.last_updated.elapsed() < idle || keep(peer));
        before - self.scores.len()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn banned_peers(&self) -> Vec<PeerId> {
        self.scores
            .iter()
            .filter(|(_, ps)| ps.banned_at.is_some_and(|t| t.elapsed() < BAN_DURATION))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn peer_info(&self, peer: &PeerId) -> Option<PeerScore> {
        self.scores.get(peer).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peer_starts_at_zero() {
        let board = PeerScoreBoard::new();
        assert_eq!(board.score(&PeerId::random()), 0);
    }

    #[test]
    fn timeout_penalty_does_not_ban() {
        let mut board = PeerScoreBoard::new();
        let peer = PeerId::random();
        assert!(!board.penalize(&peer, PENALTY_TIMEOUT));
        assert_eq!(board.score(&peer), PENALTY_TIMEOUT);
    }

    #[test]
    fn rewards_are_capped() {
        let mut board = PeerScoreBoard::new();
        let peer = PeerId::random();
        for _ in 0..200 {
            board.reward(&peer, BONUS_VALID_RESPONSE);
        }
        assert_eq!(board.score(&peer), MAX_SCORE);
    }

    /// Two invalid gossip payloads reach the threshold exactly.
    #[test]
    fn repeated_invalid_gossip_bans() {
        let mut board = PeerScoreBoard::new();
        let peer = PeerId::random();
        assert!(!board.penalize(&peer, PENALTY_INVALID_GOSSIP));
        assert!(board.penalize(&peer, PENALTY_INVALID_GOSSIP));
        assert!(board.is_banned(&peer));
        assert!(board.banned_peers().contains(&peer));
        // Already banned: further penalties are not counted again.
        assert!(!board.penalize(&peer, PENALTY_INVALID_GOSSIP));
    }

    #[test]
    fn ban_expires_after_duration() {
        let mut board = PeerScoreBoard::new();
        let peer = PeerId::random();
        board.penalize(&peer, BAN_THRESHOLD - 1);
        assert!(board.is_banned(&peer));

        if let Some(ps) = board.scores.get_mut(&peer) {
            ps.banned_at = Some(Instant::now() - BAN_DURATION - Duration::from_secs(1));
        }
        assert!(!board.is_banned(&peer));

        let unbanned = board.unban_expired();
        assert_eq!(unbanned, vec![peer]);
        assert_eq!(board.score(&peer), 0);
    }

    #[test]
    fn idle_scores_pruned_but_bans_and_kept_peers_survive() {
        let mut board = PeerScoreBoard::new();
        let idle = PeerId::random();
        let connected = PeerId::random();
        let banned = PeerId::random();
        let fresh = PeerId::random();
        board.penalize(&idle, PENALTY_TIMEOUT);
        board.penalize(&connected, PENALTY_TIMEOUT);
        board.penalize(&banned, BAN_THRESHOLD);
        board.reward(&fresh, BONUS_VALID_GOSSIP);

        let long_ago = Instant::now() - Duration::from_secs(2);
        for peer in [idle, connected, banned] {
            if let Some(ps) = board.scores.get_mut(&peer) {
                ps.last_updated = long_ago;
            }
        }

        assert_eq!(board.prune_idle(Duration::from_secs(1), |p| *p == connected), 1);
        assert!(board.peer_info(&idle).is_none());
        assert_eq!(board.score(&connected), PENALTY_TIMEOUT);
        assert!(board.is_banned(&banned));
        assert_eq!(board.score(&fresh), BONUS_VALID_GOSSIP);
        assert_eq!(board.len(), 3);
    }

    #[test]
    fn neutral_peers_are_forgotten_penalized_are_kept() {
        let mut board = PeerScoreBoard::new();
        let good = PeerId::random();
        let bad = PeerId::random();
        board.reward(&good, BONUS_VALID_GOSSIP);
        board.penalize(&bad, PENALTY_RATE_LIMITED);
        board.forget_if_neutral(&good);
        board.forget_if_neutral(&bad);
        assert!(board.peer_info(&good).is_none());
        assert_eq!(board.score(&bad), PENALTY_RATE_LIMITED);
    }
}
