//! Candidate pairs and the ordered checklist (RFC 8445 section 6.1.2)

use std::cmp::Reverse;
use std::net::SocketAddr;

use crate::candidate::IceCandidate;
use crate::config::IceRole;

/// Candidate pair state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    /// Waiting for its turn in the checklist
    Waiting,
    /// Check transaction outstanding
    InProgress,
    /// Check succeeded, the pair is valid
    Succeeded,
    /// Check exhausted its retransmissions
    Failed,
}

/// Pair priority: 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0), where G is the
/// controlling agent's candidate priority
pub fn pair_priority(local: u32, remote: u32, role: IceRole) -> u64 {
    let (g, d) = match role {
        IceRole::Controlling => (local as u64, remote as u64),
        IceRole::Controlled => (remote as u64, local as u64),
    };
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// Candidate pair for connectivity checks
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: IceCandidate,
    pub remote: IceCandidate,
    pub priority: u64,
    pub state: CandidatePairState,
    /// Nominated by the controlling agent
    pub nominated: bool,
    /// Scheduled ahead of the ordinary checks after an inbound request
    pub triggered: bool,
}

impl CandidatePair {
    pub fn new(local: IceCandidate, remote: IceCandidate, role: IceRole) -> Self {
        let priority = pair_priority(local.priority, remote.priority, role);
        Self {
            local,
            remote,
            priority,
            state: CandidatePairState::Waiting,
            nominated: false,
            triggered: false,
        }
    }

    /// Socket addresses identifying the pair
    pub fn key(&self) -> (SocketAddr, SocketAddr) {
        (self.local.socket_addr(), self.remote.socket_addr())
    }

    fn sort_key(&self) -> (Reverse<u64>, &str, std::net::IpAddr, u16) {
        (
            Reverse(self.priority),
            self.local.foundation.as_str(),
            self.remote.address,
            self.remote.port,
        )
    }
}

impl std::fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) -> {} ({})",
            self.local.socket_addr(),
            self.local.candidate_type,
            self.remote.socket_addr(),
            self.remote.candidate_type
        )
    }
}

/// Ordered set of candidate pairs.
///
/// Ordering is pair priority descending, ties broken by local foundation,
/// remote address and remote port, so the same candidate sets always yield
/// the same order regardless of insertion order.
#[derive(Debug, Clone)]
pub struct Checklist {
    pairs: Vec<CandidatePair>,
    max_pairs: usize,
}

impl Checklist {
    pub fn new(max_pairs: usize) -> Self {
        Self {
            pairs: Vec::new(),
            max_pairs,
        }
    }

    /// Add a pair unless one with the same addresses exists. Returns whether
    /// the pair is in the checklist after pruning.
    pub fn add_pair(&mut self, local: IceCandidate, remote: IceCandidate, role: IceRole) -> bool {
        let pair = CandidatePair::new(local, remote, role);
        let key = pair.key();
        if self.pairs.iter().any(|p| p.key() == key) {
            return false;
        }
        self.pairs.push(pair);
        self.sort_and_prune();
        self.pairs.iter().any(|p| p.key() == key)
    }

    fn sort_and_prune(&mut self) {
        self.pairs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if self.pairs.len() > self.max_pairs {
            // Keep pairs that already have a check outcome
            let mut kept = 0;
            self.pairs.retain(|p| {
                let keep = kept < self.max_pairs || p.state != CandidatePairState::Waiting;
                kept += 1;
                keep
            });
        }
    }

    /// Recompute priorities after a role change
    pub fn set_role(&mut self, role: IceRole) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(pair.local.priority, pair.remote.priority, role);
        }
        self.sort_and_prune();
    }

    /// Next pair to check: triggered pairs first, then the highest priority
    /// waiting pair. The pair is moved to `InProgress`.
    pub fn next_to_check(&mut self) -> Option<CandidatePair> {
        let index = self
            .pairs
            .iter()
            .position(|p| p.triggered && p.state == CandidatePairState::Waiting)
            .or_else(|| {
                self.pairs
                    .iter()
                    .position(|p| p.state == CandidatePairState::Waiting)
            })?;
        let pair = &mut self.pairs[index];
        pair.state = CandidatePairState::InProgress;
        pair.triggered = false;
        Some(pair.clone())
    }

    /// Queue a triggered check for the pair. Failed pairs are retried.
    pub fn trigger(&mut self, key: (SocketAddr, SocketAddr)) {
        if let Some(pair) = self.find_mut(key) {
            if matches!(pair.state, CandidatePairState::Waiting | CandidatePairState::Failed) {
                pair.state = CandidatePairState::Waiting;
                pair.triggered = true;
            }
        }
    }

    pub fn find(&self, key: (SocketAddr, SocketAddr)) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.key() == key)
    }

    pub fn find_mut(&mut self, key: (SocketAddr, SocketAddr)) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.key() == key)
    }

    pub fn set_state(&mut self, key: (SocketAddr, SocketAddr), state: CandidatePairState) {
        if let Some(pair) = self.find_mut(key) {
            pair.state = state;
        }
    }

    /// Drop every pair except the one with `key`
    pub fn retain_key(&mut self, key: (SocketAddr, SocketAddr)) {
        self.pairs.retain(|p| p.key() == key);
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateType;
    use proptest::prelude::*;

    fn host(addr: &str, local_pref: u16) -> IceCandidate {
        IceCandidate::host(addr.parse().unwrap(), 1, local_pref)
    }

    #[test]
    fn pair_priority_formula() {
        // G > D adds one
        let g = 2_130_706_431u32;
        let d = 1_694_498_815u32;
        let controlling = pair_priority(g, d, IceRole::Controlling);
        assert_eq!(controlling, (1u64 << 32) * d as u64 + 2 * g as u64 + 1);

        // Both agents compute the same value for the same pair
        let controlled = pair_priority(d, g, IceRole::Controlled);
        assert_eq!(controlling, controlled);
    }

    #[test]
    fn checklist_is_ordered_by_priority() {
        let mut checklist = Checklist::new(10);
        let local = host("10.0.0.1:5000", 65535);
        let srflx = IceCandidate::server_reflexive(
            "203.0.113.1:6000".parse().unwrap(),
            "10.0.0.9:6000".parse().unwrap(),
            1,
            "stun",
        );
        checklist.add_pair(local.clone(), srflx, IceRole::Controlling);
        checklist.add_pair(local.clone(), host("10.0.0.2:5000", 65535), IceRole::Controlling);

        assert_eq!(checklist.len(), 2);
        assert_eq!(checklist.pairs()[0].remote.candidate_type, CandidateType::Host);
        assert!(!checklist.add_pair(local, host("10.0.0.2:5000", 65535), IceRole::Controlling));
    }

    #[test]
    fn triggered_pairs_jump_the_queue() {
        let mut checklist = Checklist::new(10);
        let local = host("10.0.0.1:5000", 65535);
        checklist.add_pair(local.clone(), host("10.0.0.2:5000", 65535), IceRole::Controlling);
        checklist.add_pair(local.clone(), host("10.0.0.3:5000", 100), IceRole::Controlling);

        let low_key = (local.socket_addr(), "10.0.0.3:5000".parse().unwrap());
        checklist.trigger(low_key);

        let first = checklist.next_to_check().unwrap();
        assert_eq!(first.key(), low_key);
        assert_eq!(checklist.find(low_key).unwrap().state, CandidatePairState::InProgress);

        let second = checklist.next_to_check().unwrap();
        assert_eq!(second.remote.port, 5000);
        assert!(checklist.next_to_check().is_none());
    }

    #[test]
    fn pruning_keeps_highest_priority_pairs() {
        let mut checklist = Checklist::new(2);
        let local = host("10.0.0.1:5000", 65535);
        for (i, pref) in [10u16, 30, 20].iter().enumerate() {
            checklist.add_pair(
                local.clone(),
                host(&format!("10.0.1.{}:5000", i + 1), *pref),
                IceRole::Controlled,
            );
        }
        assert_eq!(checklist.len(), 2);
        let prefs: Vec<u32> = checklist.pairs().iter().map(|p| p.remote.priority).collect();
        assert!(prefs[0] > prefs[1]);
        assert!(checklist
            .pairs()
            .iter()
            .all(|p| p.remote.address.to_string() != "10.0.1.1"));
    }

    proptest! {
        #[test]
        fn order_does_not_depend_on_insertion(
            remotes in proptest::collection::vec((1u8..=254, 1024u16..=2048, 0u16..=3), 1..12),
            seed in any::<u64>(),
        ) {
            let locals = vec![host("10.0.0.1:4000", 65535), host("10.0.0.5:4000", 65000)];
            let mut remotes = remotes;
            remotes.sort_by_key(|(octet, port, _)| (*octet, *port));
            remotes.dedup_by_key(|(octet, port, _)| (*octet, *port));
            let remotes: Vec<IceCandidate> = remotes
                .iter()
                .map(|(octet, port, pref)| host(&format!("192.168.0.{}:{}", octet, port), *pref))
                .collect();

            let mut combos = Vec::new();
            for l in &locals {
                for r in &remotes {
                    combos.push((l.clone(), r.clone()));
                }
            }

            let mut forward = Checklist::new(100);
            for (l, r) in combos.iter().cloned() {
                forward.add_pair(l, r, IceRole::Controlling);
            }

            // Deterministic shuffle driven by the seed
            let mut shuffled = combos.clone();
            let mut state = seed | 1;
            for i in (1..shuffled.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                shuffled.swap(i, (state % (i as u64 + 1)) as usize);
            }
            let mut reordered = Checklist::new(100);
            for (l, r) in shuffled {
                reordered.add_pair(l, r, IceRole::Controlling);
            }

            let a: Vec<_> = forward.pairs().iter().map(|p| p.key()).collect();
            let b: Vec<_> = reordered.pairs().iter().map(|p| p.key()).collect();
            prop_assert_eq!(a, b);
        }
    }
}
