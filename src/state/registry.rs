//! The user registry: three mutually consistent indices over connected
//! users, plus the recycled session-id pool.
//!
//! The whole registry lives under one reader/writer lock (see
//! [`crate::state::Switchboard`]). The UDP thread reads all three indices
//! under the shared lock; every mutation happens under the exclusive lock.

use crate::state::{ServerUser, SessionId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub struct UserRegistry {
    by_session: HashMap<SessionId, Arc<ServerUser>>,
    /// Sessions by connection host. A user stays in this index for its whole
    /// lifetime so a repeated UDP port change can be re-learned by probing.
    by_host: HashMap<IpAddr, HashSet<SessionId>>,
    /// Sessions by learned UDP source address.
    by_peer: HashMap<SocketAddr, SessionId>,
    /// Session ids not currently assigned.
    pool: VecDeque<SessionId>,
}

impl UserRegistry {
    /// A registry handing out session ids `1..=capacity`.
    pub fn new(capacity: u32) -> Self {
        Self {
            by_session: HashMap::new(),
            by_host: HashMap::new(),
            by_peer: HashMap::new(),
            pool: (1..=capacity).collect(),
        }
    }

    pub fn user_count(&self) -> usize {
        self.by_session.len()
    }

    /// No session ids left to hand out.
    pub fn is_full(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn get(&self, session: SessionId) -> Option<&Arc<ServerUser>> {
        self.by_session.get(&session)
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.by_session.contains_key(&session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<ServerUser>> {
        self.by_session.values()
    }

    /// Exact-match lookup by UDP source address.
    pub fn by_peer(&self, addr: SocketAddr) -> Option<&Arc<ServerUser>> {
        self.by_peer
            .get(&addr)
            .and_then(|session| self.by_session.get(session))
    }

    /// All users connected from `host`, for the probe-by-host decrypt path.
    pub fn host_candidates(&self, host: IpAddr) -> Vec<Arc<ServerUser>> {
        self.by_host
            .get(&host)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter_map(|s| self.by_session.get(s).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Admit a new connection from `host`, assigning it a session id from
    /// the pool. `None` when the pool is exhausted.
    pub fn allocate(&mut self, host: IpAddr) -> Option<Arc<ServerUser>> {
        let session = self.pool.pop_front()?;
        let user = Arc::new(ServerUser::new(session, host));
        self.by_session.insert(session, Arc::clone(&user));
        self.by_host.entry(host).or_default().insert(session);
        Some(user)
    }

    /// Drop a session from every index and recycle its id. Idempotent: a
    /// second removal of the same session is a no-op returning `None`.
    pub fn remove(&mut self, session: SessionId) -> Option<Arc<ServerUser>> {
        let user = self.by_session.remove(&session)?;
        if let Some(peers) = self.by_host.get_mut(&user.host) {
            peers.remove(&session);
            if peers.is_empty() {
                self.by_host.remove(&user.host);
            }
        }
        if let Some(addr) = user.udp_addr() {
            if self.by_peer.get(&addr) == Some(&session) {
                self.by_peer.remove(&addr);
            }
        }
        self.pool.push_back(session);
        Some(user)
    }

    /// Bind `session` to the UDP source address `addr`, replacing any
    /// previous binding of either side. Requires the exclusive lock; the
    /// caller has re-verified the session is still present.
    pub fn claim_peer(&mut self, session: SessionId, addr: SocketAddr) -> bool {
        let Some(user) = self.by_session.get(&session) else {
            return false;
        };
        let user = Arc::clone(user);
        if let Some(old) = user.udp_addr() {
            if self.by_peer.get(&old) == Some(&session) {
                self.by_peer.remove(&old);
            }
        }
        if let Some(displaced) = self.by_peer.insert(addr, session) {
            if displaced != session {
                // The address moved between sessions; the old owner's UDP
                // path is no longer trustworthy.
                if let Some(previous) = self.by_session.get(&displaced) {
                    previous.set_udp_addr(None);
                    previous.set_prefers_udp(false);
                }
            }
        }
        user.set_udp_addr(Some(addr));
        true
    }

    /// Panic unless every cross-index invariant holds. Exercised by tests
    /// after every mutation scenario.
    pub fn assert_invariants(&self) {
        for (addr, session) in &self.by_peer {
            let user = self
                .by_session
                .get(session)
                .expect("by_peer entry without live session");
            assert_eq!(user.udp_addr(), Some(*addr), "stale peer binding");
        }
        for (host, sessions) in &self.by_host {
            assert!(!sessions.is_empty(), "empty host bucket left behind");
            for session in sessions {
                let user = self
                    .by_session
                    .get(session)
                    .expect("by_host entry without live session");
                assert_eq!(user.host, *host, "user indexed under the wrong host");
            }
        }
        let mut peers_seen = HashSet::new();
        for session in self.by_peer.values() {
            assert!(peers_seen.insert(*session), "session owns two peer keys");
        }
        for session in self.by_session.keys() {
            assert!(
                !self.pool.contains(session),
                "session {session} is both live and pooled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn peer(n: u8, port: u16) -> SocketAddr {
        SocketAddr::new(host(n), port)
    }

    #[test]
    fn allocation_draws_from_the_pool_in_order() {
        let mut reg = UserRegistry::new(2);
        let a = reg.allocate(host(1)).unwrap();
        let b = reg.allocate(host(1)).unwrap();
        assert_eq!((a.session, b.session), (1, 2));
        assert!(reg.is_full());
        assert!(reg.allocate(host(2)).is_none());
        reg.assert_invariants();
    }

    #[test]
    fn removal_recycles_the_session_id() {
        let mut reg = UserRegistry::new(2);
        let a = reg.allocate(host(1)).unwrap();
        assert!(reg.remove(a.session).is_some());
        // Idempotent.
        assert!(reg.remove(a.session).is_none());
        reg.assert_invariants();

        let b = reg.allocate(host(1)).unwrap();
        let c = reg.allocate(host(1)).unwrap();
        // Id 1 went to the back of the queue.
        assert_eq!((b.session, c.session), (2, 1));
        reg.assert_invariants();
    }

    #[test]
    fn claim_peer_binds_and_rebinds() {
        let mut reg = UserRegistry::new(4);
        let a = reg.allocate(host(1)).unwrap();
        assert!(reg.claim_peer(a.session, peer(1, 100)));
        assert_eq!(reg.by_peer(peer(1, 100)).unwrap().session, a.session);
        reg.assert_invariants();

        // Port change: the old binding disappears.
        assert!(reg.claim_peer(a.session, peer(1, 200)));
        assert!(reg.by_peer(peer(1, 100)).is_none());
        assert_eq!(reg.by_peer(peer(1, 200)).unwrap().session, a.session);
        reg.assert_invariants();

        // Still probeable by host after claiming a peer address.
        assert_eq!(reg.host_candidates(host(1)).len(), 1);
    }

    #[test]
    fn claim_peer_displaces_a_stale_owner() {
        let mut reg = UserRegistry::new(4);
        let a = reg.allocate(host(1)).unwrap();
        let b = reg.allocate(host(1)).unwrap();
        assert!(reg.claim_peer(a.session, peer(1, 100)));
        assert!(reg.claim_peer(b.session, peer(1, 100)));
        assert_eq!(reg.by_peer(peer(1, 100)).unwrap().session, b.session);
        assert_eq!(a.udp_addr(), None);
        reg.assert_invariants();
    }

    #[test]
    fn claim_peer_refuses_dead_sessions() {
        let mut reg = UserRegistry::new(4);
        let a = reg.allocate(host(1)).unwrap();
        reg.remove(a.session);
        assert!(!reg.claim_peer(a.session, peer(1, 100)));
        reg.assert_invariants();
    }

    #[test]
    fn removal_clears_peer_and_host_indices() {
        let mut reg = UserRegistry::new(4);
        let a = reg.allocate(host(1)).unwrap();
        reg.claim_peer(a.session, peer(1, 100));
        reg.remove(a.session);
        assert!(reg.by_peer(peer(1, 100)).is_none());
        assert!(reg.host_candidates(host(1)).is_empty());
        reg.assert_invariants();
    }
}
