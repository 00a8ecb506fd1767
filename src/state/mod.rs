//! Shared server state: the switchboard.
//!
//! The [`Switchboard`] ties together the user registry, the channel graph,
//! the routing caches, and the control queue. It is the single point the
//! datapath thread and the control tasks meet.
//!
//! # Lock order (deadlock prevention)
//!
//! 1. `world` reader/writer lock (registry + channel graph)
//! 2. `caches` mutex
//!
//! Never acquire them in reverse order, and never hold either across an
//! `.await`. The datapath thread holds the shared `world` lock for the
//! duration of one datagram; the only write it ever takes is the host→peer
//! migration, and every path that drops the shared lock to take the
//! exclusive one re-verifies the session still exists afterwards.

mod acl;
mod cache;
mod channel;
mod registry;
mod target;
mod user;

pub use acl::{AclEvaluator, AclRule, AclSubject, Permissions, RuleSet, RuleSubject};
pub use cache::{ResolvedTarget, RouteCaches};
pub use channel::{Channel, ChannelGraph, ChannelId, RemovedSubtree, ROOT_CHANNEL};
pub use registry::UserRegistry;
pub use target::resolve as resolve_whisper_target;
pub use user::{ChannelSpec, ServerUser, SessionId, WhisperTarget, MAX_WHISPER_SLOT};

use crate::config::LimitsConfig;
use crate::control::ControlEvent;
use crate::error::StateError;
use crate::network::frame::ControlFrame;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Everything the datapath reads under one lock: the user indices and the
/// channel graph they route through.
pub struct World {
    pub users: UserRegistry,
    pub channels: ChannelGraph,
}

impl World {
    pub fn new(capacity: u32) -> Self {
        Self {
            users: UserRegistry::new(capacity),
            channels: ChannelGraph::new(),
        }
    }
}

/// Central shared state.
pub struct Switchboard {
    pub world: RwLock<World>,
    pub caches: Mutex<RouteCaches>,
    pub acl: Arc<dyn AclEvaluator>,
    /// Writer handles for the per-connection control channels.
    pub senders: DashMap<SessionId, mpsc::Sender<ControlFrame>>,
    /// Datapath → control queue.
    control_tx: mpsc::Sender<ControlEvent>,
    pub limits: LimitsConfig,
    running: AtomicBool,
}

impl Switchboard {
    pub fn new(
        limits: LimitsConfig,
        acl: Arc<dyn AclEvaluator>,
        control_tx: mpsc::Sender<ControlEvent>,
    ) -> Self {
        Self {
            world: RwLock::new(World::new(limits.max_users)),
            caches: Mutex::new(RouteCaches::new()),
            acl,
            senders: DashMap::new(),
            control_tx,
            limits,
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip the running flag; the datapath exits within one poll tick and
    /// the accept loop refuses new work.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Enqueue an event for the control side without ever blocking the
    /// datapath. Overflow drops the event: a dropped resync re-arms on the
    /// next failed datagram, a dropped tunneled frame is lost voice.
    pub fn push_control(&self, event: ControlEvent) {
        if let Err(err) = self.control_tx.try_send(event) {
            debug!(error = %err, "control queue full, event dropped");
        }
    }

    pub fn get_user(&self, session: SessionId) -> Option<Arc<ServerUser>> {
        self.world.read().unwrap().users.get(session).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.world.read().unwrap().users.user_count()
    }

    /// Admit a connection from `host`: allocate a session id and register
    /// the user. The user is not yet authenticated and belongs to no
    /// channel.
    pub fn connect(&self, host: std::net::IpAddr) -> Result<Arc<ServerUser>, StateError> {
        let mut world = self.world.write().unwrap();
        if world.users.user_count() >= self.limits.max_users as usize {
            return Err(StateError::ServerFull);
        }
        world.users.allocate(host).ok_or(StateError::ServerFull)
    }

    /// Complete login: name the user, mark it authenticated, and place it
    /// in the root channel.
    pub fn authenticate(&self, session: SessionId, name: &str) -> Result<(), StateError> {
        {
            let mut world = self.world.write().unwrap();
            let user = world
                .users
                .get(session)
                .ok_or(StateError::NoSuchSession(session))?
                .clone();
            user.set_name(name);
            user.set_authenticated();
            user.set_channel(ROOT_CHANNEL);
            world.channels.add_member(ROOT_CHANNEL, session);
            info!(session, name, "user authenticated");
        }
        self.caches.lock().unwrap().clear_targets();
        self.refresh_suppression(session);
        Ok(())
    }

    /// Tear down a session everywhere. Idempotent; safe to call from the
    /// connection task, the idle sweep, and shutdown alike.
    pub fn disconnect(&self, session: SessionId) -> Option<Arc<ServerUser>> {
        let user = {
            let mut world = self.world.write().unwrap();
            let user = world.users.remove(session)?;
            let channel = user.channel();
            world.channels.remove_member(channel, session);
            user
        };
        {
            let mut caches = self.caches.lock().unwrap();
            caches.invalidate_user(session);
            caches.clear_targets();
        }
        self.senders.remove(&session);
        info!(session, name = %user.name(), "user disconnected");
        Some(user)
    }

    /// Move a user between channels, with the entry side effects: caches
    /// scoped to the user drop, every resolved target drops, and the
    /// suppression flag is recomputed from Speak permission.
    pub fn enter_channel(&self, session: SessionId, channel: ChannelId) -> Result<(), StateError> {
        {
            let mut world = self.world.write().unwrap();
            if !world.channels.contains(channel) {
                return Err(StateError::NoSuchChannel(channel));
            }
            let user = world
                .users
                .get(session)
                .ok_or(StateError::NoSuchSession(session))?
                .clone();
            let previous = user.channel();
            world.channels.remove_member(previous, session);
            world.channels.add_member(channel, session);
            user.set_channel(channel);
            debug!(session, from = previous, to = channel, "channel change");
        }
        {
            let mut caches = self.caches.lock().unwrap();
            caches.invalidate_user(session);
            caches.clear_targets();
        }
        self.refresh_suppression(session);
        Ok(())
    }

    pub fn create_channel(&self, parent: ChannelId, name: &str) -> Result<ChannelId, StateError> {
        let id = self.world.write().unwrap().channels.create(parent, name)?;
        info!(channel = id, parent, name, "channel created");
        Ok(id)
    }

    /// Remove a channel subtree, relocating its members to the parent.
    pub fn remove_channel(&self, channel: ChannelId) -> Result<(), StateError> {
        let (removed, displaced) = {
            let mut world = self.world.write().unwrap();
            let gone = world.channels.remove(channel)?;
            for &session in &gone.displaced {
                world.channels.add_member(gone.destination, session);
                if let Some(user) = world.users.get(session) {
                    user.set_channel(gone.destination);
                }
            }
            (gone.removed, gone.displaced)
        };
        self.caches.lock().unwrap().invalidate_channels(&removed);
        for session in &displaced {
            self.caches.lock().unwrap().invalidate_user(*session);
            self.refresh_suppression(*session);
        }
        info!(channel, removed = removed.len(), "channel removed");
        Ok(())
    }

    pub fn link_channels(&self, a: ChannelId, b: ChannelId) -> Result<(), StateError> {
        self.world.write().unwrap().channels.link(a, b)?;
        self.caches.lock().unwrap().invalidate_channels(&[a, b]);
        Ok(())
    }

    pub fn unlink_channels(&self, a: ChannelId, b: ChannelId) -> Result<(), StateError> {
        self.world.write().unwrap().channels.unlink(a, b)?;
        self.caches.lock().unwrap().invalidate_channels(&[a, b]);
        Ok(())
    }

    pub fn move_channel(&self, channel: ChannelId, parent: ChannelId) -> Result<(), StateError> {
        let touched = {
            let mut world = self.world.write().unwrap();
            world.channels.set_parent(channel, parent)?;
            let mut touched: Vec<ChannelId> =
                world.channels.all_children(channel).into_iter().collect();
            touched.push(channel);
            touched
        };
        self.caches.lock().unwrap().invalidate_channels(&touched);
        Ok(())
    }

    /// Register or replace a whisper target slot.
    pub fn set_whisper_target(
        &self,
        session: SessionId,
        slot: u8,
        target: WhisperTarget,
    ) -> Result<(), StateError> {
        if slot == 0 || slot > MAX_WHISPER_SLOT {
            return Err(StateError::BadWhisperSlot(slot));
        }
        let user = self
            .get_user(session)
            .ok_or(StateError::NoSuchSession(session))?;
        user.set_whisper_target(slot, target);
        self.caches.lock().unwrap().invalidate_user_targets(session);
        Ok(())
    }

    pub fn clear_whisper_target(&self, session: SessionId, slot: u8) -> Result<(), StateError> {
        let user = self
            .get_user(session)
            .ok_or(StateError::NoSuchSession(session))?;
        user.clear_whisper_target(slot);
        self.caches.lock().unwrap().invalidate_user_targets(session);
        Ok(())
    }

    /// The user's durable identity changed (login to an account, group
    /// edit): recompute everything derived from it.
    pub fn registration_changed(&self, session: SessionId, registered_id: i64) {
        if let Some(user) = self.get_user(session) {
            user.set_registered_id(registered_id);
        }
        self.caches.lock().unwrap().invalidate_user(session);
    }

    /// Structural ACL change: every cached decision is suspect.
    pub fn acl_changed(&self) {
        self.caches.lock().unwrap().clear_all();
        let world = self.world.read().unwrap();
        let sessions: Vec<SessionId> = world.users.sessions().map(|u| u.session).collect();
        drop(world);
        for session in sessions {
            self.refresh_suppression(session);
        }
    }

    /// Recompute the suppression flag from Speak permission on the user's
    /// channel: an unmuted user who may not speak is suppressed, one who
    /// regained the right is unsuppressed.
    fn refresh_suppression(&self, session: SessionId) {
        let world = self.world.read().unwrap();
        let Some(user) = world.users.get(session) else {
            return;
        };
        let user = user.clone();
        let may_speak = self.caches.lock().unwrap().has_permission(
            self.acl.as_ref(),
            &world.channels,
            &user,
            user.channel(),
            Permissions::SPEAK,
        );
        if !user.is_muted() && user.is_suppressed() == may_speak {
            user.set_suppressed(!may_speak);
            debug!(session, suppressed = !may_speak, "suppression recomputed");
        }
    }

    /// Sessions idle on both transports longer than the configured timeout.
    pub fn idle_sessions(&self) -> Vec<SessionId> {
        let cutoff = i64::from(self.limits.timeout) * 1000;
        let world = self.world.read().unwrap();
        world
            .users
            .sessions()
            .filter(|user| user.idle_millis() > cutoff)
            .map(|user| user.session)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn board() -> Switchboard {
        let (tx, _rx) = mpsc::channel(16);
        Switchboard::new(
            LimitsConfig {
                bandwidth: 72_000,
                timeout: 30,
                max_users: 3,
            },
            Arc::new(RuleSet::new()),
            tx,
        )
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn connect_authenticate_disconnect_lifecycle() {
        let board = board();
        let user = board.connect(localhost()).unwrap();
        assert!(!user.is_authenticated());
        board.authenticate(user.session, "alice").unwrap();
        assert!(user.is_authenticated());
        {
            let world = board.world.read().unwrap();
            assert!(world
                .channels
                .get(ROOT_CHANNEL)
                .unwrap()
                .members
                .contains(&user.session));
            world.users.assert_invariants();
        }

        assert!(board.disconnect(user.session).is_some());
        assert!(board.disconnect(user.session).is_none());
        let world = board.world.read().unwrap();
        assert!(!world
            .channels
            .get(ROOT_CHANNEL)
            .unwrap()
            .members
            .contains(&user.session));
        world.users.assert_invariants();
    }

    #[test]
    fn capacity_is_enforced() {
        let board = board();
        for _ in 0..3 {
            board.connect(localhost()).unwrap();
        }
        assert!(matches!(
            board.connect(localhost()),
            Err(StateError::ServerFull)
        ));
    }

    #[test]
    fn disconnect_purges_cache_entries() {
        let board = board();
        let user = board.connect(localhost()).unwrap();
        board.authenticate(user.session, "a").unwrap();
        // Suppression recompute seeded a permission entry.
        assert!(board.caches.lock().unwrap().entries_for(user.session) > 0);
        board.disconnect(user.session);
        assert_eq!(board.caches.lock().unwrap().entries_for(user.session), 0);
    }

    #[test]
    fn channel_move_updates_membership() {
        let board = board();
        let user = board.connect(localhost()).unwrap();
        board.authenticate(user.session, "a").unwrap();
        let c = board.create_channel(ROOT_CHANNEL, "den").unwrap();
        board.enter_channel(user.session, c).unwrap();
        let world = board.world.read().unwrap();
        assert!(world.channels.get(c).unwrap().members.contains(&user.session));
        assert!(!world
            .channels
            .get(ROOT_CHANNEL)
            .unwrap()
            .members
            .contains(&user.session));
        assert_eq!(user.channel(), c);
    }

    #[test]
    fn channel_removal_relocates_members() {
        let board = board();
        let user = board.connect(localhost()).unwrap();
        board.authenticate(user.session, "a").unwrap();
        let c = board.create_channel(ROOT_CHANNEL, "den").unwrap();
        let sub = board.create_channel(c, "nested").unwrap();
        board.enter_channel(user.session, sub).unwrap();

        board.remove_channel(c).unwrap();
        assert_eq!(user.channel(), ROOT_CHANNEL);
        let world = board.world.read().unwrap();
        assert!(!world.channels.contains(c));
        assert!(!world.channels.contains(sub));
        assert!(world
            .channels
            .get(ROOT_CHANNEL)
            .unwrap()
            .members
            .contains(&user.session));
    }

    #[test]
    fn suppression_follows_speak_permission() {
        let (tx, _rx) = mpsc::channel(16);
        let acl = Arc::new(RuleSet::new());
        let board = Switchboard::new(
            LimitsConfig {
                bandwidth: 72_000,
                timeout: 30,
                max_users: 3,
            },
            acl.clone(),
            tx,
        );
        let user = board.connect(localhost()).unwrap();
        board.authenticate(user.session, "a").unwrap();
        let gagged = board.create_channel(ROOT_CHANNEL, "gagged").unwrap();
        acl.set_rules(
            gagged,
            vec![AclRule {
                subject: RuleSubject::All,
                apply_here: true,
                apply_subs: false,
                grant: Permissions::NONE,
                deny: Permissions::SPEAK,
            }],
        );

        board.enter_channel(user.session, gagged).unwrap();
        assert!(user.is_suppressed());
        board.enter_channel(user.session, ROOT_CHANNEL).unwrap();
        assert!(!user.is_suppressed());
    }

    #[test]
    fn whisper_slot_bounds_are_checked() {
        let board = board();
        let user = board.connect(localhost()).unwrap();
        assert_eq!(
            board.set_whisper_target(user.session, 0, WhisperTarget::default()),
            Err(StateError::BadWhisperSlot(0))
        );
        assert_eq!(
            board.set_whisper_target(user.session, 31, WhisperTarget::default()),
            Err(StateError::BadWhisperSlot(31))
        );
        assert!(board
            .set_whisper_target(user.session, 30, WhisperTarget::default())
            .is_ok());
    }
}
