//! Memoization for the per-packet routing decisions.
//!
//! Two maps, one mutex: computed permission bitsets keyed by
//! `(session, channel)` and resolved whisper targets keyed by
//! `(session, slot)`. Keeping them on this component rather than on user or
//! channel objects keeps invalidation explicit and avoids reference cycles.
//!
//! Invalidation scopes:
//! - a user (registration or group change, channel move, disconnect) drops
//!   that user's permissions *and* their resolved targets;
//! - a set of channels (graph or ACL edit) drops permissions naming those
//!   channels and, because resolved targets bake channel closures and other
//!   users' memberships in, every resolved target;
//! - membership churn anywhere drops every resolved target;
//! - a structural ACL change drops everything.

use crate::state::{
    AclEvaluator, AclSubject, ChannelGraph, ChannelId, Permissions, ServerUser, SessionId,
};
use std::collections::HashMap;
use std::sync::Arc;

/// A memoized whisper expansion: who hears the packet and through which
/// delivery class.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Recipients reached through channel expansion.
    pub channel: Vec<SessionId>,
    /// Explicitly listed recipients not already in the channel set.
    pub direct: Vec<SessionId>,
}

#[derive(Default)]
pub struct RouteCaches {
    permissions: HashMap<(SessionId, ChannelId), Permissions>,
    targets: HashMap<(SessionId, u8), Arc<ResolvedTarget>>,
}

impl RouteCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective permissions of `user` on `channel`, computed through the
    /// evaluator on a miss.
    pub fn permissions(
        &mut self,
        acl: &dyn AclEvaluator,
        graph: &ChannelGraph,
        user: &ServerUser,
        channel: ChannelId,
    ) -> Permissions {
        *self
            .permissions
            .entry((user.session, channel))
            .or_insert_with(|| acl.permissions(&AclSubject::of(user), channel, graph))
    }

    pub fn has_permission(
        &mut self,
        acl: &dyn AclEvaluator,
        graph: &ChannelGraph,
        user: &ServerUser,
        channel: ChannelId,
        wanted: Permissions,
    ) -> bool {
        self.permissions(acl, graph, user, channel).contains(wanted)
    }

    pub fn resolved_target(&self, session: SessionId, slot: u8) -> Option<Arc<ResolvedTarget>> {
        self.targets.get(&(session, slot)).cloned()
    }

    pub fn insert_target(
        &mut self,
        session: SessionId,
        slot: u8,
        target: ResolvedTarget,
    ) -> Arc<ResolvedTarget> {
        let target = Arc::new(target);
        self.targets.insert((session, slot), Arc::clone(&target));
        target
    }

    /// Drop everything derived from one user's identity or placement.
    pub fn invalidate_user(&mut self, session: SessionId) {
        self.permissions.retain(|key, _| key.0 != session);
        self.targets.retain(|key, _| key.0 != session);
    }

    /// Drop one user's resolved targets, keeping their permissions.
    pub fn invalidate_user_targets(&mut self, session: SessionId) {
        self.targets.retain(|key, _| key.0 != session);
    }

    /// Drop everything that may reference any of `channels`.
    pub fn invalidate_channels(&mut self, channels: &[ChannelId]) {
        self.permissions.retain(|key, _| !channels.contains(&key.1));
        self.targets.clear();
    }

    /// Membership changed somewhere: every resolved target may be stale.
    pub fn clear_targets(&mut self) {
        self.targets.clear();
    }

    /// Structural ACL change: nothing survives.
    pub fn clear_all(&mut self) {
        self.permissions.clear();
        self.targets.clear();
    }

    /// Cache entries naming `session`, for invariant checks in tests.
    pub fn entries_for(&self, session: SessionId) -> usize {
        self.permissions.keys().filter(|k| k.0 == session).count()
            + self.targets.keys().filter(|k| k.0 == session).count()
    }
}
