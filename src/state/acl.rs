//! Channel permissions: the bitset, the evaluator seam, and the cache.
//!
//! The datapath never walks ACL rules per packet. It asks [`RouteCaches`]
//! (held under its own mutex, always acquired inside a registry read lock)
//! and only on a miss does the [`AclEvaluator`] walk the channel chain.
//!
//! The evaluator is a seam: rule storage and policy live outside the core.
//! [`RuleSet`] is the in-tree evaluator used by the server and its tests.

use crate::state::{ChannelGraph, ChannelId, ServerUser, SessionId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::RwLock;

/// A set of channel permissions.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    /// Pass through the channel without entering.
    pub const TRAVERSE: Permissions = Permissions(1 << 0);
    /// Join the channel.
    pub const ENTER: Permissions = Permissions(1 << 1);
    /// Normal speech into the channel, including across links.
    pub const SPEAK: Permissions = Permissions(1 << 2);
    /// Whisper into the channel without being a member.
    pub const WHISPER: Permissions = Permissions(1 << 3);
    /// Mute or deafen others.
    pub const MUTE_DEAFEN: Permissions = Permissions(1 << 4);
    /// Move users between channels.
    pub const MOVE: Permissions = Permissions(1 << 5);
    /// Create sub-channels.
    pub const MAKE_CHANNEL: Permissions = Permissions(1 << 6);
    /// Link or unlink the channel.
    pub const LINK: Permissions = Permissions(1 << 7);

    /// What an unconfigured server grants everyone.
    pub const DEFAULT: Permissions =
        Permissions(Self::TRAVERSE.0 | Self::ENTER.0 | Self::SPEAK.0 | Self::WHISPER.0);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(self, other: Permissions) -> Permissions {
        Permissions(self.0 & !other.0)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;
    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Permissions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({:#010b})", self.0)
    }
}

/// The identity facts an ACL decision may depend on.
#[derive(Debug, Clone, Copy)]
pub struct AclSubject {
    pub session: SessionId,
    /// Durable account id; negative while anonymous.
    pub registered_id: i64,
}

impl AclSubject {
    pub fn of(user: &ServerUser) -> Self {
        Self {
            session: user.session,
            registered_id: user.registered_id(),
        }
    }
}

/// Policy seam: computes effective permissions and group membership.
pub trait AclEvaluator: Send + Sync {
    /// Effective permissions of `who` on `channel`, walking whatever rules
    /// apply along the channel chain.
    fn permissions(&self, who: &AclSubject, channel: ChannelId, graph: &ChannelGraph)
        -> Permissions;

    /// Whether `who` is a member of `group` as evaluated at `channel`.
    fn is_member(
        &self,
        group: &str,
        who: &AclSubject,
        channel: ChannelId,
        graph: &ChannelGraph,
    ) -> bool;
}

/// Whom an ACL rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSubject {
    /// Everybody.
    All,
    /// One live session.
    Session(SessionId),
    /// One registered account.
    Account(i64),
    /// Members of a named group.
    Group(String),
}

/// One grant/deny rule attached to a channel.
#[derive(Debug, Clone)]
pub struct AclRule {
    pub subject: RuleSubject,
    /// Rule applies on the channel it is attached to.
    pub apply_here: bool,
    /// Rule applies on the channel's descendants.
    pub apply_subs: bool,
    pub grant: Permissions,
    pub deny: Permissions,
}

/// In-memory rule evaluator.
///
/// Rules are evaluated along the chain from the root to the target channel;
/// deeper rules override shallower ones, denies within one rule win over its
/// grants. Groups are per-channel member sets of registered accounts,
/// inherited by descendants.
pub struct RuleSet {
    inner: RwLock<RuleSetInner>,
}

#[derive(Default)]
struct RuleSetInner {
    rules: HashMap<ChannelId, Vec<AclRule>>,
    groups: HashMap<ChannelId, HashMap<String, HashSet<i64>>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RuleSetInner::default()),
        }
    }

    /// Replace the rules attached to one channel.
    ///
    /// Callers must invalidate the permission caches afterwards; the rule
    /// set itself has no view of them.
    pub fn set_rules(&self, channel: ChannelId, rules: Vec<AclRule>) {
        self.inner.write().unwrap().rules.insert(channel, rules);
    }

    pub fn clear_rules(&self, channel: ChannelId) {
        self.inner.write().unwrap().rules.remove(&channel);
    }

    /// Replace one group's member accounts at one channel.
    pub fn set_group(&self, channel: ChannelId, group: &str, members: HashSet<i64>) {
        self.inner
            .write()
            .unwrap()
            .groups
            .entry(channel)
            .or_default()
            .insert(group.to_owned(), members);
    }

    fn rule_applies(rule: &AclRule, who: &AclSubject, inner: &RuleSetInner, at: ChannelId) -> bool {
        match &rule.subject {
            RuleSubject::All => true,
            RuleSubject::Session(s) => *s == who.session,
            RuleSubject::Account(a) => who.registered_id >= 0 && *a == who.registered_id,
            RuleSubject::Group(g) => inner
                .groups
                .get(&at)
                .and_then(|groups| groups.get(g))
                .is_some_and(|members| members.contains(&who.registered_id)),
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AclEvaluator for RuleSet {
    fn permissions(
        &self,
        who: &AclSubject,
        channel: ChannelId,
        graph: &ChannelGraph,
    ) -> Permissions {
        let inner = self.inner.read().unwrap();
        let mut effective = Permissions::DEFAULT;
        for ancestor in graph.chain(channel) {
            let Some(rules) = inner.rules.get(&ancestor) else {
                continue;
            };
            let here = ancestor == channel;
            for rule in rules {
                let in_scope = (here && rule.apply_here) || (!here && rule.apply_subs);
                if in_scope && Self::rule_applies(rule, who, &inner, ancestor) {
                    effective |= rule.grant;
                    effective = effective.remove(rule.deny);
                }
            }
        }
        effective
    }

    fn is_member(
        &self,
        group: &str,
        who: &AclSubject,
        channel: ChannelId,
        graph: &ChannelGraph,
    ) -> bool {
        if who.registered_id < 0 {
            return false;
        }
        let inner = self.inner.read().unwrap();
        // A group defined anywhere along the chain covers the channel.
        graph.chain(channel).into_iter().any(|ancestor| {
            inner
                .groups
                .get(&ancestor)
                .and_then(|groups| groups.get(group))
                .is_some_and(|members| members.contains(&who.registered_id))
        })
    }
}
