//! Whisper target expansion.
//!
//! Given a sender and a whisper slot, compute who hears the packet: the
//! union of the slot's channel expansions (gated by Whisper permission and
//! optional group membership) plus its explicit sessions, deduplicated
//! against the channel set. The result is memoized per `(session, slot)`
//! until membership, permissions, or the graph change.

use crate::state::{
    AclEvaluator, AclSubject, ChannelSpec, Permissions, ResolvedTarget, RouteCaches, ServerUser,
    SessionId, World,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Resolve `sender`'s whisper slot into recipient sets.
///
/// Returns `None` when no target is registered in the slot; the packet is
/// dropped. Caller holds the registry read lock and the cache mutex.
pub fn resolve(
    world: &World,
    caches: &mut RouteCaches,
    acl: &dyn AclEvaluator,
    sender: &ServerUser,
    slot: u8,
) -> Option<Arc<ResolvedTarget>> {
    if let Some(cached) = caches.resolved_target(sender.session, slot) {
        return Some(cached);
    }
    let spec = sender.whisper_target(slot)?;

    let mut channel_set: HashSet<SessionId> = HashSet::new();
    for channel_spec in &spec.channels {
        expand_channel_spec(world, caches, acl, sender, channel_spec, &mut channel_set);
    }

    let mut direct: Vec<SessionId> = spec
        .sessions
        .iter()
        .copied()
        .filter(|s| world.users.contains(*s) && !channel_set.contains(s))
        .collect();
    direct.sort_unstable();
    direct.dedup();

    let mut channel: Vec<SessionId> = channel_set.into_iter().collect();
    channel.sort_unstable();

    Some(caches.insert_target(sender.session, slot, ResolvedTarget { channel, direct }))
}

fn expand_channel_spec(
    world: &World,
    caches: &mut RouteCaches,
    acl: &dyn AclEvaluator,
    sender: &ServerUser,
    spec: &ChannelSpec,
    out: &mut HashSet<SessionId>,
) {
    let Some(base) = world.channels.get(spec.channel) else {
        return;
    };
    let follow_links = spec.links && !base.links.is_empty();
    let follow_children = spec.children && !base.children.is_empty();

    if !follow_links && !follow_children && spec.group.is_none() {
        // Common case: one channel, no closure set to allocate.
        if caches.has_permission(
            acl,
            &world.channels,
            sender,
            spec.channel,
            Permissions::WHISPER,
        ) {
            out.extend(base.members.iter().copied());
        }
        return;
    }

    let mut channels = if follow_links {
        world.channels.all_links(spec.channel)
    } else {
        HashSet::from([spec.channel])
    };
    if follow_children {
        channels.extend(world.channels.all_children(spec.channel));
    }

    for channel_id in channels {
        if !caches.has_permission(acl, &world.channels, sender, channel_id, Permissions::WHISPER) {
            continue;
        }
        let Some(channel) = world.channels.get(channel_id) else {
            continue;
        };
        for &member in &channel.members {
            if let Some(group) = spec.group.as_deref() {
                let Some(user) = world.users.get(member) else {
                    continue;
                };
                if !acl.is_member(group, &AclSubject::of(user), channel_id, &world.channels) {
                    continue;
                }
            }
            out.insert(member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AclRule, ChannelId, RuleSet, RuleSubject, WhisperTarget, ROOT_CHANNEL};
    use std::collections::HashSet as Set;
    use std::net::{IpAddr, Ipv4Addr};

    struct Fixture {
        world: World,
        caches: RouteCaches,
        acl: RuleSet,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                world: World::new(16),
                caches: RouteCaches::new(),
                acl: RuleSet::new(),
            }
        }

        fn join(&mut self, channel: ChannelId) -> Arc<ServerUser> {
            let user = self
                .world
                .users
                .allocate(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .unwrap();
            user.set_authenticated();
            user.set_channel(channel);
            self.world.channels.add_member(channel, user.session);
            user
        }

        fn resolve(&mut self, sender: &ServerUser, slot: u8) -> Option<Arc<ResolvedTarget>> {
            resolve(&self.world, &mut self.caches, &self.acl, sender, slot)
        }
    }

    #[test]
    fn unregistered_slot_resolves_to_none() {
        let mut fx = Fixture::new();
        let a = fx.join(ROOT_CHANNEL);
        assert!(fx.resolve(&a, 9).is_none());
    }

    #[test]
    fn single_channel_expansion_takes_members() {
        let mut fx = Fixture::new();
        let c = fx.world.channels.create(ROOT_CHANNEL, "c").unwrap();
        let a = fx.join(ROOT_CHANNEL);
        let b = fx.join(c);
        let d = fx.join(c);
        a.set_whisper_target(
            5,
            WhisperTarget {
                channels: vec![ChannelSpec {
                    channel: c,
                    links: false,
                    children: false,
                    group: None,
                }],
                sessions: vec![],
            },
        );
        let resolved = fx.resolve(&a, 5).unwrap();
        let set: Set<_> = resolved.channel.iter().copied().collect();
        assert_eq!(set, Set::from([b.session, d.session]));
        assert!(resolved.direct.is_empty());
    }

    #[test]
    fn link_expansion_respects_whisper_permission() {
        let mut fx = Fixture::new();
        let c1 = fx.world.channels.create(ROOT_CHANNEL, "c1").unwrap();
        let c2 = fx.world.channels.create(ROOT_CHANNEL, "c2").unwrap();
        let c3 = fx.world.channels.create(ROOT_CHANNEL, "c3").unwrap();
        fx.world.channels.link(c1, c2).unwrap();
        fx.world.channels.link(c2, c3).unwrap();

        let a = fx.join(c1);
        let b = fx.join(c2);
        let _c = fx.join(c3);
        // Whisper denied on c3, allowed elsewhere.
        fx.acl.set_rules(
            c3,
            vec![AclRule {
                subject: RuleSubject::All,
                apply_here: true,
                apply_subs: false,
                grant: Permissions::NONE,
                deny: Permissions::WHISPER,
            }],
        );
        a.set_whisper_target(
            1,
            WhisperTarget {
                channels: vec![ChannelSpec {
                    channel: c1,
                    links: true,
                    children: false,
                    group: None,
                }],
                sessions: vec![],
            },
        );
        let resolved = fx.resolve(&a, 1).unwrap();
        let set: Set<_> = resolved.channel.iter().copied().collect();
        // a itself is a member of c1, which is part of its own link closure.
        assert_eq!(set, Set::from([a.session, b.session]));
    }

    #[test]
    fn children_expansion_includes_the_base_channel() {
        let mut fx = Fixture::new();
        let top = fx.world.channels.create(ROOT_CHANNEL, "top").unwrap();
        let sub = fx.world.channels.create(top, "sub").unwrap();
        let subsub = fx.world.channels.create(sub, "subsub").unwrap();

        let a = fx.join(ROOT_CHANNEL);
        let b = fx.join(top);
        let c = fx.join(sub);
        let d = fx.join(subsub);
        a.set_whisper_target(
            2,
            WhisperTarget {
                channels: vec![ChannelSpec {
                    channel: top,
                    links: false,
                    children: true,
                    group: None,
                }],
                sessions: vec![],
            },
        );
        let resolved = fx.resolve(&a, 2).unwrap();
        let set: Set<_> = resolved.channel.iter().copied().collect();
        assert_eq!(set, Set::from([b.session, c.session, d.session]));
    }

    #[test]
    fn direct_sessions_dedup_against_channel_set() {
        let mut fx = Fixture::new();
        let c = fx.world.channels.create(ROOT_CHANNEL, "c").unwrap();
        let a = fx.join(ROOT_CHANNEL);
        let b = fx.join(c);
        let outsider = fx.join(ROOT_CHANNEL);
        a.set_whisper_target(
            7,
            WhisperTarget {
                channels: vec![ChannelSpec {
                    channel: c,
                    links: false,
                    children: false,
                    group: None,
                }],
                sessions: vec![b.session, outsider.session, 999],
            },
        );
        let resolved = fx.resolve(&a, 7).unwrap();
        assert_eq!(resolved.channel, vec![b.session]);
        // b moved to the channel set; 999 does not exist.
        assert_eq!(resolved.direct, vec![outsider.session]);
    }

    #[test]
    fn group_filter_restricts_channel_recipients() {
        let mut fx = Fixture::new();
        let c = fx.world.channels.create(ROOT_CHANNEL, "c").unwrap();
        let a = fx.join(ROOT_CHANNEL);
        let b = fx.join(c);
        let d = fx.join(c);
        b.set_registered_id(42);
        d.set_registered_id(43);
        fx.acl.set_group(c, "officers", [42].into());
        a.set_whisper_target(
            3,
            WhisperTarget {
                channels: vec![ChannelSpec {
                    channel: c,
                    links: false,
                    children: false,
                    group: Some("officers".into()),
                }],
                sessions: vec![],
            },
        );
        let resolved = fx.resolve(&a, 3).unwrap();
        assert_eq!(resolved.channel, vec![b.session]);
    }

    #[test]
    fn resolution_is_memoized_until_invalidated() {
        let mut fx = Fixture::new();
        let c = fx.world.channels.create(ROOT_CHANNEL, "c").unwrap();
        let a = fx.join(ROOT_CHANNEL);
        let b = fx.join(c);
        a.set_whisper_target(
            4,
            WhisperTarget {
                channels: vec![ChannelSpec {
                    channel: c,
                    links: false,
                    children: false,
                    group: None,
                }],
                sessions: vec![],
            },
        );
        let first = fx.resolve(&a, 4).unwrap();
        assert_eq!(first.channel, vec![b.session]);

        // Membership changes beneath the cache; the stale entry still serves
        // until invalidated, then the next resolve recomputes.
        let e = fx.join(c);
        let stale = fx.resolve(&a, 4).unwrap();
        assert!(Arc::ptr_eq(&first, &stale));

        fx.caches.clear_targets();
        let fresh = fx.resolve(&a, 4).unwrap();
        let set: Set<_> = fresh.channel.iter().copied().collect();
        assert_eq!(set, Set::from([b.session, e.session]));
    }
}
