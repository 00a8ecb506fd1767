//! The voice router: from one authenticated sender's packet to the set of
//! transmissions it becomes.

use crate::error::DropReason;
use crate::state::{
    resolve_whisper_target, Permissions, ServerUser, SessionId, Switchboard, World,
};
use crate::voice::proto::{self, DeliveryClass, VoiceBroadcast};
use crate::voice::transmit::Transmitter;
use std::sync::Arc;
use std::time::Instant;

/// Stateless routing engine; all state lives on the switchboard.
pub struct VoiceRouter {
    board: Arc<Switchboard>,
    transmitter: Transmitter,
}

impl VoiceRouter {
    pub fn new(board: Arc<Switchboard>, transmitter: Transmitter) -> Self {
        Self { board, transmitter }
    }

    /// Route one decrypted voice packet (`[type|target][payload..]`).
    ///
    /// The caller holds the registry read lock and passes it in; routing
    /// never blocks on anything but the cache mutex.
    pub fn route(
        &self,
        world: &World,
        sender: &Arc<ServerUser>,
        packet: &[u8],
    ) -> Result<(), DropReason> {
        if packet.is_empty() {
            return Err(DropReason::Runt);
        }
        if !sender.may_transmit() {
            return Err(DropReason::NotSpeakable);
        }

        // Wire-size accounting happens before the gate so over-limit
        // traffic still counts against its sender.
        let now = Instant::now();
        let on_wire = (packet.len() + proto::WIRE_OVERHEAD) as u32;
        {
            let mut meter = sender.bandwidth.lock().unwrap();
            meter.record(on_wire, now);
            if meter.bytes_per_second(now) > u64::from(self.board.limits.bandwidth) {
                return Err(DropReason::Bandwidth);
            }
        }

        let target = proto::target(packet[0]);
        let mut broadcast = VoiceBroadcast::new(sender.session, target, &packet[1..]);

        match target {
            proto::TARGET_LOOPBACK => {
                broadcast.set_class(DeliveryClass::Loopback);
                self.transmitter.send(sender, &broadcast.full(), false);
                Ok(())
            }
            proto::TARGET_NORMAL => {
                self.route_channel_speech(world, sender, &mut broadcast);
                Ok(())
            }
            slot => self.route_whisper(world, sender, slot, &mut broadcast),
        }
    }

    /// Normal speech: the sender's channel, plus each linked channel where
    /// the sender may speak.
    fn route_channel_speech(
        &self,
        world: &World,
        sender: &ServerUser,
        broadcast: &mut VoiceBroadcast<'_>,
    ) {
        let Some(channel) = world.channels.get(sender.channel()) else {
            return;
        };
        broadcast.set_class(DeliveryClass::Normal);
        for &member in &channel.members {
            self.deliver(world, sender, member, broadcast);
        }

        if channel.links.is_empty() {
            return;
        }
        let mut linked = world.channels.all_links(channel.id);
        linked.remove(&channel.id);

        let mut caches = self.board.caches.lock().unwrap();
        for other in linked {
            if !caches.has_permission(
                self.board.acl.as_ref(),
                &world.channels,
                sender,
                other,
                Permissions::SPEAK,
            ) {
                continue;
            }
            let Some(other) = world.channels.get(other) else {
                continue;
            };
            for &member in &other.members {
                self.deliver(world, sender, member, broadcast);
            }
        }
    }

    /// Whisper: expand the registered target, channel recipients first,
    /// then the direct set under its own delivery class.
    fn route_whisper(
        &self,
        world: &World,
        sender: &Arc<ServerUser>,
        slot: u8,
        broadcast: &mut VoiceBroadcast<'_>,
    ) -> Result<(), DropReason> {
        let resolved = {
            let mut caches = self.board.caches.lock().unwrap();
            resolve_whisper_target(world, &mut caches, self.board.acl.as_ref(), sender, slot)
        }
        .ok_or(DropReason::NoSuchTarget)?;

        if !resolved.channel.is_empty() {
            broadcast.set_class(DeliveryClass::WhisperChannel);
            for &recipient in &resolved.channel {
                self.deliver(world, sender, recipient, broadcast);
            }
        }
        if !resolved.direct.is_empty() {
            broadcast.set_class(DeliveryClass::WhisperDirect);
            for &recipient in &resolved.direct {
                self.deliver(world, sender, recipient, broadcast);
            }
        }
        Ok(())
    }

    /// Emit to one recipient, skipping the sender itself and anyone
    /// deafened, and stripping positional data across context boundaries.
    fn deliver(
        &self,
        world: &World,
        sender: &ServerUser,
        recipient: SessionId,
        broadcast: &mut VoiceBroadcast<'_>,
    ) {
        if recipient == sender.session {
            return;
        }
        let Some(recipient) = world.users.get(recipient) else {
            return;
        };
        if recipient.hears_nothing() {
            return;
        }
        let packet = if broadcast.position_len() > 0 && sender.shares_position_context(recipient) {
            broadcast.full()
        } else {
            broadcast.trimmed()
        };
        self.transmitter.send(recipient, &packet, false);
    }
}
