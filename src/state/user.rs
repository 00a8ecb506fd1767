//! Per-session user state.

use crate::crypto::CryptState;
use crate::state::ChannelId;
use crate::voice::bandwidth::BandwidthMeter;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

/// Short integer identifying a connected user for the lifetime of one
/// connection; recycled after disconnect.
pub type SessionId = u32;

/// Whisper slots run 1..=30.
pub const MAX_WHISPER_SLOT: u8 = 30;

/// One channel expansion rule inside a whisper target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel: ChannelId,
    /// Expand across link edges.
    pub links: bool,
    /// Expand into transitive children.
    pub children: bool,
    /// Restrict recipients to members of this group, evaluated per channel.
    pub group: Option<String>,
}

/// Declarative recipient set bound to a whisper slot: deliver to the
/// expansion of these channel specs plus these explicit sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhisperTarget {
    pub channels: Vec<ChannelSpec>,
    pub sessions: Vec<SessionId>,
}

/// A connected user.
///
/// The registry lock orders existence and index membership; the fields the
/// datapath reads per packet are atomics or small mutexes so holding the
/// shared lock is enough on the hot path.
pub struct ServerUser {
    pub session: SessionId,
    /// Host the TLS connection arrived from. UDP datagrams from other hosts
    /// are never attributed to this user.
    pub host: IpAddr,
    pub connected_at: DateTime<Utc>,

    name: Mutex<String>,
    /// Durable account id; negative while anonymous.
    registered_id: AtomicI64,
    authenticated: AtomicBool,

    muted: AtomicBool,
    self_muted: AtomicBool,
    deafened: AtomicBool,
    self_deafened: AtomicBool,
    suppressed: AtomicBool,

    /// The client demonstrated a working UDP path recently.
    prefers_udp: AtomicBool,
    channel: AtomicU32,
    udp_addr: Mutex<Option<SocketAddr>>,
    whisper_targets: Mutex<HashMap<u8, WhisperTarget>>,
    /// Opaque client-supplied "same acoustic world" identifier; gates
    /// whether positional audio data is forwarded between two users.
    position_context: Mutex<Option<String>>,

    pub crypt: Mutex<CryptState>,
    pub bandwidth: Mutex<BandwidthMeter>,

    /// Milliseconds since the epoch of the last traffic on either transport.
    last_activity: AtomicI64,
}

impl ServerUser {
    pub fn new(session: SessionId, host: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            session,
            host,
            connected_at: now,
            name: Mutex::new(String::new()),
            registered_id: AtomicI64::new(-1),
            authenticated: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            self_muted: AtomicBool::new(false),
            deafened: AtomicBool::new(false),
            self_deafened: AtomicBool::new(false),
            suppressed: AtomicBool::new(false),
            prefers_udp: AtomicBool::new(false),
            channel: AtomicU32::new(crate::state::ROOT_CHANNEL),
            udp_addr: Mutex::new(None),
            whisper_targets: Mutex::new(HashMap::new()),
            position_context: Mutex::new(None),
            crypt: Mutex::new(CryptState::new()),
            bandwidth: Mutex::new(BandwidthMeter::new()),
            last_activity: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_owned();
    }

    pub fn registered_id(&self) -> i64 {
        self.registered_id.load(Ordering::Relaxed)
    }

    pub fn set_registered_id(&self, id: i64) {
        self.registered_id.store(id, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, v: bool) {
        self.muted.store(v, Ordering::Relaxed);
    }

    pub fn is_self_muted(&self) -> bool {
        self.self_muted.load(Ordering::Relaxed)
    }

    pub fn set_self_muted(&self, v: bool) {
        self.self_muted.store(v, Ordering::Relaxed);
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Relaxed)
    }

    pub fn set_deafened(&self, v: bool) {
        self.deafened.store(v, Ordering::Relaxed);
    }

    pub fn is_self_deafened(&self) -> bool {
        self.self_deafened.load(Ordering::Relaxed)
    }

    pub fn set_self_deafened(&self, v: bool) {
        self.self_deafened.store(v, Ordering::Relaxed);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn set_suppressed(&self, v: bool) {
        self.suppressed.store(v, Ordering::Relaxed);
    }

    /// Authenticated, not server-muted, not suppressed. Self-mute is the
    /// client's own affair: a self-muted client simply stops sending.
    pub fn may_transmit(&self) -> bool {
        self.is_authenticated() && !self.is_muted() && !self.is_suppressed()
    }

    /// Deafened in any form; such a user receives no voice at all.
    pub fn hears_nothing(&self) -> bool {
        self.is_deafened() || self.is_self_deafened()
    }

    pub fn prefers_udp(&self) -> bool {
        self.prefers_udp.load(Ordering::Relaxed)
    }

    pub fn set_prefers_udp(&self, v: bool) {
        self.prefers_udp.store(v, Ordering::Relaxed);
    }

    pub fn channel(&self) -> ChannelId {
        self.channel.load(Ordering::Relaxed)
    }

    pub(crate) fn set_channel(&self, channel: ChannelId) {
        self.channel.store(channel, Ordering::Relaxed);
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock().unwrap()
    }

    pub(crate) fn set_udp_addr(&self, addr: Option<SocketAddr>) {
        *self.udp_addr.lock().unwrap() = addr;
    }

    pub fn whisper_target(&self, slot: u8) -> Option<WhisperTarget> {
        self.whisper_targets.lock().unwrap().get(&slot).cloned()
    }

    pub fn set_whisper_target(&self, slot: u8, target: WhisperTarget) {
        self.whisper_targets.lock().unwrap().insert(slot, target);
    }

    pub fn clear_whisper_target(&self, slot: u8) {
        self.whisper_targets.lock().unwrap().remove(&slot);
    }

    pub fn position_context(&self) -> Option<String> {
        self.position_context.lock().unwrap().clone()
    }

    pub fn set_position_context(&self, context: Option<String>) {
        *self.position_context.lock().unwrap() = context;
    }

    /// Whether positional audio may flow between the two users. Users who
    /// never supplied a context share the default world.
    pub fn shares_position_context(&self, other: &ServerUser) -> bool {
        *self.position_context.lock().unwrap() == *other.position_context.lock().unwrap()
    }

    /// Record traffic on either transport, for the idle sweep.
    pub fn touch_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last traffic.
    pub fn idle_millis(&self) -> i64 {
        (Utc::now().timestamp_millis() - self.last_activity.load(Ordering::Relaxed)).max(0)
    }
}
