//! Unified error handling for voxd.
//!
//! The datapath never propagates errors to peers: every failure on the hot
//! path is a drop with a reason, surfaced only through logging and counters.
//! `DropReason` carries no allocation so it can be produced per packet.

use thiserror::Error;

/// Why an inbound datagram was discarded instead of routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("datagram shorter than the minimum frame")]
    Runt,

    #[error("datagram longer than the maximum frame")]
    Oversize,

    #[error("no session matched the source address")]
    UnknownPeer,

    #[error("authenticated decrypt failed")]
    Decrypt,

    #[error("sender exceeded the bandwidth ceiling")]
    Bandwidth,

    #[error("sender is not authenticated, muted, or suppressed")]
    NotSpeakable,

    #[error("session vanished during lock upgrade")]
    Vanished,

    #[error("no whisper target registered in that slot")]
    NoSuchTarget,
}

impl DropReason {
    /// Static label for structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Runt => "runt",
            Self::Oversize => "oversize",
            Self::UnknownPeer => "unknown_peer",
            Self::Decrypt => "decrypt",
            Self::Bandwidth => "bandwidth",
            Self::NotSpeakable => "not_speakable",
            Self::Vanished => "vanished",
            Self::NoSuchTarget => "no_such_target",
        }
    }
}

/// Errors from the voice wire parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("varint truncated")]
    Truncated,
}

/// Errors from control-plane state mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("no such session: {0}")]
    NoSuchSession(u32),

    #[error("no such channel: {0}")]
    NoSuchChannel(u32),

    #[error("channel {0} cannot be its own ancestor")]
    ChannelCycle(u32),

    #[error("root channel cannot be removed or re-parented")]
    RootImmutable,

    #[error("whisper slot {0} out of range")]
    BadWhisperSlot(u8),

    #[error("server is full")]
    ServerFull,
}
