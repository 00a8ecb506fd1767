//! voxd - low-latency group voice chat server.
//!
//! Clients hold a long-lived TLS control channel and push voice over a
//! parallel UDP datapath bound to the session by a symmetric key; voice
//! falls back to riding the control channel when UDP is blocked. The
//! server routes each packet to the right recipients — channel neighbours,
//! linked channels, whisper targets — under per-channel permissions and a
//! per-speaker bandwidth ceiling.

pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod network;
pub mod state;
pub mod voice;
