//! Per-session datagram cipher for the UDP voice path.
//!
//! Every datagram is bound to its TLS session by a symmetric key negotiated
//! on the control channel. The wire form is a fixed 4-byte header followed by
//! ciphertext:
//!
//! ```text
//! [ nonce low byte | tag[0] | tag[1] | tag[2] | ciphertext ... ]
//! ```
//!
//! The keystream is ChaCha20 with a 64-bit per-direction packet counter as
//! the nonce; the tag is a keyed BLAKE3 MAC over `counter || ciphertext`,
//! truncated to three bytes and compared in constant time. Decryption either
//! yields a verified plaintext or fails without partial output.
//!
//! Only the low byte of the counter travels on the wire. The receiver
//! reconstructs the full counter relative to the highest counter seen,
//! accepting up to 127 packets of reordering in either direction, and rejects
//! replays through a 256-entry history indexed by the wire byte.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;

/// Bytes prepended to every encrypted datagram.
pub const CRYPT_OVERHEAD: usize = 4;

/// Truncated MAC length carried in the header.
const TAG_LEN: usize = 3;

/// Sustained decrypt failure for longer than this solicits a resync.
const RESYNC_AFTER: Duration = Duration::from_secs(5);

/// Minimum spacing between resync solicitations.
const RESYNC_SPACING: Duration = Duration::from_secs(5);

/// Key derivation context for the MAC key. Changing this breaks the wire.
const MAC_CONTEXT: &str = "voxd 2026-03-01 datagram tag";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptError {
    #[error("no key material negotiated yet")]
    NotInitialized,

    #[error("datagram too short to carry the crypt header")]
    TooShort,

    #[error("output buffer too small")]
    BufferTooSmall,

    #[error("counter reconstruction out of range")]
    NonceOutOfRange,

    #[error("datagram replayed")]
    Replay,

    #[error("tag mismatch")]
    Tag,
}

/// Key material for one session, generated server-side and shipped to the
/// client over the control channel.
#[derive(Clone, Copy)]
pub struct CryptMaterial {
    pub key: [u8; 32],
    /// Initial counter for the server-to-client direction.
    pub server_nonce: u64,
    /// Initial counter for the client-to-server direction.
    pub client_nonce: u64,
}

impl CryptMaterial {
    /// Generate fresh material from the OS entropy source.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self {
            key,
            server_nonce: OsRng.next_u64(),
            client_nonce: OsRng.next_u64(),
        }
    }
}

/// Running statistics, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptStats {
    /// Datagrams decrypted and verified.
    pub good: u32,
    /// Verified datagrams that arrived behind the newest counter.
    pub late: u32,
    /// Counter values skipped over, presumed lost in transit.
    pub lost: u32,
}

/// Symmetric datagram cipher context for one session and one direction pair.
///
/// Created un-keyed with the user; becomes usable once `set_key` installs the
/// negotiated material.
pub struct CryptState {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    /// Counter of the last datagram we sent.
    encrypt_nonce: u64,
    /// Highest counter verified from the remote side.
    decrypt_nonce: u64,
    /// Full counters already accepted, indexed by their wire byte.
    history: [u64; 256],
    stats: CryptStats,
    last_good: Instant,
    last_request: Instant,
    initialized: bool,
}

impl CryptState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            cipher_key: [0; 32],
            mac_key: [0; 32],
            encrypt_nonce: 0,
            decrypt_nonce: 0,
            history: [0; 256],
            stats: CryptStats::default(),
            last_good: now,
            last_request: now,
            initialized: false,
        }
    }

    /// Install negotiated key material.
    ///
    /// `local_nonce` seeds the counter for datagrams we emit, `remote_nonce`
    /// the counter we expect from the peer. Server and client call this with
    /// the two nonces swapped.
    pub fn set_key(&mut self, key: [u8; 32], local_nonce: u64, remote_nonce: u64) {
        self.cipher_key = key;
        self.mac_key = blake3::derive_key(MAC_CONTEXT, &key);
        self.encrypt_nonce = local_nonce;
        self.decrypt_nonce = remote_nonce;
        self.history = [0; 256];
        self.stats = CryptStats::default();
        let now = Instant::now();
        self.last_good = now;
        self.last_request = now;
        self.initialized = true;
    }

    /// Install material in the server role (emits with the server nonce).
    pub fn set_material_server(&mut self, material: &CryptMaterial) {
        self.set_key(material.key, material.server_nonce, material.client_nonce);
    }

    /// Install material in the client role. Used by test clients.
    pub fn set_material_client(&mut self, material: &CryptMaterial) {
        self.set_key(material.key, material.client_nonce, material.server_nonce);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn stats(&self) -> CryptStats {
        self.stats
    }

    /// Encrypt `plain` into `dst`, returning the total datagram length.
    pub fn encrypt(&mut self, plain: &[u8], dst: &mut [u8]) -> Result<usize, CryptError> {
        if !self.initialized {
            return Err(CryptError::NotInitialized);
        }
        let total = plain.len() + CRYPT_OVERHEAD;
        if dst.len() < total {
            return Err(CryptError::BufferTooSmall);
        }

        self.encrypt_nonce = self.encrypt_nonce.wrapping_add(1);
        let nonce = self.encrypt_nonce;

        let body = &mut dst[CRYPT_OVERHEAD..total];
        body.copy_from_slice(plain);
        self.keystream(nonce).apply_keystream(body);

        let tag = self.tag(nonce, body);
        dst[0] = nonce as u8;
        dst[1..CRYPT_OVERHEAD].copy_from_slice(&tag);
        Ok(total)
    }

    /// Decrypt `source` into `dst`, returning the plaintext length.
    ///
    /// State (highest counter, replay history, statistics) advances only
    /// after the tag verifies; a failed datagram leaves the context exactly
    /// as it was.
    pub fn decrypt(&mut self, source: &[u8], dst: &mut [u8]) -> Result<usize, CryptError> {
        if !self.initialized {
            return Err(CryptError::NotInitialized);
        }
        if source.len() < CRYPT_OVERHEAD {
            return Err(CryptError::TooShort);
        }
        let body = &source[CRYPT_OVERHEAD..];
        if dst.len() < body.len() {
            return Err(CryptError::BufferTooSmall);
        }

        let wire_byte = source[0];
        let current_low = self.decrypt_nonce as u8;
        // Sign-extended distance from the newest counter, so a wire byte just
        // behind it reconstructs backwards and one ahead absorbs drops.
        let diff = wire_byte.wrapping_sub(current_low) as i8 as i64;
        let nonce = self
            .decrypt_nonce
            .checked_add_signed(diff)
            .ok_or(CryptError::NonceOutOfRange)?;

        if diff <= 0 && self.history[wire_byte as usize] == nonce {
            return Err(CryptError::Replay);
        }

        let out = &mut dst[..body.len()];
        out.copy_from_slice(body);
        let tag = self.tag(nonce, body);
        if !bool::from(tag.ct_eq(&source[1..CRYPT_OVERHEAD])) {
            return Err(CryptError::Tag);
        }
        self.keystream(nonce).apply_keystream(out);

        self.history[wire_byte as usize] = nonce;
        if diff > 0 {
            self.stats.lost += (diff - 1) as u32;
            self.decrypt_nonce = nonce;
        } else {
            self.stats.late += 1;
        }
        self.stats.good += 1;
        self.last_good = Instant::now();
        Ok(body.len())
    }

    /// Resync policy: after a decrypt failure, report whether the control
    /// thread should solicit a nonce resync. Rate-limited so a burst of bad
    /// datagrams produces at most one request per spacing window.
    pub fn should_request_resync(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_good) > RESYNC_AFTER
            && now.duration_since(self.last_request) > RESYNC_SPACING
        {
            self.last_request = now;
            return true;
        }
        false
    }

    fn keystream(&self, nonce: u64) -> ChaCha20 {
        let mut iv = [0u8; 12];
        iv[4..].copy_from_slice(&nonce.to_le_bytes());
        ChaCha20::new(
            chacha20::Key::from_slice(&self.cipher_key),
            chacha20::Nonce::from_slice(&iv),
        )
    }

    fn tag(&self, nonce: u64, ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = blake3::Hasher::new_keyed(&self.mac_key);
        hasher.update(&nonce.to_le_bytes());
        hasher.update(ciphertext);
        let digest = hasher.finalize();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest.as_bytes()[..TAG_LEN]);
        tag
    }
}

impl Default for CryptState {
    fn default() -> Self {
        Self::new()
    }
}
