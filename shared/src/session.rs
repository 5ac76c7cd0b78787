//! Per-connection AEAD state: X25519 key agreement, HKDF-SHA256 key
//! derivation, ChaCha20-Poly1305 sealing with deterministic nonces, a replay
//! window and the rekey policy.
//!
//! Nonces are `connection_id (u32 LE) || sequence (u64 LE)`. A sequence is
//! never reused under one key: `seq_tx` only grows, and it is reset to zero
//! only together with fresh keys in [`SecureSession::perform_rekey_at`].
//!
//! The 64 bytes of HKDF output are split the same way on both peers; the
//! server sends with the first half and the client with the second, so no key
//! ever protects traffic in both directions.

use std::fmt;
use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{CryptoError, DecryptError};
use crate::header::{Channel, HeaderFlags, PacketHeader};
use crate::replay::ReplayWindow;

/// HKDF info string for the initial key schedule.
pub const PROTOCOL_INFO: &[u8] = b"netcode-transport v1";
/// Prefix of the HKDF info string used when rotating keys.
pub const REKEY_INFO: &[u8] = b"rekey";

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Rotate after this many bytes of ciphertext.
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;
/// Rotate after this much time under one key.
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Which end of the connection a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Thresholds after which a session asks to be rekeyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_REKEY_BYTES,
            max_age: DEFAULT_REKEY_INTERVAL,
        }
    }
}

/// Generates an X25519 keypair, returned as `(private, public)` bytes.
pub fn generate_keypair() -> ([u8; KEY_SIZE], [u8; PUBLIC_KEY_SIZE]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Expands an ECDH shared secret into the 64-byte key block both peers split.
pub fn derive_key_material(
    shared_secret: &[u8],
    salt: &[u8; SALT_SIZE],
) -> Result<[u8; 2 * KEY_SIZE], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = [0u8; 2 * KEY_SIZE];
    hk.expand(PROTOCOL_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// Builds the 12-byte AEAD nonce for a packet.
pub fn build_nonce(connection_id: u32, sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..4].copy_from_slice(&connection_id.to_le_bytes());
    nonce[4..12].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

#[derive(Clone)]
pub struct SecureSession {
    role: Role,
    connection_id: u32,
    tx_key: [u8; KEY_SIZE],
    rx_key: [u8; KEY_SIZE],
    session_salt: [u8; SALT_SIZE],
    seq_tx: u64,
    replay: ReplayWindow,
    bytes_transmitted: u64,
    session_start: Instant,
    key_phase: bool,
    policy: RekeyPolicy,
    tx_cipher: ChaCha20Poly1305,
    rx_cipher: ChaCha20Poly1305,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.role)
            .field("connection_id", &self.connection_id)
            .field("seq_tx", &self.seq_tx)
            .field("seq_rx_highest", &self.replay.highest())
            .field("bytes_transmitted", &self.bytes_transmitted)
            .field("key_phase", &self.key_phase)
            .finish_non_exhaustive()
    }
}

impl SecureSession {
    /// Server side of the handshake.
    ///
    /// Generates an ephemeral keypair and a fresh salt, agrees a secret with
    /// the client's public key and returns what the client needs to mirror
    /// the derivation: `(server_public_key, salt, session)`.
    pub fn create_as_server(
        client_public_key: &[u8; PUBLIC_KEY_SIZE],
        connection_id: u32,
    ) -> Result<([u8; PUBLIC_KEY_SIZE], [u8; SALT_SIZE], Self), CryptoError> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*client_public_key));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        let okm = derive_key_material(shared.as_bytes(), &salt)?;
        let session = Self::from_key_material(Role::Server, connection_id, &okm, salt);
        Ok((server_public.to_bytes(), salt, session))
    }

    /// Client side of the handshake, run with the values from `ConnectionAccepted`.
    pub fn create_as_client(
        client_private_key: &[u8; KEY_SIZE],
        server_public_key: &[u8; PUBLIC_KEY_SIZE],
        salt: &[u8; SALT_SIZE],
        connection_id: u32,
    ) -> Result<Self, CryptoError> {
        let secret = StaticSecret::from(*client_private_key);
        let shared = secret.diffie_hellman(&PublicKey::from(*server_public_key));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        let okm = derive_key_material(shared.as_bytes(), salt)?;
        Ok(Self::from_key_material(
            Role::Client,
            connection_id,
            &okm,
            *salt,
        ))
    }

    /// Assigns the two halves of a derived key block according to `role`.
    pub fn from_key_material(
        role: Role,
        connection_id: u32,
        okm: &[u8; 2 * KEY_SIZE],
        salt: [u8; SALT_SIZE],
    ) -> Self {
        let (tx_key, rx_key) = split_keys(role, okm);
        Self {
            role,
            connection_id,
            tx_key,
            rx_key,
            session_salt: salt,
            seq_tx: 0,
            replay: ReplayWindow::new(),
            bytes_transmitted: 0,
            session_start: Instant::now(),
            key_phase: false,
            policy: RekeyPolicy::default(),
            tx_cipher: ChaCha20Poly1305::new(Key::from_slice(&tx_key)),
            rx_cipher: ChaCha20Poly1305::new(Key::from_slice(&rx_key)),
        }
    }

    pub fn with_policy(mut self, policy: RekeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn tx_key(&self) -> &[u8; KEY_SIZE] {
        &self.tx_key
    }

    pub fn rx_key(&self) -> &[u8; KEY_SIZE] {
        &self.rx_key
    }

    pub fn session_salt(&self) -> &[u8; SALT_SIZE] {
        &self.session_salt
    }

    pub fn seq_tx(&self) -> u64 {
        self.seq_tx
    }

    pub fn seq_rx_highest(&self) -> u64 {
        self.replay.highest()
    }

    pub fn replay_bitmask(&self) -> u64 {
        self.replay.mask()
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted
    }

    pub fn session_start(&self) -> Instant {
        self.session_start
    }

    pub fn key_phase(&self) -> bool {
        self.key_phase
    }

    pub fn policy(&self) -> RekeyPolicy {
        self.policy
    }

    /// Seals `plaintext` under the next outbound sequence number.
    ///
    /// The returned ciphertext is the plaintext length plus a 16-byte tag.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = build_nonce(self.connection_id, self.seq_tx);
        let ciphertext = self
            .tx_cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        self.seq_tx += 1;
        self.bytes_transmitted += ciphertext.len() as u64;
        Ok(ciphertext)
    }

    /// Opens a ciphertext sealed by the peer under `claimed_seq`.
    ///
    /// When `associated_data` is a serialized [`PacketHeader`], the sequence it
    /// carries must equal `claimed_seq`. Replays are rejected before the
    /// cipher runs, and the replay window only moves after the tag verifies.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        associated_data: &[u8],
        claimed_seq: u64,
    ) -> Result<Vec<u8>, DecryptError> {
        if let Ok(header) = <&[u8; PacketHeader::SIZE]>::try_from(associated_data) {
            if PacketHeader::sequence_of(header) != claimed_seq {
                return Err(DecryptError::SequenceMismatch);
            }
        }
        if !self.is_sequence_valid(claimed_seq) {
            return Err(DecryptError::Replay);
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(DecryptError::Malformed);
        }

        let nonce = build_nonce(self.connection_id, claimed_seq);
        let plaintext = self
            .rx_cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| DecryptError::Forged)?;

        self.update_replay_window(claimed_seq);
        Ok(plaintext)
    }

    pub fn is_sequence_valid(&self, seq: u64) -> bool {
        self.replay.is_valid(seq)
    }

    pub fn update_replay_window(&mut self, seq: u64) {
        self.replay.update(seq);
    }

    /// Header this session would stamp on its next outbound packet.
    pub fn next_header(&self, channel: Channel) -> PacketHeader {
        let mut flags = HeaderFlags::ENCRYPTED.with(HeaderFlags::AEAD_CHACHA20_POLY1305);
        if self.key_phase {
            flags = flags.with(HeaderFlags::KEY_PHASE);
        }
        PacketHeader {
            connection_id: self.connection_id,
            channel,
            flags,
            sequence: self.seq_tx,
        }
    }

    /// Produces `header || ciphertext || tag`, with the header as associated data.
    pub fn seal_packet(&mut self, channel: Channel, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let header = self.next_header(channel).to_bytes();
        let ciphertext = self.encrypt(plaintext, &header)?;
        let mut sealed = Vec::with_capacity(PacketHeader::SIZE + ciphertext.len());
        sealed.extend_from_slice(&header);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Parses the header of a sealed packet without touching any state.
    pub fn peek_header(sealed: &[u8]) -> Result<PacketHeader, DecryptError> {
        if sealed.len() < PacketHeader::SIZE + TAG_SIZE {
            return Err(DecryptError::Malformed);
        }
        let header = PacketHeader::from_bytes(&sealed[..PacketHeader::SIZE])?;
        let required = HeaderFlags::ENCRYPTED.with(HeaderFlags::AEAD_CHACHA20_POLY1305);
        if !header.flags.contains(required) {
            return Err(DecryptError::Malformed);
        }
        Ok(header)
    }

    /// Opens a packet produced by the peer's [`SecureSession::seal_packet`].
    pub fn open_packet(&mut self, sealed: &[u8]) -> Result<(PacketHeader, Vec<u8>), DecryptError> {
        let header = Self::peek_header(sealed)?;
        if header.connection_id != self.connection_id {
            return Err(DecryptError::WrongConnection);
        }
        if header.flags.key_phase() != self.key_phase {
            return Err(DecryptError::StaleKeyPhase);
        }
        let (aad, ciphertext) = sealed.split_at(PacketHeader::SIZE);
        let plaintext = self.decrypt(ciphertext, aad, header.sequence)?;
        Ok((header, plaintext))
    }

    pub fn should_rekey(&self) -> bool {
        self.should_rekey_at(Instant::now())
    }

    pub fn should_rekey_at(&self, now: Instant) -> bool {
        self.bytes_transmitted >= self.policy.max_bytes
            || now.saturating_duration_since(self.session_start) >= self.policy.max_age
    }

    /// Stream position a locally initiated rekey binds the new keys to.
    pub fn rekey_point(&self) -> u64 {
        self.seq_tx.max(self.replay.highest())
    }

    /// Rekeys at the local stream position.
    pub fn perform_rekey(&mut self) -> Result<(), CryptoError> {
        let point = self.rekey_point();
        self.perform_rekey_at(point)
    }

    /// Replaces both keys with ones derived from the current pair, the
    /// session salt and `point`, then resets every counter.
    ///
    /// Both peers must call this with the same `point`.
    pub fn perform_rekey_at(&mut self, point: u64) -> Result<(), CryptoError> {
        let mut ikm = [0u8; 2 * KEY_SIZE];
        let (server_to_client, client_to_server) = match self.role {
            Role::Server => (&self.tx_key, &self.rx_key),
            Role::Client => (&self.rx_key, &self.tx_key),
        };
        ikm[..KEY_SIZE].copy_from_slice(server_to_client);
        ikm[KEY_SIZE..].copy_from_slice(client_to_server);

        let mut info = Vec::with_capacity(REKEY_INFO.len() + 8);
        info.extend_from_slice(REKEY_INFO);
        info.extend_from_slice(&point.to_le_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&self.session_salt), &ikm);
        let mut okm = [0u8; 2 * KEY_SIZE];
        hk.expand(&info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let (tx_key, rx_key) = split_keys(self.role, &okm);
        self.tx_key = tx_key;
        self.rx_key = rx_key;
        self.tx_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.tx_key));
        self.rx_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.rx_key));

        self.seq_tx = 0;
        self.replay.reset();
        self.bytes_transmitted = 0;
        self.session_start = Instant::now();
        self.key_phase = !self.key_phase;

        debug!(
            "Connection {} rekeyed at point {} (phase {})",
            self.connection_id, point, self.key_phase as u8
        );
        Ok(())
    }
}

fn split_keys(role: Role, okm: &[u8; 2 * KEY_SIZE]) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let mut first = [0u8; KEY_SIZE];
    let mut second = [0u8; KEY_SIZE];
    first.copy_from_slice(&okm[..KEY_SIZE]);
    second.copy_from_slice(&okm[KEY_SIZE..]);
    match role {
        Role::Server => (first, second),
        Role::Client => (second, first),
    }
}
