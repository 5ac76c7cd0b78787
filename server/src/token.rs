//! Stateless retry tokens.
//!
//! A token proves that its holder can receive datagrams at the address it
//! claims. Nothing is stored server-side: validity is a pure function of the
//! token bytes, the source address, the clock and a secret that lives as
//! long as the process.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hmac::{Hmac, Mac};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use shared::messages::{AntiSpoofToken, TOKEN_MAC_SIZE, TOKEN_NONCE_SIZE};
use shared::{timestamp_secs, CryptoError};

use crate::canonical_ip;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10);

/// How far in the future a token timestamp may be before it is refused.
pub const FUTURE_TOLERANCE_SECS: i64 = 2;

const SECRET_SIZE: usize = 32;

#[derive(Clone)]
pub struct RetryTokenIssuer {
    secret: [u8; SECRET_SIZE],
    ttl_secs: i64,
}

impl std::fmt::Debug for RetryTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTokenIssuer")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl RetryTokenIssuer {
    /// Creates an issuer with a fresh random secret.
    pub fn new(ttl: Duration) -> Self {
        let mut secret = [0u8; SECRET_SIZE];
        OsRng.fill_bytes(&mut secret);
        Self::with_secret(secret, ttl)
    }

    pub fn with_secret(secret: [u8; SECRET_SIZE], ttl: Duration) -> Self {
        Self {
            secret,
            ttl_secs: ttl.as_secs() as i64,
        }
    }

    pub fn issue(&self, addr: SocketAddr) -> Result<AntiSpoofToken, CryptoError> {
        self.issue_at(addr, timestamp_secs())
    }

    pub fn issue_at(&self, addr: SocketAddr, now_secs: i64) -> Result<AntiSpoofToken, CryptoError> {
        let mut nonce = [0u8; TOKEN_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let mac = self.keyed_mac(addr, now_secs, &nonce)?;
        let mut tag = [0u8; TOKEN_MAC_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());

        Ok(AntiSpoofToken {
            timestamp: now_secs,
            nonce,
            mac: tag,
        })
    }

    /// Validates raw token bytes; anything but exactly 48 bytes is refused.
    pub fn validate(&self, token: &[u8], addr: SocketAddr) -> bool {
        match AntiSpoofToken::from_bytes(token) {
            Some(token) => self.validate_token_at(&token, addr, timestamp_secs()),
            None => false,
        }
    }

    pub fn validate_token(&self, token: &AntiSpoofToken, addr: SocketAddr) -> bool {
        self.validate_token_at(token, addr, timestamp_secs())
    }

    pub fn validate_token_at(&self, token: &AntiSpoofToken, addr: SocketAddr, now_secs: i64) -> bool {
        let age = now_secs.saturating_sub(token.timestamp);
        if age > self.ttl_secs {
            debug!("Retry token from {} expired ({}s old)", addr, age);
            return false;
        }
        if age < -FUTURE_TOLERANCE_SECS {
            debug!("Retry token from {} dated {}s in the future", addr, -age);
            return false;
        }

        match self.keyed_mac(addr, token.timestamp, &token.nonce) {
            // verify_slice compares in constant time.
            Ok(mac) => mac.verify_slice(&token.mac).is_ok(),
            Err(_) => false,
        }
    }

    fn keyed_mac(
        &self,
        addr: SocketAddr,
        timestamp: i64,
        nonce: &[u8; TOKEN_NONCE_SIZE],
    ) -> Result<HmacSha256, CryptoError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| CryptoError::KeyDerivation)?;
        match canonical_ip(addr.ip()) {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac.update(&addr.port().to_be_bytes());
        mac.update(&timestamp.to_le_bytes());
        mac.update(nonce);
        Ok(mac)
    }
}
