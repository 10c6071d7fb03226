//! At-rest sealing of queued drafts.
//!
//! Queued reports carry the reporter's name and email, so rows written by
//! [`crate::storage::SqliteDraftStorage`] can be sealed with
//! XChaCha20-Poly1305. The report id is bound as associated data, which stops
//! a sealed row from being replayed under another id.
//!
//! Envelope layout: `magic(8) | version(4, le) | nonce(24) | ciphertext | tag(16)`.

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;
use zeroize::Zeroize;

const ENVELOPE_MAGIC: [u8; 8] = *b"CRSEAL01";
const CURRENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 36;
const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
const MAX_AAD_LEN: usize = 1024;

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_plaintext: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_plaintext: 16 * 1024 * 1024,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("plaintext too large: {size} > {max}")]
    PlaintextTooLarge { size: usize, max: usize },

    #[error("aad required but empty")]
    AadRequired,

    #[error("aad too large: {size} > {max}")]
    AadTooLarge { size: usize, max: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("authentication failed")]
    AuthenticationFailed,
}

pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

/// Single-key XChaCha20-Poly1305 sealer. The key is supplied by the host
/// (platform keystore); it is never persisted by this crate.
pub struct SealingKey<R: RandomProvider = OsRng> {
    secret: Secret<[u8; KEY_SIZE]>,
    rng: R,
    limits: Limits,
}

impl SealingKey<OsRng> {
    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        Self::with_rng(key_bytes, OsRng, Limits::default())
    }
}

impl<R: RandomProvider> SealingKey<R> {
    pub fn with_rng(key_bytes: &[u8], rng: R, limits: Limits) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(key_bytes);
        Ok(Self {
            secret: Secret::new(key),
            rng,
            limits,
        })
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.secret.expose_secret()))
    }

    fn check_aad(aad: &[u8]) -> Result<(), CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        if aad.len() > MAX_AAD_LEN {
            return Err(CryptoError::AadTooLarge {
                size: aad.len(),
                max: MAX_AAD_LEN,
            });
        }
        Ok(())
    }
}

impl<R: RandomProvider> CryptoProvider for SealingKey<R> {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > self.limits.max_plaintext {
            return Err(CryptoError::PlaintextTooLarge {
                size: plaintext.len(),
                max: self.limits.max_plaintext,
            });
        }
        Self::check_aad(aad)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes)?;

        let total_len = HEADER_SIZE + plaintext.len() + TAG_SIZE;
        let mut out = vec![0u8; total_len];
        out[0..8].copy_from_slice(&ENVELOPE_MAGIC);
        out[8..12].copy_from_slice(&CURRENT_VERSION.to_le_bytes());
        out[12..HEADER_SIZE].copy_from_slice(&nonce_bytes);

        let pt_end = HEADER_SIZE + plaintext.len();
        out[HEADER_SIZE..pt_end].copy_from_slice(plaintext);

        let tag = self
            .cipher()
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce_bytes),
                aad,
                &mut out[HEADER_SIZE..pt_end],
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        out[pt_end..].copy_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < HEADER_SIZE + TAG_SIZE || envelope[0..8] != ENVELOPE_MAGIC {
            return Err(CryptoError::MalformedEnvelope);
        }
        Self::check_aad(aad)?;

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&envelope[8..12]);
        let version = u32::from_le_bytes(version_bytes);
        if version != CURRENT_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let nonce = XNonce::from_slice(&envelope[12..HEADER_SIZE]);
        let body = &envelope[HEADER_SIZE..];
        let ct_len = body.len() - TAG_SIZE;
        let mut buffer = body[..ct_len].to_vec();
        let tag = &body[ct_len..];

        if self
            .cipher()
            .decrypt_in_place_detached(nonce, aad, &mut buffer, tag.into())
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::AuthenticationFailed);
        }

        Ok(buffer)
    }
}
