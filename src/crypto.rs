use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest::{digest, SHA256};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::warn;

pub const ENCRYPTION_KEY_ENV: &str = "MAILMIND_ENCRYPTION_KEY";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SEALED_PREFIX: &str = "v1:";
const PLAIN_PREFIX: &str = "plain:";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    #[error("encrypt payload")]
    Seal,

    #[error("decrypt payload: {0}")]
    Open(String),
}

/// Seals analysis payloads at rest. Ciphertext is stored as
/// `v1:<base64(nonce || sealed)>`; without a master key payloads are only
/// base64 encoded under a `plain:` prefix, so the two never get confused on
/// read.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError>;
    fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError>;
}

pub struct AesGcmEncryptor {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmEncryptor {
    pub fn new(key: &[u8; KEY_BYTES]) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CryptoError::InvalidKey("construct AES-256-GCM key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Per-mailbox key: PBKDF2-HMAC-SHA256 over the master key, salted with a
    /// digest of the mailbox id.
    pub fn derive(master: &[u8; KEY_BYTES], mailbox_id: &str) -> Result<Self, CryptoError> {
        let salt = digest(&SHA256, format!("mailmind-payload:{mailbox_id}").as_bytes());
        let mut derived = [0u8; KEY_BYTES];
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| CryptoError::InvalidKey("zero pbkdf2 iterations".to_string()))?;
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt.as_ref(),
            master,
            &mut derived,
        );
        Self::new(&derived)
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut envelope = Vec::with_capacity(NONCE_BYTES + sealed.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&sealed);
        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(envelope)))
    }

    fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = envelope
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| CryptoError::Open("unsupported envelope version".to_string()))?;
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Open(format!("base64: {e}")))?;
        if raw.len() < NONCE_BYTES {
            return Err(CryptoError::Open("envelope too short".to_string()));
        }

        let (nonce_raw, sealed) = raw.split_at(NONCE_BYTES);
        let nonce_bytes: [u8; NONCE_BYTES] = nonce_raw
            .try_into()
            .map_err(|_| CryptoError::Open("invalid nonce length".to_string()))?;
        let mut buffer = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Open("authentication failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

/// Base64 only. Used when no master key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncryptor;

impl Encryptor for PassthroughEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        Ok(format!("{PLAIN_PREFIX}{}", STANDARD.encode(plaintext)))
    }

    fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = envelope
            .strip_prefix(PLAIN_PREFIX)
            .ok_or_else(|| CryptoError::Open("payload is not a plain envelope".to_string()))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Open(format!("base64: {e}")))
    }
}

/// Hands out the payload encryptor for each mailbox.
#[derive(Clone)]
pub enum PayloadKeys {
    Master([u8; KEY_BYTES]),
    Passthrough,
}

impl PayloadKeys {
    /// Reads [`ENCRYPTION_KEY_ENV`]; falls back to pass-through with a warning.
    pub fn from_env() -> Result<Self, CryptoError> {
        match std::env::var(ENCRYPTION_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            Some(raw) => Self::from_hex(&raw),
            None => {
                warn!("{ENCRYPTION_KEY_ENV} not set; analysis payloads are stored unencrypted");
                Ok(Self::Passthrough)
            }
        }
    }

    pub fn from_hex(raw: &str) -> Result<Self, CryptoError> {
        let decoded = hex_decode(raw)?;
        let key: [u8; KEY_BYTES] = decoded.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("{ENCRYPTION_KEY_ENV} must be 64 hex characters"))
        })?;
        Ok(Self::Master(key))
    }

    pub fn for_mailbox(&self, mailbox_id: &str) -> Result<Box<dyn Encryptor>, CryptoError> {
        match self {
            Self::Master(master) => Ok(Box::new(AesGcmEncryptor::derive(master, mailbox_id)?)),
            Self::Passthrough => Ok(Box::new(PassthroughEncryptor)),
        }
    }
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, CryptoError> {
    let value = raw.trim().as_bytes();
    if value.len() % 2 != 0 {
        return Err(CryptoError::InvalidKey(
            "hex string length must be even".to_string(),
        ));
    }

    value
        .chunks(2)
        .map(|pair| match (decode_hex_nibble(pair[0]), decode_hex_nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(CryptoError::InvalidKey("invalid hex digit".to_string())),
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
