//! Per-entry authenticated encryption using AES-256-GCM.
//!
//! The pool credential is stretched with PBKDF2-HMAC-SHA256 over a random
//! per-pool salt, using the round count stored in the pool's registry record.
//! Two outputs are expanded from the stretched secret with HKDF-SHA256: the
//! payload key, which only ever lives in a client's memory, and a verifier,
//! which the registry stores so `bind` can check a credential without holding
//! the key.

use aes_gcm::aead::{Aead, KeyInit, Payload, generic_array::GenericArray};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::error::{Error, ErrorKind};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const VERIFIER_SIZE: usize = 32;

pub const DEFAULT_KDF_ROUNDS: u32 = 600_000;
/// Lowest round count a pool may be created or opened with.
pub const MIN_KDF_ROUNDS: u32 = 10_000;

const KEY_INFO: &[u8] = b"latzero-pool-key-v1";
const VERIFIER_INFO: &[u8] = b"latzero-pool-verifier-v1";

/// Payload key for one pool. Zeroized on drop and redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PoolKey {
    bytes: [u8; KEY_SIZE],
}

impl PoolKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N], Error> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("os randomness unavailable: {err}"))
    })?;
    Ok(out)
}

/// A credential after key stretching. Never stored; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StretchedSecret {
    bytes: [u8; KEY_SIZE],
}

impl StretchedSecret {
    pub fn key(&self) -> Result<PoolKey, Error> {
        let mut bytes = [0u8; KEY_SIZE];
        self.expand(KEY_INFO, &mut bytes)?;
        Ok(PoolKey { bytes })
    }

    pub fn verifier(&self) -> Result<[u8; VERIFIER_SIZE], Error> {
        let mut out = [0u8; VERIFIER_SIZE];
        self.expand(VERIFIER_INFO, &mut out)?;
        Ok(out)
    }

    fn expand(&self, info: &[u8], out: &mut [u8]) -> Result<(), Error> {
        let hk = Hkdf::<Sha256>::from_prk(&self.bytes).map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("stretched secret is not a valid prk")
        })?;
        hk.expand(info, out)
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("key derivation failed"))
    }
}

/// Runs PBKDF2 over `credential`. This is the slow step; callers keep it
/// outside the registry lock.
pub fn stretch(
    credential: &[u8],
    salt: &[u8; SALT_SIZE],
    rounds: u32,
) -> Result<StretchedSecret, Error> {
    if rounds < MIN_KDF_ROUNDS {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("kdf rounds must be at least {MIN_KDF_ROUNDS}, got {rounds}")));
    }
    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(credential, salt, rounds, &mut bytes);
    Ok(StretchedSecret { bytes })
}

/// Compares without early exit so timing does not reveal the matching prefix.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Output layout: `nonce (12) || ciphertext || tag (16)`.
///
/// `aad` is authenticated but not encrypted; entries pass their key so a
/// sealed payload cannot be replayed under another key.
pub fn seal(key: &PoolKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce_bytes = random_bytes::<NONCE_SIZE>()?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend(ciphertext);
    Ok(out)
}

pub fn open(key: &PoolKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::new(ErrorKind::IntegrityFailure).with_message("ciphertext too short"));
    }
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[NONCE_SIZE..],
                aad,
            },
        )
        .map_err(|_| {
            Error::new(ErrorKind::IntegrityFailure)
                .with_message("authentication tag mismatch (wrong credential or tampered data)")
        })
}
