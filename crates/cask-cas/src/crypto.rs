//! Authenticated block encryption.
//!
//! Each payload is sealed to the repository's recipient key via an ephemeral
//! X25519 exchange: the writer generates a fresh keypair per call, uses the
//! raw shared secret as a ChaCha20-Poly1305 key, and emits
//!
//! ```text
//! e_pub (32) || nonce (12) || ciphertext + tag (len + 16)
//! ```
//!
//! The 12-byte nonce carries a little-endian call counter in its last eight
//! bytes (first call is 1). Every call derives a fresh key, so the counter
//! never repeats under a key in practice; a (key, nonce) collision would be a
//! correctness violation. Readers cache the last `(e_pub, shared)` pair so
//! consecutive blocks sealed under one ephemeral key skip the scalar
//! multiplication.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use cask_chunk::pool;

use crate::transform::BlockTransform;
use crate::{block_id, id_to_hex, BlockId, CasError, Result};

/// Fixed per-payload overhead ahead of the ciphertext: ephemeral public key
/// plus nonce. The AEAD tag adds another 16 bytes at the end.
pub const CRYPTO_OVERHEAD: usize = 32 + 12;

const TAG_LEN: usize = 16;

/// A long-term X25519 keypair identifying a repository's recipient.
#[derive(Clone)]
pub struct Key {
    secret: StaticSecret,
    public: PublicKey,
}

impl Key {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Key {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Key { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Identity of this key as stored in head headers: the digest of the
    /// public key. Lets an open detect a mismatched key before reading data.
    pub fn key_id(&self) -> BlockId {
        block_id(self.public.as_bytes())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("public", &id_to_hex(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Write-side encryption transform.
pub struct CryptWriter {
    recipient: PublicKey,
    calls: AtomicU64,
}

impl CryptWriter {
    pub fn new(key: &Key) -> CryptWriter {
        CryptWriter {
            recipient: key.public,
            calls: AtomicU64::new(0),
        }
    }
}

impl BlockTransform for CryptWriter {
    fn transform(&self, src: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.recipient);

        let cipher = ChaCha20Poly1305::new(shared.as_bytes().into());
        let counter = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = nonce_bytes(counter);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), src)
            .map_err(|_| CasError::Crypto)?;

        let mut out = pool::take_block();
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Read-side decryption transform with the `(e_pub, shared)` memo.
pub struct CryptReader {
    key: Key,
    memo: Mutex<Option<([u8; 32], [u8; 32])>>,
}

impl CryptReader {
    pub fn new(key: Key) -> CryptReader {
        CryptReader {
            key,
            memo: Mutex::new(None),
        }
    }

    fn shared_for(&self, ephemeral_pub: [u8; 32]) -> [u8; 32] {
        let mut memo = self.memo.lock().unwrap();
        if let Some((prev_pub, prev_shared)) = *memo {
            if prev_pub == ephemeral_pub {
                return prev_shared;
            }
        }
        let shared = *self
            .key
            .secret
            .diffie_hellman(&PublicKey::from(ephemeral_pub))
            .as_bytes();
        *memo = Some((ephemeral_pub, shared));
        shared
    }
}

impl BlockTransform for CryptReader {
    fn transform(&self, src: &[u8]) -> Result<Vec<u8>> {
        if src.len() < CRYPTO_OVERHEAD + TAG_LEN {
            return Err(CasError::Truncated);
        }

        let mut ephemeral_pub = [0u8; 32];
        ephemeral_pub.copy_from_slice(&src[..32]);
        let shared = self.shared_for(ephemeral_pub);

        let cipher = ChaCha20Poly1305::new((&shared).into());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&src[32..CRYPTO_OVERHEAD]),
                &src[CRYPTO_OVERHEAD..],
            )
            .map_err(|_| CasError::Crypto)?;

        let mut out = pool::take_block();
        out.extend_from_slice(&plaintext);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrips() {
        let key = Key::generate();
        let writer = CryptWriter::new(&key);
        let reader = CryptReader::new(key);

        let sealed = writer.transform(b"attack at dawn").unwrap();
        assert_eq!(sealed.len(), 14 + CRYPTO_OVERHEAD + TAG_LEN);
        assert_eq!(reader.transform(&sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn each_call_uses_a_fresh_ephemeral_key() {
        let key = Key::generate();
        let writer = CryptWriter::new(&key);

        let a = writer.transform(b"same plaintext").unwrap();
        let b = writer.transform(b"same plaintext").unwrap();
        assert_ne!(a[..32], b[..32]);
        assert_ne!(a[CRYPTO_OVERHEAD..], b[CRYPTO_OVERHEAD..]);
    }

    #[test]
    fn nonce_counter_starts_at_one() {
        let key = Key::generate();
        let writer = CryptWriter::new(&key);

        let sealed = writer.transform(b"x").unwrap();
        let mut expected = [0u8; 12];
        expected[4..].copy_from_slice(&1u64.to_le_bytes());
        assert_eq!(&sealed[32..CRYPTO_OVERHEAD], &expected);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let writer = CryptWriter::new(&Key::generate());
        let reader = CryptReader::new(Key::generate());

        let sealed = writer.transform(b"secret").unwrap();
        assert!(matches!(reader.transform(&sealed), Err(CasError::Crypto)));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let key = Key::generate();
        let writer = CryptWriter::new(&key);
        let reader = CryptReader::new(key);

        let mut sealed = writer.transform(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(reader.transform(&sealed), Err(CasError::Crypto)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let reader = CryptReader::new(Key::generate());
        assert!(matches!(
            reader.transform(&[0u8; CRYPTO_OVERHEAD]),
            Err(CasError::Truncated)
        ));
    }

    #[test]
    fn key_id_is_derived_from_public_key() {
        let key = Key::generate();
        assert_eq!(key.key_id(), block_id(&key.public_bytes()));
        assert_ne!(key.key_id(), Key::generate().key_id());
    }
}
