//! Symmetric encryption of a single secret string.
//!
//! Each call to [`SecretCipher::encrypt`] draws a fresh random salt and nonce.
//! The salt is combined with the process-wide [`MasterSecret`] through
//! PBKDF2-HMAC-SHA256 to derive a one-off AES-256-GCM key, so the stored
//! ciphertext can only be opened with the same master secret and salt.
//!
//! Stored layout of the ciphertext: `NONCE (12 bytes) || AES-GCM output`.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("master secret must not be empty")]
    EmptyMasterSecret,
    #[error("random number generation failed")]
    Random,
    #[error("encryption failed")]
    Encryption,
    #[error("stored secret could not be decrypted")]
    Decryption,
    #[error("cipher task did not complete")]
    Task,
}

/// Server-held secret that every per-record key is derived from.
///
/// Read once at startup and never mutated; the bytes are zeroized on drop.
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, CipherError> {
        let secret = Zeroizing::new(secret.into());
        if secret.iter().all(|byte| byte.is_ascii_whitespace()) {
            return Err(CipherError::EmptyMasterSecret);
        }
        Ok(Self(secret))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterSecret").field(&"<redacted>").finish()
    }
}

/// Output of one encryption: ciphertext plus the salt needed to reopen it.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub ciphertext: Vec<u8>,
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSecret")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("salt", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SecretCipher {
    master: Arc<MasterSecret>,
    kdf_iterations: u32,
}

impl SecretCipher {
    pub fn new(master: MasterSecret) -> Self {
        Self {
            master: Arc::new(master),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations.max(1);
        self
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<SealedSecret, CipherError> {
        let mut salt = [0u8; SALT_LEN];
        getrandom::fill(&mut salt).map_err(|_| CipherError::Random)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes).map_err(|_| CipherError::Random)?;

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CipherError::Encryption)?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);
        Ok(SealedSecret {
            ciphertext,
            salt: salt.to_vec(),
        })
    }

    /// Fails with [`CipherError::Decryption`] when the tag does not verify:
    /// wrong salt, corrupted bytes, or a rotated master secret.
    pub fn decrypt(&self, ciphertext: &[u8], salt: &[u8]) -> Result<Zeroizing<String>, CipherError> {
        if salt.len() != SALT_LEN || ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Decryption);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CipherError::Decryption)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), sealed)
                .map_err(|_| CipherError::Decryption)?,
        );

        let text = std::str::from_utf8(plaintext.as_slice()).map_err(|_| CipherError::Decryption)?;
        Ok(Zeroizing::new(text.to_string()))
    }

    /// [`Self::encrypt`] on the blocking pool, off the async workers.
    pub async fn seal(&self, plaintext: &str) -> Result<SealedSecret, CipherError> {
        let cipher = self.clone();
        let plaintext = Zeroizing::new(plaintext.to_string());
        tokio::task::spawn_blocking(move || cipher.encrypt(&plaintext))
            .await
            .map_err(|_| CipherError::Task)?
    }

    /// [`Self::decrypt`] on the blocking pool, off the async workers.
    pub async fn open(
        &self,
        ciphertext: &[u8],
        salt: &[u8],
    ) -> Result<Zeroizing<String>, CipherError> {
        let cipher = self.clone();
        let ciphertext = ciphertext.to_vec();
        let salt = salt.to_vec();
        tokio::task::spawn_blocking(move || cipher.decrypt(&ciphertext, &salt))
            .await
            .map_err(|_| CipherError::Task)?
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(
            self.master.as_bytes(),
            salt,
            self.kdf_iterations,
            &mut out[..],
        );
        out
    }
}

/// One-way fingerprint of a plaintext key (lowercase hex SHA-256).
pub fn fingerprint(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex_lower(&hasher.finalize())
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(secret: &str) -> SecretCipher {
        SecretCipher::new(MasterSecret::new(secret).expect("secret")).with_kdf_iterations(1_000)
    }

    #[test]
    fn round_trips_plaintext() {
        let cipher = cipher("master-1");
        let sealed = cipher.encrypt("AIzaSyExampleKey0123456789").expect("encrypt");
        assert_eq!(sealed.salt.len(), SALT_LEN);
        let opened = cipher
            .decrypt(&sealed.ciphertext, &sealed.salt)
            .expect("decrypt");
        assert_eq!(opened.as_str(), "AIzaSyExampleKey0123456789");
    }

    #[test]
    fn each_encryption_uses_fresh_salt_and_nonce() {
        let cipher = cipher("master-1");
        let a = cipher.encrypt("same-key-material-xxxxx").expect("a");
        let b = cipher.encrypt("same-key-material-xxxxx").expect("b");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn rotated_master_secret_fails_to_decrypt() {
        let sealed = cipher("master-1").encrypt("secret-value-123456789").expect("encrypt");
        let err = cipher("master-2")
            .decrypt(&sealed.ciphertext, &sealed.salt)
            .unwrap_err();
        assert_eq!(err, CipherError::Decryption);
    }

    #[test]
    fn tampered_ciphertext_or_salt_is_detected() {
        let cipher = cipher("master-1");
        let sealed = cipher.encrypt("secret-value-123456789").expect("encrypt");

        let mut flipped = sealed.ciphertext.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert_eq!(
            cipher.decrypt(&flipped, &sealed.salt).unwrap_err(),
            CipherError::Decryption
        );

        let mut other_salt = sealed.salt.clone();
        other_salt[0] ^= 0xff;
        assert_eq!(
            cipher.decrypt(&sealed.ciphertext, &other_salt).unwrap_err(),
            CipherError::Decryption
        );

        assert_eq!(
            cipher.decrypt(&sealed.ciphertext[..8], &sealed.salt).unwrap_err(),
            CipherError::Decryption
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn seal_and_open_leave_the_runtime_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cipher = SecretCipher::new(MasterSecret::new("master-1").expect("secret"));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }
        });

        let sealed = cipher.seal("AIzaSyExampleKey0123456789").await.expect("seal");
        let after_seal = ticks.load(Ordering::Relaxed);
        let opened = cipher
            .open(&sealed.ciphertext, &sealed.salt)
            .await
            .expect("open");
        let after_open = ticks.load(Ordering::Relaxed);
        ticker.abort();

        assert_eq!(opened.as_str(), "AIzaSyExampleKey0123456789");
        assert!(after_seal > 0);
        assert!(after_open > after_seal);
        assert_eq!(
            cipher.open(&sealed.ciphertext, &[0; SALT_LEN]).await.unwrap_err(),
            CipherError::Decryption
        );
    }

    #[test]
    fn rejects_blank_master_secret() {
        assert_eq!(
            MasterSecret::new("   ").unwrap_err(),
            CipherError::EmptyMasterSecret
        );
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = fingerprint("abc");
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(a, fingerprint("abd"));
    }

    #[test]
    fn debug_output_hides_secret_material() {
        let secret = MasterSecret::new("super-secret").expect("secret");
        assert!(!format!("{secret:?}").contains("super-secret"));
    }
}
