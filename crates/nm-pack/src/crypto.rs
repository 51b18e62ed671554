//! Content encryption and signing.
//!
//! Per-resource AES-256-GCM with a fresh 12-byte IV; the 16-byte tag rides at
//! the end of the ciphertext. Pack signatures are RSA PKCS#1 v1.5 over the
//! SHA-256 of everything before the signature trailer. Keys come from the
//! environment, never from the pack.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::secure::SecureBytes;

/// Environment variable holding the AES-256 key as 64 hex characters.
pub const ENV_AES_KEY_HEX: &str = "NOVELMIND_PACK_AES_KEY_HEX";
/// Environment variable pointing at a file with the raw 32-byte key.
pub const ENV_AES_KEY_FILE: &str = "NOVELMIND_PACK_AES_KEY_FILE";
/// Environment variable pointing at the RSA public key PEM used for
/// signature verification.
pub const ENV_PUBLIC_KEY: &str = "NOVELMIND_PACK_PUBLIC_KEY";

pub const AES_KEY_LEN: usize = 32;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error(
        "no encryption key available; set {ENV_AES_KEY_HEX} or {ENV_AES_KEY_FILE}"
    )]
    KeyMissing,
    #[error("encryption key must be {AES_KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("encryption key is not valid hex: {0}")]
    BadKeyHex(#[from] hex::FromHexError),
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("AES-GCM encryption failed")]
    EncryptFailed,
    #[error("AES-GCM tag verification failed")]
    GcmTagInvalid,
    #[error("failed to parse RSA key: {0}")]
    BadRsaKey(String),
    #[error("RSA signing failed: {0}")]
    SignFailed(rsa::Error),
    #[error("RSA signature verification failed")]
    SignatureInvalid,
}

/// IV source. Deterministic builds seed a ChaCha20 stream so pack bytes are a
/// pure function of inputs; everything else uses the OS CSPRNG.
pub enum IvSource {
    Os,
    Seeded(ChaCha20Rng),
}

impl IvSource {
    pub fn from_seed(seed: u64) -> Self {
        IvSource::Seeded(ChaCha20Rng::seed_from_u64(seed))
    }

    pub fn next_iv(&mut self) -> [u8; GCM_IV_LEN] {
        let mut iv = [0u8; GCM_IV_LEN];
        match self {
            IvSource::Os => OsRng.fill_bytes(&mut iv),
            IvSource::Seeded(rng) => rng.fill_bytes(&mut iv),
        }
        iv
    }
}

/// Load the AES key from the environment (hex first, then file).
pub fn load_aes_key_from_env() -> Result<SecureBytes, CryptoError> {
    if let Ok(hex_key) = std::env::var(ENV_AES_KEY_HEX) {
        let bytes = hex::decode(hex_key.trim())?;
        return secure_key(bytes);
    }
    if let Ok(path) = std::env::var(ENV_AES_KEY_FILE) {
        let bytes = std::fs::read(&path).map_err(|source| CryptoError::KeyFile {
            path: path.clone(),
            source,
        })?;
        return secure_key(bytes);
    }
    Err(CryptoError::KeyMissing)
}

fn secure_key(bytes: Vec<u8>) -> Result<SecureBytes, CryptoError> {
    if bytes.len() != AES_KEY_LEN {
        return Err(CryptoError::BadKeyLength(bytes.len()));
    }
    Ok(SecureBytes::new(bytes))
}

/// Encrypt one resource payload; returns ciphertext with the tag appended.
pub fn encrypt_resource(
    key: &SecureBytes,
    iv: &[u8; GCM_IV_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose()));
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Decrypt one resource payload, verifying the GCM tag. Tag failure is fatal
/// for the read.
pub fn decrypt_resource(
    key: &SecureBytes,
    iv: &[u8; GCM_IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose()));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::GcmTagInvalid)
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

pub fn load_private_key_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::BadRsaKey(e.to_string()))
}

pub fn load_public_key_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::BadRsaKey(e.to_string()))
}

/// Sign `bytes` (the full pack minus trailer) with RSA PKCS#1 v1.5 / SHA-256.
pub fn sign(private_key: &RsaPrivateKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(bytes);
    private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(CryptoError::SignFailed)
}

pub fn verify(
    public_key: &RsaPublicKey,
    bytes: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let digest = Sha256::digest(bytes);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecureBytes {
        SecureBytes::new((0u8..32).collect())
    }

    #[test]
    fn encrypt_appends_tag_and_round_trips() {
        let key = test_key();
        let iv = [7u8; GCM_IV_LEN];
        let plaintext = b"the pack payload";
        let ciphertext = encrypt_resource(&key, &iv, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + GCM_TAG_LEN);
        let back = decrypt_resource(&key, &iv, &ciphertext).unwrap();
        assert_eq!(back, plaintext);
    }

    #[test]
    fn tamper_is_detected_by_tag() {
        let key = test_key();
        let iv = [1u8; GCM_IV_LEN];
        let mut ciphertext = encrypt_resource(&key, &iv, b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(
            decrypt_resource(&key, &iv, &ciphertext),
            Err(CryptoError::GcmTagInvalid)
        ));
    }

    #[test]
    fn seeded_iv_source_is_reproducible() {
        let mut a = IvSource::from_seed(42);
        let mut b = IvSource::from_seed(42);
        assert_eq!(a.next_iv(), b.next_iv());
        assert_eq!(a.next_iv(), b.next_iv());
        let mut c = IvSource::from_seed(43);
        assert_ne!(a.next_iv(), c.next_iv());
    }

    #[test]
    fn rsa_sign_verify_round_trip() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let payload = b"pack bytes before trailer";
        let signature = sign(&private_key, payload).unwrap();
        verify(&public_key, payload, &signature).unwrap();
        assert!(matches!(
            verify(&public_key, b"tampered", &signature),
            Err(CryptoError::SignatureInvalid)
        ));
    }

    #[test]
    fn env_key_loading_prefers_hex() {
        // Serialized through a lock-free convention: tests in this module do
        // not run the env path concurrently.
        std::env::set_var(ENV_AES_KEY_HEX, hex::encode([9u8; 32]));
        let key = load_aes_key_from_env().unwrap();
        assert_eq!(key.expose(), &[9u8; 32]);
        std::env::remove_var(ENV_AES_KEY_HEX);
    }

    #[test]
    fn bad_key_length_rejected() {
        assert!(matches!(
            secure_key(vec![0u8; 16]),
            Err(CryptoError::BadKeyLength(16))
        ));
    }
}
