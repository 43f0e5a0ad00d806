//! Credential vault
//!
//! Symmetric encryption for refresh/access tokens, provider API keys and
//! cloud credentials. AES-256-CBC with a process-lifetime key derived from
//! the configured secret via scrypt. Blobs are self-delimiting:
//! `hex(iv):hex(ciphertext)`.
//!
//! Absent fields must round-trip: empty input encrypts/decrypts to the empty
//! string, and a malformed blob decrypts to the empty string (logged at WARN)
//! rather than failing the request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use scrypt::Params;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Fixed per-deployment salt. Changing it invalidates every stored secret.
const KEY_SALT: &[u8] = b"relay-gateway-credential-salt";

const DECRYPT_CACHE_MAX: usize = 500;
const DECRYPT_CACHE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    plain: String,
    inserted: Instant,
}

#[derive(Clone)]
pub struct Vault {
    key: [u8; 32],
    decrypt_cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl Vault {
    pub fn new(secret: &str) -> Self {
        Self {
            key: derive_key(secret),
            decrypt_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Encrypt a plaintext secret. Empty input yields an empty blob.
    pub fn encrypt(&self, plain: &str) -> String {
        if plain.is_empty() {
            return String::new();
        }
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);
        let cipher = match Aes256CbcEnc::new_from_slices(&self.key, &iv) {
            Ok(c) => c,
            Err(_) => return String::new(),
        };
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    /// Decrypt a stored blob. Empty or malformed input yields an empty
    /// string; callers treat that as "no secret".
    pub fn decrypt(&self, blob: &str) -> String {
        if blob.is_empty() {
            return String::new();
        }

        let cache_key = hex::encode(Sha256::digest(blob.as_bytes()));
        if let Ok(cache) = self.decrypt_cache.lock() {
            if let Some(entry) = cache.get(&cache_key) {
                if entry.inserted.elapsed() < DECRYPT_CACHE_TTL {
                    return entry.plain.clone();
                }
            }
        }

        let plain = match self.decrypt_inner(blob) {
            Some(plain) => plain,
            None => {
                crate::logger::warn("crypto", "Failed to decrypt credential blob, treating as empty");
                return String::new();
            }
        };

        if let Ok(mut cache) = self.decrypt_cache.lock() {
            prune_cache(&mut cache);
            cache.insert(
                cache_key,
                CacheEntry {
                    plain: plain.clone(),
                    inserted: Instant::now(),
                },
            );
        }

        plain
    }

    fn decrypt_inner(&self, blob: &str) -> Option<String> {
        let (iv_hex, ct_hex) = blob.split_once(':')?;
        let iv = hex::decode(iv_hex).ok()?;
        let ciphertext = hex::decode(ct_hex).ok()?;
        if iv.len() != 16 || ciphertext.is_empty() {
            return None;
        }
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &iv).ok()?;
        let plain = cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext).ok()?;
        String::from_utf8(plain).ok()
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    // scrypt N=16384, r=8, p=1; interactive-grade parameters; the key is
    // derived once per process.
    let params = Params::new(14, 8, 1, 32).expect("static scrypt params");
    let mut key = [0u8; 32];
    scrypt::scrypt(secret.as_bytes(), KEY_SALT, &params, &mut key)
        .expect("scrypt output length is fixed");
    key
}

fn prune_cache(cache: &mut HashMap<String, CacheEntry>) {
    cache.retain(|_, entry| entry.inserted.elapsed() < DECRYPT_CACHE_TTL);
    while cache.len() >= DECRYPT_CACHE_MAX {
        let oldest = cache
            .iter()
            .min_by_key(|(_, entry)| entry.inserted)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                cache.remove(&key);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new("test-secret")
    }

    #[test]
    fn round_trip() {
        let v = vault();
        for plain in ["x", "refresh-token-value", "πρβ unicode ✓", &"a".repeat(4096)] {
            let blob = v.encrypt(plain);
            assert_ne!(blob, plain);
            assert!(blob.contains(':'));
            assert_eq!(v.decrypt(&blob), plain);
        }
    }

    #[test]
    fn empty_round_trips_to_empty() {
        let v = vault();
        assert_eq!(v.encrypt(""), "");
        assert_eq!(v.decrypt(""), "");
    }

    #[test]
    fn tampered_blob_yields_empty() {
        let v = vault();
        let blob = v.encrypt("secret");
        let mut tampered = blob.clone();
        tampered.pop();
        tampered.push('0');
        // Flipping the last ciphertext nibble breaks padding or content;
        // either way decrypt must not panic.
        let out = v.decrypt(&tampered);
        assert!(out.is_empty() || out != "secret");
        assert_eq!(v.decrypt("not-a-blob"), "");
        assert_eq!(v.decrypt("zz:zz"), "");
        assert_eq!(v.decrypt("00ff:"), "");
    }

    #[test]
    fn distinct_ivs_per_encrypt() {
        let v = vault();
        assert_ne!(v.encrypt("same"), v.encrypt("same"));
    }

    #[test]
    fn decrypt_cache_serves_repeat_lookups() {
        let v = vault();
        let blob = v.encrypt("cached");
        assert_eq!(v.decrypt(&blob), "cached");
        assert_eq!(v.decrypt(&blob), "cached");
        let cache = v.decrypt_cache.lock().unwrap();
        assert_eq!(cache.len(), 1);
    }
}
