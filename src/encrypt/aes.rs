// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! AES-256-GCM encryptor.
//!
//! Key derivation: Argon2id(passphrase, salt) → 32-byte key. The 16-byte
//! salt is generated when a bag is first written and persisted in the file
//! header record, so the same passphrase yields a different key per bag.
//!
//! Encrypted payload layout: `nonce (12 B) || ciphertext || GCM tag (16 B)`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};

use crate::core::{BagError, Result};
use crate::types::FieldMap;

use super::Encryptor;

/// Registry name of this encryptor.
pub const AES_PLUGIN_NAME: &str = "aes";

/// File header field holding the key-derivation salt.
const SALT_FIELD_NAME: &str = "salt";

/// Byte length of the AES-GCM nonce prepended to every encrypted payload.
const NONCE_LEN: usize = 12;

/// Byte length of the key-derivation salt.
const SALT_LEN: usize = 16;

/// AES-256-GCM encryptor keyed from a passphrase.
pub struct AesGcmEncryptor {
    key: Option<[u8; 32]>,
    salt: [u8; SALT_LEN],
}

impl Default for AesGcmEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl AesGcmEncryptor {
    /// Create an uninitialized encryptor.
    pub fn new() -> Self {
        AesGcmEncryptor {
            key: None,
            salt: [0u8; SALT_LEN],
        }
    }

    /// Derive a 256-bit key from a passphrase and salt using Argon2id.
    fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
        let params = Params::new(64 * 1024, 3, 1, Some(32))
            .map_err(|e| BagError::bag(format!("key derivation setup failed: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| BagError::bag(format!("key derivation failed: {e}")))?;
        Ok(key)
    }

    fn key(&self) -> Result<&[u8; 32]> {
        self.key
            .as_ref()
            .ok_or_else(|| BagError::bag("aes encryptor used before initialization"))
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(self.key()?)
            .map_err(|_| BagError::bag("aes cipher setup failed"))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plain)
            .map_err(|_| BagError::bag("chunk encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(BagError::format(format!(
                "encrypted payload too short: {} bytes",
                data.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(self.key()?)
            .map_err(|_| BagError::bag("aes cipher setup failed"))?;
        let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| BagError::format("decryption failed: wrong passphrase or corrupted data"))
    }
}

impl Encryptor for AesGcmEncryptor {
    fn init_for_writing(&mut self, param: &str) -> Result<()> {
        if param.is_empty() {
            return Err(BagError::bag("aes encryptor requires a passphrase"));
        }
        let mut salt = [0u8; SALT_LEN];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut salt);
        self.salt = salt;
        self.key = Some(Self::derive_key(param, &salt)?);
        Ok(())
    }

    fn init_for_reading(&mut self, param: &str, fields: &FieldMap) -> Result<()> {
        if param.is_empty() {
            return Err(BagError::bag(
                "bag is encrypted; set the aes encryptor passphrase before opening",
            ));
        }
        let salt = fields
            .get(SALT_FIELD_NAME)
            .ok_or_else(|| BagError::format("encrypted bag is missing its salt field"))?;
        if salt.len() != SALT_LEN {
            return Err(BagError::format(format!(
                "bad salt length {} in file header",
                salt.len()
            )));
        }
        self.salt.copy_from_slice(salt);
        self.key = Some(Self::derive_key(param, &self.salt)?);
        Ok(())
    }

    fn add_fields_to_file_header(&self, fields: &mut FieldMap) -> Result<()> {
        self.key()?;
        fields.insert(SALT_FIELD_NAME.to_string(), self.salt.to_vec());
        Ok(())
    }

    fn encrypt_chunk(&self, plain: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(plain)
    }

    fn decrypt_chunk(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(data)
    }

    fn rewrite_connection_record(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(data)
    }

    fn read_connection_record(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(data)
    }
}
