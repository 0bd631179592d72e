// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Chunk and connection-record encryption.
//!
//! An [`Encryptor`] sits between compression and the file: chunk bodies are
//! encrypted after they are compressed and decrypted before they are
//! decompressed, and standalone (trailer) connection records have their
//! data section rewritten. Connection records inside a chunk body are
//! covered by whole-chunk encryption and are not rewritten separately.
//!
//! Encryptors are requested by name through a process-global registry,
//! populated at startup with the built-in AES-256-GCM implementation.
//! External code can register additional implementations; dynamic library
//! loading stays outside the engine.

pub mod aes;

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::core::{BagError, Result};
use crate::types::FieldMap;

pub use aes::AesGcmEncryptor;

/// Contract for encrypting bag content.
///
/// One instance serves one bag. `init_for_writing` runs once before the
/// first chunk is written; `init_for_reading` runs when an encrypted bag is
/// opened, with the fields of the file header record.
pub trait Encryptor: Send {
    /// Prepare for writing. `param` is the plugin parameter given to
    /// [`Bag::set_encryptor`](crate::bag::Bag::set_encryptor), typically a
    /// passphrase.
    fn init_for_writing(&mut self, param: &str) -> Result<()>;

    /// Recover key material when opening an encrypted bag for reading or
    /// appending.
    fn init_for_reading(&mut self, param: &str, fields: &FieldMap) -> Result<()>;

    /// Persist public key material (never the key itself) into the file
    /// header record.
    fn add_fields_to_file_header(&self, fields: &mut FieldMap) -> Result<()>;

    /// Encrypt one compressed chunk body.
    fn encrypt_chunk(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt one chunk body read from the file.
    fn decrypt_chunk(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Rewrite the data section of a standalone connection record for
    /// writing.
    fn rewrite_connection_record(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of [`Encryptor::rewrite_connection_record`].
    fn read_connection_record(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Factory producing a fresh, uninitialized encryptor.
pub type EncryptorFactory = fn() -> Box<dyn Encryptor>;

fn registry() -> &'static Mutex<HashMap<String, EncryptorFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, EncryptorFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, EncryptorFactory> = HashMap::new();
        map.insert(aes::AES_PLUGIN_NAME.to_string(), || {
            Box::new(AesGcmEncryptor::new())
        });
        Mutex::new(map)
    })
}

/// Register an encryptor implementation under `name`, replacing any
/// previous registration.
pub fn register_encryptor(name: &str, factory: EncryptorFactory) {
    registry()
        .lock()
        .expect("encryptor registry poisoned")
        .insert(name.to_string(), factory);
}

/// Instantiate the encryptor registered under `name`.
pub fn create_encryptor(name: &str) -> Result<Box<dyn Encryptor>> {
    let registry = registry().lock().expect("encryptor registry poisoned");
    let factory = registry
        .get(name)
        .ok_or_else(|| BagError::bag(format!("unknown encryptor plugin: {name}")))?;
    Ok(factory())
}
