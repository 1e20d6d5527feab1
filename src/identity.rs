// src/identity.rs
use crate::error::{RuntimeError, RuntimeResult};
use crate::store::{LocalStore, StoredKey};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Utc;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePublicKey;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

const FINGERPRINT_DOMAIN: &str = "display-fingerprint/v1";

/// A persisted ed25519 keypair scoped to one physical output.
pub struct DisplayKeyPair {
    alias: String,
    signing: SigningKey,
    public_key_pem: String,
}

impl DisplayKeyPair {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn sign_text(&self, text: &str) -> String {
        sign_text(&self.signing, text)
    }
}

impl std::fmt::Debug for DisplayKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayKeyPair")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

pub fn derive_fingerprint(machine_id: &str, display_output: &str) -> RuntimeResult<String> {
    let machine_id = machine_id.trim();
    let display_output = display_output.trim();
    if machine_id.is_empty() {
        return Err(RuntimeError::Identity("machine id is missing".into()));
    }
    if display_output.is_empty() {
        return Err(RuntimeError::Identity("display output is missing".into()));
    }
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN.as_bytes());
    hasher.update(b"\n");
    hasher.update(machine_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(display_output.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn key_alias(fingerprint: &str, display_output: &str) -> String {
    format!("{fingerprint}:{display_output}")
}

pub fn read_machine_id(path: impl AsRef<Path>) -> RuntimeResult<String> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RuntimeError::Identity(format!("read {}: {e}", path.display())))?;
    let id = raw.trim();
    if id.is_empty() {
        return Err(RuntimeError::Identity(format!("{} is empty", path.display())));
    }
    Ok(id.to_string())
}

pub fn export_public_key_pem(key: &VerifyingKey) -> RuntimeResult<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| RuntimeError::Identity(format!("encode public key: {e}")))
}

pub fn sign_text(key: &SigningKey, text: &str) -> String {
    B64.encode(key.sign(text.as_bytes()).to_bytes())
}

/// Loads the keypair stored under `alias`, generating and persisting one first
/// if none exists. Never hands out a key that is not in the store.
pub async fn get_or_create_key_pair(store: &LocalStore, alias: &str) -> RuntimeResult<DisplayKeyPair> {
    if let Some(stored) = store.key(alias).await? {
        return decode_stored(stored);
    }

    let signing = SigningKey::generate(&mut OsRng);
    let candidate = StoredKey {
        key_alias: alias.to_string(),
        secret_key_b64: B64.encode(signing.to_bytes()),
        public_key_pem: export_public_key_pem(&signing.verifying_key())?,
        created_at: Utc::now(),
    };
    store.insert_key_if_absent(&candidate).await?;

    let stored = store
        .key(alias)
        .await?
        .ok_or_else(|| RuntimeError::Identity(format!("key {alias} vanished after insert")))?;
    if stored.secret_key_b64 == candidate.secret_key_b64 {
        info!("generated new display key for alias {alias}");
    }
    decode_stored(stored)
}

/// Loads an existing keypair; a missing key means this output must re-register.
pub async fn load_key_pair(store: &LocalStore, alias: &str) -> RuntimeResult<DisplayKeyPair> {
    match store.key(alias).await? {
        Some(stored) => decode_stored(stored),
        None => Err(RuntimeError::Identity(format!(
            "no key stored under {alias}; register this output again"
        ))),
    }
}

fn decode_stored(stored: StoredKey) -> RuntimeResult<DisplayKeyPair> {
    let bytes = B64
        .decode(&stored.secret_key_b64)
        .map_err(|e| RuntimeError::Identity(format!("stored key {}: {e}", stored.key_alias)))?;
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        RuntimeError::Identity(format!("stored key {} has wrong length", stored.key_alias))
    })?;
    let signing = SigningKey::from_bytes(&seed);
    let public_key_pem = export_public_key_pem(&signing.verifying_key())?;
    if public_key_pem.trim() != stored.public_key_pem.trim() {
        return Err(RuntimeError::Identity(format!(
            "stored key {} does not match its public key",
            stored.key_alias
        )));
    }
    Ok(DisplayKeyPair {
        alias: stored.key_alias,
        signing,
        public_key_pem,
    })
}
