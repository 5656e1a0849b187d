//! Device identity: an X25519 keypair plus a random device id.
//!
//! The public key is what the control plane seals provisioning secrets to;
//! the device id names this installation in every control-plane request.
//! Persistence lives in [`crate::vault`]; this module only models and
//! generates the identity.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::aead::OsRng;
use crypto_box::SecretKey;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// The device's long-lived identity.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    public_key: [u8; 32],
    private_key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Generate a fresh keypair and device id.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public_key = *secret.public_key().as_bytes();
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            public_key,
            private_key: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Rebuild an identity from stored parts.
    ///
    /// Returns `None` if the public key was not derived from the private key,
    /// which means the stored identity is torn and must be regenerated.
    pub fn from_parts(device_id: String, public_key: [u8; 32], private_key: [u8; 32]) -> Option<Self> {
        let private_key = Zeroizing::new(private_key);
        let derived = SecretKey::from(*private_key).public_key();
        if derived.as_bytes() != &public_key {
            return None;
        }
        Some(Self {
            device_id,
            public_key,
            private_key,
        })
    }

    /// Stable device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// X25519 public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// X25519 private key.
    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    /// Public key, standard base64 (the `pubkey_b64` wire field).
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }

    /// Human-readable fingerprint for visual verification.
    ///
    /// First 8 bytes of SHA-256(public key), hex, colon separated.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// Fingerprint of an arbitrary public key.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let hash = Sha256::digest(public_key);
    hash[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Default device name based on hostname.
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map_or_else(|| "Tether Agent".to_string(), |h| format!("Tether Agent ({})", h))
}

/// Decode a base64 32-byte key.
pub(crate) fn decode_key(b64: &str) -> Option<[u8; 32]> {
    BASE64.decode(b64).ok()?.try_into().ok()
}
