//! Anonymous-sender sealed boxes.
//!
//! Wire-compatible with libsodium's `crypto_box_seal`: an ephemeral X25519
//! key is generated per message, prepended to the ciphertext, and combined
//! with the recipient's key to derive an XSalsa20-Poly1305 key. The sender
//! keeps no identity; only the recipient's private key opens the box.
//!
//! # Wire Format
//!
//! ```text
//! ephemeral_pk (32) || xsalsa20poly1305(msg) (len + 16)
//! ```
//!
//! Provisioning secrets arrive base64 (standard alphabet) encoded.
//!
//! Opening fails closed: a wrong keypair, a truncated box or a flipped bit
//! all return [`CryptoError`] and never partial plaintext.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::aead::OsRng;
use crypto_box::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::DeviceIdentity;

/// Bytes added to every sealed message (ephemeral key + Poly1305 tag).
pub const SEAL_OVERHEAD: usize = 32 + 16;

/// Seal `plaintext` to `recipient_public_key`.
pub fn seal(plaintext: &[u8], recipient_public_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    PublicKey::from(*recipient_public_key)
        .seal(&mut OsRng, plaintext)
        .map_err(|e| CryptoError(format!("seal failed: {e}")))
}

/// Open a sealed box addressed to the given keypair.
pub fn open(
    ciphertext: &[u8],
    recipient_public_key: &[u8; 32],
    recipient_private_key: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < SEAL_OVERHEAD {
        return Err(CryptoError(format!(
            "ciphertext too short ({} bytes)",
            ciphertext.len()
        )));
    }

    let secret = SecretKey::from(*recipient_private_key);
    if secret.public_key().as_bytes() != recipient_public_key {
        return Err(CryptoError("public key does not match private key".to_string()));
    }

    secret
        .unseal(ciphertext)
        .map_err(|_aead| CryptoError("authentication failed".to_string()))
}

/// Decode a base64 sealed box and open it as UTF-8 text.
pub fn open_base64_str(
    sealed_b64: &str,
    identity: &DeviceIdentity,
) -> Result<Zeroizing<String>, CryptoError> {
    let ciphertext = BASE64
        .decode(sealed_b64.trim())
        .map_err(|e| CryptoError(format!("invalid base64: {e}")))?;

    let plaintext = Zeroizing::new(open(
        &ciphertext,
        identity.public_key(),
        identity.private_key(),
    )?);

    std::str::from_utf8(&plaintext)
        .map(|s| Zeroizing::new(s.to_string()))
        .map_err(|_utf8| CryptoError("plaintext is not valid UTF-8".to_string()))
}

/// Seal UTF-8 text and base64-encode it, as the control plane does.
pub fn seal_base64_str(plaintext: &str, recipient_public_key: &[u8; 32]) -> Result<String, CryptoError> {
    seal(plaintext.as_bytes(), recipient_public_key).map(|sealed| BASE64.encode(sealed))
}
