//! Identity & secret store.
//!
//! [`Vault`] layers the device identity and the provisioned credential set
//! over a [`SecretStore`]. It is the only component that writes secrets;
//! the auth gate and webhook dispatcher only read through it.
//!
//! # Layout
//!
//! ```text
//! identity/device_id     uuid v4
//! identity/public_key    base64 X25519 public key
//! identity/private_key   base64 X25519 private key
//! server/password        local API password
//! server/webhook_secret  outbound webhook signing secret
//! ```

use std::sync::{Arc, Mutex};

use crate::constants::{NS_IDENTITY, NS_SERVER};
use crate::error::StoreError;
use crate::identity::{decode_key, DeviceIdentity};
use crate::keyring::SecretStore;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_DEVICE_ID: &str = "device_id";
const KEY_PUBLIC: &str = "public_key";
const KEY_PRIVATE: &str = "private_key";
const KEY_PASSWORD: &str = "password";
const KEY_WEBHOOK_SECRET: &str = "webhook_secret";

/// Credentials issued by one successful provisioning.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    /// Password guarding the local API.
    pub server_password: Option<String>,
    /// Secret attached to outbound webhook deliveries.
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("server_password", &self.server_password.as_ref().map(|_| "<redacted>"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Identity and credential accessors over a secret store.
#[derive(Debug, Clone)]
pub struct Vault {
    store: Arc<dyn SecretStore>,
    // Serializes identity creation and credential replacement.
    write_lock: Arc<Mutex<()>>,
}

impl Vault {
    /// Wrap a backing store.
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_poisoned| StoreError::Unavailable("vault lock poisoned".into()))
    }

    /// Return the existing identity, or create and persist one.
    ///
    /// The flag is `true` only for the call that created it. A partial or
    /// inconsistent stored identity is replaced as a whole.
    pub fn ensure_identity(&self) -> Result<(DeviceIdentity, bool), StoreError> {
        let _guard = self.guard()?;

        if let Some(identity) = self.load_identity()? {
            return Ok((identity, false));
        }

        let identity = DeviceIdentity::generate();
        self.store
            .set(NS_IDENTITY, KEY_PRIVATE, &BASE64.encode(identity.private_key()))?;
        self.store
            .set(NS_IDENTITY, KEY_PUBLIC, &identity.public_key_base64())?;
        self.store
            .set(NS_IDENTITY, KEY_DEVICE_ID, identity.device_id())?;

        log::info!(
            "Created new device identity: device_id={} fingerprint={}",
            identity.device_id(),
            identity.fingerprint()
        );
        Ok((identity, true))
    }

    fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let device_id = self.store.get(NS_IDENTITY, KEY_DEVICE_ID)?;
        let public = self.store.get(NS_IDENTITY, KEY_PUBLIC)?;
        let private = self.store.get(NS_IDENTITY, KEY_PRIVATE)?;

        let (Some(device_id), Some(public), Some(private)) = (device_id, public, private) else {
            return Ok(None);
        };

        let identity = decode_key(&public)
            .zip(decode_key(&private))
            .and_then(|(public, private)| DeviceIdentity::from_parts(device_id, public, private));

        if identity.is_none() {
            log::warn!("Stored device identity is inconsistent; generating a new one");
        }
        Ok(identity)
    }

    fn read(&self, namespace: &str, key: &str) -> Option<String> {
        match self.store.get(namespace, key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                log::warn!("Failed to read {namespace}/{key}: {e}");
                None
            }
        }
    }

    /// Stored public key, if any.
    pub fn get_public_key(&self) -> Option<[u8; 32]> {
        self.read(NS_IDENTITY, KEY_PUBLIC).and_then(|k| decode_key(&k))
    }

    /// Stored private key, if any.
    pub fn get_private_key(&self) -> Option<zeroize::Zeroizing<[u8; 32]>> {
        self.read(NS_IDENTITY, KEY_PRIVATE)
            .and_then(|k| decode_key(&k))
            .map(zeroize::Zeroizing::new)
    }

    /// Stored device id, if any.
    pub fn get_device_id(&self) -> Option<String> {
        self.read(NS_IDENTITY, KEY_DEVICE_ID)
    }

    /// Store the local API password.
    pub fn store_server_password(&self, secret: &str) -> Result<(), StoreError> {
        self.store.set(NS_SERVER, KEY_PASSWORD, secret)
    }

    /// Local API password.
    ///
    /// Unlike the identity accessors this surfaces store failures, because
    /// the auth gate must not mistake an unreachable vault for "no password".
    pub fn get_server_password(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(NS_SERVER, KEY_PASSWORD)?
            .filter(|v| !v.is_empty()))
    }

    /// Store the webhook signing secret.
    pub fn store_webhook_secret(&self, secret: &str) -> Result<(), StoreError> {
        self.store.set(NS_SERVER, KEY_WEBHOOK_SECRET, secret)
    }

    /// Webhook signing secret.
    pub fn get_webhook_secret(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(NS_SERVER, KEY_WEBHOOK_SECRET)?
            .filter(|v| !v.is_empty()))
    }

    /// Replace the whole credential set. `None` fields are deleted.
    ///
    /// Both fields are written in one store operation, so a failure leaves
    /// the previous pair in place rather than a mix of old and new.
    pub fn store_credentials(&self, credentials: &CredentialSet) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        self.store.set_many(
            NS_SERVER,
            &[
                (KEY_PASSWORD, credentials.server_password.as_deref()),
                (KEY_WEBHOOK_SECRET, credentials.webhook_secret.as_deref()),
            ],
        )
    }

    /// Current credential set.
    pub fn credentials(&self) -> Result<CredentialSet, StoreError> {
        Ok(CredentialSet {
            server_password: self.get_server_password()?,
            webhook_secret: self.get_webhook_secret()?,
        })
    }

    /// Delete password and webhook secret, keeping the identity.
    pub fn clear_server_credentials(&self) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        self.store
            .set_many(NS_SERVER, &[(KEY_PASSWORD, None), (KEY_WEBHOOK_SECRET, None)])?;
        log::info!("Cleared server credentials");
        Ok(())
    }

    /// Delete the device keypair and id.
    pub fn clear_keypair(&self) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        self.store.delete(NS_IDENTITY, KEY_PRIVATE)?;
        self.store.delete(NS_IDENTITY, KEY_PUBLIC)?;
        self.store.delete(NS_IDENTITY, KEY_DEVICE_ID)?;
        log::info!("Cleared device keypair");
        Ok(())
    }

    /// Full wipe: identity and credentials.
    pub fn clear_all_credentials(&self) -> Result<(), StoreError> {
        self.clear_server_credentials()?;
        self.clear_keypair()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::MemoryStore;

    fn vault() -> (Vault, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Vault::new(store.clone()), store)
    }

    #[test]
    fn test_ensure_identity_is_idempotent() {
        let (vault, _) = vault();
        let (first, created) = vault.ensure_identity().unwrap();
        assert!(created);

        let (second, created) = vault.ensure_identity().unwrap();
        assert!(!created);
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_ensure_identity_concurrent_calls_agree() {
        let (vault, _) = vault();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vault = vault.clone();
                std::thread::spawn(move || vault.ensure_identity().unwrap())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(id, _)| id.device_id() == first.device_id()));
    }

    #[test]
    fn test_accessors_absent_before_identity() {
        let (vault, _) = vault();
        assert_eq!(vault.get_device_id(), None);
        assert_eq!(vault.get_public_key(), None);
        assert!(vault.get_private_key().is_none());

        let (id, _) = vault.ensure_identity().unwrap();
        assert_eq!(vault.get_device_id().as_deref(), Some(id.device_id()));
        assert_eq!(vault.get_public_key(), Some(*id.public_key()));
        assert_eq!(vault.get_private_key().as_deref(), Some(id.private_key()));
    }

    #[test]
    fn test_accessors_swallow_store_errors() {
        let (vault, store) = vault();
        vault.ensure_identity().unwrap();
        store.set_unavailable(true);
        assert_eq!(vault.get_device_id(), None);
    }

    #[test]
    fn test_partial_identity_is_replaced() {
        let (vault, store) = vault();
        store.set(NS_IDENTITY, KEY_DEVICE_ID, "orphan").unwrap();

        let (id, created) = vault.ensure_identity().unwrap();
        assert!(created);
        assert_ne!(id.device_id(), "orphan");
    }

    #[test]
    fn test_ensure_identity_store_unavailable() {
        let (vault, store) = vault();
        store.set_unavailable(true);
        assert!(matches!(
            vault.ensure_identity(),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_store_credentials_replaces_not_merges() {
        let (vault, _) = vault();
        vault
            .store_credentials(&CredentialSet {
                server_password: Some("old-pass".into()),
                webhook_secret: Some("old-secret".into()),
            })
            .unwrap();

        vault
            .store_credentials(&CredentialSet {
                server_password: Some("new-pass".into()),
                webhook_secret: None,
            })
            .unwrap();

        let creds = vault.credentials().unwrap();
        assert_eq!(creds.server_password.as_deref(), Some("new-pass"));
        assert_eq!(creds.webhook_secret, None);
    }

    /// Store that accepts a fixed number of write calls, then refuses.
    #[derive(Debug)]
    struct WriteBudgetStore {
        inner: MemoryStore,
        writes_left: std::sync::atomic::AtomicUsize,
    }

    impl WriteBudgetStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                writes_left: std::sync::atomic::AtomicUsize::new(usize::MAX),
            }
        }

        fn allow_writes(&self, n: usize) {
            self.writes_left.store(n, std::sync::atomic::Ordering::SeqCst);
        }

        fn spend(&self) -> Result<(), StoreError> {
            use std::sync::atomic::Ordering;
            self.writes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(|_| ())
                .map_err(|_| StoreError::Unavailable("write refused".into()))
        }
    }

    impl SecretStore for WriteBudgetStore {
        fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(namespace, key)
        }

        fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
            self.spend()?;
            self.inner.set(namespace, key, value)
        }

        fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
            self.spend()?;
            self.inner.delete(namespace, key)
        }

        fn set_many(&self, namespace: &str, changes: &[(&str, Option<&str>)]) -> Result<(), StoreError> {
            self.spend()?;
            self.inner.set_many(namespace, changes)
        }
    }

    #[test]
    fn test_store_credentials_failure_keeps_previous_pair() {
        let store = Arc::new(WriteBudgetStore::new());
        let vault = Vault::new(store.clone());
        let old = CredentialSet {
            server_password: Some("old-pass".into()),
            webhook_secret: Some("old-secret".into()),
        };
        vault.store_credentials(&old).unwrap();

        // Refused outright: nothing changes.
        store.allow_writes(0);
        let new = CredentialSet {
            server_password: Some("new-pass".into()),
            webhook_secret: Some("new-secret".into()),
        };
        assert!(vault.store_credentials(&new).is_err());
        assert_eq!(vault.credentials().unwrap(), old);

        // One write is enough for the whole set.
        store.allow_writes(1);
        vault.store_credentials(&new).unwrap();
        assert_eq!(vault.credentials().unwrap(), new);
    }

    #[test]
    fn test_clear_server_credentials_keeps_identity() {
        let (vault, _) = vault();
        let (id, _) = vault.ensure_identity().unwrap();
        vault.store_server_password("pw").unwrap();
        vault.store_webhook_secret("ws").unwrap();

        vault.clear_server_credentials().unwrap();

        assert_eq!(vault.get_server_password().unwrap(), None);
        assert_eq!(vault.get_webhook_secret().unwrap(), None);
        let (again, created) = vault.ensure_identity().unwrap();
        assert!(!created);
        assert_eq!(again.device_id(), id.device_id());
    }

    #[test]
    fn test_clear_all_credentials() {
        let (vault, store) = vault();
        vault.ensure_identity().unwrap();
        vault.store_server_password("pw").unwrap();

        vault.clear_all_credentials().unwrap();
        assert!(store.is_empty());

        let (_, created) = vault.ensure_identity().unwrap();
        assert!(created);
    }

    #[test]
    fn test_credential_set_debug_redacts() {
        let creds = CredentialSet {
            server_password: Some("hunter2".into()),
            webhook_secret: None,
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }
}
