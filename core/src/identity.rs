use crate::error::{RemoteError, Result};
use crate::fingerprint::Fingerprint;
use crate::storage;
use parking_lot::Mutex;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

const COMMON_NAME_PREFIX: &str = "UTM Remote";
const ORGANIZATION_NAME: &str = "UTM";
const VALIDITY_DAYS: i64 = 3650;

/// Which side of the remote protocol an identity authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "Client",
            Role::Server => "Server",
        }
    }

    fn storage_label(&self) -> &'static str {
        match self {
            Role::Client => "identity-client",
            Role::Server => "identity-server",
        }
    }
}

/// Key pair plus self-signed certificate for one role.
pub struct Identity {
    role: Role,
    common_name: String,
    certificate: CertificateDer<'static>,
    private_key: PrivatePkcs8KeyDer<'static>,
    fingerprint: Fingerprint,
}

impl Identity {
    fn from_stored(role: Role, stored: StoredIdentity) -> Self {
        let fingerprint = Fingerprint::of_certificate(&stored.cert_der);
        Self {
            role,
            common_name: stored.common_name,
            certificate: CertificateDer::from(stored.cert_der),
            private_key: PrivatePkcs8KeyDer::from(stored.key_der),
            fingerprint,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn certificate(&self) -> CertificateDer<'static> {
        self.certificate.clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.private_key.clone_key())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            role: self.role,
            common_name: self.common_name.clone(),
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone_key(),
            fingerprint: self.fingerprint,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("role", &self.role)
            .field("common_name", &self.common_name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Serialized form handed to a [`SecureStorage`] backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub common_name: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Platform credential facility holding the private key and certificate.
pub trait SecureStorage: Send + Sync {
    fn load(&self, label: &str) -> Result<Option<StoredIdentity>>;
    fn store(&self, label: &str, identity: &StoredIdentity) -> Result<()>;
    fn delete(&self, label: &str) -> Result<()>;
}

/// Owner-only JSON files in a private directory.
#[derive(Debug, Clone)]
pub struct FileSecureStorage {
    dir: PathBuf,
}

impl FileSecureStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        storage::ensure_private_dir(&dir)
            .map_err(|e| RemoteError::SecureStorage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}.json", label))
    }
}

impl SecureStorage for FileSecureStorage {
    fn load(&self, label: &str) -> Result<Option<StoredIdentity>> {
        let path = self.path(label);
        if !path.exists() {
            return Ok(None);
        }
        storage::check_private_permissions(&path);

        let data = std::fs::read(&path).map_err(|e| RemoteError::SecureStorage(e.to_string()))?;
        let stored = serde_json::from_slice(&data).map_err(|e| {
            RemoteError::SecureStorage(format!("Failed to parse identity: {}", e))
        })?;
        Ok(Some(stored))
    }

    fn store(&self, label: &str, identity: &StoredIdentity) -> Result<()> {
        let data = serde_json::to_vec_pretty(identity)?;
        storage::write_private_file(&self.path(label), &data)
            .map_err(|e| RemoteError::SecureStorage(e.to_string()))
    }

    fn delete(&self, label: &str) -> Result<()> {
        match std::fs::remove_file(self.path(label)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::SecureStorage(e.to_string())),
        }
    }
}

/// Process-local backend for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemorySecureStorage {
    items: Mutex<HashMap<String, StoredIdentity>>,
}

impl MemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStorage for MemorySecureStorage {
    fn load(&self, label: &str) -> Result<Option<StoredIdentity>> {
        Ok(self.items.lock().get(label).cloned())
    }

    fn store(&self, label: &str, identity: &StoredIdentity) -> Result<()> {
        self.items.lock().insert(label.to_string(), identity.clone());
        Ok(())
    }

    fn delete(&self, label: &str) -> Result<()> {
        self.items.lock().remove(label);
        Ok(())
    }
}

/// Loads, generates and resets the long-lived identity for one role.
pub struct IdentityStore {
    role: Role,
    device_name: String,
    backend: Box<dyn SecureStorage>,
    identity: Option<Identity>,
}

impl IdentityStore {
    pub fn new(role: Role, device_name: impl Into<String>, backend: Box<dyn SecureStorage>) -> Self {
        Self {
            role,
            device_name: device_name.into(),
            backend,
            identity: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn common_name(&self) -> String {
        format!(
            "{} {} ({})",
            COMMON_NAME_PREFIX,
            self.role.as_str(),
            self.device_name
        )
    }

    /// Return the persisted identity, generating and storing one on first use.
    pub fn load(&mut self) -> Result<Identity> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }

        let label = self.role.storage_label();
        let stored = match self.backend.load(label)? {
            Some(stored) => {
                debug!("Loaded existing {} identity", self.role.as_str());
                stored
            }
            None => {
                info!("No {} identity found, generating new one...", self.role.as_str());
                let stored = generate_identity(&self.common_name(), self.role)?;
                self.backend.store(label, &stored)?;
                stored
            }
        };

        let identity = Identity::from_stored(self.role, stored);
        info!(
            "{} identity ready: {} ({})",
            self.role.as_str(),
            identity.common_name(),
            identity.fingerprint().short()
        );
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        self.identity
            .as_ref()
            .map(Identity::fingerprint)
            .ok_or(RemoteError::IdentityNotLoaded)
    }

    /// Delete the persisted identity and generate a fresh one.
    ///
    /// Every peer that trusted the old fingerprint must approve the new one.
    pub fn reset(&mut self) -> Result<Identity> {
        let previous = self.identity.take().map(|i| i.fingerprint());
        self.backend.delete(self.role.storage_label())?;
        let identity = self.load()?;
        if let Some(previous) = previous {
            info!(
                "Reset {} identity {} -> {}",
                self.role.as_str(),
                previous.short(),
                identity.fingerprint().short()
            );
        }
        Ok(identity)
    }
}

fn generate_identity(common_name: &str, role: Role) -> Result<StoredIdentity> {
    let keygen = |e: rcgen::Error| RemoteError::KeyGeneration(e.to_string());

    let mut params = CertificateParams::new(vec!["utm-remote.local".to_string()]).map_err(keygen)?;

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name.push(DnType::OrganizationName, ORGANIZATION_NAME);
    params.distinguished_name = name;

    params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![match role {
        Role::Client => ExtendedKeyUsagePurpose::ClientAuth,
        Role::Server => ExtendedKeyUsagePurpose::ServerAuth,
    }];

    let key_pair = KeyPair::generate().map_err(keygen)?;
    let cert = params.self_signed(&key_pair).map_err(keygen)?;

    Ok(StoredIdentity {
        common_name: common_name.to_string(),
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
    })
}

/// Positive, non-zero 8-byte serial.
fn random_serial() -> [u8; 8] {
    let mut serial = [0u8; 8];
    serial.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
    serial[0] = (serial[0] & 0x7F) | 0x01;
    serial
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct SharedBackend(Arc<MemorySecureStorage>);

    impl SecureStorage for SharedBackend {
        fn load(&self, label: &str) -> Result<Option<StoredIdentity>> {
            self.0.load(label)
        }
        fn store(&self, label: &str, identity: &StoredIdentity) -> Result<()> {
            self.0.store(label, identity)
        }
        fn delete(&self, label: &str) -> Result<()> {
            self.0.delete(label)
        }
    }

    struct FailingBackend;

    impl SecureStorage for FailingBackend {
        fn load(&self, _label: &str) -> Result<Option<StoredIdentity>> {
            Ok(None)
        }
        fn store(&self, _label: &str, _identity: &StoredIdentity) -> Result<()> {
            Err(RemoteError::SecureStorage("keychain locked".into()))
        }
        fn delete(&self, _label: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_load_is_idempotent() {
        let mut store =
            IdentityStore::new(Role::Server, "test-mac", Box::new(MemorySecureStorage::new()));
        assert!(matches!(store.fingerprint(), Err(RemoteError::IdentityNotLoaded)));

        let first = store.load().unwrap();
        let second = store.load().unwrap();

        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(store.fingerprint().unwrap(), first.fingerprint());
        assert_eq!(first.common_name(), "UTM Remote Server (test-mac)");
        assert_eq!(
            first.fingerprint(),
            Fingerprint::of_certificate(first.certificate().as_ref())
        );
    }

    #[test]
    fn test_persisted_identity_survives_new_store() {
        let backend = Arc::new(MemorySecureStorage::new());
        let fp = IdentityStore::new(Role::Client, "ipad", Box::new(SharedBackend(backend.clone())))
            .load()
            .unwrap()
            .fingerprint();

        let reloaded = IdentityStore::new(Role::Client, "ipad", Box::new(SharedBackend(backend)))
            .load()
            .unwrap();
        assert_eq!(reloaded.fingerprint(), fp);
    }

    #[test]
    fn test_roles_do_not_share_identity() {
        let backend = Arc::new(MemorySecureStorage::new());
        let server = IdentityStore::new(Role::Server, "mac", Box::new(SharedBackend(backend.clone())))
            .load()
            .unwrap();
        let client = IdentityStore::new(Role::Client, "mac", Box::new(SharedBackend(backend)))
            .load()
            .unwrap();
        assert_ne!(server.fingerprint(), client.fingerprint());
    }

    #[test]
    fn test_reset_generates_new_fingerprint() {
        let mut store =
            IdentityStore::new(Role::Server, "mac", Box::new(MemorySecureStorage::new()));
        let before = store.load().unwrap().fingerprint();
        let after = store.reset().unwrap().fingerprint();

        assert_ne!(before, after);
        assert_eq!(store.fingerprint().unwrap(), after);
    }

    #[test]
    fn test_storage_failure_is_reported() {
        let mut store = IdentityStore::new(Role::Server, "mac", Box::new(FailingBackend));
        assert!(matches!(store.load(), Err(RemoteError::SecureStorage(_))));
        assert!(store.identity().is_none());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSecureStorage::new(dir.path()).unwrap();
        let fp = IdentityStore::new(Role::Server, "mac", Box::new(backend.clone()))
            .load()
            .unwrap()
            .fingerprint();

        assert!(dir.path().join("identity-server.json").exists());
        let reloaded = IdentityStore::new(Role::Server, "mac", Box::new(backend.clone()))
            .load()
            .unwrap();
        assert_eq!(reloaded.fingerprint(), fp);

        backend.delete("identity-server").unwrap();
        backend.delete("identity-server").unwrap();
        assert!(!dir.path().join("identity-server.json").exists());
    }
}
