/*!
Device descriptors and the directory that supplies them.

Credentials are decrypted when a directory is loaded and live only in memory;
nothing in this crate writes them anywhere.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

use crate::error::ConfigError;
use crate::vendor::{Transport, Vendor};

/// Device identity, also used as a path component in the store and the
/// ingestion root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new<S: Into<String>>(id: S) -> Result<Self, ConfigError> {
        let id = id.into();
        if !Self::is_valid(&id) {
            return Err(ConfigError::InvalidValue {
                key: "device id".to_string(),
                value: id,
            });
        }
        Ok(Self(id))
    }

    /// A device id must be usable as a single path component.
    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id != "."
            && id != ".."
            && id.len() <= 128
            && !id.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Plaintext login material for one attempt
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub enable_secret: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field(
                "enable_secret",
                &self.enable_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Everything needed to reach one device
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    pub transport: Transport,
    pub vendor: Vendor,
    pub credentials: Credentials,
    pub active: bool,
}

impl DeviceDescriptor {
    /// Custom port if set, otherwise the transport default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }

    /// `host:port` form used in logs and error messages.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.effective_port())
        } else {
            format!("{}:{}", self.address, self.effective_port())
        }
    }
}

/// Decrypts credentials stored at rest by the host application
pub trait CredentialCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, ConfigError>;
}

/// Identity cipher for inventories that already hold plaintext
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl CredentialCipher for PlaintextCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, ConfigError> {
        Ok(ciphertext.to_string())
    }
}

/// Source of device descriptors
pub trait DeviceDirectory: Send + Sync {
    /// Devices eligible for scheduled collection.
    fn list_active(&self) -> Vec<DeviceDescriptor>;

    fn get(&self, id: &DeviceId) -> Option<DeviceDescriptor>;
}

/// In-memory directory
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    devices: BTreeMap<DeviceId, DeviceDescriptor>,
}

impl StaticDirectory {
    pub fn new<I: IntoIterator<Item = DeviceDescriptor>>(devices: I) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceDirectory for StaticDirectory {
    fn list_active(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().filter(|d| d.active).cloned().collect()
    }

    fn get(&self, id: &DeviceId) -> Option<DeviceDescriptor> {
        self.devices.get(id).cloned()
    }
}

/// On-disk inventory record; credential fields hold ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InventoryEntry {
    id: DeviceId,
    name: String,
    address: String,
    #[serde(default)]
    port: Option<u16>,
    transport: Transport,
    vendor: Vendor,
    username: String,
    password: String,
    #[serde(default)]
    enable_password: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl InventoryEntry {
    fn into_descriptor(self, cipher: &dyn CredentialCipher) -> Result<DeviceDescriptor, ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::validation(format!(
                "device {} has an empty address",
                self.id
            )));
        }
        let credentials = Credentials {
            username: cipher.decrypt(&self.username)?,
            password: cipher.decrypt(&self.password)?,
            enable_secret: self
                .enable_password
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| cipher.decrypt(s))
                .transpose()?,
        };
        Ok(DeviceDescriptor {
            id: self.id,
            name: self.name,
            address: self.address,
            port: self.port,
            transport: self.transport,
            vendor: self.vendor,
            credentials,
            active: self.active,
        })
    }
}

/// JSON inventory file: an array of device records
#[derive(Debug, Clone)]
pub struct JsonInventory {
    inner: StaticDirectory,
}

impl JsonInventory {
    pub fn load<P: AsRef<Path>>(path: P, cipher: &dyn CredentialCipher) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, cipher)
    }

    /// Parse an inventory. A malformed file is an error; a malformed entry
    /// (unknown vendor, bad transport, empty address, undecryptable
    /// credentials) is logged and skipped so the rest still load.
    pub fn from_json(raw: &str, cipher: &dyn CredentialCipher) -> Result<Self, ConfigError> {
        let entries: Vec<serde_json::Value> = serde_json::from_str(raw)?;
        let mut devices = Vec::with_capacity(entries.len());

        for (index, value) in entries.into_iter().enumerate() {
            let label = value
                .get("id")
                .and_then(|id| id.as_str())
                .unwrap_or("<missing>")
                .to_string();
            let parsed = serde_json::from_value::<InventoryEntry>(value)
                .map_err(ConfigError::from)
                .and_then(|entry| entry.into_descriptor(cipher));
            match parsed {
                Ok(device) => devices.push(device),
                Err(e) => {
                    warn!(entry = index, device = %label, error = %e, "Skipping inventory entry");
                }
            }
        }

        let inner = StaticDirectory::new(devices);
        Ok(Self { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl DeviceDirectory for JsonInventory {
    fn list_active(&self) -> Vec<DeviceDescriptor> {
        self.inner.list_active()
    }

    fn get(&self, id: &DeviceId) -> Option<DeviceDescriptor> {
        self.inner.get(id)
    }
}
