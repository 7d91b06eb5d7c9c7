//! Persisted driver, device and script records.
//!
//! The relational database of a full deployment is out of reach here; the
//! driver layer only needs keyed get/put/delete, expressed by [`RecordStore`].
//! Two implementations are provided: [`MemoryRecordStore`] and
//! [`JsonFileRecordStore`], which keeps everything in one JSON document.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::PoisonError;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use super::DeviceIdentity;
use super::DriverIdentity;
use super::SemanticVersion;

/// A driver script and its persisted driver singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDriver {
    pub identity: DriverIdentity,
    pub name: String,
    pub version: SemanticVersion,
    pub source: String,
    #[serde(default)]
    pub singleton_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceIdentity,
    pub name: String,
    pub room_id: String,
    pub driver: DriverIdentity,
    #[serde(default)]
    pub singleton_json: Option<serde_json::Value>,
}

/// An ordinary (non-driver) script owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    pub owner: String,
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Failed to access record file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode record file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode records: {0}")]
    Encode(#[source] serde_json::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn driver(&self, id: &DriverIdentity) -> Result<Option<DeviceDriver>, RecordError>;
    async fn drivers(&self) -> Result<Vec<DeviceDriver>, RecordError>;
    async fn put_driver(&self, driver: DeviceDriver) -> Result<(), RecordError>;
    async fn delete_driver(&self, id: &DriverIdentity) -> Result<bool, RecordError>;

    async fn device(&self, id: &DeviceIdentity) -> Result<Option<DeviceRecord>, RecordError>;
    async fn devices(&self) -> Result<Vec<DeviceRecord>, RecordError>;
    async fn put_device(&self, device: DeviceRecord) -> Result<(), RecordError>;
    async fn delete_device(&self, id: &DeviceIdentity) -> Result<bool, RecordError>;

    async fn script(&self, id: &str) -> Result<Option<ScriptRecord>, RecordError>;
    async fn put_script(&self, script: ScriptRecord) -> Result<(), RecordError>;

    /// Store the singleton blobs written by one invocation in a single step.
    async fn put_singletons(
        &self,
        driver: &DriverIdentity,
        driver_json: serde_json::Value,
        device: Option<(&DeviceIdentity, serde_json::Value)>,
    ) -> Result<(), RecordError>;
}

// =============================================================================
// Shared record table
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Records {
    drivers: BTreeMap<DriverIdentity, DeviceDriver>,
    devices: BTreeMap<DeviceIdentity, DeviceRecord>,
    scripts: BTreeMap<String, ScriptRecord>,
}

/// On-disk layout of [`JsonFileRecordStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    drivers: Vec<DeviceDriver>,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
    #[serde(default)]
    scripts: Vec<ScriptRecord>,
}

impl From<RecordFile> for Records {
    fn from(file: RecordFile) -> Self {
        Self {
            drivers: file
                .drivers
                .into_iter()
                .map(|d| (d.identity.clone(), d))
                .collect(),
            devices: file.devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            scripts: file.scripts.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }
}

impl From<&Records> for RecordFile {
    fn from(records: &Records) -> Self {
        Self {
            drivers: records.drivers.values().cloned().collect(),
            devices: records.devices.values().cloned().collect(),
            scripts: records.scripts.values().cloned().collect(),
        }
    }
}

impl Records {
    fn put_singletons(
        &mut self,
        driver: &DriverIdentity,
        driver_json: serde_json::Value,
        device: Option<(&DeviceIdentity, serde_json::Value)>,
    ) {
        if let Some(record) = self.drivers.get_mut(driver) {
            record.singleton_json = Some(driver_json);
        }
        if let Some((id, json)) = device {
            if let Some(record) = self.devices.get_mut(id) {
                record.singleton_json = Some(json);
            }
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Records>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Records) -> R) -> R {
        f(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Records) -> R) -> R {
        f(&mut self.records.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn driver(&self, id: &DriverIdentity) -> Result<Option<DeviceDriver>, RecordError> {
        Ok(self.read(|r| r.drivers.get(id).cloned()))
    }

    async fn drivers(&self) -> Result<Vec<DeviceDriver>, RecordError> {
        Ok(self.read(|r| r.drivers.values().cloned().collect()))
    }

    async fn put_driver(&self, driver: DeviceDriver) -> Result<(), RecordError> {
        self.write(|r| r.drivers.insert(driver.identity.clone(), driver));
        Ok(())
    }

    async fn delete_driver(&self, id: &DriverIdentity) -> Result<bool, RecordError> {
        Ok(self.write(|r| r.drivers.remove(id).is_some()))
    }

    async fn device(&self, id: &DeviceIdentity) -> Result<Option<DeviceRecord>, RecordError> {
        Ok(self.read(|r| r.devices.get(id).cloned()))
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, RecordError> {
        Ok(self.read(|r| r.devices.values().cloned().collect()))
    }

    async fn put_device(&self, device: DeviceRecord) -> Result<(), RecordError> {
        self.write(|r| r.devices.insert(device.id.clone(), device));
        Ok(())
    }

    async fn delete_device(&self, id: &DeviceIdentity) -> Result<bool, RecordError> {
        Ok(self.write(|r| r.devices.remove(id).is_some()))
    }

    async fn script(&self, id: &str) -> Result<Option<ScriptRecord>, RecordError> {
        Ok(self.read(|r| r.scripts.get(id).cloned()))
    }

    async fn put_script(&self, script: ScriptRecord) -> Result<(), RecordError> {
        self.write(|r| r.scripts.insert(script.id.clone(), script));
        Ok(())
    }

    async fn put_singletons(
        &self,
        driver: &DriverIdentity,
        driver_json: serde_json::Value,
        device: Option<(&DeviceIdentity, serde_json::Value)>,
    ) -> Result<(), RecordError> {
        self.write(|r| r.put_singletons(driver, driver_json, device));
        Ok(())
    }
}

// =============================================================================
// JSON file store
// =============================================================================

/// Record store persisted as a single JSON document.
///
/// Every mutation rewrites the file through a temporary sibling and a rename,
/// so the file on disk is always a complete snapshot. The in-memory table is
/// only updated after the write succeeded.
pub struct JsonFileRecordStore {
    path: PathBuf,
    records: tokio::sync::Mutex<Records>,
}

impl JsonFileRecordStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: RecordFile =
                    serde_json::from_slice(&bytes).map_err(|source| RecordError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                info!(
                    "Loaded {} driver(s) and {} device(s) from {}",
                    file.drivers.len(),
                    file.devices.len(),
                    path.display()
                );
                Records::from(file)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Record file {} does not exist yet, starting empty", path.display());
                Records::default()
            }
            Err(source) => return Err(RecordError::Io { path, source }),
        };

        Ok(Self {
            path,
            records: tokio::sync::Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut Records) -> R) -> Result<R, RecordError> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        let result = f(&mut updated);
        self.persist(&updated).await?;
        *records = updated;
        Ok(result)
    }

    async fn persist(&self, records: &Records) -> Result<(), RecordError> {
        let bytes =
            serde_json::to_vec_pretty(&RecordFile::from(records)).map_err(RecordError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source| RecordError::Io {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!("Persisted records to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn driver(&self, id: &DriverIdentity) -> Result<Option<DeviceDriver>, RecordError> {
        Ok(self.records.lock().await.drivers.get(id).cloned())
    }

    async fn drivers(&self) -> Result<Vec<DeviceDriver>, RecordError> {
        Ok(self.records.lock().await.drivers.values().cloned().collect())
    }

    async fn put_driver(&self, driver: DeviceDriver) -> Result<(), RecordError> {
        self.mutate(|r| {
            r.drivers.insert(driver.identity.clone(), driver);
        })
        .await
    }

    async fn delete_driver(&self, id: &DriverIdentity) -> Result<bool, RecordError> {
        self.mutate(|r| r.drivers.remove(id).is_some()).await
    }

    async fn device(&self, id: &DeviceIdentity) -> Result<Option<DeviceRecord>, RecordError> {
        Ok(self.records.lock().await.devices.get(id).cloned())
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, RecordError> {
        Ok(self.records.lock().await.devices.values().cloned().collect())
    }

    async fn put_device(&self, device: DeviceRecord) -> Result<(), RecordError> {
        self.mutate(|r| {
            r.devices.insert(device.id.clone(), device);
        })
        .await
    }

    async fn delete_device(&self, id: &DeviceIdentity) -> Result<bool, RecordError> {
        self.mutate(|r| r.devices.remove(id).is_some()).await
    }

    async fn script(&self, id: &str) -> Result<Option<ScriptRecord>, RecordError> {
        Ok(self.records.lock().await.scripts.get(id).cloned())
    }

    async fn put_script(&self, script: ScriptRecord) -> Result<(), RecordError> {
        self.mutate(|r| {
            r.scripts.insert(script.id.clone(), script);
        })
        .await
    }

    async fn put_singletons(
        &self,
        driver: &DriverIdentity,
        driver_json: serde_json::Value,
        device: Option<(&DeviceIdentity, serde_json::Value)>,
    ) -> Result<(), RecordError> {
        self.mutate(|r| r.put_singletons(driver, driver_json, device))
            .await
    }
}
