//! In-memory driver stack for tests.

use std::sync::Arc;
use std::time::Duration;

use super::DeviceDriver;
use super::DeviceIdentity;
use super::DeviceRecord;
use super::DriverCatalog;
use super::DriverIdentity;
use super::DriverManager;
use super::InvocationEngine;
use super::MemoryRecordStore;
use super::RecordStore;
use super::SemanticVersion;
use super::SingletonStore;
use super::DEFAULT_TIMEOUT;
use crate::script::testing::fixtures;
use crate::script::testing::MockEngine;
use crate::script::Value;

pub(crate) fn driver_record(identity: &DriverIdentity, source: &str) -> DeviceDriver {
    DeviceDriver {
        identity: identity.clone(),
        name: identity.model_id.clone(),
        version: SemanticVersion::new(1, 0, 0),
        source: source.to_string(),
        singleton_json: None,
    }
}

pub(crate) fn device_record(id: &str, driver: &DriverIdentity) -> DeviceRecord {
    DeviceRecord {
        id: DeviceIdentity::new(id),
        name: id.to_string(),
        room_id: "living-room".to_string(),
        driver: driver.clone(),
        singleton_json: None,
    }
}

pub(crate) struct Harness {
    pub engine: Arc<MockEngine>,
    pub records: Arc<dyn RecordStore>,
    pub invoker: Arc<InvocationEngine>,
    pub manager: DriverManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(fixtures::engine(), Arc::new(MemoryRecordStore::new()), timeout)
    }

    pub fn build(engine: Arc<MockEngine>, records: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        let catalog = Arc::new(DriverCatalog::new(engine.clone()));
        let invoker = Arc::new(
            InvocationEngine::new(catalog, records.clone(), Arc::new(SingletonStore::new()))
                .with_timeout(timeout),
        );
        Self {
            engine,
            records,
            manager: DriverManager::new(invoker.clone()),
            invoker,
        }
    }

    /// Create driver `acme:{model}` running `source`.
    pub async fn driver(&self, model: &str, source: &str) -> DriverIdentity {
        let identity = DriverIdentity::new("acme", model);
        self.manager
            .create_driver(driver_record(&identity, source))
            .await
            .unwrap();
        identity
    }

    pub async fn device(&self, id: &str, driver: &DriverIdentity) -> DeviceIdentity {
        self.manager
            .create_device(device_record(id, driver))
            .await
            .unwrap();
        DeviceIdentity::new(id)
    }

    /// A lamp driver with one device.
    pub async fn lamp(&self, id: &str) -> DeviceIdentity {
        let driver = self.driver("lamp", fixtures::LAMP).await;
        self.device(id, &driver).await
    }

    pub fn device_value(&self, id: &DeviceIdentity) -> Value {
        self.invoker.store().device(id).unwrap()
    }

    pub fn device_field(&self, id: &DeviceIdentity, name: &str) -> Value {
        self.device_value(id).field(name).cloned().unwrap_or(Value::Null)
    }
}
