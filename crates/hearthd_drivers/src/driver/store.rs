use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use super::DeviceIdentity;
use super::DriverIdentity;
use crate::script::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("No singleton stored for driver `{0}`")]
    MissingDriver(DriverIdentity),

    #[error("No singleton stored for device `{0}`")]
    MissingDevice(DeviceIdentity),
}

#[derive(Default)]
struct Singletons {
    drivers: HashMap<DriverIdentity, Value>,
    devices: HashMap<DeviceIdentity, Value>,
}

/// Current singleton value of every driver and device.
///
/// Both maps sit behind one lock so that the driver and device values written
/// by one invocation become visible together. A missing entry is an invariant
/// violation: every driver and device creation populates its entry.
#[derive(Default)]
pub struct SingletonStore {
    inner: RwLock<Singletons>,
}

impl SingletonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver(&self, id: &DriverIdentity) -> Result<Value, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .drivers
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::MissingDriver(id.clone()))
    }

    pub fn device(&self, id: &DeviceIdentity) -> Result<Value, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::MissingDevice(id.clone()))
    }

    /// Read a driver singleton and, optionally, one of its devices from the
    /// same snapshot.
    pub fn load(
        &self,
        driver: &DriverIdentity,
        device: Option<&DeviceIdentity>,
    ) -> Result<(Value, Option<Value>), StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let driver_value = inner
            .drivers
            .get(driver)
            .cloned()
            .ok_or_else(|| StoreError::MissingDriver(driver.clone()))?;
        let device_value = match device {
            Some(id) => Some(
                inner
                    .devices
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::MissingDevice(id.clone()))?,
            ),
            None => None,
        };
        Ok((driver_value, device_value))
    }

    pub fn set_driver(&self, id: DriverIdentity, value: Value) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.drivers.insert(id, value);
    }

    pub fn set_device(&self, id: DeviceIdentity, value: Value) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.devices.insert(id, value);
    }

    /// Write the results of one invocation under a single lock.
    pub fn commit(&self, driver: (DriverIdentity, Value), device: Option<(DeviceIdentity, Value)>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.drivers.insert(driver.0, driver.1);
        if let Some((id, value)) = device {
            inner.devices.insert(id, value);
        }
    }

    pub fn remove_driver(&self, id: &DriverIdentity) -> Option<Value> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.drivers.remove(id)
    }

    pub fn remove_device(&self, id: &DeviceIdentity) -> Option<Value> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.devices.remove(id)
    }
}
