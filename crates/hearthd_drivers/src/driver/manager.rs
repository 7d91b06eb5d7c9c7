//! Driver and device lifecycle.
//!
//! [`DriverManager`] is the service object calling layers talk to: it creates
//! and deletes drivers and devices, applies code and configuration changes,
//! and assembles overviews for display. Invocations go through the shared
//! [`InvocationEngine`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ActionRequest;
use super::ActionResponse;
use super::CallOutcome;
use super::Capability;
use super::CapabilitySet;
use super::DeviceDriver;
use super::DeviceIdentity;
use super::DeviceRecord;
use super::DimmableReport;
use super::DriverIdentity;
use super::Error;
use super::InvocationEngine;
use super::RecordStore;
use super::SensorReading;
use super::SingletonStore;
use crate::schema::decode;
use crate::schema::migrate;
use crate::schema::validate;
use crate::schema::ConfigSchema;
use crate::schema::DriverInfo;
use crate::schema::Extraction;
use crate::script::CancelToken;
use crate::script::ScriptDiagnostic;
use crate::script::ScriptEngine;
use crate::script::Value;

/// Which singleton a configuration change is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigTarget {
    Driver(DriverIdentity),
    Device(DeviceIdentity),
}

impl std::fmt::Display for ConfigTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTarget::Driver(id) => write!(f, "driver {}", id),
            ConfigTarget::Device(id) => write!(f, "device {}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverOverview {
    pub driver: DeviceDriver,
    pub info: Option<DriverInfo>,
    pub valid: bool,
    pub diagnostics: Vec<ScriptDiagnostic>,
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceOverview {
    pub device: DeviceRecord,
    pub configuration: serde_json::Value,
    pub capabilities: CapabilitySet,
    pub power: Option<bool>,
    pub power_draw: Option<i64>,
    pub dimmables: Option<Vec<DimmableReport>>,
    pub sensor_readings: Option<Vec<SensorReading>>,
    pub diagnostics: Vec<ScriptDiagnostic>,
}

/// What [`DriverManager::load`] found in the record store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub drivers: usize,
    pub devices: usize,
    pub invalid: Vec<DriverIdentity>,
    pub migrated: usize,
}

/// Told after drivers or devices change, so that triggers declared in
/// driver code can follow.
#[async_trait]
pub trait ReloadHook: Send + Sync {
    async fn driver_reloaded(&self, driver: &DriverIdentity);

    /// Also called after the device was deleted.
    async fn device_reloaded(&self, device: &DeviceIdentity);
}

pub struct DriverManager {
    engine: Arc<InvocationEngine>,
    hook: RwLock<Option<Arc<dyn ReloadHook>>>,
}

impl DriverManager {
    pub fn new(engine: Arc<InvocationEngine>) -> Self {
        Self {
            engine,
            hook: RwLock::new(None),
        }
    }

    pub fn set_reload_hook(&self, hook: Arc<dyn ReloadHook>) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    fn hook(&self) -> Option<Arc<dyn ReloadHook>> {
        self.hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn driver_reloaded(&self, id: &DriverIdentity) {
        if let Some(hook) = self.hook() {
            hook.driver_reloaded(id).await;
        }
    }

    async fn device_reloaded(&self, id: &DeviceIdentity) {
        if let Some(hook) = self.hook() {
            hook.device_reloaded(id).await;
        }
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    fn records(&self) -> &Arc<dyn RecordStore> {
        self.engine.records()
    }

    fn store(&self) -> &Arc<SingletonStore> {
        self.engine.store()
    }

    fn script_engine(&self) -> &dyn ScriptEngine {
        self.engine.catalog().engine().as_ref()
    }

    async fn driver_record(&self, id: &DriverIdentity) -> Result<DeviceDriver, Error> {
        self.records()
            .driver(id)
            .await?
            .ok_or_else(|| Error::DriverNotFound(id.clone()))
    }

    async fn device_record(&self, id: &DeviceIdentity) -> Result<DeviceRecord, Error> {
        self.records()
            .device(id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(id.clone()))
    }

    fn valid_info(&self, driver: &DeviceDriver) -> Result<DriverInfo, Error> {
        match self.engine.catalog().extraction(driver)?.as_ref() {
            Extraction::Valid { info, .. } => Ok(info.clone()),
            Extraction::Invalid { diagnostics } => Err(Error::DriverInvalid {
                id: driver.identity.clone(),
                diagnostics: diagnostics.clone(),
            }),
        }
    }

    // =========================================================================
    // Drivers
    // =========================================================================

    /// Register a new driver and seed its singleton.
    ///
    /// Invalid drivers are accepted so they can be fixed later; their
    /// singleton starts as an empty object.
    pub async fn create_driver(&self, mut driver: DeviceDriver) -> Result<Arc<Extraction>, Error> {
        if self.records().driver(&driver.identity).await?.is_some() {
            return Err(Error::DriverExists(driver.identity));
        }

        let extraction = self.engine.catalog().extraction(&driver)?;
        let singleton = match extraction.info() {
            Some(info) => self.script_engine().zero_value(&info.driver_config),
            None => Value::Object(Default::default()),
        };

        driver.singleton_json = Some(self.script_engine().marshal(&singleton));
        let id = driver.identity.clone();
        self.records().put_driver(driver).await?;
        self.store().set_driver(id.clone(), singleton);

        info!(
            "[{}] Created driver ({})",
            id,
            if extraction.is_valid() { "valid" } else { "invalid" }
        );
        Ok(extraction)
    }

    /// Replace a driver's source, migrating every singleton it owns.
    ///
    /// When the new source is invalid the singletons are left as they are;
    /// the source is still stored so it can be edited further.
    pub async fn apply_code(
        &self,
        id: &DriverIdentity,
        source: String,
    ) -> Result<Arc<Extraction>, Error> {
        let mut driver = self.driver_record(id).await?;
        let catalog = self.engine.catalog();
        // Singletons of an invalid driver were loaded without a schema.
        let was_invalid = !catalog.extraction(&driver)?.is_valid();
        driver.source = source;
        catalog.invalidate(id);
        let extraction = catalog.extraction(&driver)?;

        let Some(info) = extraction.info() else {
            warn!("[{}] New source is invalid, keeping singletons as they are", id);
            self.records().put_driver(driver).await?;
            self.driver_reloaded(id).await;
            return Ok(extraction);
        };

        let driver_value = carry_over(
            &self.store().driver(id)?,
            driver.singleton_json.as_ref(),
            &info.driver_config,
            was_invalid,
        );
        let mut device_values = Vec::new();
        for mut device in self.records().devices().await? {
            if &device.driver != id {
                continue;
            }
            let value = carry_over(
                &self.store().device(&device.id)?,
                device.singleton_json.as_ref(),
                &info.device_config,
                was_invalid,
            );
            device.singleton_json = Some(self.script_engine().marshal(&value));
            self.records().put_device(device.clone()).await?;
            device_values.push((device.id, value));
        }

        driver.singleton_json = Some(self.script_engine().marshal(&driver_value));
        self.records().put_driver(driver).await?;

        info!(
            "[{}] Applied new source, migrated {} device(s)",
            id,
            device_values.len()
        );
        self.store().set_driver(id.clone(), driver_value);
        for (device, value) in device_values {
            self.store().set_device(device, value);
        }
        self.driver_reloaded(id).await;
        Ok(extraction)
    }

    pub async fn delete_driver(&self, id: &DriverIdentity) -> Result<(), Error> {
        let in_use = self
            .records()
            .devices()
            .await?
            .iter()
            .filter(|device| &device.driver == id)
            .count();
        if in_use > 0 {
            return Err(Error::DriverInUse {
                driver: id.clone(),
                devices: in_use,
            });
        }

        if !self.records().delete_driver(id).await? {
            return Err(Error::DriverNotFound(id.clone()));
        }
        self.store().remove_driver(id);
        self.engine.catalog().invalidate(id);
        info!("[{}] Deleted driver", id);
        Ok(())
    }

    pub async fn driver_overview(&self, id: &DriverIdentity) -> Result<DriverOverview, Error> {
        let driver = self.driver_record(id).await?;
        self.overview(driver)
    }

    pub async fn list_drivers(&self) -> Result<Vec<DriverOverview>, Error> {
        self.records()
            .drivers()
            .await?
            .into_iter()
            .map(|driver| self.overview(driver))
            .collect()
    }

    fn overview(&self, driver: DeviceDriver) -> Result<DriverOverview, Error> {
        let extraction = self.engine.catalog().extraction(&driver)?;
        let configuration = self
            .script_engine()
            .marshal(&self.store().driver(&driver.identity)?);
        Ok(DriverOverview {
            info: extraction.info().cloned(),
            valid: extraction.is_valid(),
            diagnostics: extraction.diagnostics().to_vec(),
            configuration,
            driver,
        })
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Provision a device of a valid driver, seeding its singleton.
    pub async fn create_device(&self, mut device: DeviceRecord) -> Result<(), Error> {
        if self.records().device(&device.id).await?.is_some() {
            return Err(Error::DeviceExists(device.id));
        }

        let driver = self.driver_record(&device.driver).await?;
        let info = self.valid_info(&driver)?;
        let singleton = self.script_engine().zero_value(&info.device_config);

        device.singleton_json = Some(self.script_engine().marshal(&singleton));
        let id = device.id.clone();
        self.records().put_device(device).await?;
        self.store().set_device(id.clone(), singleton);
        info!("[{}] Created device of driver {}", id, driver.identity);
        self.device_reloaded(&id).await;
        Ok(())
    }

    pub async fn delete_device(&self, id: &DeviceIdentity) -> Result<(), Error> {
        if !self.records().delete_device(id).await? {
            return Err(Error::DeviceNotFound(id.clone()));
        }
        self.store().remove_device(id);
        info!("[{}] Deleted device", id);
        self.device_reloaded(id).await;
        Ok(())
    }

    /// Configuration plus live reports of every capability the device has.
    ///
    /// Failing reports end up in `diagnostics`; only system errors are
    /// returned as `Err`.
    pub async fn device_overview(
        &self,
        id: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<DeviceOverview, Error> {
        let device = self.device_record(id).await?;
        let configuration = self.script_engine().marshal(&self.store().device(id)?);
        let mut overview = DeviceOverview {
            device,
            configuration,
            capabilities: CapabilitySet::default(),
            power: None,
            power_draw: None,
            dimmables: None,
            sensor_readings: None,
            diagnostics: Vec::new(),
        };

        let driver = self.driver_record(&overview.device.driver).await?;
        let info = match self.valid_info(&driver) {
            Ok(info) => info,
            Err(Error::DriverInvalid { diagnostics, .. }) => {
                overview.diagnostics = diagnostics;
                return Ok(overview);
            }
            Err(e) => return Err(e),
        };
        overview.capabilities = info.device_capabilities.clone();

        fn collect<T>(
            outcome: CallOutcome<T>,
            diagnostics: &mut Vec<ScriptDiagnostic>,
        ) -> Option<T> {
            match outcome {
                CallOutcome::Returned(value) => Some(value),
                CallOutcome::Failed(failed) => {
                    diagnostics.extend(failed);
                    None
                }
            }
        }

        let engine = &self.engine;
        let diagnostics = &mut overview.diagnostics;
        for capability in info.device_capabilities.iter() {
            match capability {
                Capability::Base => {}
                Capability::Power => {
                    let power = engine.report_power(id, cancel.clone()).await?;
                    overview.power = collect(power, diagnostics);
                    let draw = engine.report_power_draw(id, cancel.clone()).await?;
                    overview.power_draw = collect(draw, diagnostics);
                }
                Capability::Dimmable => {
                    let dimmables = engine.report_dim(id, cancel.clone()).await?;
                    overview.dimmables = collect(dimmables, diagnostics);
                }
                Capability::Sensor => {
                    let readings = engine.report_sensor_readings(id, cancel.clone()).await?;
                    overview.sensor_readings = collect(readings, diagnostics);
                }
            }
        }
        Ok(overview)
    }

    pub async fn invoke_action(
        &self,
        device: &DeviceIdentity,
        request: ActionRequest,
        cancel: CancelToken,
    ) -> Result<ActionResponse, Error> {
        self.engine.invoke_action(device, request, cancel).await
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    async fn config_schema(&self, target: &ConfigTarget) -> Result<ConfigSchema, Error> {
        Ok(match target {
            ConfigTarget::Driver(id) => {
                let driver = self.driver_record(id).await?;
                self.valid_info(&driver)?.driver_config
            }
            ConfigTarget::Device(id) => {
                let device = self.device_record(id).await?;
                let driver = self.driver_record(&device.driver).await?;
                self.valid_info(&driver)?.device_config
            }
        })
    }

    /// Check a user-submitted configuration without applying it.
    pub async fn validate_config_change(
        &self,
        target: &ConfigTarget,
        json: &serde_json::Value,
    ) -> Result<(), Error> {
        let schema = self.config_schema(target).await?;
        validate(json, &schema)?;
        Ok(())
    }

    /// Validate a user-submitted configuration and make it current.
    pub async fn apply_config_change(
        &self,
        target: &ConfigTarget,
        json: &serde_json::Value,
    ) -> Result<(), Error> {
        let schema = self.config_schema(target).await?;
        let value = decode(json, &schema)?;
        let marshaled = self.script_engine().marshal(&value);

        match target {
            ConfigTarget::Driver(id) => {
                self.records().put_singletons(id, marshaled, None).await?;
                self.store().set_driver(id.clone(), value);
            }
            ConfigTarget::Device(id) => {
                let mut device = self.device_record(id).await?;
                device.singleton_json = Some(marshaled);
                self.records().put_device(device).await?;
                self.store().set_device(id.clone(), value);
            }
        }
        debug!("[{}] Applied configuration change", target);
        Ok(())
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Populate the singleton store from the persisted blobs.
    ///
    /// Blobs that no longer fit the current schema are migrated. Blobs of
    /// invalid drivers and their devices are loaded verbatim and their
    /// records are left alone until the source is fixed.
    pub async fn load(&self) -> Result<LoadReport, Error> {
        let mut report = LoadReport::default();

        let drivers = self.records().drivers().await?;
        let mut infos = HashMap::new();
        for driver in &drivers {
            let extraction = self.engine.catalog().extraction(driver)?;
            let value = match extraction.info() {
                Some(info) => {
                    let (value, migrated) =
                        restore(driver.singleton_json.as_ref(), &info.driver_config);
                    if migrated {
                        warn!(
                            "[{}] Persisted driver singleton did not validate, migrated it",
                            driver.identity
                        );
                        report.migrated += 1;
                    }
                    infos.insert(driver.identity.clone(), info.clone());
                    value
                }
                None => {
                    warn!(
                        "[{}] Driver is invalid, it will not accept actions",
                        driver.identity
                    );
                    report.invalid.push(driver.identity.clone());
                    schemaless(driver.singleton_json.as_ref())
                }
            };
            self.store().set_driver(driver.identity.clone(), value);
            report.drivers += 1;
        }

        for device in self.records().devices().await? {
            let value = match infos.get(&device.driver) {
                Some(info) => {
                    let (value, migrated) =
                        restore(device.singleton_json.as_ref(), &info.device_config);
                    if migrated {
                        warn!(
                            "[{}] Persisted device singleton did not validate, migrated it",
                            device.id
                        );
                        report.migrated += 1;
                    }
                    value
                }
                None => schemaless(device.singleton_json.as_ref()),
            };
            self.store().set_device(device.id, value);
            report.devices += 1;
        }

        info!(
            "Loaded {} driver(s) ({} invalid) and {} device(s)",
            report.drivers,
            report.invalid.len(),
            report.devices
        );
        for driver in &drivers {
            self.driver_reloaded(&driver.identity).await;
        }
        Ok(report)
    }
}

/// Decode a persisted blob, migrating it when it no longer validates.
/// Returns whether migration was needed.
fn restore(json: Option<&serde_json::Value>, schema: &ConfigSchema) -> (Value, bool) {
    let Some(json) = json else {
        return (schema.zero_value(), false);
    };
    match decode(json, schema) {
        Ok(value) => (value, false),
        Err(e) => {
            debug!("Migrating persisted singleton: {}", e);
            (migrate(&Value::from_json(json), schema), true)
        }
    }
}

fn schemaless(json: Option<&serde_json::Value>) -> Value {
    json.map(Value::from_json)
        .unwrap_or_else(|| Value::Object(Default::default()))
}

/// Move a singleton onto a new schema.
///
/// A schemaless value has lost its option and integer typing, so the
/// persisted blob is decoded against the new schema first and only migrated
/// when it does not fit.
fn carry_over(
    current: &Value,
    persisted: Option<&serde_json::Value>,
    schema: &ConfigSchema,
    schemaless: bool,
) -> Value {
    match persisted {
        Some(json) if schemaless => match decode(json, schema) {
            Ok(value) => value,
            Err(e) => {
                debug!("Migrating schemaless singleton: {}", e);
                migrate(&Value::from_json(json), schema)
            }
        },
        _ => migrate(current, schema),
    }
}
