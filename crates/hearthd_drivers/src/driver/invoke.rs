//! Driver invocation: run one script function against a driver/device pair
//! and reconcile the singleton state it leaves behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::info;

use super::DeviceIdentity;
use super::DriverCatalog;
use super::DriverIdentity;
use super::Error;
use super::PreparedDriver;
use super::RecordStore;
use super::SingletonStore;
use crate::schema::DEVICE_SINGLETON;
use crate::schema::DRIVER_SINGLETON;
use crate::script::Analysis;
use crate::script::CancelToken;
use crate::script::CompileCache;
use crate::script::EngineError;
use crate::script::FunctionCall;
use crate::script::InvokeOutcome;
use crate::script::InvokeRequest;
use crate::script::ScriptDiagnostic;
use crate::script::ScriptEngine;
use crate::script::Value;
use crate::script::source_digest;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The singletons a call runs against. Driver-only calls have no device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverTarget {
    pub driver: DriverIdentity,
    pub device: Option<DeviceIdentity>,
}

impl DriverTarget {
    pub fn driver(driver: DriverIdentity) -> Self {
        Self {
            driver,
            device: None,
        }
    }

    pub fn device(driver: DriverIdentity, device: DeviceIdentity) -> Self {
        Self {
            driver,
            device: Some(device),
        }
    }
}

impl std::fmt::Display for DriverTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{}/{}", self.driver, device),
            None => write!(f, "{}", self.driver),
        }
    }
}

/// Domain result of a call. Host failures travel separately as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T = Value> {
    Returned(T),
    Failed(Vec<ScriptDiagnostic>),
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Returned(_))
    }

    pub fn diagnostics(&self) -> &[ScriptDiagnostic] {
        match self {
            CallOutcome::Returned(_) => &[],
            CallOutcome::Failed(diagnostics) => diagnostics,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        match self {
            CallOutcome::Returned(value) => CallOutcome::Returned(f(value)),
            CallOutcome::Failed(diagnostics) => CallOutcome::Failed(diagnostics),
        }
    }
}

pub struct InvocationEngine {
    catalog: Arc<DriverCatalog>,
    records: Arc<dyn RecordStore>,
    store: Arc<SingletonStore>,
    timeout: Duration,
    scripts: CompileCache,
}

impl InvocationEngine {
    pub fn new(
        catalog: Arc<DriverCatalog>,
        records: Arc<dyn RecordStore>,
        store: Arc<SingletonStore>,
    ) -> Self {
        Self {
            catalog,
            records,
            store,
            timeout: DEFAULT_TIMEOUT,
            scripts: CompileCache::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Arc<DriverCatalog> {
        &self.catalog
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn store(&self) -> &Arc<SingletonStore> {
        &self.store
    }

    fn engine(&self) -> &dyn ScriptEngine {
        self.catalog.engine().as_ref()
    }

    /// Call a driver function and persist the singletons it leaves behind.
    ///
    /// Diagnostics leave the store untouched. The returned value is only
    /// checked against the function's declared type by the script engine.
    pub async fn invoke(
        &self,
        target: &DriverTarget,
        call: FunctionCall,
        cancel: CancelToken,
    ) -> Result<CallOutcome, Error> {
        let prepared = self.prepare(target).await?;
        self.invoke_checked(target, &prepared, call, cancel, |value| Ok(value))
            .await
    }

    /// Look up the target's records and compile its driver.
    pub(crate) async fn prepare(&self, target: &DriverTarget) -> Result<PreparedDriver, Error> {
        let driver = self
            .records
            .driver(&target.driver)
            .await?
            .ok_or_else(|| Error::DriverNotFound(target.driver.clone()))?;

        if let Some(id) = &target.device {
            let device = self
                .records
                .device(id)
                .await?
                .ok_or_else(|| Error::DeviceNotFound(id.clone()))?;
            if device.driver != target.driver {
                return Err(Error::ForeignDevice {
                    device: id.clone(),
                    driver: target.driver.clone(),
                });
            }
        }

        self.catalog.prepare(&driver)
    }

    /// Run `call` and accept its result only if `check` does.
    ///
    /// A rejected result is reported like a script fault: the diagnostic is
    /// returned and no singleton state is written.
    pub(crate) async fn invoke_checked<T>(
        &self,
        target: &DriverTarget,
        prepared: &PreparedDriver,
        call: FunctionCall,
        cancel: CancelToken,
        check: impl FnOnce(Value) -> Result<T, ScriptDiagnostic>,
    ) -> Result<CallOutcome<T>, Error> {
        let (driver_value, device_value) = self.store.load(&target.driver, target.device.as_ref())?;
        let mut singletons = BTreeMap::new();
        singletons.insert(DRIVER_SINGLETON.to_string(), driver_value);
        if let Some(device_value) = device_value {
            singletons.insert(DEVICE_SINGLETON.to_string(), device_value);
        }

        let function = call.function.clone();
        debug!("[{}] Invoking `{}`", target, function);

        let request = InvokeRequest { call, singletons };
        let outcome = {
            let _deadline = cancel.deadline(self.timeout);
            self.engine().invoke(&prepared.unit, request, cancel).await?
        };

        let (value, mut singletons) = match outcome {
            InvokeOutcome::Completed { value, singletons } => (value, singletons),
            InvokeOutcome::Failed { diagnostics } => {
                info!(
                    "[{}] `{}` failed with {} diagnostic(s)",
                    target,
                    function,
                    diagnostics.len()
                );
                return Ok(CallOutcome::Failed(diagnostics));
            }
        };

        let value = match check(value) {
            Ok(value) => value,
            Err(diagnostic) => {
                info!("[{}] `{}` violated its contract: {}", target, function, diagnostic.message);
                return Ok(CallOutcome::Failed(vec![diagnostic]));
            }
        };

        let program_id = prepared.unit.program_id();
        let missing = |singleton: &str| EngineError::MissingSingleton {
            program_id: program_id.to_string(),
            singleton: singleton.to_string(),
        };
        let driver_value = singletons
            .remove(DRIVER_SINGLETON)
            .ok_or_else(|| missing(DRIVER_SINGLETON))?;
        let device_update = match &target.device {
            Some(id) => Some((
                id.clone(),
                singletons
                    .remove(DEVICE_SINGLETON)
                    .ok_or_else(|| missing(DEVICE_SINGLETON))?,
            )),
            None => None,
        };

        // Persist first; the in-memory store only reflects durable state.
        self.records
            .put_singletons(
                &target.driver,
                self.engine().marshal(&driver_value),
                device_update
                    .as_ref()
                    .map(|(id, value)| (id, self.engine().marshal(value))),
            )
            .await?;
        self.store
            .commit((target.driver.clone(), driver_value), device_update);

        Ok(CallOutcome::Returned(value))
    }

    /// Run a function of an ordinary (non-driver) script.
    ///
    /// No singletons are injected and nothing is persisted.
    pub async fn invoke_script(
        &self,
        program_id: &str,
        call: FunctionCall,
        cancel: CancelToken,
    ) -> Result<CallOutcome, Error> {
        let script = self
            .records
            .script(program_id)
            .await?
            .ok_or_else(|| Error::ScriptNotFound(program_id.to_string()))?;

        let digest = source_digest(&script.source);
        let unit = match self.scripts.get(program_id, digest) {
            Some(unit) => unit,
            None => match self.engine().analyze(program_id, &script.source)? {
                Analysis::Analyzed { program, .. } => {
                    self.scripts.get_or_compile(self.engine(), &program, digest)?
                }
                Analysis::Rejected { diagnostics } => return Ok(CallOutcome::Failed(diagnostics)),
            },
        };

        debug!("[{}] Invoking `{}`", program_id, call.function);
        let request = InvokeRequest {
            call,
            singletons: BTreeMap::new(),
        };
        let _deadline = cancel.deadline(self.timeout);
        Ok(match self.engine().invoke(&unit, request, cancel).await? {
            InvokeOutcome::Completed { value, .. } => CallOutcome::Returned(value),
            InvokeOutcome::Failed { diagnostics } => CallOutcome::Failed(diagnostics),
        })
    }
}
