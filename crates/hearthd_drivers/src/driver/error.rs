use super::Capability;
use super::DeviceIdentity;
use super::DriverIdentity;
use super::RecordError;
use super::StoreError;
use crate::schema::ConfigError;
use crate::script::EngineError;
use crate::script::ScriptDiagnostic;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Driver `{0}` not found")]
    DriverNotFound(DriverIdentity),

    #[error("Device `{0}` not found")]
    DeviceNotFound(DeviceIdentity),

    #[error("Driver `{0}` already exists")]
    DriverExists(DriverIdentity),

    #[error("Device `{0}` already exists")]
    DeviceExists(DeviceIdentity),

    #[error(
        "Driver `{id}` is invalid: {}",
        .diagnostics.first().map(|d| d.message.as_str()).unwrap_or("no diagnostics")
    )]
    DriverInvalid {
        id: DriverIdentity,
        diagnostics: Vec<ScriptDiagnostic>,
    },

    #[error("Device `{device}` is not driven by `{driver}`")]
    ForeignDevice {
        device: DeviceIdentity,
        driver: DriverIdentity,
    },

    #[error("Driver `{driver}` is still used by {devices} device(s)")]
    DriverInUse { driver: DriverIdentity, devices: usize },

    #[error("Device `{device}` does not support the `{capability}` capability")]
    Unsupported {
        device: DeviceIdentity,
        capability: Capability,
    },

    #[error("Script `{0}` not found")]
    ScriptNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Record(#[from] RecordError),
}
