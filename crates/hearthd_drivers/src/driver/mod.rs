//! Script-backed device drivers.
//!
//! A driver is a script declaring two singletons, `@Driver` and `@Device`,
//! that implement the `Driver` and `Device` templates. This module keeps their
//! records and singleton state, checks template conformance, and invokes
//! driver functions against a driver/device pair.

mod action;
mod capability;
mod catalog;
mod error;
mod identity;
mod invoke;
mod manager;
mod record;
mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use action::ActionKind;
pub use action::ActionOutput;
pub use action::ActionRequest;
pub use action::ActionResponse;
pub use action::DimmableReport;
pub use action::SensorReading;
pub use capability::check_conformance;
pub use capability::Capability;
pub use capability::CapabilitySet;
pub use capability::Template;
pub use catalog::DriverCatalog;
pub use catalog::PreparedDriver;
pub use error::Error;
pub use identity::DeviceIdentity;
pub use identity::DriverIdentity;
pub use identity::IdentityError;
pub use identity::SemanticVersion;
pub use invoke::CallOutcome;
pub use invoke::DriverTarget;
pub use invoke::InvocationEngine;
pub use invoke::DEFAULT_TIMEOUT;
pub use manager::ConfigTarget;
pub use manager::DeviceOverview;
pub use manager::DriverManager;
pub use manager::DriverOverview;
pub use manager::LoadReport;
pub use manager::ReloadHook;
pub use record::DeviceDriver;
pub use record::DeviceRecord;
pub use record::JsonFileRecordStore;
pub use record::MemoryRecordStore;
pub use record::RecordError;
pub use record::RecordStore;
pub use record::ScriptRecord;
pub use store::SingletonStore;
pub use store::StoreError;
