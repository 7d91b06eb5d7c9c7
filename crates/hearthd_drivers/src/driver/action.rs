//! Device actions: typed wrappers around well-known driver functions.
//!
//! Each wrapper checks the device's capabilities before anything runs, then
//! enforces the function's contract on the returned value. A contract
//! violation is reported as a `driver` runtime diagnostic attributed to the
//! offending function, so a buggy driver is flagged instead of trusted.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::Capability;
use super::CallOutcome;
use super::DeviceIdentity;
use super::DriverIdentity;
use super::DriverTarget;
use super::Error;
use super::InvocationEngine;
use super::PreparedDriver;
use crate::script::CancelToken;
use crate::script::FunctionCall;
use crate::script::FunctionSignature;
use crate::script::ScriptDiagnostic;
use crate::script::ScriptType;
use crate::script::Span;
use crate::script::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    ReportPower,
    ReportPowerDraw,
    SetPower,
    ReportDim,
    Dim,
    ReportSensors,
    HealthCheck,
}

impl ActionKind {
    pub fn capability(self) -> Capability {
        match self {
            ActionKind::ReportPower | ActionKind::ReportPowerDraw | ActionKind::SetPower => {
                Capability::Power
            }
            ActionKind::ReportDim | ActionKind::Dim => Capability::Dimmable,
            ActionKind::ReportSensors => Capability::Sensor,
            ActionKind::HealthCheck => Capability::Base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    ReportPower,
    ReportPowerDraw,
    SetPower { on: bool },
    ReportDim,
    Dim { label: String, value: i64 },
    ReportSensors,
    HealthCheck,
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionRequest::ReportPower => ActionKind::ReportPower,
            ActionRequest::ReportPowerDraw => ActionKind::ReportPowerDraw,
            ActionRequest::SetPower { .. } => ActionKind::SetPower,
            ActionRequest::ReportDim => ActionKind::ReportDim,
            ActionRequest::Dim { .. } => ActionKind::Dim,
            ActionRequest::ReportSensors => ActionKind::ReportSensors,
            ActionRequest::HealthCheck => ActionKind::HealthCheck,
        }
    }
}

/// One dimmable channel reported by `report_dim`, bounds already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimmableReport {
    pub label: String,
    pub lower: i64,
    pub upper: i64,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub label: String,
    pub value: serde_json::Value,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActionOutput {
    None,
    PowerState(bool),
    PowerDraw(i64),
    Changed(bool),
    Dimmables(Vec<DimmableReport>),
    SensorReadings(Vec<SensorReading>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub diagnostics: Vec<ScriptDiagnostic>,
    pub output: ActionOutput,
}

impl<T: Into<ActionOutput>> From<CallOutcome<T>> for ActionResponse {
    fn from(outcome: CallOutcome<T>) -> Self {
        match outcome {
            CallOutcome::Returned(value) => ActionResponse {
                success: true,
                diagnostics: Vec::new(),
                output: value.into(),
            },
            CallOutcome::Failed(diagnostics) => ActionResponse {
                success: false,
                diagnostics,
                output: ActionOutput::None,
            },
        }
    }
}

impl From<()> for ActionOutput {
    fn from(_: ()) -> Self {
        ActionOutput::None
    }
}

impl From<Vec<DimmableReport>> for ActionOutput {
    fn from(reports: Vec<DimmableReport>) -> Self {
        ActionOutput::Dimmables(reports)
    }
}

impl From<Vec<SensorReading>> for ActionOutput {
    fn from(readings: Vec<SensorReading>) -> Self {
        ActionOutput::SensorReadings(readings)
    }
}

// =============================================================================
// Function contracts
// =============================================================================

fn dimmable_type() -> ScriptType {
    ScriptType::object([
        ("label", ScriptType::String),
        ("range", ScriptType::Range),
        ("value", ScriptType::Int),
    ])
}

fn sensor_type() -> ScriptType {
    ScriptType::object([
        ("label", ScriptType::String),
        ("value", ScriptType::Any),
        ("unit", ScriptType::String),
    ])
}

fn unexpected(
    function: &str,
    expected: &ScriptType,
    value: &Value,
    span: &Span,
) -> ScriptDiagnostic {
    ScriptDiagnostic::driver_fault(
        format!(
            "Device function `{}` returned `{}` which is not a valid `{}`",
            function, value, expected
        ),
        span.clone(),
    )
}

fn expect_bool(
    function: &'static str,
    span: Span,
) -> impl FnOnce(Value) -> Result<bool, ScriptDiagnostic> {
    move |value| {
        value
            .as_bool()
            .ok_or_else(|| unexpected(function, &ScriptType::Bool, &value, &span))
    }
}

fn check_power_draw(span: Span) -> impl FnOnce(Value) -> Result<i64, ScriptDiagnostic> {
    move |value| match value.as_int() {
        Some(draw) if draw >= 0 => Ok(draw),
        Some(draw) => Err(ScriptDiagnostic::driver_fault(
            format!(
                "Device function `report_power_draw` should return positive power consumption but returned {}",
                draw
            ),
            span,
        )),
        None => Err(unexpected("report_power_draw", &ScriptType::Int, &value, &span)),
    }
}

fn check_dimmables(
    span: Span,
) -> impl FnOnce(Value) -> Result<Vec<DimmableReport>, ScriptDiagnostic> {
    move |value| {
        let expected = ScriptType::list(dimmable_type());
        let items = value
            .as_list()
            .ok_or_else(|| unexpected("report_dim", &expected, &value, &span))?;

        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            let (Some(label), Some(Value::Range(range)), Some(level)) = (
                item.field("label").and_then(Value::as_str),
                item.field("range"),
                item.field("value").and_then(Value::as_int),
            ) else {
                return Err(unexpected("report_dim", &expected, &value, &span));
            };

            if !range.contains(level) {
                return Err(ScriptDiagnostic::driver_fault(
                    format!(
                        "Device function `report_dim` should return value in dimmable range({}) but returned {} for label `{}`",
                        range, level, label
                    ),
                    span,
                ));
            }

            let (lower, upper) = range.bounds();
            reports.push(DimmableReport {
                label: label.to_string(),
                lower,
                upper,
                value: level,
            });
        }
        Ok(reports)
    }
}

fn check_sensors(span: Span) -> impl FnOnce(Value) -> Result<Vec<SensorReading>, ScriptDiagnostic> {
    move |value| {
        let expected = ScriptType::list(sensor_type());
        let items = value
            .as_list()
            .ok_or_else(|| unexpected("report_sensor_readings", &expected, &value, &span))?;

        let mut readings = Vec::with_capacity(items.len());
        for item in items {
            let (Some(label), Some(reading), Some(unit)) = (
                item.field("label").and_then(Value::as_str),
                item.field("value"),
                item.field("unit").and_then(Value::as_str),
            ) else {
                return Err(unexpected("report_sensor_readings", &expected, &value, &span));
            };

            if !reading.is_primitive() {
                return Err(ScriptDiagnostic::driver_fault(
                    format!(
                        "Device function `report_sensor_readings` should return a primitive value but returned `{}` for label `{}`",
                        reading, label
                    ),
                    span,
                ));
            }

            readings.push(SensorReading {
                label: label.to_string(),
                value: reading.to_json(),
                unit: unit.to_string(),
            });
        }
        Ok(readings)
    }
}

fn expect_null(
    function: &'static str,
    span: Span,
) -> impl FnOnce(Value) -> Result<(), ScriptDiagnostic> {
    move |value| match value {
        Value::Null => Ok(()),
        other => Err(unexpected(function, &ScriptType::Null, &other, &span)),
    }
}

// =============================================================================
// Wrappers
// =============================================================================

impl InvocationEngine {
    /// Resolve a device, its driver, and check that the driver's device
    /// singleton provides `capability`.
    async fn prepare_device(
        &self,
        device: &DeviceIdentity,
        capability: Capability,
    ) -> Result<(DriverTarget, PreparedDriver), Error> {
        let record = self
            .records()
            .device(device)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device.clone()))?;
        let target = DriverTarget::device(record.driver, device.clone());
        let prepared = self.prepare(&target).await?;

        if !prepared.info.device_capabilities.contains(capability) {
            debug!("[{}] Rejected call needing `{}` capability", device, capability);
            return Err(Error::Unsupported {
                device: device.clone(),
                capability,
            });
        }
        Ok((target, prepared))
    }

    fn method_span(prepared: &PreparedDriver, function: &str) -> Span {
        prepared
            .program
            .method_span(function)
            .unwrap_or(&prepared.program.span)
            .clone()
    }

    async fn device_call<T, C>(
        &self,
        device: &DeviceIdentity,
        capability: Capability,
        call: FunctionCall,
        cancel: CancelToken,
        check: impl FnOnce(Span) -> C,
    ) -> Result<CallOutcome<T>, Error>
    where
        C: FnOnce(Value) -> Result<T, ScriptDiagnostic>,
    {
        let (target, prepared) = self.prepare_device(device, capability).await?;
        let span = Self::method_span(&prepared, &call.function);
        self.invoke_checked(&target, &prepared, call, cancel, check(span))
            .await
    }

    pub async fn report_power(
        &self,
        device: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<CallOutcome<bool>, Error> {
        let call = FunctionCall::new(
            "report_power",
            FunctionSignature::returning(ScriptType::Bool),
            Vec::new(),
        );
        self.device_call(device, Capability::Power, call, cancel, |span| {
            expect_bool("report_power", span)
        })
        .await
    }

    pub async fn report_power_draw(
        &self,
        device: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<CallOutcome<i64>, Error> {
        let call = FunctionCall::new(
            "report_power_draw",
            FunctionSignature::returning(ScriptType::Int),
            Vec::new(),
        );
        self.device_call(device, Capability::Power, call, cancel, check_power_draw)
            .await
    }

    /// Switch a device on or off; returns whether its state changed.
    pub async fn set_power(
        &self,
        device: &DeviceIdentity,
        on: bool,
        cancel: CancelToken,
    ) -> Result<CallOutcome<bool>, Error> {
        let call = FunctionCall::new(
            "set_power",
            FunctionSignature::new([("power", ScriptType::Bool)], ScriptType::Bool),
            vec![Value::Bool(on)],
        );
        self.device_call(device, Capability::Power, call, cancel, |span| {
            expect_bool("set_power", span)
        })
        .await
    }

    pub async fn report_dim(
        &self,
        device: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<CallOutcome<Vec<DimmableReport>>, Error> {
        let call = FunctionCall::new(
            "report_dim",
            FunctionSignature::returning(ScriptType::list(dimmable_type())),
            Vec::new(),
        );
        self.device_call(device, Capability::Dimmable, call, cancel, check_dimmables)
            .await
    }

    /// Dim the channel `label` to `value`; returns whether its state changed.
    pub async fn dim(
        &self,
        device: &DeviceIdentity,
        label: &str,
        value: i64,
        cancel: CancelToken,
    ) -> Result<CallOutcome<bool>, Error> {
        let call = FunctionCall::new(
            "dim",
            FunctionSignature::new(
                [("label", ScriptType::String), ("value", ScriptType::Int)],
                ScriptType::Bool,
            ),
            vec![Value::String(label.to_string()), Value::Int(value)],
        );
        self.device_call(device, Capability::Dimmable, call, cancel, |span| {
            expect_bool("dim", span)
        })
        .await
    }

    pub async fn report_sensor_readings(
        &self,
        device: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<CallOutcome<Vec<SensorReading>>, Error> {
        let call = FunctionCall::new(
            "report_sensor_readings",
            FunctionSignature::returning(ScriptType::list(sensor_type())),
            Vec::new(),
        );
        self.device_call(device, Capability::Sensor, call, cancel, check_sensors)
            .await
    }

    pub async fn validate_device(
        &self,
        device: &DeviceIdentity,
        cancel: CancelToken,
    ) -> Result<CallOutcome<()>, Error> {
        let call = FunctionCall::new(
            "validate_device",
            FunctionSignature::returning(ScriptType::Null),
            Vec::new(),
        );
        self.device_call(device, Capability::Base, call, cancel, |span| {
            expect_null("validate_device", span)
        })
        .await
    }

    pub async fn validate_driver(
        &self,
        driver: &DriverIdentity,
        cancel: CancelToken,
    ) -> Result<CallOutcome<()>, Error> {
        let target = DriverTarget::driver(driver.clone());
        let prepared = self.prepare(&target).await?;
        let span = Self::method_span(&prepared, "validate_driver");
        let call = FunctionCall::new(
            "validate_driver",
            FunctionSignature::returning(ScriptType::Null),
            Vec::new(),
        );
        self.invoke_checked(&target, &prepared, call, cancel, expect_null("validate_driver", span))
            .await
    }

    /// Dispatch an action request to the matching wrapper.
    pub async fn invoke_action(
        &self,
        device: &DeviceIdentity,
        request: ActionRequest,
        cancel: CancelToken,
    ) -> Result<ActionResponse, Error> {
        debug!("[{}] Action `{}`", device, request.kind());
        Ok(match request {
            ActionRequest::ReportPower => self
                .report_power(device, cancel)
                .await?
                .map(ActionOutput::PowerState)
                .into(),
            ActionRequest::ReportPowerDraw => self
                .report_power_draw(device, cancel)
                .await?
                .map(ActionOutput::PowerDraw)
                .into(),
            ActionRequest::SetPower { on } => self
                .set_power(device, on, cancel)
                .await?
                .map(ActionOutput::Changed)
                .into(),
            ActionRequest::ReportDim => self.report_dim(device, cancel).await?.into(),
            ActionRequest::Dim { label, value } => self
                .dim(device, &label, value, cancel)
                .await?
                .map(ActionOutput::Changed)
                .into(),
            ActionRequest::ReportSensors => {
                self.report_sensor_readings(device, cancel).await?.into()
            }
            ActionRequest::HealthCheck => self.validate_device(device, cancel).await?.into(),
        })
    }
}
