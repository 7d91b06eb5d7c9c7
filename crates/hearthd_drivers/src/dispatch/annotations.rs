//! Trigger annotations declared in driver code.
//!
//! Every annotation of a valid driver is registered once per device of that
//! driver, as a message trigger that allocates in the driver/device context.
//! The registrations use [`Tolerance::Retry`], so a missing broker only
//! delays them.

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CallMode;
use super::CalledFunction;
use super::DispatchError;
use super::Dispatcher;
use super::ExecutionContext;
use super::Origin;
use super::RegisterRequest;
use super::Tolerance;
use super::Trigger;
use crate::driver::CallOutcome;
use crate::driver::DeviceDriver;
use crate::driver::DeviceIdentity;
use crate::driver::DriverIdentity;
use crate::driver::DriverTarget;
use crate::driver::Error as DriverError;
use crate::driver::ReloadHook;
use crate::script::AnalyzedProgram;
use crate::script::CancelToken;
use crate::script::FunctionCall;
use crate::script::FunctionSignature;
use crate::script::ScriptType;
use crate::script::TriggerAnnotation;
use crate::script::Value;

impl Dispatcher {
    /// Register the trigger annotations of every driver.
    pub async fn register_driver_annotations(&self) -> Result<usize, DispatchError> {
        let drivers = self
            .invoker()
            .records()
            .drivers()
            .await
            .map_err(DriverError::from)?;
        let mut registered = 0;
        for driver in drivers {
            registered += self.reload_driver(&driver.identity).await?;
        }
        Ok(registered)
    }

    /// Replace the annotation registrations of every device of `id`.
    ///
    /// Returns how many registrations went through right away.
    pub async fn reload_driver(&self, id: &DriverIdentity) -> Result<usize, DispatchError> {
        let dropped = self.drop_annotations(Some(id), None).await;
        if dropped > 0 {
            debug!("[{}] Dropped {} annotation registration(s)", id, dropped);
        }

        let records = self.invoker().records();
        let Some(driver) = records.driver(id).await.map_err(DriverError::from)? else {
            return Ok(0);
        };
        let Some(program) = self.annotated_program(&driver)? else {
            return Ok(0);
        };

        let mut registered = 0;
        for device in records.devices().await.map_err(DriverError::from)? {
            if &device.driver == id {
                registered += self.register_annotations(id, &program, &device.id).await;
            }
        }
        Ok(registered)
    }

    /// Replace the annotation registrations of one device. A deleted device
    /// only loses its registrations.
    pub async fn reload_device(&self, id: &DeviceIdentity) -> Result<usize, DispatchError> {
        self.drop_annotations(None, Some(id)).await;

        let records = self.invoker().records();
        let Some(device) = records.device(id).await.map_err(DriverError::from)? else {
            return Ok(0);
        };
        let Some(driver) = records
            .driver(&device.driver)
            .await
            .map_err(DriverError::from)?
        else {
            return Ok(0);
        };
        let Some(program) = self.annotated_program(&driver)? else {
            return Ok(0);
        };
        Ok(self.register_annotations(&device.driver, &program, id).await)
    }

    fn annotated_program(&self, driver: &DeviceDriver) -> Result<Option<AnalyzedProgram>, DispatchError> {
        match self.invoker().catalog().prepare(driver) {
            Ok(prepared) if prepared.program.triggers.is_empty() => Ok(None),
            Ok(prepared) => Ok(Some(prepared.program)),
            Err(DriverError::DriverInvalid { .. }) => {
                debug!("[{}] Driver is invalid, skipping its trigger annotations", driver.identity);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn register_annotations(
        &self,
        driver: &DriverIdentity,
        program: &AnalyzedProgram,
        device: &DeviceIdentity,
    ) -> usize {
        let mut registered = 0;
        for annotation in &program.triggers {
            let Some(topics) = self.annotation_topics(driver, device, annotation).await else {
                continue;
            };
            let request = RegisterRequest {
                program_id: driver.program_id(),
                function: CalledFunction {
                    ident: annotation.callback.clone(),
                    literal: true,
                    call_mode: CallMode::Allocating {
                        context: ExecutionContext::Driver {
                            driver: driver.clone(),
                            device: Some(device.clone()),
                        },
                    },
                },
                trigger: Trigger::Message { topics },
                tolerance: Tolerance::Retry,
                origin: Origin::Annotation,
            };
            match self.register(request).await {
                Ok(_) => registered += 1,
                Err(e) if e.is_transient() => {}
                Err(e) => warn!(
                    "[{}] Trigger annotation on `{}` rejected: {}",
                    device, annotation.callback, e
                ),
            }
        }
        registered
    }

    /// Run the annotation's topic function against `device`.
    async fn annotation_topics(
        &self,
        driver: &DriverIdentity,
        device: &DeviceIdentity,
        annotation: &TriggerAnnotation,
    ) -> Option<Vec<String>> {
        let target = DriverTarget::device(driver.clone(), device.clone());
        let call = FunctionCall::new(
            annotation.topics_fn.clone(),
            FunctionSignature::returning(ScriptType::list(ScriptType::String)),
            Vec::new(),
        );

        let items = match self.invoker().invoke(&target, call, CancelToken::new()).await {
            Ok(CallOutcome::Returned(Value::List(items))) => items,
            Ok(CallOutcome::Returned(other)) => {
                warn!(
                    "[{}] `{}` returned {} instead of a topic list",
                    target,
                    annotation.topics_fn,
                    other.kind()
                );
                return None;
            }
            Ok(CallOutcome::Failed(diagnostics)) => {
                warn!(
                    "[{}] `{}` failed: {}",
                    target,
                    annotation.topics_fn,
                    diagnostics
                        .first()
                        .map(|d| d.message.as_str())
                        .unwrap_or("no diagnostics")
                );
                return None;
            }
            Err(e) => {
                warn!("[{}] Could not run `{}`: {}", target, annotation.topics_fn, e);
                return None;
            }
        };

        let topics: Option<Vec<String>> = items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect();
        if topics.is_none() {
            warn!("[{}] `{}` returned a non-string topic", target, annotation.topics_fn);
        }
        topics
    }
}

#[async_trait]
impl ReloadHook for Dispatcher {
    async fn driver_reloaded(&self, driver: &DriverIdentity) {
        match self.reload_driver(driver).await {
            Ok(registered) => info!("[{}] Registered {} trigger annotation(s)", driver, registered),
            Err(e) => warn!("[{}] Failed to reload trigger annotations: {}", driver, e),
        }
    }

    async fn device_reloaded(&self, device: &DeviceIdentity) {
        if let Err(e) = self.reload_device(device).await {
            warn!("[{}] Failed to reload trigger annotations: {}", device, e);
        }
    }
}
