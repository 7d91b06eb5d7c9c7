//! Trigger dispatch.
//!
//! Scripts register callbacks against triggers: messages on broker topics,
//! a time of day or deadline, the termination of a job, or events emitted by
//! devices. Trigger annotations in driver code are registered per device and
//! follow the driver through reloads. The [`Dispatcher`] keeps the
//! registration table and turns incoming [`DispatchEvent`]s into calls
//! through the driver invocation engine, a live job, or the plain script
//! path, depending on the registration's [`CallMode`].

mod annotations;
mod broker;
mod dispatcher;
mod jobs;
mod types;

#[cfg(test)]
mod tests;

#[cfg(test)]
pub use broker::MockBroker;
#[cfg(feature = "broker_mqtt")]
pub use broker::MqttBroker;
pub use broker::BrokerError;
pub use broker::MessageBroker;
pub use dispatcher::DispatchEvent;
pub use dispatcher::Dispatcher;
pub use dispatcher::DispatcherSettings;
pub use jobs::JobRegistry;
pub use jobs::LiveJob;
pub use types::CallMode;
pub use types::CalledFunction;
pub use types::DeviceEventTrigger;
pub use types::DeviceFilter;
pub use types::ExecutionContext;
pub use types::FireAt;
pub use types::JobId;
pub use types::Origin;
pub use types::RegisterRequest;
pub use types::Registration;
pub use types::RegistrationId;
pub use types::TimeTrigger;
pub use types::Tolerance;
pub use types::Trigger;

use crate::script::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message trigger has no topics")]
    NoTopics,

    #[error("Registration {0} not found")]
    NotRegistered(RegistrationId),

    #[error("Job {0} is not alive")]
    JobNotAlive(JobId),

    #[error("No message broker configured")]
    NoBroker,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Driver(#[from] crate::driver::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl DispatchError {
    /// Failures that may clear up on their own, such as a broker outage.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Broker(_) | DispatchError::NoBroker)
    }
}
