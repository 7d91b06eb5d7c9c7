//! The dispatcher: a registration table plus the event loop that resolves
//! timer fires, published messages and job terminations into callbacks.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::CallMode;
use super::DeviceFilter;
use super::DispatchError;
use super::ExecutionContext;
use super::JobId;
use super::JobRegistry;
use super::MessageBroker;
use super::RegisterRequest;
use super::Registration;
use super::RegistrationId;
use super::Tolerance;
use super::Trigger;
use crate::config::DispatcherConfig;
use crate::driver::CallOutcome;
use crate::driver::DeviceIdentity;
use crate::driver::DriverIdentity;
use crate::driver::DriverTarget;
use crate::driver::InvocationEngine;
use crate::script::CancelToken;
use crate::script::FunctionCall;
use crate::script::FunctionSignature;
use crate::script::ScriptType;
use crate::script::Value;

const EVENT_CHANNEL_SIZE: usize = 256;

// =============================================================================
// Events and settings
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// The timer of a registration expired.
    Timer(RegistrationId),
    /// A message was published to a topic.
    Message { topic: String, payload: String },
    /// A job is about to terminate.
    JobTerminated(JobId),
    /// A device emitted an event.
    DeviceEvent {
        driver: DriverIdentity,
        device: DeviceIdentity,
        topic: String,
        data: Value,
    },
    /// The message broker (re)connected; subscriptions must be renewed.
    BrokerConnected,
    /// Re-attempt registrations that failed under `Retry` tolerance.
    RetryPending,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Attempts per delivery under `Retry` tolerance.
    pub delivery_attempts: u32,
    pub retry_delay: Duration,
    /// Period of the pending-registration sweep.
    pub pending_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            delivery_attempts: 3,
            retry_delay: Duration::from_millis(500),
            pending_interval: Duration::from_secs(30),
        }
    }
}

impl From<&DispatcherConfig> for DispatcherSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            delivery_attempts: config.delivery_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            pending_interval: Duration::from_secs(config.pending_retry_secs),
        }
    }
}

// =============================================================================
// Registration table
// =============================================================================

#[derive(Default)]
struct Registrations {
    set: HashMap<RegistrationId, Arc<Registration>>,
    /// Registrations listening on each subscribed topic.
    topics: HashMap<String, Vec<RegistrationId>>,
    kills: HashMap<JobId, Vec<RegistrationId>>,
    device_events: Vec<RegistrationId>,
}

impl Registrations {
    /// Insert `registration`, returning the topics nobody listened on before.
    fn insert(&mut self, registration: Arc<Registration>) -> Vec<String> {
        let id = registration.id;
        let mut new_topics = Vec::new();
        match &registration.trigger {
            Trigger::Message { topics } => {
                for topic in topics {
                    let listeners = self.topics.entry(topic.clone()).or_default();
                    if listeners.is_empty() {
                        new_topics.push(topic.clone());
                    }
                    if !listeners.contains(&id) {
                        listeners.push(id);
                    }
                }
            }
            Trigger::Kill { job_id } => self.kills.entry(*job_id).or_default().push(id),
            Trigger::DeviceEvent(_) => self.device_events.push(id),
            Trigger::AtTime(_) => {}
        }
        self.set.insert(id, registration);
        new_topics
    }

    /// Remove a registration, returning it with the topics left without
    /// listeners.
    fn remove(&mut self, id: RegistrationId) -> Option<(Arc<Registration>, Vec<String>)> {
        let registration = self.set.remove(&id)?;
        let mut orphaned = Vec::new();
        match &registration.trigger {
            Trigger::Message { topics } => {
                for topic in topics {
                    if let Some(listeners) = self.topics.get_mut(topic) {
                        listeners.retain(|other| *other != id);
                        if listeners.is_empty() {
                            self.topics.remove(topic);
                            orphaned.push(topic.clone());
                        }
                    }
                }
            }
            Trigger::Kill { job_id } => {
                if let Some(ids) = self.kills.get_mut(job_id) {
                    ids.retain(|other| *other != id);
                    if ids.is_empty() {
                        self.kills.remove(job_id);
                    }
                }
            }
            Trigger::DeviceEvent(_) => self.device_events.retain(|other| *other != id),
            Trigger::AtTime(_) => {}
        }
        Some((registration, orphaned))
    }

    fn listeners(&self, topic: &str) -> Vec<Arc<Registration>> {
        self.topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| self.set.get(id).cloned())
            .collect()
    }

    fn device_listeners(
        &self,
        driver: &DriverIdentity,
        device: &DeviceIdentity,
        topic: &str,
    ) -> Vec<Arc<Registration>> {
        self.device_events
            .iter()
            .filter_map(|id| self.set.get(id))
            .filter(|registration| match &registration.trigger {
                Trigger::DeviceEvent(trigger) => trigger.matches(driver, device, topic),
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Adaptive registrations an adaptive `request` replaces.
    fn replaced_by(&self, request: &RegisterRequest) -> Vec<RegistrationId> {
        if !matches!(request.function.call_mode, CallMode::Adaptive { .. }) {
            return Vec::new();
        }
        self.set
            .values()
            .filter(|existing| {
                existing.program_id == request.program_id
                    && existing.trigger == request.trigger
                    && matches!(existing.function.call_mode, CallMode::Adaptive { .. })
            })
            .map(|existing| existing.id)
            .collect()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct Dispatcher {
    invoker: Arc<InvocationEngine>,
    jobs: Arc<JobRegistry>,
    broker: RwLock<Option<Arc<dyn MessageBroker>>>,
    settings: DispatcherSettings,
    next_id: AtomicU64,
    registrations: RwLock<Registrations>,
    pending: Mutex<VecDeque<RegisterRequest>>,
    timers: Mutex<HashMap<RegistrationId, JoinHandle<()>>>,
    events_tx: mpsc::Sender<DispatchEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<DispatchEvent>>,
}

impl Dispatcher {
    pub fn new(
        invoker: Arc<InvocationEngine>,
        jobs: Arc<JobRegistry>,
        settings: DispatcherSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            invoker,
            jobs,
            broker: RwLock::new(None),
            settings,
            next_id: AtomicU64::new(1),
            registrations: RwLock::new(Registrations::default()),
            pending: Mutex::new(VecDeque::new()),
            timers: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    pub fn set_broker(&self, broker: Arc<dyn MessageBroker>) {
        *self.broker.write().unwrap_or_else(PoisonError::into_inner) = Some(broker);
    }

    /// Sender half of the event channel, for brokers and job runners.
    pub fn events(&self) -> mpsc::Sender<DispatchEvent> {
        self.events_tx.clone()
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn invoker(&self) -> &Arc<InvocationEngine> {
        &self.invoker
    }

    pub fn registration(&self, id: RegistrationId) -> Option<Arc<Registration>> {
        self.read(|table| table.set.get(&id).cloned())
    }

    pub fn registrations(&self) -> Vec<Arc<Registration>> {
        let mut all: Vec<_> = self.read(|table| table.set.values().cloned().collect());
        all.sort_by_key(|registration| registration.id);
        all
    }

    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn read<R>(&self, f: impl FnOnce(&Registrations) -> R) -> R {
        f(&self.registrations.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Registrations) -> R) -> R {
        f(&mut self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn broker(&self) -> Option<Arc<dyn MessageBroker>> {
        self.broker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a callback.
    ///
    /// Under `Retry` tolerance a registration that failed for a transient
    /// reason is queued and re-attempted by [`retry_pending`](Self::retry_pending);
    /// the error is still returned to the caller.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegistrationId, DispatchError> {
        let tolerance = request.tolerance;
        match self.register_internal(request.clone()).await {
            Err(e) if e.is_transient() && tolerance == Tolerance::Retry => {
                warn!(
                    "[{}] Registering `{}` failed, queued for retry: {}",
                    request.program_id, request.function.ident, e
                );
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(request);
                Err(e)
            }
            other => other,
        }
    }

    async fn register_internal(
        &self,
        mut request: RegisterRequest,
    ) -> Result<RegistrationId, DispatchError> {
        let mut broker = None;
        match &mut request.trigger {
            Trigger::Message { topics } => {
                topics.retain(|topic| !topic.trim().is_empty());
                if topics.is_empty() {
                    return Err(DispatchError::NoTopics);
                }
                broker = Some(self.broker().ok_or(DispatchError::NoBroker)?);
            }
            Trigger::Kill { job_id } => {
                if self.jobs.get(*job_id).is_none() {
                    return Err(DispatchError::JobNotAlive(*job_id));
                }
            }
            Trigger::DeviceEvent(trigger) => {
                if let Some(topics) = &mut trigger.topics {
                    topics.retain(|topic| !topic.trim().is_empty());
                    if topics.is_empty() {
                        return Err(DispatchError::NoTopics);
                    }
                }
            }
            Trigger::AtTime(_) => {}
        }

        let replaced = self.read(|table| table.replaced_by(&request));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = Arc::new(Registration::new(id, request));
        let new_topics = self.write(|table| table.insert(registration.clone()));

        if let Some(broker) = broker {
            for (idx, topic) in new_topics.iter().enumerate() {
                if let Err(e) = broker.subscribe(topic).await {
                    let orphaned = self.write(|table| table.remove(id)).map(|(_, t)| t);
                    for topic in orphaned.into_iter().flatten() {
                        if !new_topics[..idx].contains(&topic) {
                            continue;
                        }
                        if let Err(e) = broker.unsubscribe(&topic).await {
                            warn!("[{}] Failed to unsubscribe during rollback: {}", topic, e);
                        }
                    }
                    return Err(e.into());
                }
                debug!("[{}] Subscribed", topic);
            }
        }

        if let Trigger::AtTime(time) = &registration.trigger {
            let delay = time.delay_from(Local::now());
            let events = self.events_tx.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(DispatchEvent::Timer(id)).await;
            });
            self.timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, timer);
            debug!("[{}] Timer armed, fires in {:?}", id, delay);
        }

        for old in replaced {
            debug!("[{}] Replaced by registration {}", old, id);
            if let Err(e) = self.unregister(old).await {
                debug!("[{}] Replaced registration already gone: {}", old, e);
            }
        }

        info!(
            "[{}] Registered `{}` of `{}`",
            id, registration.function.ident, registration.program_id
        );
        Ok(id)
    }

    /// Remove a registration, cancelling its timer and dropping topic
    /// subscriptions nobody else listens on.
    pub async fn unregister(&self, id: RegistrationId) -> Result<(), DispatchError> {
        let (_, orphaned) = self.detach(id).ok_or(DispatchError::NotRegistered(id))?;
        self.unsubscribe_all(&orphaned).await;
        debug!("[{}] Unregistered", id);
        Ok(())
    }

    /// Remove every registration owned by `program_id`.
    pub async fn unregister_program(&self, program_id: &str) -> usize {
        let ids: Vec<_> = self.read(|table| {
            table
                .set
                .values()
                .filter(|registration| registration.program_id == program_id)
                .map(|registration| registration.id)
                .collect()
        });
        let mut removed = 0;
        for id in ids {
            if self.unregister(id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove the annotation registrations for `driver` and `device`
    /// (`None` matches any), including ones still waiting for a retry.
    pub(super) async fn drop_annotations(
        &self,
        driver: Option<&DriverIdentity>,
        device: Option<&DeviceIdentity>,
    ) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|request| !request.annotates(driver, device));

        let ids: Vec<_> = self.read(|table| {
            table
                .set
                .values()
                .filter(|registration| registration.annotates(driver, device))
                .map(|registration| registration.id)
                .collect()
        });
        let mut removed = 0;
        for id in ids {
            if self.unregister(id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn detach(&self, id: RegistrationId) -> Option<(Arc<Registration>, Vec<String>)> {
        let removed = self.write(|table| table.remove(id))?;
        if let Some(timer) = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        {
            timer.abort();
        }
        Some(removed)
    }

    async fn unsubscribe_all(&self, topics: &[String]) {
        if topics.is_empty() {
            return;
        }
        let Some(broker) = self.broker() else {
            return;
        };
        for topic in topics {
            match broker.unsubscribe(topic).await {
                Ok(()) => debug!("[{}] Unsubscribed", topic),
                Err(e) => warn!("[{}] Failed to unsubscribe: {}", topic, e),
            }
        }
    }

    /// Re-attempt queued registrations. Returns how many went through.
    pub async fn retry_pending(&self) -> usize {
        let queued: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if queued.is_empty() {
            return 0;
        }

        let mut registered = 0;
        for request in queued {
            match self.register(request).await {
                Ok(_) => registered += 1,
                Err(e) if e.is_transient() => {}
                Err(e) => warn!("Dropping pending registration: {}", e),
            }
        }
        info!("Retried pending registrations, {} succeeded", registered);
        registered
    }

    /// Renew every subscription, then retry pending registrations.
    async fn resubscribe(&self) {
        if let Some(broker) = self.broker() {
            let topics: Vec<_> = self.read(|table| table.topics.keys().cloned().collect());
            for topic in topics {
                if let Err(e) = broker.subscribe(&topic).await {
                    warn!("[{}] Failed to resubscribe: {}", topic, e);
                }
            }
        }
        self.retry_pending().await;
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Fire a timer registration. The registration is removed before its
    /// callback runs, so firing the same id again does nothing.
    pub async fn fire_timer(&self, id: RegistrationId) -> usize {
        let timed = self.read(|table| {
            table
                .set
                .get(&id)
                .map(|registration| matches!(registration.trigger, Trigger::AtTime(_)))
        });
        match timed {
            None => {
                debug!("[{}] Timer fired for a removed registration", id);
                return 0;
            }
            Some(false) => {
                warn!("[{}] Timer fired for a registration without a time trigger", id);
                return 0;
            }
            Some(true) => {}
        }

        let Some((registration, _)) = self.detach(id) else {
            return 0;
        };
        let Trigger::AtTime(time) = &registration.trigger else {
            return 0;
        };
        let elapsed = time.elapsed_secs(Local::now());
        let signature = FunctionSignature::new([("elapsed", ScriptType::Int)], ScriptType::Null);
        self.deliver(&registration, signature, vec![Value::Int(elapsed)])
            .await;
        1
    }

    /// Deliver a published message to every listener on `topic`.
    pub async fn deliver_message(&self, topic: &str, payload: &str) -> usize {
        let listeners = self.read(|table| table.listeners(topic));
        let signature = FunctionSignature::new(
            [("topic", ScriptType::String), ("payload", ScriptType::String)],
            ScriptType::Null,
        );
        for registration in &listeners {
            self.deliver(
                registration,
                signature.clone(),
                vec![
                    Value::String(topic.to_string()),
                    Value::String(payload.to_string()),
                ],
            )
            .await;
        }
        listeners.len()
    }

    /// Deliver a device event to every matching device-event registration.
    ///
    /// Callbacks receive `(topic, data)`; class-wide registrations also get
    /// the emitting device's id.
    pub async fn emit_device_event(
        &self,
        driver: &DriverIdentity,
        device: &DeviceIdentity,
        topic: &str,
        data: Value,
    ) -> usize {
        let listeners = self.read(|table| table.device_listeners(driver, device, topic));
        for registration in &listeners {
            let mut params = vec![("topic", ScriptType::String), ("data", ScriptType::Any)];
            let mut args = vec![Value::String(topic.to_string()), data.clone()];
            if let Trigger::DeviceEvent(trigger) = &registration.trigger {
                if matches!(trigger.filter, DeviceFilter::Class(_)) {
                    params.push(("device_id", ScriptType::String));
                    args.push(Value::String(device.to_string()));
                }
            }
            let signature = FunctionSignature::new(params, ScriptType::Null);
            self.deliver(registration, signature, args).await;
        }
        debug!(
            "[{}] Event `{}` delivered to {} listener(s)",
            device,
            topic,
            listeners.len()
        );
        listeners.len()
    }

    /// Run the kill callbacks of a terminating job, then forget the job.
    ///
    /// Callbacks run while the job is still registered so they can attach
    /// to it.
    pub async fn job_terminated(&self, job_id: JobId) -> usize {
        let ids = self.read(|table| table.kills.get(&job_id).cloned().unwrap_or_default());
        let mut fired = 0;
        for id in ids {
            if let Some((registration, _)) = self.detach(id) {
                let signature = FunctionSignature::returning(ScriptType::Null);
                self.deliver(&registration, signature, Vec::new()).await;
                fired += 1;
            }
        }
        self.jobs.remove(job_id);
        debug!("[job {}] Terminated, {} kill callback(s) fired", job_id, fired);
        fired
    }

    /// Invoke a registration's callback, retrying host failures under
    /// `Retry` tolerance. Script faults are never retried.
    async fn deliver(
        &self,
        registration: &Registration,
        signature: FunctionSignature,
        args: Vec<Value>,
    ) -> bool {
        let call = FunctionCall {
            function: registration.function.ident.clone(),
            literal_name: registration.function.literal,
            signature,
            args,
        };
        let attempts = match registration.tolerance {
            Tolerance::Retry => self.settings.delivery_attempts.max(1),
            Tolerance::BestEffort => 1,
        };

        for attempt in 1..=attempts {
            match self.call(registration, call.clone()).await {
                Ok(CallOutcome::Returned(_)) => return true,
                Ok(CallOutcome::Failed(diagnostics)) => {
                    warn!(
                        "[{}] Callback `{}` failed: {}",
                        registration.id,
                        registration.function.ident,
                        diagnostics
                            .first()
                            .map(|d| d.message.as_str())
                            .unwrap_or("no diagnostics")
                    );
                    return false;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "[{}] Delivery attempt {}/{} failed: {}",
                        registration.id, attempt, attempts, e
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => {
                    match registration.tolerance {
                        Tolerance::Retry => error!(
                            "[{}] Giving up on `{}` after {} attempt(s): {}",
                            registration.id, registration.function.ident, attempts, e
                        ),
                        Tolerance::BestEffort => warn!(
                            "[{}] Dropped delivery of `{}`: {}",
                            registration.id, registration.function.ident, e
                        ),
                    }
                    return false;
                }
            }
        }
        false
    }

    async fn call(
        &self,
        registration: &Registration,
        call: FunctionCall,
    ) -> Result<CallOutcome, DispatchError> {
        match &registration.function.call_mode {
            CallMode::Allocating { context } => {
                self.allocate(context, &registration.program_id, call).await
            }
            CallMode::Attaching { job_id } => {
                let job = self
                    .jobs
                    .get(*job_id)
                    .ok_or(DispatchError::JobNotAlive(*job_id))?;
                Ok(job.spawn_callback(call).await?)
            }
            CallMode::Adaptive { fallback } => {
                match self.jobs.find_by_program(&registration.program_id) {
                    Some(job) => Ok(job.spawn_callback(call).await?),
                    None => self.allocate(fallback, &registration.program_id, call).await,
                }
            }
        }
    }

    async fn allocate(
        &self,
        context: &ExecutionContext,
        program_id: &str,
        call: FunctionCall,
    ) -> Result<CallOutcome, DispatchError> {
        Ok(match context {
            ExecutionContext::Driver { driver, device } => {
                let target = DriverTarget {
                    driver: driver.clone(),
                    device: device.clone(),
                };
                self.invoker.invoke(&target, call, CancelToken::new()).await?
            }
            ExecutionContext::User { username } => {
                debug!("[{}] Running callback for user `{}`", program_id, username);
                self.invoker
                    .invoke_script(program_id, call, CancelToken::new())
                    .await?
            }
        })
    }

    async fn handle(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Timer(id) => {
                self.fire_timer(id).await;
            }
            DispatchEvent::Message { topic, payload } => {
                let delivered = self.deliver_message(&topic, &payload).await;
                debug!("[{}] Message delivered to {} listener(s)", topic, delivered);
            }
            DispatchEvent::JobTerminated(job_id) => {
                self.job_terminated(job_id).await;
            }
            DispatchEvent::DeviceEvent {
                driver,
                device,
                topic,
                data,
            } => {
                self.emit_device_event(&driver, &device, &topic, data).await;
            }
            DispatchEvent::BrokerConnected => self.resubscribe().await,
            DispatchEvent::RetryPending => {
                self.retry_pending().await;
            }
        }
    }

    /// Consume dispatch events until `shutdown` is cancelled.
    ///
    /// Every event is handled on its own task so a slow callback does not
    /// hold up the queue.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        let mut rx = self.events_rx.lock().await;
        let period = self.settings.pending_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.tick().await;

        info!("Dispatcher starting");

        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = sweep.tick() => DispatchEvent::RetryPending,
                _ = shutdown.cancelled() => break,
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle(event).await;
            });
        }

        info!("Dispatcher shutting down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (_, timer) in self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            timer.abort();
        }
    }
}
