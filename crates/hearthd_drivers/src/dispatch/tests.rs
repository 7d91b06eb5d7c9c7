use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;

use super::*;
use crate::driver::testing::Harness;
use crate::driver::CallOutcome;
use crate::driver::DeviceIdentity;
use crate::driver::DriverIdentity;
use crate::driver::ScriptRecord;
use crate::script::testing::fixtures;
use crate::script::testing::set_device_field;
use crate::script::testing::MockProgram;
use crate::script::AnalyzedProgram;
use crate::script::CancelToken;
use crate::script::EngineError;
use crate::script::FunctionCall;
use crate::script::ScriptDiagnostic;
use crate::script::Span;
use crate::script::Value;

// =============================================================================
// Helpers
// =============================================================================

/// A live job that records attached callbacks. The first `failures` calls
/// fail on the host side.
struct MockJob {
    id: JobId,
    program_id: String,
    calls: Mutex<Vec<FunctionCall>>,
    failures: AtomicUsize,
    script_fault: bool,
}

impl MockJob {
    fn new(id: JobId, program_id: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            program_id: program_id.to_string(),
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            script_fault: false,
        })
    }

    fn flaky(id: JobId, program_id: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            program_id: program_id.to_string(),
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
            script_fault: false,
        })
    }

    fn faulty(id: JobId, program_id: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            program_id: program_id.to_string(),
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            script_fault: true,
        })
    }

    fn calls(&self) -> Vec<FunctionCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveJob for MockJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn program_id(&self) -> &str {
        &self.program_id
    }

    async fn spawn_callback(&self, call: FunctionCall) -> Result<CallOutcome, EngineError> {
        self.calls.lock().unwrap().push(call);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Host {
                program_id: self.program_id.clone(),
                message: "vm crashed".to_string(),
            });
        }
        if self.script_fault {
            return Ok(CallOutcome::Failed(vec![ScriptDiagnostic::runtime(
                "throw",
                "callback threw",
                Span::default(),
            )]));
        }
        Ok(CallOutcome::Returned(Value::Null))
    }
}

struct Setup {
    harness: Harness,
    broker: Arc<MockBroker>,
    dispatcher: Arc<Dispatcher>,
}

fn setup() -> Setup {
    let setup = setup_without_broker();
    setup.dispatcher.set_broker(setup.broker.clone());
    setup
}

fn setup_without_broker() -> Setup {
    let harness = Harness::new();
    let settings = DispatcherSettings {
        delivery_attempts: 3,
        retry_delay: Duration::from_millis(10),
        pending_interval: Duration::from_secs(30),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        harness.invoker.clone(),
        Arc::new(JobRegistry::new()),
        settings,
    ));
    Setup {
        harness,
        broker: Arc::new(MockBroker::new()),
        dispatcher,
    }
}

fn request(program_id: &str, ident: &str, call_mode: CallMode, trigger: Trigger) -> RegisterRequest {
    RegisterRequest {
        program_id: program_id.to_string(),
        function: CalledFunction {
            ident: ident.to_string(),
            literal: true,
            call_mode,
        },
        trigger,
        tolerance: Tolerance::BestEffort,
        origin: Origin::Script,
    }
}

fn attach(job_id: JobId) -> CallMode {
    CallMode::Attaching { job_id }
}

fn adaptive(username: &str) -> CallMode {
    CallMode::Adaptive {
        fallback: ExecutionContext::User {
            username: username.to_string(),
        },
    }
}

/// One hour from now, far enough not to fire during a test.
fn later() -> Trigger {
    Trigger::at_minutes_from_now(60)
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn test_timer_fires_once() {
    let setup = setup();
    setup.harness.engine.register(
        "timer-lamp",
        fixtures::lamp().function("on_timer", |args, s| {
            assert!(matches!(args, [Value::Int(_)]));
            set_device_field(s, "on", Value::Bool(true));
            Ok(Value::Null)
        }),
    );
    let driver = setup.harness.driver("timer-lamp", "timer-lamp").await;
    let device = setup.harness.device("lamp-1", &driver).await;

    let mode = CallMode::Allocating {
        context: ExecutionContext::Driver {
            driver,
            device: Some(device.clone()),
        },
    };
    let id = setup
        .dispatcher
        .register(request("@driver:acme:timer-lamp", "on_timer", mode, later()))
        .await
        .unwrap();

    assert_eq!(setup.dispatcher.fire_timer(id).await, 1);
    assert_eq!(setup.harness.device_field(&device, "on"), Value::Bool(true));
    assert!(setup.dispatcher.registration(id).is_none());

    // Already removed: a second fire is a no-op.
    assert_eq!(setup.dispatcher.fire_timer(id).await, 0);
    assert_eq!(
        setup
            .harness
            .engine
            .calls()
            .iter()
            .filter(|call| *call == "on_timer")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_one_shot_removed_even_when_callback_fails() {
    let setup = setup();
    let job = MockJob::faulty(1, "morning");
    setup.dispatcher.jobs().register(job.clone());

    let id = setup
        .dispatcher
        .register(request("morning", "wake", attach(1), later()))
        .await
        .unwrap();

    assert_eq!(setup.dispatcher.fire_timer(id).await, 1);
    assert_eq!(job.calls().len(), 1);
    assert!(setup.dispatcher.registrations().is_empty());
}

#[tokio::test]
async fn test_timer_event_ignores_other_triggers() {
    let setup = setup();
    let id = setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap();

    assert_eq!(setup.dispatcher.fire_timer(id).await, 0);
    assert!(setup.dispatcher.registration(id).is_some());
    assert!(setup.broker.unsubscribed().is_empty());
}

#[tokio::test]
async fn test_topic_subscriptions_are_reference_counted() {
    let setup = setup();
    let door = setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap();
    let both = setup
        .dispatcher
        .register(request(
            "alarm",
            "on_any",
            attach(1),
            Trigger::message(["home/door", "home/window"]),
        ))
        .await
        .unwrap();
    assert_eq!(setup.broker.subscribed(), vec!["home/door", "home/window"]);

    setup.dispatcher.unregister(door).await.unwrap();
    assert!(setup.broker.unsubscribed().is_empty());

    setup.dispatcher.unregister(both).await.unwrap();
    assert_eq!(setup.broker.unsubscribed(), vec!["home/door", "home/window"]);

    let err = setup.dispatcher.unregister(both).await.unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Registration 2 not found");
}

#[tokio::test]
async fn test_empty_topics_are_filtered() {
    let setup = setup();
    let err = setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["", "  "])))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoTopics));

    let id = setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["", "home/door"])))
        .await
        .unwrap();
    assert_eq!(
        setup.dispatcher.registration(id).unwrap().trigger,
        Trigger::message(["home/door"])
    );
    assert_eq!(setup.broker.subscribed(), vec!["home/door"]);
}

#[tokio::test]
async fn test_adaptive_registration_replaces_equal_trigger() {
    let setup = setup();
    let first = setup
        .dispatcher
        .register(request("alarm", "on_door", adaptive("alice"), Trigger::message(["home/door"])))
        .await
        .unwrap();
    let second = setup
        .dispatcher
        .register(request("alarm", "on_door", adaptive("alice"), Trigger::message(["home/door"])))
        .await
        .unwrap();

    let ids: Vec<_> = setup
        .dispatcher
        .registrations()
        .iter()
        .map(|registration| registration.id)
        .collect();
    assert_eq!(ids, vec![second]);
    assert_ne!(first, second);
    // The topic never lost its last listener.
    assert_eq!(setup.broker.subscribed(), vec!["home/door"]);
    assert!(setup.broker.unsubscribed().is_empty());

    // Non-adaptive registrations accumulate.
    setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap();
    assert_eq!(setup.dispatcher.registrations().len(), 2);
}

#[tokio::test]
async fn test_unregister_program() {
    let setup = setup();
    for topic in ["a", "b"] {
        setup
            .dispatcher
            .register(request("alarm", "on_message", attach(1), Trigger::message([topic])))
            .await
            .unwrap();
    }
    setup
        .dispatcher
        .register(request("lights", "on_message", attach(2), Trigger::message(["a"])))
        .await
        .unwrap();

    assert_eq!(setup.dispatcher.unregister_program("alarm").await, 2);
    assert_eq!(setup.broker.unsubscribed(), vec!["b"]);
    assert_eq!(setup.dispatcher.registrations().len(), 1);
}

// =============================================================================
// Tolerance
// =============================================================================

#[tokio::test]
async fn test_missing_broker_queues_retry_registrations() {
    let setup = setup_without_broker();

    let err = setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoBroker));
    assert_eq!(setup.dispatcher.pending(), 0);

    let mut retried = request("alarm", "on_door", attach(1), Trigger::message(["home/door"]));
    retried.tolerance = Tolerance::Retry;
    assert!(setup.dispatcher.register(retried).await.is_err());
    assert_eq!(setup.dispatcher.pending(), 1);

    // Still no broker: the request stays queued.
    assert_eq!(setup.dispatcher.retry_pending().await, 0);
    assert_eq!(setup.dispatcher.pending(), 1);

    setup.dispatcher.set_broker(setup.broker.clone());
    assert_eq!(setup.dispatcher.retry_pending().await, 1);
    assert_eq!(setup.dispatcher.pending(), 0);
    assert_eq!(setup.dispatcher.registrations().len(), 1);
    assert_eq!(setup.broker.subscribed(), vec!["home/door"]);
}

#[tokio::test]
async fn test_failed_subscription_rolls_back() {
    let setup = setup();
    setup.broker.fail(true);

    let mut retried = request("alarm", "on_door", attach(1), Trigger::message(["home/door"]));
    retried.tolerance = Tolerance::Retry;
    let err = setup.dispatcher.register(retried).await.unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Message broker unavailable: mock broker offline");
    assert!(setup.dispatcher.registrations().is_empty());
    assert_eq!(setup.dispatcher.pending(), 1);

    setup.broker.fail(false);
    assert_eq!(setup.dispatcher.retry_pending().await, 1);
    assert_eq!(setup.dispatcher.registrations().len(), 1);
}

#[tokio::test]
async fn test_retry_tolerance_retries_host_failures() {
    let setup = setup();
    let job = MockJob::flaky(1, "alarm", 2);
    setup.dispatcher.jobs().register(job.clone());

    let mut retried = request("alarm", "on_door", attach(1), Trigger::message(["home/door"]));
    retried.tolerance = Tolerance::Retry;
    setup.dispatcher.register(retried).await.unwrap();

    assert_eq!(setup.dispatcher.deliver_message("home/door", "open").await, 1);
    assert_eq!(job.calls().len(), 3);
}

#[tokio::test]
async fn test_best_effort_drops_after_one_attempt() {
    let setup = setup();
    let job = MockJob::flaky(1, "alarm", 2);
    setup.dispatcher.jobs().register(job.clone());

    setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap();

    setup.dispatcher.deliver_message("home/door", "open").await;
    assert_eq!(job.calls().len(), 1);
}

#[tokio::test]
async fn test_script_faults_are_not_retried() {
    let setup = setup();
    let job = MockJob::faulty(1, "alarm");
    setup.dispatcher.jobs().register(job.clone());

    let mut retried = request("alarm", "on_door", attach(1), Trigger::message(["home/door"]));
    retried.tolerance = Tolerance::Retry;
    setup.dispatcher.register(retried).await.unwrap();

    setup.dispatcher.deliver_message("home/door", "open").await;
    assert_eq!(job.calls().len(), 1);
}

// =============================================================================
// Call modes
// =============================================================================

#[tokio::test]
async fn test_message_callback_arguments() {
    let setup = setup();
    let job = MockJob::new(1, "alarm");
    setup.dispatcher.jobs().register(job.clone());
    setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap();

    assert_eq!(setup.dispatcher.deliver_message("home/window", "open").await, 0);
    assert_eq!(setup.dispatcher.deliver_message("home/door", "open").await, 1);

    let calls = job.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function, "on_door");
    assert_eq!(
        calls[0].args,
        vec![
            Value::String("home/door".to_string()),
            Value::String("open".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_attaching_to_dead_job_delivers_nothing() {
    let setup = setup();
    let id = setup
        .dispatcher
        .register(request("morning", "wake", attach(9), later()))
        .await
        .unwrap();

    // The registration is consumed; delivery fails without panicking.
    assert_eq!(setup.dispatcher.fire_timer(id).await, 1);
    assert!(setup.dispatcher.registration(id).is_none());
}

#[tokio::test]
async fn test_adaptive_prefers_live_job() {
    let setup = setup();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    setup.harness.engine.register(
        "alarm-source",
        MockProgram::new(AnalyzedProgram::default()).function("on_door", move |args, _| {
            assert_eq!(args.len(), 2);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );
    setup
        .harness
        .records
        .put_script(ScriptRecord {
            id: "alarm".to_string(),
            owner: "alice".to_string(),
            source: "alarm-source".to_string(),
        })
        .await
        .unwrap();

    setup
        .dispatcher
        .register(request("alarm", "on_door", adaptive("alice"), Trigger::message(["home/door"])))
        .await
        .unwrap();

    // No live job: falls back to a fresh script execution.
    setup.dispatcher.deliver_message("home/door", "open").await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let job = MockJob::new(4, "alarm");
    setup.dispatcher.jobs().register(job.clone());
    setup.dispatcher.deliver_message("home/door", "closed").await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(job.calls().len(), 1);
}

#[tokio::test]
async fn test_kill_callbacks_fire_on_termination() {
    let setup = setup();
    let job = MockJob::new(7, "alarm");
    setup.dispatcher.jobs().register(job.clone());

    let err = setup
        .dispatcher
        .register(request("alarm", "cleanup", attach(8), Trigger::Kill { job_id: 8 }))
        .await
        .unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Job 8 is not alive");

    let id = setup
        .dispatcher
        .register(request("alarm", "cleanup", attach(7), Trigger::Kill { job_id: 7 }))
        .await
        .unwrap();

    assert_eq!(setup.dispatcher.job_terminated(7).await, 1);
    let calls = job.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function, "cleanup");
    assert!(calls[0].args.is_empty());
    assert!(setup.dispatcher.jobs().get(7).is_none());
    assert!(setup.dispatcher.registration(id).is_none());

    assert_eq!(setup.dispatcher.job_terminated(7).await, 0);
}

// =============================================================================
// Device events
// =============================================================================

fn device_event(filter: DeviceFilter) -> Trigger {
    Trigger::DeviceEvent(DeviceEventTrigger::new(filter))
}

async fn emit(
    dispatcher: &Dispatcher,
    driver: &DriverIdentity,
    device: &DeviceIdentity,
    topic: &str,
) -> usize {
    dispatcher
        .emit_device_event(driver, device, topic, Value::Int(1))
        .await
}

#[tokio::test]
async fn test_device_event_filters_and_arguments() {
    let setup = setup();
    let job = MockJob::new(1, "panel");
    setup.dispatcher.jobs().register(job.clone());

    let lamp = DriverIdentity::new("acme", "lamp");
    let desk = DeviceIdentity::new("desk");
    let hall = DeviceIdentity::new("hall");

    let class = setup
        .dispatcher
        .register(request(
            "panel",
            "on_lamp",
            attach(1),
            device_event(DeviceFilter::Class(lamp.clone())),
        ))
        .await
        .unwrap();
    let individual = DeviceEventTrigger::new(DeviceFilter::Individual(desk.clone()))
        .with_topics(["motion"]);
    setup
        .dispatcher
        .register(request(
            "panel",
            "on_desk",
            attach(1),
            Trigger::DeviceEvent(individual),
        ))
        .await
        .unwrap();
    assert!(setup.broker.subscribed().is_empty());

    let dispatcher = &setup.dispatcher;
    assert_eq!(emit(dispatcher, &lamp, &desk, "motion").await, 2);
    assert_eq!(emit(dispatcher, &lamp, &hall, "motion").await, 1);
    assert_eq!(emit(dispatcher, &lamp, &desk, "power").await, 1);
    let switch = DriverIdentity::new("acme", "switch");
    assert_eq!(emit(dispatcher, &switch, &hall, "motion").await, 0);

    let calls = job.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].function, "on_lamp");
    assert_eq!(
        calls[0].args,
        vec![
            Value::String("motion".to_string()),
            Value::Int(1),
            Value::String("desk".to_string()),
        ]
    );
    assert_eq!(calls[1].function, "on_desk");
    assert_eq!(
        calls[1].args,
        vec![Value::String("motion".to_string()), Value::Int(1)]
    );

    setup.dispatcher.unregister(class).await.unwrap();
    assert_eq!(emit(dispatcher, &lamp, &desk, "motion").await, 1);
}

#[tokio::test]
async fn test_device_event_needs_a_topic_when_filtered() {
    let setup = setup_without_broker();
    let trigger = DeviceEventTrigger::new(DeviceFilter::Individual(DeviceIdentity::new("desk")))
        .with_topics([" "]);
    let err = setup
        .dispatcher
        .register(request("panel", "on_desk", attach(1), Trigger::DeviceEvent(trigger)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoTopics));

    // Unfiltered device events work without a broker.
    setup
        .dispatcher
        .register(request(
            "panel",
            "on_desk",
            attach(1),
            device_event(DeviceFilter::Individual(DeviceIdentity::new("desk"))),
        ))
        .await
        .unwrap();
}

// =============================================================================
// Trigger annotations
// =============================================================================

const MOTION_LAMP: &str = "motion-lamp-source";

/// A lamp that switches on when its motion topic fires.
fn motion_lamp() -> MockProgram {
    fixtures::lamp()
        .trigger("on_motion", "motion_topics")
        .function("motion_topics", |_, _| {
            Ok(Value::List(vec![Value::String("home/motion".into())]))
        })
        .function("on_motion", |args, s| {
            assert_eq!(args.len(), 2);
            set_device_field(s, "on", Value::Bool(true));
            Ok(Value::Null)
        })
}

fn annotated(setup: &Setup) -> Vec<Arc<Registration>> {
    setup
        .dispatcher
        .registrations()
        .into_iter()
        .filter(|registration| registration.origin == Origin::Annotation)
        .collect()
}

#[tokio::test]
async fn test_annotations_follow_driver_reloads() {
    let setup = setup();
    setup.harness.manager.set_reload_hook(setup.dispatcher.clone());
    setup.harness.engine.register(MOTION_LAMP, motion_lamp());

    let driver = setup.harness.driver("motion-lamp", MOTION_LAMP).await;
    assert!(annotated(&setup).is_empty());

    let device = setup.harness.device("lamp-1", &driver).await;
    let registrations = annotated(&setup);
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].tolerance, Tolerance::Retry);
    assert_eq!(registrations[0].trigger, Trigger::message(["home/motion"]));
    assert_eq!(registrations[0].program_id, driver.program_id());
    assert_eq!(setup.broker.subscribed(), vec!["home/motion"]);

    assert_eq!(setup.dispatcher.deliver_message("home/motion", "1").await, 1);
    assert_eq!(setup.harness.device_field(&device, "on"), Value::Bool(true));

    // Reapplying the same code replaces the registration.
    setup
        .harness
        .manager
        .apply_code(&driver, MOTION_LAMP.to_string())
        .await
        .unwrap();
    assert_eq!(annotated(&setup).len(), 1);

    // Code without annotations drops it.
    setup
        .harness
        .manager
        .apply_code(&driver, fixtures::LAMP.to_string())
        .await
        .unwrap();
    assert!(annotated(&setup).is_empty());
    assert_eq!(setup.dispatcher.deliver_message("home/motion", "1").await, 0);
}

#[tokio::test]
async fn test_annotations_wait_for_broker() {
    let setup = setup_without_broker();
    setup.harness.manager.set_reload_hook(setup.dispatcher.clone());
    setup.harness.engine.register(MOTION_LAMP, motion_lamp());

    let driver = setup.harness.driver("motion-lamp", MOTION_LAMP).await;
    setup.harness.device("lamp-1", &driver).await;
    let second = setup.harness.device("lamp-2", &driver).await;
    assert!(annotated(&setup).is_empty());
    assert_eq!(setup.dispatcher.pending(), 2);

    // A deleted device forgets its queued registration.
    setup.harness.manager.delete_device(&second).await.unwrap();
    assert_eq!(setup.dispatcher.pending(), 1);

    setup.dispatcher.set_broker(setup.broker.clone());
    assert_eq!(setup.dispatcher.retry_pending().await, 1);
    assert_eq!(annotated(&setup).len(), 1);

    // Invalid code keeps no annotations alive.
    setup
        .harness
        .manager
        .apply_code(&driver, "not a driver".to_string())
        .await
        .unwrap();
    assert!(annotated(&setup).is_empty());
    assert_eq!(setup.broker.unsubscribed(), vec!["home/motion"]);
}

#[tokio::test]
async fn test_register_driver_annotations_at_startup() {
    let setup = setup();
    setup.harness.engine.register(MOTION_LAMP, motion_lamp());
    setup.harness.engine.register(
        "bad-topics",
        fixtures::lamp()
            .trigger("on_motion", "motion_topics")
            .function("motion_topics", |_, _| Ok(Value::Int(3))),
    );

    let driver = setup.harness.driver("motion-lamp", MOTION_LAMP).await;
    setup.harness.device("lamp-1", &driver).await;
    setup.harness.device("lamp-2", &driver).await;
    let broken = setup.harness.driver("bad-topics", "bad-topics").await;
    setup.harness.device("lamp-3", &broken).await;
    setup.harness.lamp("lamp-4").await;

    assert_eq!(setup.dispatcher.register_driver_annotations().await.unwrap(), 2);
    // Registering again replaces instead of duplicating.
    assert_eq!(setup.dispatcher.register_driver_annotations().await.unwrap(), 2);
    assert_eq!(annotated(&setup).len(), 2);
}

// =============================================================================
// Event loop
// =============================================================================

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_run_loop_handles_events() {
    let setup = setup();
    let job = MockJob::new(1, "alarm");
    setup.dispatcher.jobs().register(job.clone());

    let shutdown = CancelToken::new();
    let running = tokio::spawn(setup.dispatcher.clone().run(shutdown.clone()));

    setup
        .dispatcher
        .register(request("alarm", "on_door", attach(1), Trigger::message(["home/door"])))
        .await
        .unwrap();
    setup
        .dispatcher
        .events()
        .send(DispatchEvent::Message {
            topic: "home/door".to_string(),
            payload: "open".to_string(),
        })
        .await
        .unwrap();
    assert!(wait_for(|| job.calls().len() == 1).await);

    let soon = (Local::now() + chrono::Duration::seconds(1)).time();
    let id = setup
        .dispatcher
        .register(request("alarm", "tick", attach(1), Trigger::at(soon)))
        .await
        .unwrap();
    assert!(wait_for(|| job.calls().len() == 2).await);
    assert_eq!(job.calls()[1].function, "tick");
    assert!(setup.dispatcher.registration(id).is_none());

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_run_loop_fires_deadlines_and_device_events() {
    let setup = setup();
    let job = MockJob::new(1, "alarm");
    setup.dispatcher.jobs().register(job.clone());

    let shutdown = CancelToken::new();
    let running = tokio::spawn(setup.dispatcher.clone().run(shutdown.clone()));

    setup
        .dispatcher
        .register(request("alarm", "now", attach(1), Trigger::at_minutes_from_now(0)))
        .await
        .unwrap();
    assert!(wait_for(|| job.calls().len() == 1).await);
    assert_eq!(job.calls()[0].function, "now");

    let desk = DeviceIdentity::new("desk");
    setup
        .dispatcher
        .register(request(
            "alarm",
            "on_desk",
            attach(1),
            device_event(DeviceFilter::Individual(desk.clone())),
        ))
        .await
        .unwrap();
    setup
        .dispatcher
        .events()
        .send(DispatchEvent::DeviceEvent {
            driver: DriverIdentity::new("acme", "lamp"),
            device: desk,
            topic: "motion".to_string(),
            data: Value::Bool(true),
        })
        .await
        .unwrap();
    assert!(wait_for(|| job.calls().len() == 2).await);
    assert_eq!(job.calls()[1].function, "on_desk");

    shutdown.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_unregister_cancels_timer() {
    let setup = setup();
    let job = MockJob::new(1, "alarm");
    setup.dispatcher.jobs().register(job.clone());

    let shutdown = CancelToken::new();
    let running = tokio::spawn(setup.dispatcher.clone().run(shutdown.clone()));

    let soon = (Local::now() + chrono::Duration::milliseconds(300)).time();
    let id = setup
        .dispatcher
        .register(request("alarm", "tick", attach(1), Trigger::at(soon)))
        .await
        .unwrap();
    setup.dispatcher.unregister(id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(job.calls().is_empty());

    shutdown.cancel();
    running.await.unwrap();
}
