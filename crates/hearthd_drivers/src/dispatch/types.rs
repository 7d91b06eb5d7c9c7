//! Registrations and the triggers they wait on.

use std::time::Duration;

use chrono::DateTime;
use chrono::Local;
use chrono::NaiveTime;
use chrono::TimeZone;

use crate::driver::DeviceIdentity;
use crate::driver::DriverIdentity;

pub type RegistrationId = u64;
pub type JobId = u64;

/// Where a freshly allocated callback runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Against a driver's singletons, optionally with one of its devices.
    Driver {
        driver: DriverIdentity,
        device: Option<DeviceIdentity>,
    },
    /// As an ordinary script on behalf of a user.
    User { username: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallMode {
    /// Start a fresh execution for every delivery.
    Allocating { context: ExecutionContext },
    /// Run inside a job that must still be alive at delivery time.
    Attaching { job_id: JobId },
    /// Attach to a live job of the owning program if there is one,
    /// otherwise allocate in `fallback`.
    Adaptive { fallback: ExecutionContext },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledFunction {
    pub ident: String,
    /// `true` when `ident` is the name as written in the source.
    pub literal: bool,
    pub call_mode: CallMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FireAt {
    /// The next occurrence of a wall-clock time of day.
    TimeOfDay(NaiveTime),
    /// A fixed instant.
    Deadline(DateTime<Local>),
}

/// When a one-shot timer fires.
#[derive(Debug, Clone)]
pub struct TimeTrigger {
    pub at: FireAt,
    pub registered_at: DateTime<Local>,
}

impl PartialEq for TimeTrigger {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl TimeTrigger {
    pub fn new(at: NaiveTime) -> Self {
        Self {
            at: FireAt::TimeOfDay(at),
            registered_at: Local::now(),
        }
    }

    /// Time left until the trigger fires, seen from `now`.
    ///
    /// A time of day that already passed today fires tomorrow. A deadline in
    /// the past fires immediately.
    pub fn delay_from(&self, now: DateTime<Local>) -> Duration {
        let at = match &self.at {
            FireAt::Deadline(deadline) => return (*deadline - now).to_std().unwrap_or_default(),
            FireAt::TimeOfDay(at) => *at,
        };

        let mut date = now.date_naive();
        for _ in 0..2 {
            let next = Local.from_local_datetime(&date.and_time(at)).earliest();
            if let Some(next) = next.filter(|next| *next > now) {
                return (next - now).to_std().unwrap_or_default();
            }
            date = date.succ_opt().unwrap_or(date);
        }
        Duration::ZERO
    }

    /// Whole seconds since the trigger was registered.
    pub fn elapsed_secs(&self, now: DateTime<Local>) -> i64 {
        (now - self.registered_at).num_seconds().max(0)
    }
}

/// Which devices a device-event trigger listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Every device of a driver.
    Class(DriverIdentity),
    Individual(DeviceIdentity),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEventTrigger {
    pub filter: DeviceFilter,
    /// Event topics to listen on; `None` matches every topic.
    pub topics: Option<Vec<String>>,
}

impl DeviceEventTrigger {
    /// Listen to every topic of the filtered devices.
    pub fn new(filter: DeviceFilter) -> Self {
        Self {
            filter,
            topics: None,
        }
    }

    pub fn with_topics<S: Into<String>>(mut self, topics: impl IntoIterator<Item = S>) -> Self {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, driver: &DriverIdentity, device: &DeviceIdentity, topic: &str) -> bool {
        let selected = match &self.filter {
            DeviceFilter::Class(class) => class == driver,
            DeviceFilter::Individual(id) => id == device,
        };
        selected
            && self
                .topics
                .as_ref()
                .is_none_or(|topics| topics.iter().any(|t| t == topic))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Every message published to one of `topics`.
    Message { topics: Vec<String> },
    /// Once, at a time of day or a deadline.
    AtTime(TimeTrigger),
    /// Once, when job `job_id` terminates.
    Kill { job_id: JobId },
    /// Every event a matching device emits.
    DeviceEvent(DeviceEventTrigger),
}

impl Trigger {
    pub fn message<S: Into<String>>(topics: impl IntoIterator<Item = S>) -> Self {
        Trigger::Message {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    pub fn at(time: NaiveTime) -> Self {
        Trigger::AtTime(TimeTrigger::new(time))
    }

    pub fn at_minutes_from_now(minutes: i64) -> Self {
        let now = Local::now();
        Trigger::AtTime(TimeTrigger {
            at: FireAt::Deadline(now + chrono::Duration::minutes(minutes)),
            registered_at: now,
        })
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::AtTime(_) | Trigger::Kill { .. })
    }
}

/// What happens when registering or delivering fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Tolerance {
    /// Log and drop.
    #[default]
    BestEffort,
    /// Queue failed registrations and retry failed deliveries.
    Retry,
}

/// Who asked for a registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Origin {
    /// A running script.
    #[default]
    Script,
    /// A trigger annotation in driver code; replaced whenever the driver or
    /// device is reloaded.
    Annotation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRequest {
    pub program_id: String,
    pub function: CalledFunction,
    pub trigger: Trigger,
    pub tolerance: Tolerance,
    pub origin: Origin,
}

impl RegisterRequest {
    /// Whether this is an annotation registration for `driver` and
    /// `device`; `None` matches any.
    pub(crate) fn annotates(
        &self,
        driver: Option<&DriverIdentity>,
        device: Option<&DeviceIdentity>,
    ) -> bool {
        annotates(self.origin, &self.function, driver, device)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub id: RegistrationId,
    pub program_id: String,
    pub function: CalledFunction,
    pub trigger: Trigger,
    pub tolerance: Tolerance,
    pub origin: Origin,
}

impl Registration {
    pub(crate) fn new(id: RegistrationId, request: RegisterRequest) -> Self {
        Self {
            id,
            program_id: request.program_id,
            function: request.function,
            trigger: request.trigger,
            tolerance: request.tolerance,
            origin: request.origin,
        }
    }

    pub(crate) fn annotates(
        &self,
        driver: Option<&DriverIdentity>,
        device: Option<&DeviceIdentity>,
    ) -> bool {
        annotates(self.origin, &self.function, driver, device)
    }
}

fn annotates(
    origin: Origin,
    function: &CalledFunction,
    driver: Option<&DriverIdentity>,
    device: Option<&DeviceIdentity>,
) -> bool {
    let CallMode::Allocating {
        context:
            ExecutionContext::Driver {
                driver: target,
                device: target_device,
            },
    } = &function.call_mode
    else {
        return false;
    };
    origin == Origin::Annotation
        && driver.is_none_or(|driver| target == driver)
        && device.is_none_or(|device| target_device.as_ref() == Some(device))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local
            .from_local_datetime(
                &chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
                    .unwrap()
                    .and_hms_opt(h, m, s)
                    .unwrap(),
            )
            .earliest()
            .unwrap()
    }

    #[test]
    fn test_delay_later_today() {
        let trigger = TimeTrigger::new(NaiveTime::from_hms_opt(12, 30, 0).unwrap());
        assert_eq!(
            trigger.delay_from(local(12, 0, 0)),
            Duration::from_secs(30 * 60)
        );
    }

    #[test]
    fn test_delay_rolls_over_to_tomorrow() {
        let trigger = TimeTrigger::new(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        let delay = trigger.delay_from(local(7, 0, 0));
        // 23 hours, give or take a DST shift.
        assert!(delay > Duration::from_secs(21 * 3600));
        assert!(delay < Duration::from_secs(25 * 3600));
    }

    #[test]
    fn test_time_trigger_equality_ignores_registration_time() {
        let at = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        let first = TimeTrigger {
            at: FireAt::TimeOfDay(at),
            registered_at: local(1, 0, 0),
        };
        let second = TimeTrigger {
            at: FireAt::TimeOfDay(at),
            registered_at: local(2, 0, 0),
        };
        assert_eq!(Trigger::AtTime(first), Trigger::AtTime(second));
    }

    fn delay(trigger: &Trigger) -> Duration {
        match trigger {
            Trigger::AtTime(time) => time.delay_from(time.registered_at),
            other => panic!("not a timer: {:?}", other),
        }
    }

    #[test]
    fn test_minutes_from_now_is_a_deadline() {
        assert_eq!(delay(&Trigger::at_minutes_from_now(0)), Duration::ZERO);
        assert_eq!(
            delay(&Trigger::at_minutes_from_now(90)),
            Duration::from_secs(90 * 60)
        );
        // Longer than a day must not wrap around to a time of day.
        assert_eq!(
            delay(&Trigger::at_minutes_from_now(1500)),
            Duration::from_secs(1500 * 60)
        );
    }

    #[test]
    fn test_past_deadline_fires_immediately() {
        let trigger = TimeTrigger {
            at: FireAt::Deadline(local(6, 0, 0)),
            registered_at: local(5, 0, 0),
        };
        assert_eq!(trigger.delay_from(local(7, 0, 0)), Duration::ZERO);
        assert_eq!(trigger.elapsed_secs(local(7, 0, 0)), 7200);
    }

    #[test]
    fn test_device_event_matching() {
        let lamp = DriverIdentity::new("acme", "lamp");
        let desk = DeviceIdentity::new("desk");
        let hall = DeviceIdentity::new("hall");

        let class = DeviceEventTrigger::new(DeviceFilter::Class(lamp.clone()));
        assert!(class.matches(&lamp, &desk, "anything"));
        assert!(class.matches(&lamp, &hall, "anything"));
        assert!(!class.matches(&DriverIdentity::new("acme", "switch"), &desk, "anything"));

        let individual =
            DeviceEventTrigger::new(DeviceFilter::Individual(desk.clone())).with_topics(["motion"]);
        assert!(individual.matches(&lamp, &desk, "motion"));
        assert!(!individual.matches(&lamp, &desk, "power"));
        assert!(!individual.matches(&lamp, &hall, "motion"));
    }

    #[test]
    fn test_one_shot() {
        assert!(!Trigger::message(["a"]).is_one_shot());
        let device = DeviceEventTrigger::new(DeviceFilter::Individual(DeviceIdentity::new("a")));
        assert!(!Trigger::DeviceEvent(device).is_one_shot());
        assert!(Trigger::Kill { job_id: 1 }.is_one_shot());
        assert!(Trigger::at_minutes_from_now(5).is_one_shot());
    }
}
