use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use toml::Spanned;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::MergeConflictLocation;
use super::diagnostics::ValidationError;
use super::partial::MergedConfig;
use super::partial::PartialConfig;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "hearthd-drivers";

#[derive(Debug, Default, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub invocation: InvocationConfig,
    pub dispatcher: DispatcherConfig,
    /// Message broker; message triggers are unavailable without one.
    pub mqtt: Option<MqttConfig>,
}

// Deserialize is needed for toml::Spanned<LogLevel> in the partial config.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Per-target levels, e.g. `"hearthd_drivers::dispatch" = "debug"`.
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

#[derive(Debug, Default, Clone)]
pub struct StoreConfig {
    /// JSON record file. Records are kept in memory only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct InvocationConfig {
    pub timeout_secs: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl InvocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub delivery_attempts: u32,
    pub retry_delay_ms: u64,
    pub pending_retry_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            delivery_attempts: 3,
            retry_delay_ms: 500,
            pending_retry_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn value<T>(field: Option<Spanned<T>>) -> Option<T> {
    field.map(Spanned::into_inner)
}

impl Config {
    /// Load and merge config files, following their imports.
    ///
    /// Returns the config with any warnings, or every error found across
    /// all files.
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), LoadError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (merged, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(merged, diagnostics)
    }

    pub fn from_partial(
        merged: MergedConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), LoadError> {
        let MergedConfig {
            config: partial,
            locations,
        } = merged;
        let mut invalid = Invalid {
            locations: &locations,
            diagnostics: &mut diagnostics,
        };

        let logging = partial
            .logging
            .map(|logging| LoggingConfig {
                level: value(logging.level).unwrap_or_default(),
                overrides: logging
                    .overrides
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(target, level)| (target, level.into_inner()))
                    .collect(),
            })
            .unwrap_or_default();

        let store = StoreConfig {
            path: partial.store.and_then(|store| value(store.path)),
        };

        let mut invocation = InvocationConfig::default();
        if let Some(partial) = partial.invocation {
            if let Some(timeout_secs) = value(partial.timeout_secs) {
                if timeout_secs == 0 {
                    invalid.push("invocation.timeout_secs", "must be at least 1 second");
                }
                invocation.timeout_secs = timeout_secs;
            }
        }

        let mut dispatcher = DispatcherConfig::default();
        if let Some(partial) = partial.dispatcher {
            if let Some(attempts) = value(partial.delivery_attempts) {
                if attempts == 0 {
                    invalid.push("dispatcher.delivery_attempts", "must be at least 1");
                }
                dispatcher.delivery_attempts = attempts;
            }
            if let Some(delay) = value(partial.retry_delay_ms) {
                dispatcher.retry_delay_ms = delay;
            }
            if let Some(secs) = value(partial.pending_retry_secs) {
                if secs == 0 {
                    invalid.push("dispatcher.pending_retry_secs", "must be at least 1 second");
                }
                dispatcher.pending_retry_secs = secs;
            }
        }

        let mqtt = match partial.mqtt {
            None => None,
            Some(partial) => match value(partial.host) {
                Some(host) => Some(MqttConfig {
                    host,
                    port: value(partial.port).unwrap_or(DEFAULT_MQTT_PORT),
                    client_id: value(partial.client_id)
                        .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                    username: value(partial.username),
                    password: value(partial.password),
                }),
                None => {
                    invalid.push("mqtt.host", "required when [mqtt] is present");
                    None
                }
            },
        };

        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(LoadError::Invalid { diagnostics });
        }

        Ok((
            Self {
                logging,
                store,
                invocation,
                dispatcher,
                mqtt,
            },
            diagnostics,
        ))
    }
}

struct Invalid<'a> {
    locations: &'a HashMap<String, MergeConflictLocation>,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl Invalid<'_> {
    fn push(&mut self, field_path: &str, message: &str) {
        self.diagnostics
            .push(Diagnostic::Error(Error::Validation(ValidationError {
                field_path: field_path.to_string(),
                message: message.to_string(),
                location: self.locations.get(field_path).cloned(),
            })));
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tracing::Level;

    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "empty.toml", "");

        let (config, diagnostics) = Config::from_files(&[path]).unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics[0].is_error());
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.invocation.timeout(), Duration::from_secs(10));
        assert_eq!(config.dispatcher.delivery_attempts, 3);
        assert_eq!(config.dispatcher.retry_delay_ms, 500);
        assert_eq!(config.dispatcher.pending_retry_secs, 30);
        assert!(config.store.path.is_none());
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "hearthd.toml",
            r#"
[logging]
level = "warn"

[logging.overrides]
"hearthd_drivers::dispatch" = "debug"

[store]
path = "/var/lib/hearthd/drivers.json"

[invocation]
timeout_secs = 5

[dispatcher]
delivery_attempts = 5
retry_delay_ms = 250
pending_retry_secs = 60

[mqtt]
host = "broker.local"
username = "hearthd"
password = "secret"
"#,
        );

        let (config, diagnostics) = Config::from_files(&[path]).unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(
            config.logging.overrides.get("hearthd_drivers::dispatch"),
            Some(&LogLevel::Debug)
        );
        assert_eq!(
            config.store.path,
            Some(PathBuf::from("/var/lib/hearthd/drivers.json"))
        );
        assert_eq!(config.invocation.timeout_secs, 5);
        assert_eq!(config.dispatcher.delivery_attempts, 5);
        assert_eq!(config.dispatcher.retry_delay_ms, 250);
        assert_eq!(config.dispatcher.pending_retry_secs, 60);

        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, DEFAULT_MQTT_PORT);
        assert_eq!(mqtt.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(mqtt.username.as_deref(), Some("hearthd"));
    }

    #[test]
    fn test_merge_non_overlapping_configs() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "base.toml",
            r#"
[logging]
level = "info"

[dispatcher]
delivery_attempts = 4
"#,
        );
        let secrets = write(
            dir.path(),
            "secrets.toml",
            r#"
[logging.overrides]
"hearthd_drivers::driver" = "trace"

[mqtt]
host = "localhost"
password = "hunter2"
"#,
        );

        let (config, diagnostics) = Config::from_files(&[base, secrets]).unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(config.dispatcher.delivery_attempts, 4);
        assert_eq!(config.logging.overrides.len(), 1);
        assert_eq!(config.mqtt.unwrap().password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_conflict_detection() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(dir.path(), "base.toml", "[logging]\nlevel = \"info\"\n");
        let other = write(
            dir.path(),
            "other.toml",
            "[logging]\nlevel = \"debug\"\n\n[invocation]\ntimeout_secs = 3\n",
        );

        let err = Config::from_files(&[base, other]).unwrap_err();
        let LoadError::Invalid { diagnostics } = &err else {
            panic!("expected merge conflict, got {}", err);
        };
        assert_eq!(diagnostics.len(), 1);

        let rendered = err.to_string();
        assert!(rendered.contains("Merge conflict in field 'logging.level'"));
        assert!(rendered.contains("first definition here"));
        assert!(rendered.contains("conflicts with this definition"));
        assert!(rendered.contains("base.toml"));
        assert!(rendered.contains("other.toml"));
    }

    #[test]
    fn test_override_conflicts_are_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(
            dir.path(),
            "a.toml",
            "[logging.overrides]\n\"hearthd_drivers::driver\" = \"debug\"\n",
        );
        let b = write(
            dir.path(),
            "b.toml",
            "[logging.overrides]\n\"hearthd_drivers::dispatch\" = \"debug\"\n\"hearthd_drivers::driver\" = \"trace\"\n",
        );

        let err = Config::from_files(&[a, b]).unwrap_err();
        assert!(err
            .to_string()
            .contains("Merge conflict in field 'logging.overrides.hearthd_drivers::driver'"));
    }

    #[test]
    fn test_mqtt_requires_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "mqtt.toml", "[mqtt]\nport = 1884\n");

        let err = Config::from_files(&[path]).unwrap_err();
        insta::assert_snapshot!(err.to_string().trim_end(), @"Validation error in 'mqtt.host': required when [mqtt] is present");
    }

    #[test]
    fn test_zero_attempts_points_at_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "dispatcher.toml",
            "[dispatcher]\ndelivery_attempts = 0\n",
        );

        let rendered = Config::from_files(&[path]).unwrap_err().to_string();
        assert!(rendered.contains("Invalid value for 'dispatcher.delivery_attempts'"));
        assert!(rendered.contains("must be at least 1"));
    }

    #[test]
    fn test_import_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.toml", "[invocation]\ntimeout_secs = 2\n");
        let main = write(
            dir.path(),
            "main.toml",
            "imports = [\"base.toml\"]\n\n[store]\npath = \"drivers.json\"\n",
        );

        let (config, _) = Config::from_files(&[main]).unwrap();
        assert_eq!(config.invocation.timeout_secs, 2);
        assert_eq!(config.store.path, Some(PathBuf::from("drivers.json")));
    }

    #[test]
    fn test_shared_import_is_merged_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "common.toml", "[invocation]\ntimeout_secs = 4\n");
        write(dir.path(), "left.toml", "imports = [\"common.toml\"]\n");
        write(dir.path(), "right.toml", "imports = [\"common.toml\"]\n");
        let main = write(
            dir.path(),
            "main.toml",
            "imports = [\"left.toml\", \"right.toml\"]\n",
        );

        let (config, diagnostics) = Config::from_files(&[main]).unwrap();
        assert_eq!(config.invocation.timeout_secs, 4);
        assert!(!diagnostics.iter().any(Diagnostic::is_error));
    }

    #[test]
    fn test_import_cycle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "imports = [\"b.toml\"]\n");
        write(dir.path(), "b.toml", "imports = [\"a.toml\"]\n");

        let err = Config::from_files(&[a]).unwrap_err();
        assert!(matches!(err, LoadError::ImportCycle { .. }));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "broken.toml", "[logging\n");

        let err = Config::from_files(&[path]).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse '"));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_logging_targets() {
        let logging = LoggingConfig {
            level: LogLevel::Warn,
            overrides: HashMap::from([(
                "hearthd_drivers::dispatch".to_string(),
                LogLevel::Debug,
            )]),
        };
        let targets = logging.targets();

        assert!(targets.would_enable("hearthd_drivers::dispatch::dispatcher", &Level::DEBUG));
        assert!(!targets.would_enable("hearthd_drivers::driver", &Level::INFO));
        assert!(targets.would_enable("hearthd_drivers::driver", &Level::WARN));
    }
}
