use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use toml::Spanned;

use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::MergeConflictLocation;
use super::diagnostics::MergeError;
use super::diagnostics::SourceInfo;
use super::diagnostics::Warning;
use super::LogLevel;

/// One config file as written, every value optional and spanned.
#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub store: Option<PartialStoreConfig>,
    pub invocation: Option<PartialInvocationConfig>,
    pub dispatcher: Option<PartialDispatcherConfig>,
    pub mqtt: Option<PartialMqttConfig>,

    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialStoreConfig {
    pub path: Option<Spanned<PathBuf>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialInvocationConfig {
    pub timeout_secs: Option<Spanned<u64>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialDispatcherConfig {
    pub delivery_attempts: Option<Spanned<u32>>,
    pub retry_delay_ms: Option<Spanned<u64>>,
    pub pending_retry_secs: Option<Spanned<u64>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialMqttConfig {
    pub host: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
    pub client_id: Option<Spanned<String>>,
    pub username: Option<Spanned<String>>,
    pub password: Option<Spanned<String>>,
}

/// Merged config plus where each field was first set.
#[derive(Debug, Default)]
pub struct MergedConfig {
    pub config: PartialConfig,
    pub locations: HashMap<String, MergeConflictLocation>,
}

impl PartialConfig {
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;
        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });
        Ok(config)
    }

    /// Load `paths` and everything they import, imports before importers.
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut stack = HashSet::new();
        let mut loaded = HashSet::new();
        let mut configs = Vec::new();
        for path in paths {
            Self::load_recursive(path, &mut stack, &mut loaded, &mut configs)?;
        }
        Ok(configs)
    }

    fn load_recursive(
        path: &Path,
        stack: &mut HashSet<PathBuf>,
        loaded: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if loaded.contains(&canonical) {
            return Ok(());
        }
        if !stack.insert(canonical.clone()) {
            return Err(LoadError::ImportCycle {
                path: canonical,
                cycle: stack.iter().cloned().collect(),
            });
        }

        let config = Self::from_file(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for import in &config.imports {
            Self::load_recursive(&base.join(import), stack, loaded, configs)?;
        }
        configs.push(config);

        // Sibling branches may import the same file; it is merged once.
        stack.remove(&canonical);
        loaded.insert(canonical);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.imports.is_empty()
            && self.logging.is_none()
            && self.store.is_none()
            && self.invocation.is_none()
            && self.dispatcher.is_none()
            && self.mqtt.is_none()
    }

    /// Merge configs first-wins. A field set in two files is kept from the
    /// first and reported as a conflict; merging carries on so every
    /// conflict is reported at once.
    pub fn merge<I>(configs: I) -> (MergedConfig, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut merger = Merger::default();
        let mut result = PartialConfig::default();

        for config in configs {
            let source = config.source.clone().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });
            if config.is_empty() {
                merger.diagnostics.push(Diagnostic::Warning(Warning::EmptyConfig {
                    file_path: source.file_path.clone(),
                }));
            }
            result.imports.extend(config.imports);

            if let Some(logging) = config.logging {
                let into = result.logging.get_or_insert_with(Default::default);
                merger.field("logging.level", &source, &mut into.level, logging.level);
                let overrides = into.overrides.get_or_insert_with(HashMap::new);
                for (target, level) in logging.overrides.into_iter().flatten() {
                    let path = format!("logging.overrides.{}", target);
                    let mut slot = overrides.remove(&target);
                    merger.field(&path, &source, &mut slot, Some(level));
                    if let Some(level) = slot {
                        overrides.insert(target, level);
                    }
                }
            }

            if let Some(store) = config.store {
                let into = result.store.get_or_insert_with(Default::default);
                merger.field("store.path", &source, &mut into.path, store.path);
            }

            if let Some(invocation) = config.invocation {
                let into = result.invocation.get_or_insert_with(Default::default);
                merger.field(
                    "invocation.timeout_secs",
                    &source,
                    &mut into.timeout_secs,
                    invocation.timeout_secs,
                );
            }

            if let Some(dispatcher) = config.dispatcher {
                let into = result.dispatcher.get_or_insert_with(Default::default);
                merger.field(
                    "dispatcher.delivery_attempts",
                    &source,
                    &mut into.delivery_attempts,
                    dispatcher.delivery_attempts,
                );
                merger.field(
                    "dispatcher.retry_delay_ms",
                    &source,
                    &mut into.retry_delay_ms,
                    dispatcher.retry_delay_ms,
                );
                merger.field(
                    "dispatcher.pending_retry_secs",
                    &source,
                    &mut into.pending_retry_secs,
                    dispatcher.pending_retry_secs,
                );
            }

            if let Some(mqtt) = config.mqtt {
                let into = result.mqtt.get_or_insert_with(Default::default);
                merger.field("mqtt.host", &source, &mut into.host, mqtt.host);
                merger.field("mqtt.port", &source, &mut into.port, mqtt.port);
                merger.field("mqtt.client_id", &source, &mut into.client_id, mqtt.client_id);
                merger.field("mqtt.username", &source, &mut into.username, mqtt.username);
                merger.field("mqtt.password", &source, &mut into.password, mqtt.password);
            }
        }

        (
            MergedConfig {
                config: result,
                locations: merger.seen,
            },
            merger.diagnostics,
        )
    }
}

#[derive(Default)]
struct Merger {
    seen: HashMap<String, MergeConflictLocation>,
    diagnostics: Vec<Diagnostic>,
}

impl Merger {
    fn field<T>(
        &mut self,
        path: &str,
        source: &SourceInfo,
        into: &mut Option<Spanned<T>>,
        value: Option<Spanned<T>>,
    ) {
        let Some(value) = value else {
            return;
        };
        let location = MergeConflictLocation {
            file_path: source.file_path.clone(),
            span: value.span(),
            content: source.content.clone(),
        };

        match self.seen.get(path) {
            Some(first) => {
                self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                    field_path: path.to_string(),
                    message: format!("'{}' is defined in multiple config files", path),
                    conflicts: vec![first.clone(), location],
                })));
            }
            None => {
                self.seen.insert(path.to_string(), location);
                *into = Some(value);
            }
        }
    }
}
