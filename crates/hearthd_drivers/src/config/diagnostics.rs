use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;

/// A loaded config file, kept for rendering diagnostics against it.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warnings don't prevent the config from loading.
#[derive(Debug, Clone)]
pub enum Warning {
    EmptyConfig { file_path: PathBuf },
}

#[derive(Debug, Clone)]
pub enum Error {
    Merge(MergeError),
    Validation(ValidationError),
}

/// The same field set in more than one file.
#[derive(Debug, Clone)]
pub struct MergeError {
    pub field_path: String,
    pub message: String,
    pub conflicts: Vec<MergeConflictLocation>,
}

#[derive(Debug, Clone)]
pub struct MergeConflictLocation {
    pub file_path: PathBuf,
    pub span: Range<usize>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
    /// Where the offending value was set, if it was set at all.
    pub location: Option<MergeConflictLocation>,
}

/// Failure to produce a [`Config`](super::Config) from files.
#[derive(Debug)]
pub enum LoadError {
    Io { path: PathBuf, error: std::io::Error },
    Parse { path: PathBuf, error: toml::de::Error },
    ImportCycle { path: PathBuf, cycle: Vec<PathBuf> },
    Invalid { diagnostics: Vec<Diagnostic> },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io { path, error } => {
                write!(f, "Failed to read '{}': {}", path.display(), error)
            }
            LoadError::Parse { path, error } => {
                write!(f, "Failed to parse '{}': {}", path.display(), error)
            }
            LoadError::ImportCycle { path, cycle } => write!(
                f,
                "Import cycle detected at '{}': involves {} file(s)",
                path.display(),
                cycle.len()
            ),
            LoadError::Invalid { diagnostics } => {
                write!(f, "{}", format_diagnostics(diagnostics))
            }
        }
    }
}

impl std::error::Error for LoadError {}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }
}

fn file_id(location: &MergeConflictLocation) -> String {
    location.file_path.to_string_lossy().to_string()
}

/// Render diagnostics with ariadne, without colors.
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    use ariadne::Color;
    use ariadne::Config;
    use ariadne::Label;
    use ariadne::Report;
    use ariadne::ReportKind;

    let mut output = Vec::new();

    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Warning(Warning::EmptyConfig { file_path }) => {
                let message = format!(
                    "Warning: Config file '{}' is empty and has no effect\n",
                    file_path.display()
                );
                output.extend_from_slice(message.as_bytes());
            }
            Diagnostic::Error(Error::Merge(merge)) => {
                let Some(first) = merge.conflicts.first() else {
                    let message = format!("Error: {}\n", merge.message);
                    output.extend_from_slice(message.as_bytes());
                    continue;
                };

                let mut report = Report::build(ReportKind::Error, (file_id(first), first.span.clone()))
                    .with_config(Config::default().with_color(false))
                    .with_message(format!("Merge conflict in field '{}'", merge.field_path))
                    .with_note(&merge.message);

                for (idx, conflict) in merge.conflicts.iter().enumerate() {
                    let (message, color) = if idx == 0 {
                        ("first definition here", Color::Red)
                    } else {
                        ("conflicts with this definition", Color::Yellow)
                    };
                    report = report.with_label(
                        Label::new((file_id(conflict), conflict.span.clone()))
                            .with_message(message)
                            .with_color(color),
                    );
                }

                // One cache entry per file; the conflicts usually span two.
                let sources: HashMap<String, String> = merge
                    .conflicts
                    .iter()
                    .map(|conflict| (file_id(conflict), conflict.content.clone()))
                    .collect();
                report
                    .finish()
                    .write(ariadne::sources(sources), &mut output)
                    .ok();
            }
            Diagnostic::Error(Error::Validation(validation)) => match &validation.location {
                Some(location) => {
                    Report::build(ReportKind::Error, (file_id(location), location.span.clone()))
                        .with_config(Config::default().with_color(false))
                        .with_message(format!("Invalid value for '{}'", validation.field_path))
                        .with_label(
                            Label::new((file_id(location), location.span.clone()))
                                .with_message(&validation.message)
                                .with_color(Color::Red),
                        )
                        .finish()
                        .write(
                            ariadne::sources([(file_id(location), location.content.clone())]),
                            &mut output,
                        )
                        .ok();
                }
                None => {
                    let message = format!(
                        "Validation error in '{}': {}\n",
                        validation.field_path, validation.message
                    );
                    output.extend_from_slice(message.as_bytes());
                }
            },
        }
    }

    String::from_utf8_lossy(&output).to_string()
}
