use serde::Deserialize;
use serde::Serialize;

/// Byte range inside a named script source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub filename: String,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(filename: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            filename: filename.into(),
            start,
            end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Hint,
}

/// Where in the script lifecycle a diagnostic was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum DiagnosticKind {
    Syntax,
    Semantic,
    /// A fault raised while the script was running. `kind` names the
    /// interrupt class (`throw`, `timeout`, `driver`, ...).
    Runtime { kind: String },
}

/// Interrupt class used for faults synthesized by the driver layer itself.
pub const DRIVER_INTERRUPT: &str = "driver";

/// A diagnostic reported by the script engine or synthesized on behalf of a
/// driver script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDiagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub span: Span,
}

impl ScriptDiagnostic {
    /// Semantic error, as produced while analyzing a driver.
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Error,
            kind: DiagnosticKind::Semantic,
            message: message.into(),
            notes: Vec::new(),
            span,
        }
    }

    pub fn runtime(kind: impl Into<String>, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Error,
            kind: DiagnosticKind::Runtime { kind: kind.into() },
            message: message.into(),
            notes: Vec::new(),
            span,
        }
    }

    /// Runtime fault attributed to a misbehaving driver function.
    pub fn driver_fault(message: impl Into<String>, span: Span) -> Self {
        Self::runtime(DRIVER_INTERRUPT, message, span)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for ScriptDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DiagnosticKind::Syntax => write!(f, "syntax {}: {}", self.severity, self.message)?,
            DiagnosticKind::Semantic => write!(f, "{}: {}", self.severity, self.message)?,
            DiagnosticKind::Runtime { kind } => {
                write!(f, "runtime {} ({}): {}", self.severity, kind, self.message)?
            }
        }
        for note in &self.notes {
            write!(f, "\n  note: {}", note)?;
        }
        Ok(())
    }
}

pub fn has_errors(diagnostics: &[ScriptDiagnostic]) -> bool {
    diagnostics.iter().any(ScriptDiagnostic::is_error)
}

/// Render diagnostics against their source using Ariadne.
pub fn format_script_diagnostics(
    diagnostics: &[ScriptDiagnostic],
    source: &str,
    filename: &str,
) -> String {
    use ariadne::Color;
    use ariadne::Label;
    use ariadne::Report;
    use ariadne::ReportKind;
    use ariadne::Source;

    let mut output = Vec::new();
    for diagnostic in diagnostics {
        let end = diagnostic.span.end.min(source.len());
        let span = diagnostic.span.start.min(end)..end;
        let (kind, color) = match diagnostic.severity {
            Severity::Error => (ReportKind::Error, Color::Red),
            Severity::Warning => (ReportKind::Warning, Color::Yellow),
            Severity::Hint => (ReportKind::Advice, Color::Cyan),
        };

        let mut report = Report::build(kind, (filename, span.clone()))
            .with_message(&diagnostic.message)
            .with_label(
                Label::new((filename, span))
                    .with_message(&diagnostic.message)
                    .with_color(color),
            );
        for note in &diagnostic.notes {
            report = report.with_note(note);
        }

        report
            .finish()
            .write((filename, Source::from(source)), &mut output)
            .ok();
    }
    String::from_utf8_lossy(&output).to_string()
}
