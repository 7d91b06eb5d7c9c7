//! Contract between the driver layer and the embedded scripting engine.
//!
//! The engine (parser, analyzer, compiler and VM) is an external component.
//! This module only describes what the driver layer needs from it:
//!
//! - `analyze`: source text to an [`AnalyzedProgram`] or diagnostics
//! - `compile`: analyzed program to an invokable [`CompiledUnit`]
//! - `invoke`: run one function with injected singletons under a [`CancelToken`]
//!
//! Values cross the boundary as [`Value`] trees; script-level failures are
//! [`ScriptDiagnostic`]s and never mix with host failures ([`EngineError`]).

mod cache;
mod cancel;
mod diagnostic;
mod program;
mod value;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

pub use cache::source_digest;
pub use cache::CompileCache;
pub use cancel::CancelToken;
pub use cancel::DeadlineGuard;
pub use diagnostic::format_script_diagnostics;
pub use diagnostic::has_errors;
pub use diagnostic::DiagnosticKind;
pub use diagnostic::ScriptDiagnostic;
pub use diagnostic::Severity;
pub use diagnostic::Span;
pub use diagnostic::DRIVER_INTERRUPT;
pub use program::Analysis;
pub use program::AnalyzedProgram;
pub use program::CompiledUnit;
pub use program::FunctionCall;
pub use program::FunctionSignature;
pub use program::InvokeOutcome;
pub use program::InvokeRequest;
pub use program::MethodDecl;
pub use program::ObjectField;
pub use program::ScriptType;
pub use program::SingletonDecl;
pub use program::TemplateImpl;
pub use program::TriggerAnnotation;
pub use value::RangeValue;
pub use value::Value;
pub use value::ValueKind;

use crate::schema::ConfigSchema;

/// Host-side failure of the script engine, as opposed to a script fault.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to compile `{program_id}`: {message}")]
    Compile { program_id: String, message: String },

    #[error("Script engine failure while running `{program_id}`: {message}")]
    Host { program_id: String, message: String },

    #[error("Singleton `{singleton}` missing from the result of `{program_id}`")]
    MissingSingleton {
        program_id: String,
        singleton: String,
    },
}

/// The embedded scripting engine, as seen from the driver layer.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Parse and type-check `source`.
    fn analyze(&self, program_id: &str, source: &str) -> Result<Analysis, EngineError>;

    /// Turn an analyzed program into an invokable unit.
    fn compile(&self, program: &AnalyzedProgram) -> Result<CompiledUnit, EngineError>;

    /// Run one function of a compiled unit.
    ///
    /// The engine must check `cancel` at its suspension points and report a
    /// cancelled run as a runtime diagnostic.
    async fn invoke(
        &self,
        unit: &CompiledUnit,
        request: InvokeRequest,
        cancel: CancelToken,
    ) -> Result<InvokeOutcome, EngineError>;

    /// Expose a value to external callers.
    fn marshal(&self, value: &Value) -> serde_json::Value {
        value.to_json()
    }

    fn zero_value(&self, schema: &ConfigSchema) -> Value {
        schema.zero_value()
    }
}
