use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::diagnostic::ScriptDiagnostic;
use super::diagnostic::Span;
use super::value::Value;

/// Script-level type as reported by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptType {
    Null,
    Int,
    Float,
    Bool,
    String,
    Range,
    Any,
    Never,
    /// The analyzer could not resolve the type.
    Unknown,
    List(Box<ScriptType>),
    Option(Box<ScriptType>),
    Object(Vec<ObjectField>),
    Function {
        params: Vec<ScriptType>,
        returns: Box<ScriptType>,
    },
    Union(Vec<ScriptType>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub ty: ScriptType,
}

impl ObjectField {
    pub fn new(name: impl Into<String>, ty: ScriptType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl ScriptType {
    pub fn list(inner: ScriptType) -> Self {
        ScriptType::List(Box::new(inner))
    }

    pub fn option(inner: ScriptType) -> Self {
        ScriptType::Option(Box::new(inner))
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, ScriptType)>) -> Self {
        ScriptType::Object(
            fields
                .into_iter()
                .map(|(name, ty)| ObjectField::new(name, ty))
                .collect(),
        )
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptType::Null => write!(f, "null"),
            ScriptType::Int => write!(f, "int"),
            ScriptType::Float => write!(f, "float"),
            ScriptType::Bool => write!(f, "bool"),
            ScriptType::String => write!(f, "str"),
            ScriptType::Range => write!(f, "range"),
            ScriptType::Any => write!(f, "any"),
            ScriptType::Never => write!(f, "!"),
            ScriptType::Unknown => write!(f, "unknown"),
            ScriptType::List(inner) => write!(f, "[{}]", inner),
            ScriptType::Option(inner) => write!(f, "?{}", inner),
            ScriptType::Object(fields) => {
                write!(f, "{{")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", field.name, field.ty)?;
                }
                write!(f, " }}")
            }
            ScriptType::Function { params, returns } => {
                write!(f, "fn(")?;
                for (idx, param) in params.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ") -> {}", returns)
            }
            ScriptType::Union(variants) => {
                for (idx, variant) in variants.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", variant)?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Analyzed programs
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub span: Span,
}

/// An `impl <Template> with { capabilities } for <Singleton>` block.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateImpl {
    pub template: String,
    pub capabilities: Vec<String>,
    pub methods: Vec<MethodDecl>,
    pub span: Span,
}

impl TemplateImpl {
    pub fn method(&self, name: &str) -> Option<&MethodDecl> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingletonDecl {
    pub ident: String,
    pub ty: ScriptType,
    pub implements: Vec<TemplateImpl>,
    pub span: Span,
}

impl SingletonDecl {
    pub fn template(&self, name: &str) -> Option<&TemplateImpl> {
        self.implements.iter().find(|i| i.template == name)
    }
}

/// A `@trigger(topics_fn)` annotation on a driver function.
///
/// `topics_fn` is run once per device and returns the message topics
/// `callback` listens on for that device.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerAnnotation {
    pub callback: String,
    pub topics_fn: String,
    pub span: Span,
}

/// Result of a successful analysis: the declarations the driver layer needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzedProgram {
    pub program_id: String,
    pub singletons: Vec<SingletonDecl>,
    pub triggers: Vec<TriggerAnnotation>,
    /// Span of the whole main module, used when nothing more precise exists.
    pub span: Span,
}

impl AnalyzedProgram {
    pub fn singleton(&self, ident: &str) -> Option<&SingletonDecl> {
        self.singletons.iter().find(|s| s.ident == ident)
    }

    /// Span of a template method implemented by any singleton.
    pub fn method_span(&self, name: &str) -> Option<&Span> {
        self.singletons
            .iter()
            .flat_map(|s| s.implements.iter())
            .find_map(|i| i.method(name))
            .map(|m| &m.span)
    }
}

#[derive(Debug, Clone)]
pub enum Analysis {
    Analyzed {
        program: AnalyzedProgram,
        warnings: Vec<ScriptDiagnostic>,
    },
    Rejected {
        diagnostics: Vec<ScriptDiagnostic>,
    },
}

/// Engine-specific compiled artifact.
#[derive(Clone)]
pub struct CompiledUnit {
    program_id: String,
    artifact: Arc<dyn Any + Send + Sync>,
}

impl CompiledUnit {
    pub fn new(program_id: impl Into<String>, artifact: impl Any + Send + Sync) -> Self {
        Self {
            program_id: program_id.into(),
            artifact: Arc::new(artifact),
        }
    }

    pub fn program_id(&self) -> &str {
        &self.program_id
    }

    pub fn artifact<T: Any>(&self) -> Option<&T> {
        self.artifact.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("program_id", &self.program_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Invocation
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    pub params: Vec<(String, ScriptType)>,
    pub returns: ScriptType,
}

impl FunctionSignature {
    pub fn new<K: Into<String>>(
        params: impl IntoIterator<Item = (K, ScriptType)>,
        returns: ScriptType,
    ) -> Self {
        Self {
            params: params.into_iter().map(|(k, t)| (k.into(), t)).collect(),
            returns,
        }
    }

    /// Signature of a parameterless function.
    pub fn returning(returns: ScriptType) -> Self {
        Self {
            params: Vec::new(),
            returns,
        }
    }
}

/// A call to one script function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: String,
    /// `true` when `function` is the literal source name, `false` when it is
    /// an already-mangled identifier resolved by the analyzer.
    pub literal_name: bool,
    pub signature: FunctionSignature,
    pub args: Vec<Value>,
}

impl FunctionCall {
    pub fn new(function: impl Into<String>, signature: FunctionSignature, args: Vec<Value>) -> Self {
        Self {
            function: function.into(),
            literal_name: true,
            signature,
            args,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub call: FunctionCall,
    /// Singleton values injected under their fixed names (`@Driver`, `@Device`).
    pub singletons: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Completed {
        value: Value,
        singletons: BTreeMap<String, Value>,
    },
    Failed {
        diagnostics: Vec<ScriptDiagnostic>,
    },
}
