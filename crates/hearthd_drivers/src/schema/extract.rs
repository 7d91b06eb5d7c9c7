use serde::Deserialize;
use serde::Serialize;

use super::AtomKind;
use super::ConfigSchema;
use crate::driver::check_conformance;
use crate::driver::CapabilitySet;
use crate::driver::Template;
use crate::script::Analysis;
use crate::script::AnalyzedProgram;
use crate::script::EngineError;
use crate::script::ScriptDiagnostic;
use crate::script::ScriptEngine;
use crate::script::ScriptType;
use crate::script::Span;

pub const DRIVER_SINGLETON: &str = "@Driver";
pub const DEVICE_SINGLETON: &str = "@Device";

/// Configuration shapes and capabilities of one driver script revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub driver_config: ConfigSchema,
    pub device_config: ConfigSchema,
    pub driver_capabilities: CapabilitySet,
    pub device_capabilities: CapabilitySet,
}

#[derive(Debug, Clone)]
pub enum Extraction {
    Valid {
        info: DriverInfo,
        program: AnalyzedProgram,
        warnings: Vec<ScriptDiagnostic>,
    },
    Invalid {
        diagnostics: Vec<ScriptDiagnostic>,
    },
}

impl Extraction {
    pub fn info(&self) -> Option<&DriverInfo> {
        match self {
            Extraction::Valid { info, .. } => Some(info),
            Extraction::Invalid { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Extraction::Valid { .. })
    }

    pub fn diagnostics(&self) -> &[ScriptDiagnostic] {
        match self {
            Extraction::Valid { warnings, .. } => warnings,
            Extraction::Invalid { diagnostics } => diagnostics,
        }
    }
}

/// Analyze a driver script and derive its [`DriverInfo`].
pub fn extract_driver_info(
    engine: &dyn ScriptEngine,
    program_id: &str,
    source: &str,
) -> Result<Extraction, EngineError> {
    let (program, warnings) = match engine.analyze(program_id, source)? {
        Analysis::Analyzed { program, warnings } => (program, warnings),
        Analysis::Rejected { diagnostics } => return Ok(Extraction::Invalid { diagnostics }),
    };

    Ok(match extract_from_program(&program) {
        Ok(info) => Extraction::Valid {
            info,
            program,
            warnings,
        },
        Err(diagnostics) => Extraction::Invalid { diagnostics },
    })
}

/// Derive a [`DriverInfo`] from an already analyzed program.
///
/// Problems with both singletons are reported together.
pub fn extract_from_program(program: &AnalyzedProgram) -> Result<DriverInfo, Vec<ScriptDiagnostic>> {
    let mut diagnostics = Vec::new();
    let driver = singleton_config(program, DRIVER_SINGLETON, Template::Driver, &mut diagnostics);
    let device = singleton_config(program, DEVICE_SINGLETON, Template::Device, &mut diagnostics);

    match (driver, device) {
        (Some((driver_config, driver_capabilities)), Some((device_config, device_capabilities)))
            if diagnostics.is_empty() =>
        {
            Ok(DriverInfo {
                driver_config,
                device_config,
                driver_capabilities,
                device_capabilities,
            })
        }
        _ => Err(diagnostics),
    }
}

fn singleton_config(
    program: &AnalyzedProgram,
    ident: &str,
    template: Template,
    diagnostics: &mut Vec<ScriptDiagnostic>,
) -> Option<(ConfigSchema, CapabilitySet)> {
    let Some(decl) = program.singleton(ident) else {
        diagnostics.push(ScriptDiagnostic::error(
            format!("Singleton `{}` not found", ident),
            program.span.clone(),
        ));
        return None;
    };

    let capabilities = match check_conformance(decl, template) {
        Ok(capabilities) => Some(capabilities),
        Err(mut errors) => {
            diagnostics.append(&mut errors);
            None
        }
    };

    let schema = match lower_type(&decl.ty, &decl.span) {
        Ok(schema @ ConfigSchema::Struct { .. }) => Some(schema),
        Ok(_) => {
            diagnostics.push(ScriptDiagnostic::error(
                format!(
                    "Singleton `{}` must have an object type, found `{}`",
                    ident, decl.ty
                ),
                decl.span.clone(),
            ));
            None
        }
        Err(error) => {
            diagnostics.push(error);
            None
        }
    };

    Some((schema?, capabilities?))
}

/// Lower a script type into a [`ConfigSchema`].
///
/// Only data types have a schema; functions, unions, ranges, `any` and
/// unresolved types are rejected.
pub fn lower_type(ty: &ScriptType, span: &Span) -> Result<ConfigSchema, ScriptDiagnostic> {
    match ty {
        ScriptType::Int => Ok(ConfigSchema::atom(AtomKind::Int)),
        ScriptType::Float => Ok(ConfigSchema::atom(AtomKind::Float)),
        ScriptType::Bool => Ok(ConfigSchema::atom(AtomKind::Bool)),
        ScriptType::String => Ok(ConfigSchema::atom(AtomKind::String)),
        ScriptType::List(inner) => Ok(ConfigSchema::list(lower_type(inner, span)?)),
        ScriptType::Option(inner) => Ok(ConfigSchema::option(lower_type(inner, span)?)),
        ScriptType::Object(fields) => {
            let mut lowered = Vec::with_capacity(fields.len());
            for field in fields {
                lowered.push((field.name.clone(), lower_type(&field.ty, span)?));
            }
            Ok(ConfigSchema::structure(lowered))
        }
        ScriptType::Null
        | ScriptType::Range
        | ScriptType::Any
        | ScriptType::Never
        | ScriptType::Unknown
        | ScriptType::Function { .. }
        | ScriptType::Union(_) => Err(ScriptDiagnostic::error(
            format!("Cannot derive user configuration from type `{}`", ty),
            span.clone(),
        )
        .with_note("Singleton types may only contain int, float, bool, str, lists, options and objects")),
    }
}
