//! Programmable script engine for tests.
//!
//! Programs are registered under their source text. Functions are plain
//! closures over the call arguments and the injected singleton map.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::Analysis;
use super::AnalyzedProgram;
use super::CancelToken;
use super::CompiledUnit;
use super::DiagnosticKind;
use super::EngineError;
use super::InvokeOutcome;
use super::InvokeRequest;
use super::ScriptDiagnostic;
use super::ScriptEngine;
use super::Severity;
use super::Span;
use super::TriggerAnnotation;
use super::Value;

pub(crate) type Singletons = BTreeMap<String, Value>;
type MockFn = Arc<dyn Fn(&[Value], &mut Singletons) -> Result<Value, String> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MockProgram {
    analysis: Analysis,
    functions: HashMap<String, MockFn>,
    delays: HashMap<String, Duration>,
}

impl MockProgram {
    pub fn new(program: AnalyzedProgram) -> Self {
        Self {
            analysis: Analysis::Analyzed {
                program,
                warnings: Vec::new(),
            },
            functions: HashMap::new(),
            delays: HashMap::new(),
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            analysis: Analysis::Rejected {
                diagnostics: vec![ScriptDiagnostic {
                    severity: Severity::Error,
                    kind: DiagnosticKind::Syntax,
                    message: message.to_string(),
                    notes: Vec::new(),
                    span: Span::default(),
                }],
            },
            functions: HashMap::new(),
            delays: HashMap::new(),
        }
    }

    pub fn function(
        mut self,
        name: &str,
        f: impl Fn(&[Value], &mut Singletons) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Declare `callback` as triggered on the topics `topics_fn` returns.
    pub fn trigger(mut self, callback: &str, topics_fn: &str) -> Self {
        if let Analysis::Analyzed { program, .. } = &mut self.analysis {
            program.triggers.push(TriggerAnnotation {
                callback: callback.to_string(),
                topics_fn: topics_fn.to_string(),
                span: Span::new("driver.hms", 40, 60),
            });
        }
        self
    }

    /// Make `name` wait for `delay` before running, honoring cancellation.
    pub fn delayed(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }
}

#[derive(Default)]
pub(crate) struct MockEngine {
    programs: Mutex<HashMap<String, MockProgram>>,
    analyzed: Mutex<HashMap<String, String>>,
    compilations: AtomicUsize,
    calls: Mutex<Vec<String>>,
    host_failure: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: &str, program: MockProgram) {
        self.programs
            .lock()
            .unwrap()
            .insert(source.to_string(), program);
    }

    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_host(&self, fail: bool) {
        self.host_failure.store(fail, Ordering::SeqCst);
    }

    pub fn analyzed(&self, program_id: &str, source: &str) -> AnalyzedProgram {
        match self.analyze(program_id, source).unwrap() {
            Analysis::Analyzed { program, .. } => program,
            Analysis::Rejected { diagnostics } => panic!("rejected: {:?}", diagnostics),
        }
    }
}

#[async_trait]
impl ScriptEngine for MockEngine {
    fn analyze(&self, program_id: &str, source: &str) -> Result<Analysis, EngineError> {
        let Some(registered) = self.programs.lock().unwrap().get(source).cloned() else {
            return Ok(MockProgram::rejected("unknown source").analysis);
        };
        self.analyzed
            .lock()
            .unwrap()
            .insert(program_id.to_string(), source.to_string());

        Ok(match registered.analysis {
            Analysis::Analyzed {
                mut program,
                warnings,
            } => {
                program.program_id = program_id.to_string();
                Analysis::Analyzed { program, warnings }
            }
            rejected => rejected,
        })
    }

    fn compile(&self, program: &AnalyzedProgram) -> Result<CompiledUnit, EngineError> {
        let source = self
            .analyzed
            .lock()
            .unwrap()
            .get(&program.program_id)
            .cloned()
            .ok_or_else(|| EngineError::Compile {
                program_id: program.program_id.clone(),
                message: "program was never analyzed".to_string(),
            })?;
        self.compilations.fetch_add(1, Ordering::SeqCst);
        Ok(CompiledUnit::new(program.program_id.clone(), source))
    }

    async fn invoke(
        &self,
        unit: &CompiledUnit,
        request: InvokeRequest,
        cancel: CancelToken,
    ) -> Result<InvokeOutcome, EngineError> {
        let name = request.call.function.clone();
        self.calls.lock().unwrap().push(name.clone());

        if self.host_failure.load(Ordering::SeqCst) {
            return Err(EngineError::Host {
                program_id: unit.program_id().to_string(),
                message: "simulated host failure".to_string(),
            });
        }

        let program = unit
            .artifact::<String>()
            .and_then(|source| self.programs.lock().unwrap().get(source).cloned())
            .ok_or_else(|| EngineError::Host {
                program_id: unit.program_id().to_string(),
                message: "unit does not belong to this engine".to_string(),
            })?;

        let Some(function) = program.functions.get(&name).cloned() else {
            return Ok(InvokeOutcome::Failed {
                diagnostics: vec![ScriptDiagnostic::runtime(
                    "throw",
                    format!("Function `{}` not found", name),
                    Span::default(),
                )],
            });
        };

        if let Some(delay) = program.delays.get(&name) {
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = cancel.cancelled() => {
                    return Ok(InvokeOutcome::Failed {
                        diagnostics: vec![ScriptDiagnostic::runtime(
                            "timeout",
                            "Execution was cancelled",
                            Span::default(),
                        )],
                    });
                }
            }
        }

        let mut singletons = request.singletons;
        Ok(match function(&request.call.args, &mut singletons) {
            Ok(value) => InvokeOutcome::Completed { value, singletons },
            Err(message) => InvokeOutcome::Failed {
                diagnostics: vec![ScriptDiagnostic::runtime("throw", message, Span::default())],
            },
        })
    }
}

/// Read a field of the injected device singleton.
pub(crate) fn device_field(singletons: &Singletons, name: &str) -> Value {
    singletons
        .get("@Device")
        .and_then(|device| device.field(name))
        .cloned()
        .unwrap_or(Value::Null)
}

pub(crate) fn set_device_field(singletons: &mut Singletons, name: &str, value: Value) {
    if let Some(Value::Object(fields)) = singletons.get_mut("@Device") {
        fields.insert(name.to_string(), value);
    }
}

pub(crate) mod fixtures {
    use super::*;
    use crate::driver::Capability;
    use crate::driver::Template;
    use crate::script::MethodDecl;
    use crate::script::RangeValue;
    use crate::script::ScriptType;
    use crate::script::SingletonDecl;
    use crate::script::TemplateImpl;

    pub const LAMP: &str = "lamp-source";
    pub const SWITCH: &str = "switch-source";
    pub const THERMOMETER: &str = "thermometer-source";

    fn method(name: &str) -> MethodDecl {
        MethodDecl {
            name: name.to_string(),
            span: Span::new("driver.hms", 10, 20),
        }
    }

    fn decl(ident: &str, template: Template, ty: ScriptType, caps: &[Capability]) -> SingletonDecl {
        let mut methods: Vec<MethodDecl> = template
            .required_methods(Capability::Base)
            .iter()
            .map(|m| method(m))
            .collect();
        for cap in caps {
            methods.extend(template.required_methods(*cap).iter().map(|m| method(m)));
        }
        SingletonDecl {
            ident: ident.to_string(),
            ty,
            implements: vec![TemplateImpl {
                template: template.to_string(),
                capabilities: caps.iter().map(ToString::to_string).collect(),
                methods,
                span: Span::new("driver.hms", 0, 5),
            }],
            span: Span::new("driver.hms", 0, 30),
        }
    }

    pub fn program(device_ty: ScriptType, caps: &[Capability]) -> AnalyzedProgram {
        AnalyzedProgram {
            program_id: String::new(),
            singletons: vec![
                decl(
                    "@Driver",
                    Template::Driver,
                    ScriptType::object([("address", ScriptType::String), ("port", ScriptType::Int)]),
                    &[],
                ),
                decl("@Device", Template::Device, device_ty, caps),
            ],
            triggers: Vec::new(),
            span: Span::new("driver.hms", 0, 100),
        }
    }

    pub fn lamp_program() -> AnalyzedProgram {
        program(
            ScriptType::object([
                ("on", ScriptType::Bool),
                ("brightness", ScriptType::Int),
                ("label", ScriptType::option(ScriptType::String)),
            ]),
            &[Capability::Power, Capability::Dimmable],
        )
    }

    fn with_power(program: MockProgram) -> MockProgram {
        program
            .function("validate_driver", |_, _| Ok(Value::Null))
            .function("validate_device", |_, _| Ok(Value::Null))
            .function("report_power", |_, s| Ok(device_field(s, "on")))
            .function("report_power_draw", |_, s| {
                let on = device_field(s, "on").as_bool().unwrap_or(false);
                Ok(Value::Int(if on { 12 } else { 0 }))
            })
            .function("set_power", |args, s| {
                let target = args[0].clone();
                let changed = device_field(s, "on") != target;
                set_device_field(s, "on", target);
                Ok(Value::Bool(changed))
            })
    }

    /// Lamp driver: power and dimmable capabilities.
    pub fn lamp() -> MockProgram {
        with_power(MockProgram::new(lamp_program()))
            .function("report_dim", |_, s| {
                Ok(Value::List(vec![Value::object([
                    ("label", Value::String("brightness".into())),
                    (
                        "range",
                        Value::Range(RangeValue {
                            start: 0,
                            end: 100,
                            end_inclusive: true,
                        }),
                    ),
                    ("value", device_field(s, "brightness")),
                ])]))
            })
            .function("dim", |args, s| {
                let changed = device_field(s, "brightness") != args[1];
                set_device_field(s, "brightness", args[1].clone());
                Ok(Value::Bool(changed))
            })
    }

    /// Switch driver: power capability only.
    pub fn switch() -> MockProgram {
        with_power(MockProgram::new(program(
            ScriptType::object([("on", ScriptType::Bool)]),
            &[Capability::Power],
        )))
    }

    /// Thermometer driver: sensor capability only.
    pub fn thermometer() -> MockProgram {
        MockProgram::new(program(
            ScriptType::object([("offset", ScriptType::Float)]),
            &[Capability::Sensor],
        ))
        .function("validate_driver", |_, _| Ok(Value::Null))
        .function("validate_device", |_, _| Ok(Value::Null))
        .function("report_sensor_readings", |_, _| {
            Ok(Value::List(vec![Value::object([
                ("label", Value::String("temperature".into())),
                ("value", Value::Float(21.5)),
                ("unit", Value::String("°C".into())),
            ])]))
        })
    }

    pub fn engine() -> Arc<MockEngine> {
        let engine = MockEngine::new();
        engine.register(LAMP, lamp());
        engine.register(SWITCH, switch());
        engine.register(THERMOMETER, thermometer());
        Arc::new(engine)
    }
}
