//! Templates and capabilities a driver script must implement.
//!
//! A template is a contract for one singleton (`Driver` for `@Driver`,
//! `Device` for `@Device`). It is implemented with a set of capabilities,
//! each requiring a fixed list of methods. The `base` capability is always
//! part of the set.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::script::ScriptDiagnostic;
use crate::script::SingletonDecl;
use crate::script::Span;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Base,
    Power,
    Dimmable,
    Sensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Template {
    Driver,
    Device,
}

impl Template {
    pub const DEFAULT_CAPABILITY: Capability = Capability::Base;

    /// Capabilities this template can be implemented with.
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Template::Driver => &[Capability::Base],
            Template::Device => &[
                Capability::Base,
                Capability::Power,
                Capability::Dimmable,
                Capability::Sensor,
            ],
        }
    }

    /// Methods a singleton must define to provide `capability`.
    pub fn required_methods(self, capability: Capability) -> &'static [&'static str] {
        match (self, capability) {
            (Template::Driver, Capability::Base) => &["validate_driver"],
            (Template::Device, Capability::Base) => &["validate_device"],
            (Template::Device, Capability::Power) => {
                &["set_power", "report_power", "report_power_draw"]
            }
            (Template::Device, Capability::Dimmable) => &["dim", "report_dim"],
            (Template::Device, Capability::Sensor) => &["report_sensor_readings"],
            (Template::Driver, _) => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{{ {} }}", names.join(", "))
    }
}

/// Check that `decl` implements `template`, returning the capability set it
/// provides.
pub fn check_conformance(
    decl: &SingletonDecl,
    template: Template,
) -> Result<CapabilitySet, Vec<ScriptDiagnostic>> {
    let Some(implementation) = decl.template(&template.to_string()) else {
        return Err(vec![ScriptDiagnostic::error(
            format!("Template `{}` is not implemented for this Singleton", template),
            decl.span.clone(),
        )
        .with_note(format!(
            "It can be implemented like this: `impl {} for {} with {{ {} }} {{ ... }}`",
            template,
            decl.ident,
            Template::DEFAULT_CAPABILITY
        ))]);
    };

    let mut diagnostics = Vec::new();
    let mut capabilities = CapabilitySet::default();
    capabilities.insert(Template::DEFAULT_CAPABILITY);

    for name in &implementation.capabilities {
        match Capability::from_str(name) {
            Ok(capability) if template.capabilities().contains(&capability) => {
                capabilities.insert(capability);
            }
            _ => diagnostics.push(
                ScriptDiagnostic::error(
                    format!(
                        "Capability `{}` is not defined for template `{}`",
                        name, template
                    ),
                    implementation.span.clone(),
                )
                .with_note(format!(
                    "Available capabilities: {}",
                    template
                        .capabilities()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
            ),
        }
    }

    for capability in capabilities.iter() {
        for method in template.required_methods(capability) {
            if implementation.method(method).is_none() {
                diagnostics.push(missing_method(template, capability, method, &implementation.span));
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(capabilities)
    } else {
        Err(diagnostics)
    }
}

fn missing_method(template: Template, capability: Capability, method: &str, span: &Span) -> ScriptDiagnostic {
    ScriptDiagnostic::error(
        format!(
            "Method `{}` is required by capability `{}` of template `{}`",
            method, capability, template
        ),
        span.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::MethodDecl;
    use crate::script::ScriptType;
    use crate::script::TemplateImpl;

    fn device(capabilities: &[&str], methods: &[&str]) -> SingletonDecl {
        SingletonDecl {
            ident: "@Device".to_string(),
            ty: ScriptType::object([("on", ScriptType::Bool)]),
            implements: vec![TemplateImpl {
                template: "Device".to_string(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                methods: methods
                    .iter()
                    .map(|m| MethodDecl {
                        name: m.to_string(),
                        span: Span::default(),
                    })
                    .collect(),
                span: Span::default(),
            }],
            span: Span::default(),
        }
    }

    #[test]
    fn test_base_is_implied() {
        let caps = check_conformance(&device(&[], &["validate_device"]), Template::Device).unwrap();
        assert_eq!(caps, [Capability::Base].into_iter().collect());
    }

    #[test]
    fn test_power_requires_all_methods() {
        let errors = check_conformance(
            &device(&["power"], &["validate_device", "set_power"]),
            Template::Device,
        )
        .unwrap_err();
        let messages: Vec<_> = errors.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(
            messages,
            [
                "Method `report_power` is required by capability `power` of template `Device`",
                "Method `report_power_draw` is required by capability `power` of template `Device`",
            ]
        );
    }

    #[test]
    fn test_unknown_capability() {
        let errors =
            check_conformance(&device(&["teleport"], &["validate_device"]), Template::Device)
                .unwrap_err();
        insta::assert_snapshot!(errors[0].to_string(), @r"
        error: Capability `teleport` is not defined for template `Device`
          note: Available capabilities: base, power, dimmable, sensor
        ");
    }

    #[test]
    fn test_missing_template() {
        let errors = check_conformance(&device(&[], &[]), Template::Driver).unwrap_err();
        insta::assert_snapshot!(errors[0].to_string(), @r"
        error: Template `Driver` is not implemented for this Singleton
          note: It can be implemented like this: `impl Driver for @Device with { base } { ... }`
        ");
    }

    #[test]
    fn test_display_set() {
        let caps: CapabilitySet = [Capability::Dimmable, Capability::Base].into_iter().collect();
        assert_eq!(caps.to_string(), "{ base, dimmable }");
    }
}
