use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

const DRIVER_PROGRAM_PREFIX: &str = "@driver";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid driver program id `{0}`: expected `@driver:<vendor>:<model>`")]
    ProgramId(String),

    #[error("Invalid semantic version `{0}`: expected `major.minor.patch`")]
    Version(String),
}

/// Globally unique key of a driver: `(vendor, model)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverIdentity {
    pub vendor_id: String,
    pub model_id: String,
}

impl DriverIdentity {
    pub fn new(vendor_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Identifier of the driver's script program, `@driver:<vendor>:<model>`.
    pub fn program_id(&self) -> String {
        format!(
            "{}:{}:{}",
            DRIVER_PROGRAM_PREFIX, self.vendor_id, self.model_id
        )
    }

    pub fn from_program_id(program_id: &str) -> Result<Self, IdentityError> {
        let segments: Vec<&str> = program_id.split(':').collect();
        match segments.as_slice() {
            [prefix, vendor, model]
                if *prefix == DRIVER_PROGRAM_PREFIX && !vendor.is_empty() && !model.is_empty() =>
            {
                Ok(Self::new(*vendor, *model))
            }
            _ => Err(IdentityError::ProgramId(program_id.to_string())),
        }
    }
}

impl std::fmt::Display for DriverIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.vendor_id, self.model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemanticVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for SemanticVersion {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentityError::Version(s.to_string());
        let segments = s
            .split('.')
            .map(|segment| segment.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        match segments.as_slice() {
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for SemanticVersion {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SemanticVersion> for String {
    fn from(version: SemanticVersion) -> Self {
        version.to_string()
    }
}

impl std::fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_id_round_trip() {
        let id = DriverIdentity::new("shelly", "plug-s");
        assert_eq!(id.program_id(), "@driver:shelly:plug-s");
        assert_eq!(DriverIdentity::from_program_id("@driver:shelly:plug-s").unwrap(), id);
    }

    #[test]
    fn test_program_id_rejects_malformed() {
        for bad in ["@driver:shelly", "@script:shelly:plug", "@driver:a:b:c", "@driver::plug"] {
            assert_eq!(
                DriverIdentity::from_program_id(bad),
                Err(IdentityError::ProgramId(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("1.12.0".parse(), Ok(SemanticVersion::new(1, 12, 0)));
        assert!("1.2".parse::<SemanticVersion>().is_err());
        assert!("1.2.3.4".parse::<SemanticVersion>().is_err());
        assert!("1.x.3".parse::<SemanticVersion>().is_err());
        assert!("-1.2.3".parse::<SemanticVersion>().is_err());
    }

    #[test]
    fn test_version_serde_as_string() {
        let json = serde_json::to_string(&SemanticVersion::new(0, 3, 1)).unwrap();
        assert_eq!(json, "\"0.3.1\"");
        let back: SemanticVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SemanticVersion::new(0, 3, 1));
    }
}
