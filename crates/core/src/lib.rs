//! Cairn core types: component descriptors, lifecycle phases, parameter bags.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod error;
mod settings;

pub use error::{Error, Result};
pub use settings::{Settings, IN_CLUSTER_NAMESPACE_FILE};

/// String-keyed parameter bag passed to capability handlers.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Fetch a required string parameter.
pub fn required_str<'a>(params: &'a Params, key: &str) -> Result<&'a str> {
    match params.get(key) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(serde_json::Value::String(_)) | None => Err(Error::invalid_params(format!("{} is required", key))),
        Some(_) => Err(Error::invalid_params(format!("{} must be a string", key))),
    }
}

/// Fetch an optional string parameter; non-string values are rejected.
pub fn optional_str<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(Error::invalid_params(format!("{} must be a string", key))),
    }
}

/// Lifecycle points at which the external installer invokes component hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PreInstall,
    PostInstall,
    PreDelete,
    PostDelete,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::PreInstall,
        Phase::PostInstall,
        Phase::PreDelete,
        Phase::PostDelete,
        Phase::PreUpgrade,
        Phase::PostUpgrade,
        Phase::PreRollback,
        Phase::PostRollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreInstall => "pre-install",
            Phase::PostInstall => "post-install",
            Phase::PreDelete => "pre-delete",
            Phase::PostDelete => "post-delete",
            Phase::PreUpgrade => "pre-upgrade",
            Phase::PostUpgrade => "post-upgrade",
            Phase::PreRollback => "pre-rollback",
            Phase::PostRollback => "post-rollback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::invalid_params(format!("unknown lifecycle phase: {}", s)))
    }
}

/// Installable metadata for one catalog component.
///
/// All fields are opaque to the core; the external installer resolves chart
/// coordinates and consumes the hook manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    #[serde(rename = "repository")]
    pub repo: String,
    pub chart: String,
    pub version: String,
    #[serde(default)]
    pub values: String,
    #[serde(default)]
    pub hooks: String,
    #[serde(rename = "applicationHooks", default, skip_serializing_if = "String::is_empty")]
    pub application_hooks: String,
}

impl ComponentDescriptor {
    pub fn from_config(config: ComponentConfig, hooks: &str, application_hooks: &str) -> Self {
        Self {
            repo: config.repo,
            chart: config.chart,
            version: config.version,
            values: config.values,
            hooks: hooks.to_string(),
            application_hooks: application_hooks.to_string(),
        }
    }
}

/// Static chart coordinates shipped with each component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub repo: String,
    pub chart: String,
    pub version: String,
    #[serde(default)]
    pub values: String,
}

/// One catalog-level parameter declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParameter {
    pub name: String,
    #[serde(default)]
    pub default: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub parameters: Vec<ConfigParameter>,
}

/// Namespace holding a toolchain's shared inputs and CI system.
pub fn toolchain_namespace(toolchain: &str) -> String {
    format!("cairn-toolchain-{}", toolchain)
}

/// Namespace holding one application's copies of the toolchain inputs.
pub fn application_namespace(toolchain: &str, application: &str) -> String {
    format!("cairn-application-{}-{}", toolchain, application)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phase_round_trips_through_kebab_names() {
        for p in Phase::ALL {
            assert_eq!(p.as_str().parse::<Phase>().unwrap(), p);
        }
        assert_eq!(serde_json::to_value(Phase::PostRollback).unwrap(), json!("post-rollback"));
    }

    #[test]
    fn unknown_phase_is_invalid_params() {
        let err = "increment".parse::<Phase>().unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)), "err={}", err);
    }

    #[test]
    fn descriptor_serializes_with_manifest_field_names() {
        let d = ComponentDescriptor {
            repo: "https://charts.test.com".into(),
            chart: "test/test".into(),
            version: "1.0.0".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["repository"], "https://charts.test.com");
        assert_eq!(v["chart"], "test/test");
        assert!(v.get("applicationHooks").is_none());

        let d2 = ComponentDescriptor { application_hooks: "kind: Job".into(), ..d };
        let v2 = serde_json::to_value(&d2).unwrap();
        assert_eq!(v2["applicationHooks"], "kind: Job");
    }

    #[test]
    fn required_and_optional_params() {
        let params = json!({"name": "app", "empty": "", "n": 3}).as_object().cloned().unwrap();
        assert_eq!(required_str(&params, "name").unwrap(), "app");
        assert!(required_str(&params, "missing").unwrap_err().to_string().contains("missing is required"));
        assert!(required_str(&params, "empty").is_err());
        assert!(required_str(&params, "n").unwrap_err().to_string().contains("must be a string"));
        assert_eq!(optional_str(&params, "missing").unwrap(), None);
        assert!(optional_str(&params, "n").is_err());
    }

    #[test]
    fn namespaces_follow_toolchain_layout() {
        assert_eq!(toolchain_namespace("dev"), "cairn-toolchain-dev");
        assert_eq!(application_namespace("dev", "web"), "cairn-application-dev-web");
    }
}
