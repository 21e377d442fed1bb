use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::builtins::EscapeStrategy;
use crate::compiled::Features;
use crate::error::{Error, Result};

/// Environment options. Missing fields take their defaults when read from
/// JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keeps line markers and the full Source in compiled units.
    pub debug: bool,
    /// Escaping applied to print statements; `None` turns it off.
    pub autoescape: Option<EscapeStrategy>,
    /// Missing variables and attributes are errors instead of undefined.
    pub strict_variables: bool,
    pub security_policy: SecurityPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            autoescape: Some(EscapeStrategy::Html),
            strict_variables: false,
            security_policy: SecurityPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::runtime(format!("Invalid configuration: {e}.")))
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_autoescape(mut self, autoescape: Option<EscapeStrategy>) -> Self {
        self.autoescape = autoescape;
        self
    }

    pub fn with_strict_variables(mut self, strict: bool) -> Self {
        self.strict_variables = strict;
        self
    }

    pub fn with_security_policy(mut self, policy: SecurityPolicy) -> Self {
        self.security_policy = policy;
        self
    }
}

/// What templates included from a `{% sandbox %}` section may use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub allowed_tags: BTreeSet<String>,
    pub allowed_filters: BTreeSet<String>,
    pub allowed_functions: BTreeSet<String>,
}

impl SecurityPolicy {
    pub fn allow_tags<'a>(mut self, tags: impl IntoIterator<Item = &'a str>) -> Self {
        self.allowed_tags.extend(tags.into_iter().map(str::to_string));
        self
    }

    pub fn allow_filters<'a>(mut self, filters: impl IntoIterator<Item = &'a str>) -> Self {
        self.allowed_filters.extend(filters.into_iter().map(str::to_string));
        self
    }

    pub fn allow_functions<'a>(mut self, functions: impl IntoIterator<Item = &'a str>) -> Self {
        self.allowed_functions.extend(functions.into_iter().map(str::to_string));
        self
    }

    pub(crate) fn check(&self, features: &Features) -> std::result::Result<(), String> {
        if let Some(tag) = features.tags.iter().find(|t| !self.allowed_tags.contains(*t)) {
            return Err(format!("Tag \"{tag}\" is not allowed."));
        }
        if let Some(filter) = features.filters.iter().find(|f| !self.allowed_filters.contains(*f)) {
            return Err(format!("Filter \"{filter}\" is not allowed."));
        }
        if let Some(function) = features.functions.iter().find(|f| !self.allowed_functions.contains(*f)) {
            return Err(format!("Function \"{function}\" is not allowed."));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(!config.debug);
        assert_eq!(config.autoescape, Some(EscapeStrategy::Html));
        assert!(!config.strict_variables);
    }

    #[test]
    fn partial_json() {
        let config = Config::from_json(r#"{"strict_variables": true, "autoescape": null}"#).unwrap();
        assert!(config.strict_variables);
        assert_eq!(config.autoescape, None);
        assert!(!config.debug);

        let config = Config::from_json(r#"{"autoescape": "js", "security_policy": {"allowed_tags": ["if"]}}"#).unwrap();
        assert_eq!(config.autoescape, Some(EscapeStrategy::Js));
        assert!(config.security_policy.allowed_tags.contains("if"));

        assert!(Config::from_json("{\"debug\": 3}").is_err());
    }

    #[test]
    fn policy_reports_first_violation() {
        let policy = SecurityPolicy::default().allow_tags(["if"]).allow_filters(["upper"]);
        let mut features = Features::default();
        features.tags.insert("if".into());
        features.filters.insert("upper".into());
        assert_eq!(policy.check(&features), Ok(()));

        features.filters.insert("lower".into());
        assert_eq!(policy.check(&features), Err("Filter \"lower\" is not allowed.".into()));

        features.tags.insert("for".into());
        assert_eq!(policy.check(&features), Err("Tag \"for\" is not allowed.".into()));
    }
}
