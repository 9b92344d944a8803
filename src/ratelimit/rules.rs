//! Named admission policies per action.
//!
//! Call sites name the action they are about to perform; the policy table
//! maps that name to a budget so limits live in one configuration file
//! instead of being repeated at every call site.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::counter::{Limit, TimeWindow};
use super::policy::Algorithm;
use crate::error::{Result, TurnstileError};

/// Per-action admission policies loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Rule applied to actions without their own entry
    #[serde(default)]
    pub default: Option<ActionRule>,
    /// Rules for specific actions
    #[serde(default)]
    pub actions: Vec<ActionRule>,
}

/// A budget for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRule {
    /// The action name, e.g. `login` or `ocr_upload`
    #[serde(default)]
    pub action: String,
    /// Number of requests allowed per window
    pub requests_per_unit: u64,
    /// Window length as a coarse unit
    #[serde(default)]
    pub unit: Option<TimeWindow>,
    /// Window length in seconds; takes precedence over `unit`
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Algorithm override; the limiter's default applies when absent
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

impl ActionRule {
    /// The window this rule enforces.
    pub fn window(&self) -> Result<Duration> {
        match (self.window_secs, self.unit) {
            (Some(secs), _) => Ok(Duration::from_secs(secs)),
            (None, Some(unit)) => Ok(unit.duration()),
            (None, None) => Err(TurnstileError::InvalidConfig(format!(
                "rule '{}' needs either `unit` or `window_secs`",
                self.action
            ))),
        }
    }

    /// The validated limit for this rule.
    pub fn limit(&self) -> Result<Limit> {
        Limit::new(self.requests_per_unit, self.window()?).map_err(|e| {
            TurnstileError::InvalidConfig(format!("rule '{}': {}", self.action, e))
        })
    }
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PolicyTable = serde_yaml::from_str(yaml).map_err(|e| {
            TurnstileError::Config(format!("Failed to parse admission policies: {}", e))
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Check every rule for a usable window and unique action names.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref default) = self.default {
            default.limit()?;
        }

        let mut seen = HashSet::new();
        for rule in &self.actions {
            if rule.action.trim().is_empty() {
                return Err(TurnstileError::InvalidConfig(
                    "action rules need a non-empty `action`".to_string(),
                ));
            }
            if !seen.insert(rule.action.as_str()) {
                return Err(TurnstileError::InvalidConfig(format!(
                    "duplicate rule for action '{}'",
                    rule.action
                )));
            }
            rule.limit()?;
        }

        Ok(())
    }

    /// Find the rule for `action`, falling back to the default rule.
    pub fn find(&self, action: &str) -> Option<&ActionRule> {
        self.actions
            .iter()
            .find(|rule| rule.action == action)
            .or(self.default.as_ref())
    }

    /// Number of action-specific rules.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the table has neither action rules nor a default.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.default.is_none()
    }
}
