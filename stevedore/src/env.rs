//! Process-wide environment variable set.
//!
//! The set is a plain value: it is recorded in image metadata by `ENV`
//! steps and handed explicitly to every process the builder or the
//! supervisor spawns. Nothing here touches the current process environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stevedore_shared::constants::envs;
use stevedore_shared::{StevedoreError, StevedoreResult};

/// Environment variables applied to spawned processes.
///
/// Keys are unique; iteration is sorted by key so rendering and hashing are
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvSet {
    vars: BTreeMap<String, String>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The container defaults: no bytecode cache writes, unbuffered output.
    pub fn container_defaults() -> Self {
        let mut set = Self::new();
        set.vars
            .insert(envs::PYTHONDONTWRITEBYTECODE.to_string(), "1".to_string());
        set.vars
            .insert(envs::PYTHONUNBUFFERED.to_string(), "1".to_string());
        set
    }

    /// Insert or replace a variable after validating its name.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> StevedoreResult<()> {
        let key = key.into();
        validate_key(&key)?;
        self.vars.insert(key, value.into());
        Ok(())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> StevedoreResult<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Copy every variable of `other` over this set.
    pub fn extend(&mut self, other: &EnvSet) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `PYTHONDONTWRITEBYTECODE` is set to a truthy value.
    pub fn disables_bytecode_cache(&self) -> bool {
        self.get(envs::PYTHONDONTWRITEBYTECODE).is_some_and(is_truthy)
    }

    /// `PYTHONUNBUFFERED` is set to a truthy value.
    pub fn forces_unbuffered_output(&self) -> bool {
        self.get(envs::PYTHONUNBUFFERED).is_some_and(is_truthy)
    }

    /// Fail unless bytecode caching is off and output is unbuffered.
    pub fn check_container_invariants(&self) -> StevedoreResult<()> {
        for (key, holds) in [
            (envs::PYTHONDONTWRITEBYTECODE, self.disables_bytecode_cache()),
            (envs::PYTHONUNBUFFERED, self.forces_unbuffered_output()),
        ] {
            if !holds {
                return Err(StevedoreError::Config(format!(
                    "{key} must stay enabled, got '{}'",
                    self.get(key).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    /// Apply the set to a command on top of whatever it inherits.
    pub fn apply_to(&self, cmd: &mut tokio::process::Command) {
        cmd.envs(self.iter());
    }

    /// `KEY=value` pairs, sorted by key.
    pub fn to_pairs(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl FromIterator<(String, String)> for EnvSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Validate an environment variable name (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn validate_key(key: &str) -> StevedoreResult<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StevedoreError::InvalidArgument(format!(
            "invalid environment variable name: '{key}'"
        )))
    }
}

// Python treats any non-empty value as enabled; "0" is spelled out as off
// by convention in container images.
fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0"
}
