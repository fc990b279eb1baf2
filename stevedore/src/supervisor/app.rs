//! Application references (`module:attribute`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use stevedore_shared::StevedoreError;

/// Where the ASGI application lives: `app.main:app`, or `app.main:create_app()`
/// for a factory that returns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppRef {
    module: String,
    attribute: String,
    factory: bool,
}

impl AppRef {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn is_factory(&self) -> bool {
        self.factory
    }
}

impl Default for AppRef {
    fn default() -> Self {
        Self {
            module: "app.main".to_string(),
            attribute: "app".to_string(),
            factory: false,
        }
    }
}

impl FromStr for AppRef {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| {
            StevedoreError::InvalidArgument(format!("invalid application reference '{s}': {why}"))
        };

        let (module, attribute) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected <module>:<attribute>"))?;
        let (attribute, factory) = match attribute.strip_suffix("()") {
            Some(name) => (name, true),
            None => (attribute, false),
        };

        if module.is_empty() || !module.split('.').all(is_identifier) {
            return Err(invalid("module must be a dotted Python name"));
        }
        if !is_identifier(attribute) {
            return Err(invalid("attribute must be a Python identifier"));
        }

        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
            factory,
        })
    }
}

impl TryFrom<String> for AppRef {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppRef> for String {
    fn from(value: AppRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.attribute)?;
        if self.factory {
            f.write_str("()")?;
        }
        Ok(())
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}
