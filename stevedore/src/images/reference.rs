//! Image references (`name[:tag]`).

use serde::{Deserialize, Serialize};
use stevedore_shared::constants::build::{DEFAULT_TAG, SCRATCH};
use stevedore_shared::{StevedoreError, StevedoreResult};

/// A named, tagged image reference such as `python:3.11-slim`.
///
/// Digest-pinned references (`name@sha256:...`) are not accepted; base
/// images are addressed by tag and pinned by the digest recorded at build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    name: String,
    tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> StevedoreResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StevedoreError::InvalidArgument(
                "empty image reference".into(),
            ));
        }
        if reference.contains('@') {
            return Err(StevedoreError::InvalidArgument(format!(
                "digest references are not supported: {reference}"
            )));
        }

        // A ':' after the last '/' separates the tag; earlier ones belong to
        // a registry port.
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if name.is_empty() || tag.is_empty() {
            return Err(StevedoreError::InvalidArgument(format!(
                "malformed image reference: {reference}"
            )));
        }
        let name_ok = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/:".contains(c));
        let tag_ok = tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));
        if !name_ok || !tag_ok {
            return Err(StevedoreError::InvalidArgument(format!(
                "malformed image reference: {reference}"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `scratch` is the empty base.
    pub fn is_scratch(&self) -> bool {
        self.name == SCRATCH
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_scratch() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.tag)
        }
    }
}

impl std::str::FromStr for ImageRef {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.to_string()
    }
}
