//! Image metadata persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::build::manifest::Requirement;
use crate::env::EnvSet;
use crate::images::reference::ImageRef;
use crate::util::digest;

/// Runtime configuration carried by an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Variables applied to every process started from the image.
    #[serde(default)]
    pub env: EnvSet,

    /// Absolute working directory for RUN steps and the command.
    pub workdir: String,

    /// Documented ports. Never enforced.
    #[serde(default)]
    pub exposed_ports: BTreeSet<u16>,

    /// Command the image runs at start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            env: EnvSet::new(),
            workdir: "/".to_string(),
            exposed_ports: BTreeSet::new(),
            cmd: None,
        }
    }
}

/// The resolved base of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub reference: ImageRef,
    pub digest: String,
}

/// A built image: base, ordered layer digests and runtime config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// `sha256:` over base, layers and config.
    pub id: String,
    pub tag: String,
    pub base: BaseRecord,
    /// Layer digests, bottom to top.
    pub layers: Vec<String>,
    pub config: ImageConfig,
    /// Declared dependencies recorded from the manifest at build time.
    #[serde(default)]
    pub dependencies: Vec<Requirement>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Content identity of an image; independent of tag and build time.
    pub fn compute_id(base: &BaseRecord, layers: &[String], config: &ImageConfig) -> String {
        #[derive(Serialize)]
        struct Identity<'a> {
            base: &'a BaseRecord,
            layers: &'a [String],
            config: &'a ImageConfig,
        }
        let json = serde_json::to_vec(&Identity {
            base,
            layers,
            config,
        })
        .unwrap_or_default();
        digest::sha256_bytes(&json)
    }

    /// Short form of the id for listings.
    pub fn short_id(&self) -> &str {
        let hex = self.id.strip_prefix("sha256:").unwrap_or(&self.id);
        &hex[..hex.len().min(12)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaseRecord {
        BaseRecord {
            reference: ImageRef::parse("python:3.11-slim").unwrap(),
            digest: "sha256:base".into(),
        }
    }

    #[test]
    fn test_id_depends_on_content_only() {
        let config = ImageConfig::default();
        let a = ImageRecord::compute_id(&base(), &["sha256:l1".into()], &config);
        let b = ImageRecord::compute_id(&base(), &["sha256:l1".into()], &config);
        let c = ImageRecord::compute_id(&base(), &["sha256:l2".into()], &config);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_config_roundtrip_keeps_ports_sorted() {
        let mut config = ImageConfig::default();
        config.exposed_ports.insert(9000);
        config.exposed_ports.insert(8000);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("[8000,9000]"));
        let back: ImageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
