//! Dependency manifest (pip requirements format).
//!
//! The manifest is parsed before any step runs so a malformed file fails
//! the build early, and the parsed requirements are recorded in the image.
//! Resolution itself belongs to the package manager; only the surface
//! syntax is understood here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use stevedore_shared::{BuildError, StevedoreResult};

/// One declared requirement, e.g. `uvicorn[standard]>=0.20; python_version>"3.8"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    /// Version constraint as written, without whitespace (`==1.0`, `>=2,<3`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    /// Environment marker after `;`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

impl Requirement {
    /// PEP 503 normalized project name.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Whether the constraint pins a single version with `==`.
    pub fn is_pinned(&self) -> bool {
        self.constraint.as_deref().is_some_and(|c| {
            c.starts_with("==") && !c.contains(',') && !c.contains('*')
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(constraint) = &self.constraint {
            write!(f, "{constraint}")?;
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

/// Parsed requirements file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
    /// Option lines (`--index-url ...`, `-r other.txt`) kept verbatim.
    pub options: Vec<String>,
    /// Direct references (`name @ url`, VCS and archive URLs, local paths)
    /// kept verbatim for the package manager.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl DependencyManifest {
    pub fn load(path: &Path) -> StevedoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&contents)?)
    }

    pub fn parse(contents: &str) -> Result<Self, BuildError> {
        let mut manifest = Self::default();
        let mut seen: HashMap<(String, Option<String>), usize> = HashMap::new();

        for (line_no, line) in logical_lines(contents) {
            if line.starts_with('-') {
                manifest.options.push(line);
                continue;
            }
            if is_direct_reference(&line) {
                manifest.references.push(line);
                continue;
            }
            let requirement = parse_requirement(&line)
                .map_err(|reason| BuildError::Manifest(format!("line {line_no}: {reason}")))?;
            // The same project may appear once per environment marker.
            let key = (requirement.normalized_name(), requirement.marker.clone());
            if let Some(first) = seen.insert(key, line_no) {
                return Err(BuildError::Manifest(format!(
                    "line {line_no}: duplicate requirement '{}' (first declared on line {first})",
                    requirement.name
                )));
            }
            manifest.requirements.push(requirement);
        }
        Ok(manifest)
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        let wanted = normalize_name(name);
        self.requirements
            .iter()
            .find(|r| r.normalized_name() == wanted)
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Lowercase, with runs of `-`, `_` and `.` collapsed to a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

// Join `\` continuations, strip comments and blanks. Yields the line number
// where each logical line starts.
fn logical_lines(contents: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let without_comment = strip_comment(raw);
        let (text, continued) = match without_comment.trim_end().strip_suffix('\\') {
            Some(head) => (head.to_string(), true),
            None => (without_comment.to_string(), false),
        };

        let (start, mut buffer) = pending.take().unwrap_or((line_no, String::new()));
        buffer.push_str(&text);

        if continued {
            pending = Some((start, buffer));
            continue;
        }
        let trimmed = buffer.trim();
        if !trimmed.is_empty() {
            lines.push((start, trimmed.to_string()));
        }
    }
    if let Some((start, buffer)) = pending {
        let trimmed = buffer.trim();
        if !trimmed.is_empty() {
            lines.push((start, trimmed.to_string()));
        }
    }
    lines
}

// URLs, `name @ url` and local paths are handed to pip untouched.
fn is_direct_reference(line: &str) -> bool {
    let spec = line.split(';').next().unwrap_or(line).trim();
    spec.contains("://")
        || spec.contains(" @ ")
        || spec.starts_with("git+")
        || spec.starts_with('.')
        || spec.starts_with('/')
        || spec.ends_with(".whl")
        || spec.ends_with(".tar.gz")
        || spec.ends_with(".zip")
}

// pip only treats `#` as a comment at line start or after whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn parse_requirement(line: &str) -> Result<Requirement, String> {
    let (spec, marker) = match line.split_once(';') {
        Some((spec, marker)) => {
            let marker = marker.trim();
            if marker.is_empty() {
                return Err("empty environment marker".into());
            }
            (spec.trim(), Some(marker.to_string()))
        }
        None => (line.trim(), None),
    };

    let name_end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(spec.len());
    let name = &spec[..name_end];
    if name.is_empty()
        || !name.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(format!("invalid project name in '{spec}'"));
    }

    let mut rest = spec[name_end..].trim_start();
    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .ok_or_else(|| format!("unterminated extras in '{spec}'"))?;
        for extra in after[..close].split(',') {
            let extra = extra.trim();
            if extra.is_empty() {
                return Err(format!("empty extra in '{spec}'"));
            }
            extras.push(extra.to_string());
        }
        rest = after[close + 1..].trim_start();
    }

    let constraint = if rest.is_empty() {
        None
    } else {
        let compact: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
        for clause in compact.split(',') {
            validate_clause(clause).map_err(|e| format!("{e} in '{spec}'"))?;
        }
        Some(compact)
    };

    Ok(Requirement {
        name: name.to_string(),
        extras,
        constraint,
        marker,
    })
}

const OPERATORS: [&str; 8] = ["===", "~=", "==", "!=", "<=", ">=", "<", ">"];

fn validate_clause(clause: &str) -> Result<(), String> {
    let op = OPERATORS
        .iter()
        .find(|op| clause.starts_with(**op))
        .ok_or_else(|| format!("invalid version clause '{clause}'"))?;
    let version = &clause[op.len()..];
    if version.is_empty() {
        return Err(format!("missing version after '{op}'"));
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '-' | '!' | '_'))
    {
        return Err(format!("invalid version '{version}'"));
    }
    Ok(())
}
