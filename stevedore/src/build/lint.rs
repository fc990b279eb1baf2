//! Recipe lint: layer ordering and image hygiene checks.
//!
//! Findings are warnings by default; strict builds refuse to start when
//! any are present.

use std::fmt;

use super::recipe::{CommandForm, Instruction, Recipe};
use crate::env::EnvSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LintRule {
    /// The whole build context is copied before a package install, so any
    /// source edit reruns the install.
    SourceBeforeInstall,
    /// Bytecode caching or output buffering left enabled.
    PythonEnvMissing,
    /// apt package lists kept in the layer.
    AptListsKept,
    /// pip download cache kept in the layer.
    PipCacheKept,
    /// The manifest only arrives with the full source copy.
    ManifestWithSource,
}

impl LintRule {
    pub fn code(&self) -> &'static str {
        match self {
            LintRule::SourceBeforeInstall => "source-before-install",
            LintRule::PythonEnvMissing => "python-env-missing",
            LintRule::AptListsKept => "apt-lists-kept",
            LintRule::PipCacheKept => "pip-cache-kept",
            LintRule::ManifestWithSource => "manifest-with-source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    /// 1-based step, 0 for findings about the recipe as a whole.
    pub step: usize,
    pub rule: LintRule,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 0 {
            write!(f, "[{}] {}", self.rule.code(), self.message)
        } else {
            write!(f, "step {} [{}] {}", self.step, self.rule.code(), self.message)
        }
    }
}

pub fn check(recipe: &Recipe) -> Vec<LintWarning> {
    let mut warnings = Vec::new();
    let mut env = EnvSet::new();
    let mut source_copied_at: Option<usize> = None;
    let mut copied_files: Vec<String> = Vec::new();

    for (idx, instruction) in recipe.instructions.iter().enumerate() {
        let step = idx + 1;
        match instruction {
            Instruction::Env(pairs) => {
                for (k, v) in pairs {
                    // Keys were validated by the parser.
                    let _ = env.insert(k.as_str(), v.as_str());
                }
            }
            Instruction::Copy { sources, .. } => {
                if sources.iter().any(|s| is_whole_context(s)) {
                    source_copied_at.get_or_insert(step);
                } else {
                    copied_files.extend(sources.iter().map(|s| normalize(s)));
                }
            }
            Instruction::Run(command) => {
                let script = script_of(command);
                let installs_packages = is_apt_install(&script) || is_pip_install(&script);

                if installs_packages && let Some(copied) = source_copied_at {
                    warnings.push(LintWarning {
                        step,
                        rule: LintRule::SourceBeforeInstall,
                        message: format!(
                            "package install runs after the source tree is copied in step {copied}"
                        ),
                    });
                }

                if is_apt_install(&script) && !script.contains("/var/lib/apt/lists") {
                    warnings.push(LintWarning {
                        step,
                        rule: LintRule::AptListsKept,
                        message: "apt-get install without `rm -rf /var/lib/apt/lists/*` in the same step"
                            .into(),
                    });
                }

                if let Some(manifest) = requirements_file(&script) {
                    if !script.contains("--no-cache-dir") {
                        warnings.push(LintWarning {
                            step,
                            rule: LintRule::PipCacheKept,
                            message: "pip install -r without --no-cache-dir".into(),
                        });
                    }
                    if !copied_files.contains(&normalize(&manifest)) {
                        warnings.push(LintWarning {
                            step,
                            rule: LintRule::ManifestWithSource,
                            message: format!(
                                "{manifest} is not copied on its own before it is installed"
                            ),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    if !env.disables_bytecode_cache() || !env.forces_unbuffered_output() {
        warnings.push(LintWarning {
            step: 0,
            rule: LintRule::PythonEnvMissing,
            message: "set PYTHONDONTWRITEBYTECODE=1 and PYTHONUNBUFFERED=1".into(),
        });
    }

    warnings
}

fn script_of(command: &CommandForm) -> String {
    match command {
        CommandForm::Shell(script) => script.clone(),
        CommandForm::Exec(argv) => argv.join(" "),
    }
}

fn is_whole_context(source: &str) -> bool {
    matches!(source.trim_end_matches('/'), "." | "")
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

fn is_apt_install(script: &str) -> bool {
    script.contains("apt-get install") || script.contains("apt install")
}

fn is_pip_install(script: &str) -> bool {
    script.contains("pip install") || script.contains("pip3 install")
}

/// The file passed to `pip install -r` / `--requirement`, if any.
fn requirements_file(script: &str) -> Option<String> {
    if !is_pip_install(script) {
        return None;
    }
    let mut words = script.split_whitespace();
    while let Some(word) = words.next() {
        if word == "-r" || word == "--requirement" {
            return words.next().map(String::from);
        }
        if let Some(file) = word.strip_prefix("--requirement=") {
            return Some(file.to_string());
        }
    }
    None
}
