//! Build recipes in Containerfile syntax.
//!
//! Supported instructions: `FROM`, `WORKDIR`, `ENV`, `RUN`, `COPY`,
//! `EXPOSE` and `CMD`. Lines starting with `#` are comments and a trailing
//! `\` continues an instruction on the next line. `RUN` and `CMD` accept
//! both the shell form and the JSON exec form.

use std::fmt;
use std::path::{Component, Path};

use thiserror::Error;

use crate::env;
use crate::images::reference::ImageRef;
use stevedore_shared::{BuildError, StevedoreResult};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct RecipeParseError {
    pub line: usize,
    pub message: String,
}

impl RecipeParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl From<RecipeParseError> for BuildError {
    fn from(err: RecipeParseError) -> Self {
        BuildError::InvalidRecipe(err.to_string())
    }
}

/// How a command is handed to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    /// Run through `/bin/sh -c`.
    Shell(String),
    /// argv, executed directly.
    Exec(Vec<String>),
}

impl CommandForm {
    /// argv for the command, wrapping the shell form in `/bin/sh -c`.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandForm::Shell(script) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), script.clone()]
            }
            CommandForm::Exec(argv) => argv.clone(),
        }
    }
}

impl fmt::Display for CommandForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandForm::Shell(script) => f.write_str(script),
            CommandForm::Exec(argv) => {
                let json = serde_json::to_string(argv).map_err(|_| fmt::Error)?;
                f.write_str(&json.replace("\",\"", "\", \""))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From(ImageRef),
    Workdir(String),
    Env(Vec<(String, String)>),
    Run(CommandForm),
    Copy { sources: Vec<String>, dest: String },
    Expose(Vec<u16>),
    Cmd(CommandForm),
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From(_) => "FROM",
            Instruction::Workdir(_) => "WORKDIR",
            Instruction::Env(_) => "ENV",
            Instruction::Run(_) => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Expose(_) => "EXPOSE",
            Instruction::Cmd(_) => "CMD",
        }
    }

    /// Whether executing this instruction changes the filesystem.
    pub fn produces_layer(&self) -> bool {
        matches!(
            self,
            Instruction::Workdir(_) | Instruction::Run(_) | Instruction::Copy { .. }
        )
    }

    /// Normalized text used in cache keys. Whitespace and quoting
    /// differences in the source file do not change it.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From(image) => write!(f, "FROM {image}"),
            Instruction::Workdir(dir) => write!(f, "WORKDIR {dir}"),
            Instruction::Env(pairs) => {
                f.write_str("ENV")?;
                for (key, value) in pairs {
                    write!(f, " {}={}", key, quote_value(value))?;
                }
                Ok(())
            }
            Instruction::Run(cmd) => write!(f, "RUN {cmd}"),
            Instruction::Copy { sources, dest } => {
                f.write_str("COPY")?;
                for path in sources.iter().chain(std::iter::once(dest)) {
                    write!(f, " {}", quote_value(path))?;
                }
                Ok(())
            }
            Instruction::Expose(ports) => {
                let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
                write!(f, "EXPOSE {}", ports.join(" "))
            }
            Instruction::Cmd(cmd) => write!(f, "CMD {cmd}"),
        }
    }
}

/// An ordered list of instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn load(path: &Path) -> StevedoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BuildError::InvalidRecipe(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&contents).map_err(BuildError::from)?)
    }

    pub fn parse(contents: &str) -> Result<Self, RecipeParseError> {
        let mut instructions = Vec::new();
        for (line, text) in logical_lines(contents) {
            instructions.push(parse_instruction(line, &text)?);
        }
        Ok(Self { instructions })
    }

    /// Render back to Containerfile text, one instruction per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }

    /// The base image named by the first instruction.
    pub fn base(&self) -> Option<&ImageRef> {
        match self.instructions.first() {
            Some(Instruction::From(image)) => Some(image),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Structural checks that make a recipe buildable.
    pub fn validate(&self) -> Result<(), BuildError> {
        let invalid = |msg: String| -> Result<(), BuildError> { Err(BuildError::InvalidRecipe(msg)) };

        match self.instructions.first() {
            None => return invalid("recipe has no instructions".into()),
            Some(Instruction::From(_)) => {}
            Some(other) => {
                return invalid(format!(
                    "first instruction must be FROM, found {}",
                    other.keyword()
                ));
            }
        }

        for (idx, instruction) in self.instructions.iter().enumerate().skip(1) {
            let step = idx + 1;
            match instruction {
                Instruction::From(_) => {
                    return invalid(format!("step {step}: only one FROM is supported"));
                }
                Instruction::Workdir(dir) if dir.is_empty() => {
                    return invalid(format!("step {step}: WORKDIR is empty"));
                }
                Instruction::Env(pairs) => {
                    for (key, _) in pairs {
                        env::validate_key(key)
                            .map_err(|e| BuildError::InvalidRecipe(format!("step {step}: {e}")))?;
                    }
                }
                Instruction::Copy { sources, .. } => {
                    for source in sources {
                        if !is_contained(source) {
                            return Err(BuildError::CopySource {
                                source_path: source.clone(),
                                reason: "must be a relative path inside the build context"
                                    .into(),
                            });
                        }
                    }
                }
                Instruction::Expose(ports) if ports.contains(&0) => {
                    return invalid(format!("step {step}: port 0 cannot be exposed"));
                }
                Instruction::Run(CommandForm::Exec(argv))
                | Instruction::Cmd(CommandForm::Exec(argv))
                    if argv.is_empty() =>
                {
                    return invalid(format!("step {step}: empty exec form"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Relative and never climbing above its root.
pub fn is_contained(path: &str) -> bool {
    let path = Path::new(path);
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn logical_lines(contents: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in contents.lines().enumerate() {
        let trimmed = raw.trim();
        // Comments are dropped even inside a continuation.
        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.is_empty() && pending.is_none() {
            continue;
        }

        let (start, mut buffer) = pending.take().unwrap_or((idx + 1, String::new()));
        match trimmed.strip_suffix('\\') {
            Some(head) => {
                buffer.push_str(head.trim_end());
                buffer.push(' ');
                pending = Some((start, buffer));
            }
            None => {
                buffer.push_str(trimmed);
                lines.push((start, buffer.trim().to_string()));
            }
        }
    }
    if let Some((start, buffer)) = pending {
        lines.push((start, buffer.trim().to_string()));
    }
    lines
}

fn parse_instruction(line: usize, text: &str) -> Result<Instruction, RecipeParseError> {
    let (keyword, args) = match text.split_once(char::is_whitespace) {
        Some((keyword, args)) => (keyword, args.trim()),
        None => (text, ""),
    };
    let keyword = keyword.to_ascii_uppercase();
    if args.is_empty() {
        return Err(RecipeParseError::new(line, format!("{keyword} requires arguments")));
    }

    match keyword.as_str() {
        "FROM" => {
            if args.split_whitespace().count() != 1 {
                return Err(RecipeParseError::new(line, "FROM takes a single image reference"));
            }
            ImageRef::parse(args)
                .map(Instruction::From)
                .map_err(|e| RecipeParseError::new(line, e.to_string()))
        }
        "WORKDIR" => Ok(Instruction::Workdir(args.to_string())),
        "ENV" => parse_env(line, args).map(Instruction::Env),
        "RUN" => parse_command(line, args).map(Instruction::Run),
        "CMD" => parse_command(line, args).map(Instruction::Cmd),
        "COPY" => {
            let mut words = split_words(line, args)?;
            if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
                return Err(RecipeParseError::new(
                    line,
                    format!("unsupported COPY flag '{flag}'"),
                ));
            }
            if words.len() < 2 {
                return Err(RecipeParseError::new(line, "COPY needs a source and a destination"));
            }
            let dest = words.pop().unwrap_or_default();
            Ok(Instruction::Copy {
                sources: words,
                dest,
            })
        }
        "EXPOSE" => {
            let mut ports = Vec::new();
            for word in args.split_whitespace() {
                let number = word.strip_suffix("/tcp").unwrap_or(word);
                let port = number
                    .parse::<u16>()
                    .map_err(|_| RecipeParseError::new(line, format!("invalid port '{word}'")))?;
                ports.push(port);
            }
            Ok(Instruction::Expose(ports))
        }
        other => Err(RecipeParseError::new(
            line,
            format!("unsupported instruction '{other}'"),
        )),
    }
}

fn parse_command(line: usize, args: &str) -> Result<CommandForm, RecipeParseError> {
    if args.starts_with('[') {
        let argv: Vec<String> = serde_json::from_str(args)
            .map_err(|e| RecipeParseError::new(line, format!("invalid exec form: {e}")))?;
        return Ok(CommandForm::Exec(argv));
    }
    Ok(CommandForm::Shell(args.to_string()))
}

fn parse_env(line: usize, args: &str) -> Result<Vec<(String, String)>, RecipeParseError> {
    let first = args.split_whitespace().next().unwrap_or_default();
    if !first.contains('=') {
        // Legacy form: `ENV KEY value with spaces`.
        let (key, value) = args
            .split_once(char::is_whitespace)
            .ok_or_else(|| RecipeParseError::new(line, "ENV needs a value"))?;
        return Ok(vec![(key.to_string(), value.trim().to_string())]);
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    for word in split_words(line, args)? {
        let (key, value) = word
            .split_once('=')
            .ok_or_else(|| RecipeParseError::new(line, format!("expected KEY=value, got '{word}'")))?;
        env::validate_key(key).map_err(|e| RecipeParseError::new(line, e.to_string()))?;
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => pairs.push((key.to_string(), value.to_string())),
        }
    }
    Ok(pairs)
}

// Whitespace separated words. Double quotes group, backslash escapes the
// next character inside quotes.
fn split_words(line: usize, args: &str) -> Result<Vec<String>, RecipeParseError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut has_word = false;
    let mut in_quotes = false;
    let mut chars = args.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if in_quotes {
        return Err(RecipeParseError::new(line, "unterminated quote"));
    }
    if has_word {
        words.push(current);
    }
    Ok(words)
}

fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\')
    {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = r#"
# Python service
FROM python:3.11-slim
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 \
    PYTHONUNBUFFERED=1
RUN apt-get update \
    && apt-get install -y --no-install-recommends build-essential \
    && rm -rf /var/lib/apt/lists/*
COPY requirements.txt .
RUN pip install --upgrade pip
RUN pip install --no-cache-dir --default-timeout=900 -r requirements.txt
COPY . .
EXPOSE 8000
CMD ["gunicorn", "-k", "uvicorn.workers.UvicornWorker", "--bind", "0.0.0.0:8000", "app.main:app"]
"#;

    #[test]
    fn test_parse_sample() {
        let recipe = Recipe::parse(SAMPLE).unwrap();
        assert_eq!(recipe.len(), 10);
        assert_eq!(recipe.base().unwrap().to_string(), "python:3.11-slim");
        assert_eq!(
            recipe.instructions[2],
            Instruction::Env(vec![
                ("PYTHONDONTWRITEBYTECODE".into(), "1".into()),
                ("PYTHONUNBUFFERED".into(), "1".into()),
            ])
        );
        match &recipe.instructions[3] {
            Instruction::Run(CommandForm::Shell(script)) => {
                assert_eq!(
                    script,
                    "apt-get update && apt-get install -y --no-install-recommends build-essential && rm -rf /var/lib/apt/lists/*"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        match &recipe.instructions[9] {
            Instruction::Cmd(CommandForm::Exec(argv)) => {
                assert_eq!(argv[0], "gunicorn");
                assert_eq!(argv.last().unwrap(), "app.main:app");
            }
            other => panic!("unexpected {other:?}"),
        }
        recipe.validate().unwrap();
    }

    #[test]
    fn test_render_reparses_to_same_recipe() {
        let recipe = Recipe::parse(SAMPLE).unwrap();
        let rendered = recipe.render();
        assert_eq!(Recipe::parse(&rendered).unwrap(), recipe);
    }

    #[test]
    fn test_copy_paths_with_spaces_stay_distinct() {
        let spaced = Recipe::parse("FROM scratch\nCOPY \"a b\" .\n").unwrap();
        let split = Recipe::parse("FROM scratch\nCOPY a b .\n").unwrap();
        assert_ne!(spaced.instructions[1].canonical(), split.instructions[1].canonical());
        assert_eq!(spaced.instructions[1].to_string(), "COPY \"a b\" .");

        for recipe in [spaced, split] {
            assert_eq!(Recipe::parse(&recipe.render()).unwrap(), recipe);
        }
    }

    #[test]
    fn test_canonical_ignores_formatting() {
        let a = Recipe::parse("FROM scratch\nENV A=1   B=\"x y\"\n").unwrap();
        let b = Recipe::parse("from scratch\nENV A=1 \\\n  B=\"x y\"\n").unwrap();
        assert_eq!(a.instructions[1].canonical(), b.instructions[1].canonical());
        assert_eq!(a.instructions[1].canonical(), "ENV A=1 B=\"x y\"");
    }

    #[test]
    fn test_legacy_env_form() {
        let recipe = Recipe::parse("FROM scratch\nENV GREETING hello world\n").unwrap();
        assert_eq!(
            recipe.instructions[1],
            Instruction::Env(vec![("GREETING".into(), "hello world".into())])
        );
    }

    #[rstest]
    #[case("FROM", 1)]
    #[case("FROM scratch\nHEALTHCHECK CMD true", 2)]
    #[case("FROM scratch\nEXPOSE http", 2)]
    #[case("FROM scratch\nCOPY onlyone", 2)]
    #[case("FROM scratch\nCOPY --chown=app a b", 2)]
    #[case("FROM scratch\nCMD [\"unterminated\"", 2)]
    #[case("FROM scratch\n\nENV A=\"open", 3)]
    #[case("FROM scratch\nENV 1BAD=x", 2)]
    fn test_parse_errors_carry_line(#[case] text: &str, #[case] line: usize) {
        let err = Recipe::parse(text).unwrap_err();
        assert_eq!(err.line, line, "{err}");
    }

    #[rstest]
    #[case("", "no instructions")]
    #[case("WORKDIR /app", "first instruction must be FROM")]
    #[case("FROM scratch\nFROM scratch", "only one FROM")]
    #[case("FROM scratch\nEXPOSE 0", "port 0")]
    #[case("FROM scratch\nRUN []", "empty exec form")]
    fn test_validate_rejects(#[case] text: &str, #[case] expected: &str) {
        let recipe = Recipe::parse(text).unwrap();
        let err = recipe.validate().unwrap_err();
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[rstest]
    #[case("/etc/passwd")]
    #[case("../secrets")]
    #[case("src/../../x")]
    fn test_copy_outside_context_rejected(#[case] source: &str) {
        let recipe = Recipe::new(vec![
            Instruction::From(ImageRef::parse("scratch").unwrap()),
            Instruction::Copy {
                sources: vec![source.into()],
                dest: ".".into(),
            },
        ]);
        assert!(matches!(
            recipe.validate().unwrap_err(),
            BuildError::CopySource { .. }
        ));
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained("."));
        assert!(is_contained("src/../app"));
        assert!(!is_contained(".."));
    }

    #[test]
    fn test_shell_form_argv() {
        let cmd = CommandForm::Shell("echo hi".into());
        assert_eq!(cmd.argv(), vec!["/bin/sh", "-c", "echo hi"]);
    }
}
