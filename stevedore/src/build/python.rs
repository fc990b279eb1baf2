//! The canonical recipe for a Python ASGI service.
//!
//! Steps go from least to most frequently changing: base, OS packages,
//! manifest and dependencies, then the source tree last. A source-only edit
//! therefore invalidates the final copy and nothing before it.

use std::time::Duration;

use super::recipe::{CommandForm, Instruction, Recipe};
use crate::env::EnvSet;
use crate::images::reference::ImageRef;
use crate::supervisor::{AppRef, BindAddress, WorkerClass};
use stevedore_shared::StevedoreResult;
use stevedore_shared::constants::{build, network, supervisor};

/// Flags for the dependency install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Network timeout for package downloads.
    pub network_timeout: Duration,
    /// Do not keep the package manager's download cache in the image.
    pub no_cache: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(build::INSTALL_NETWORK_TIMEOUT_SECS),
            no_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PythonServiceRecipe {
    pub python_version: String,
    /// OS packages installed before the Python dependencies.
    pub system_packages: Vec<String>,
    pub manifest: String,
    pub install: InstallOptions,
    pub workdir: String,
    pub env: EnvSet,
    pub port: u16,
    pub app: AppRef,
    pub worker_class: WorkerClass,
    /// Program (and any subcommand) the image command starts with,
    /// e.g. `gunicorn` or `stevedore serve`.
    pub program: String,
}

impl Default for PythonServiceRecipe {
    fn default() -> Self {
        Self {
            python_version: build::DEFAULT_PYTHON_VERSION.to_string(),
            system_packages: vec!["build-essential".to_string()],
            manifest: build::DEFAULT_MANIFEST.to_string(),
            install: InstallOptions::default(),
            workdir: build::DEFAULT_WORKDIR.to_string(),
            env: EnvSet::container_defaults(),
            port: network::DEFAULT_PORT,
            app: AppRef::default(),
            worker_class: WorkerClass::default(),
            program: supervisor::DEFAULT_PROGRAM.to_string(),
        }
    }
}

impl PythonServiceRecipe {
    pub fn base_image(&self) -> StevedoreResult<ImageRef> {
        ImageRef::parse(&format!("python:{}-slim", self.python_version))
    }

    /// `apt-get` install followed by list cleanup, as one step.
    pub fn system_packages_command(&self) -> Option<String> {
        if self.system_packages.is_empty() {
            return None;
        }
        Some(format!(
            "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
            self.system_packages.join(" ")
        ))
    }

    pub fn install_command(&self) -> String {
        let mut cmd = String::from("pip install");
        if self.install.no_cache {
            cmd.push_str(" --no-cache-dir");
        }
        cmd.push_str(&format!(
            " --default-timeout={} -r {}",
            self.install.network_timeout.as_secs(),
            self.manifest
        ));
        cmd
    }

    /// Image command: `<program> -k <class> --bind <host:port> <app>`.
    pub fn command(&self) -> Vec<String> {
        let bind = format!("{}:{}", network::DEFAULT_HOST, self.port);
        let mut argv: Vec<String> = self.program.split_whitespace().map(String::from).collect();
        argv.extend([
            "-k".to_string(),
            self.worker_class.dotted_name().to_string(),
            "--bind".to_string(),
            bind,
            self.app.to_string(),
        ]);
        argv
    }

    /// Bind address the image command serves on.
    pub fn bind(&self) -> StevedoreResult<BindAddress> {
        format!("{}:{}", network::DEFAULT_HOST, self.port).parse()
    }

    pub fn recipe(&self) -> StevedoreResult<Recipe> {
        let mut steps = vec![
            Instruction::From(self.base_image()?),
            Instruction::Workdir(self.workdir.clone()),
            Instruction::Env(
                self.env
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        ];
        if let Some(apt) = self.system_packages_command() {
            steps.push(Instruction::Run(CommandForm::Shell(apt)));
        }
        steps.extend([
            Instruction::Copy {
                sources: vec![self.manifest.clone()],
                dest: ".".to_string(),
            },
            Instruction::Run(CommandForm::Shell("pip install --upgrade pip".to_string())),
            Instruction::Run(CommandForm::Shell(self.install_command())),
            Instruction::Copy {
                sources: vec![".".to_string()],
                dest: ".".to_string(),
            },
            Instruction::Expose(vec![self.port]),
            Instruction::Cmd(CommandForm::Exec(self.command())),
        ]);
        Ok(Recipe::new(steps))
    }

    /// Containerfile text.
    pub fn render(&self) -> StevedoreResult<String> {
        Ok(self.recipe()?.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_rendering() {
        let text = PythonServiceRecipe::default().render().unwrap();
        let expected = "\
FROM python:3.11-slim
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1
RUN apt-get update && apt-get install -y --no-install-recommends build-essential && rm -rf /var/lib/apt/lists/*
COPY requirements.txt .
RUN pip install --upgrade pip
RUN pip install --no-cache-dir --default-timeout=900 -r requirements.txt
COPY . .
EXPOSE 8000
CMD [\"gunicorn\", \"-k\", \"uvicorn.workers.UvicornWorker\", \"--bind\", \"0.0.0.0:8000\", \"app.main:app\"]
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_rendered_recipe_is_valid_and_reparses() {
        let recipe = PythonServiceRecipe::default().recipe().unwrap();
        recipe.validate().unwrap();
        let reparsed = Recipe::parse(&recipe.render()).unwrap();
        assert_eq!(reparsed, recipe);
    }

    #[test]
    fn test_dependencies_installed_before_source_copy() {
        let recipe = PythonServiceRecipe::default().recipe().unwrap();
        let position = |pred: &dyn Fn(&Instruction) -> bool| {
            recipe.instructions.iter().position(pred).unwrap()
        };
        let install = position(&|i| matches!(i, Instruction::Run(CommandForm::Shell(s)) if s.contains("-r requirements.txt")));
        let source = position(&|i| matches!(i, Instruction::Copy { sources, .. } if sources == &vec![".".to_string()]));
        let manifest = position(&|i| matches!(i, Instruction::Copy { sources, .. } if sources == &vec!["requirements.txt".to_string()]));
        assert!(manifest < install);
        assert!(install < source);
        assert_eq!(source, recipe.len() - 3);
    }

    #[test]
    fn test_custom_program_and_class() {
        let recipe = PythonServiceRecipe {
            program: "stevedore serve".into(),
            worker_class: WorkerClass::UvicornH11,
            port: 9000,
            system_packages: vec![],
            ..Default::default()
        };
        assert_eq!(
            recipe.command(),
            vec![
                "stevedore",
                "serve",
                "-k",
                "uvicorn.workers.UvicornH11Worker",
                "--bind",
                "0.0.0.0:9000",
                "app.main:app"
            ]
        );
        let rendered = recipe.render().unwrap();
        assert!(!rendered.contains("apt-get"));
        assert!(rendered.contains("EXPOSE 9000"));
    }
}
