use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use nix::sys::signal::Signal;
use stevedore::EnvSet;
use stevedore::constants::{envs, supervisor as supervisor_defaults};
use stevedore::supervisor::{
    AppRef, BindAddress, Control, SupervisionSpec, Supervisor, SupervisorControl, WorkerClass,
    resolve_worker_count,
};
use tokio::signal::unix::{SignalKind, signal};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Worker class: uvicorn, uvicorn-h11, or a dotted worker name
    #[arg(short = 'k', long = "worker-class", default_value = "uvicorn.workers.UvicornWorker")]
    pub worker_class: WorkerClass,

    /// Address to listen on (host:port)
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    pub bind: BindAddress,

    /// Number of worker processes (defaults to WEB_CONCURRENCY, then 1)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Seconds workers get to finish in-flight requests on shutdown
    #[arg(long, value_name = "SECS", default_value_t = supervisor_defaults::DEFAULT_GRACEFUL_TIMEOUT_SECS)]
    pub graceful_timeout: u64,

    /// Seconds the application import check may take
    #[arg(long, value_name = "SECS", default_value_t = supervisor_defaults::DEFAULT_BOOT_TIMEOUT_SECS)]
    pub boot_timeout: u64,

    /// Python interpreter for the import check and the workers
    #[arg(long, default_value = supervisor_defaults::DEFAULT_PYTHON)]
    pub python: String,

    /// Change to this directory before loading the application
    #[arg(long)]
    pub chdir: Option<PathBuf>,

    /// Extra environment variables for the workers (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Application as module:attribute (append `()` for a factory)
    pub app: AppRef,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

impl ServeArgs {
    fn to_spec(&self) -> anyhow::Result<SupervisionSpec> {
        let web_concurrency = std::env::var(envs::WEB_CONCURRENCY).ok();
        let workers = resolve_worker_count(self.workers, web_concurrency.as_deref())?;

        let mut env = EnvSet::container_defaults();
        for (key, value) in &self.env {
            env.insert(key.as_str(), value.as_str())?;
        }

        let spec = SupervisionSpec {
            workers,
            graceful_timeout: Duration::from_secs(self.graceful_timeout),
            boot_timeout: Duration::from_secs(self.boot_timeout),
            python: self.python.clone(),
            chdir: self.chdir.clone(),
            env,
            ..SupervisionSpec::new(self.app.clone(), self.worker_class, self.bind)
        };
        spec.validate()?;
        Ok(spec)
    }
}

pub async fn execute(args: ServeArgs) -> anyhow::Result<()> {
    let spec = args.to_spec()?;
    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&spec)?);
        return Ok(());
    }

    // Handlers go in before any worker exists so an early SIGTERM is not fatal.
    let signals = ControlSignals::install()?;
    let handle = Supervisor::new(spec).spawn()?;
    let signals = tokio::spawn(signals.forward(handle.controller()));
    let result = handle.wait().await;
    signals.abort();

    let report = result?;
    tracing::info!(
        restarts = report.restarts,
        forced_kills = report.forced_kills,
        "Supervisor exited"
    );
    Ok(())
}

struct ControlSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
    ttin: tokio::signal::unix::Signal,
    ttou: tokio::signal::unix::Signal,
}

impl ControlSignals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
            ttin: signal(SignalKind::from_raw(Signal::SIGTTIN as i32))?,
            ttou: signal(SignalKind::from_raw(Signal::SIGTTOU as i32))?,
        })
    }

    /// Translate process signals into supervisor controls until the master
    /// stops listening.
    async fn forward(mut self, controller: SupervisorControl) {
        loop {
            let control = tokio::select! {
                _ = self.term.recv() => Control::Shutdown,
                _ = self.int.recv() => Control::Shutdown,
                _ = self.hup.recv() => Control::Reload,
                _ = self.ttin.recv() => Control::IncreaseWorkers,
                _ = self.ttou.recv() => Control::DecreaseWorkers,
            };
            tracing::info!(?control, "Received signal");
            if controller.send(control).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: ServeArgs,
    }

    fn parse(argv: &[&str]) -> ServeArgs {
        let mut full = vec!["serve"];
        full.extend_from_slice(argv);
        Wrapper::parse_from(full).args
    }

    #[test]
    fn test_image_command_arguments_resolve() {
        let args = parse(&[
            "-k",
            "uvicorn.workers.UvicornWorker",
            "--bind",
            "0.0.0.0:8000",
            "-w",
            "2",
            "app.main:app",
        ]);
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.app.to_string(), "app.main:app");
        assert_eq!(spec.worker_class, WorkerClass::Uvicorn);
        assert_eq!(spec.bind.to_string(), "0.0.0.0:8000");
        assert_eq!(spec.workers, 2);
        assert_eq!(spec.graceful_timeout, Duration::from_secs(30));
        assert!(spec.env.forces_unbuffered_output());
    }

    #[test]
    fn test_extra_env_is_layered_over_defaults() {
        let args = parse(&["-w", "1", "-e", "PYTHONUNBUFFERED=true", "-e", "MODE=prod", "app.main:app"]);
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.env.get("MODE"), Some("prod"));
        assert!(spec.env.forces_unbuffered_output());
        assert!(spec.env.disables_bytecode_cache());
    }

    #[rstest]
    #[case("PYTHONUNBUFFERED=0")]
    #[case("PYTHONDONTWRITEBYTECODE=")]
    fn test_disabling_container_defaults_rejected(#[case] pair: &str) {
        let args = parse(&["-w", "1", "-e", pair, "app.main:app"]);
        let err = args.to_spec().unwrap_err();
        assert!(err.to_string().contains("must stay enabled"), "{err}");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let args = parse(&["-w", "0", "app.main:app"]);
        assert!(args.to_spec().is_err());
    }

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".into(), "b=c".into()));
        assert!(parse_env("nope").is_err());
    }
}
