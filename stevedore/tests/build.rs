//! Integration tests for the layer-cached image builder.
//!
//! Builds run against a temporary store with a local `python:3.11-slim`
//! base and a recording executor, so no package manager is ever invoked.

use std::sync::Arc;

use stevedore::build::{PythonServiceRecipe, StepExecutor};
use stevedore::images::BaseImageSource;
use stevedore::runtime::StoreLock;
use stevedore::{BuildError, BuildOptions, Builder, Recipe, StevedoreError};
use stevedore_test_utils::{RecordingExecutor, TestStore, python_context, write_file};

const TAG: &str = "service:latest";

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct TestContext {
    store: TestStore,
    executor: Arc<RecordingExecutor>,
    recipe: Recipe,
}

impl TestContext {
    fn new() -> Self {
        Self::with_executor(RecordingExecutor::new())
    }

    fn with_executor(executor: RecordingExecutor) -> Self {
        Self {
            store: TestStore::new(),
            executor: Arc::new(executor),
            recipe: PythonServiceRecipe::default().recipe().unwrap(),
        }
    }

    fn builder(&self, options: BuildOptions) -> Builder {
        let bases: Arc<dyn BaseImageSource> = self.store.bases.clone();
        let executor: Arc<dyn StepExecutor> = self.executor.clone();
        Builder::new(self.store.store.clone(), bases, executor, options)
    }

    fn default_builder(&self) -> Builder {
        self.builder(BuildOptions::default())
    }
}

fn first_executed(report: &stevedore::BuildReport) -> Option<usize> {
    report.executed().map(|s| s.index).next()
}

// ============================================================================
// CACHE BEHAVIOUR
// ============================================================================

#[tokio::test]
async fn first_build_executes_every_step() {
    let ctx = TestContext::new();
    let source = python_context();

    let report = ctx
        .default_builder()
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap();

    assert_eq!(report.steps.len(), 10);
    assert_eq!(report.cached_count(), 0);
    // apt, pip upgrade, dependency install
    assert_eq!(ctx.executor.count(), 3);
    assert!(ctx.store.store.get(TAG).is_some());
}

#[tokio::test]
async fn unchanged_rebuild_is_fully_cached() {
    let ctx = TestContext::new();
    let source = python_context();
    let builder = ctx.default_builder();

    let first = builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();
    ctx.executor.reset();
    let second = builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();

    assert_eq!(second.cached_count(), second.steps.len());
    assert_eq!(ctx.executor.count(), 0);
    assert_eq!(first.image.id, second.image.id);
    assert_eq!(first.image.layers, second.image.layers);
}

#[tokio::test]
async fn source_change_reexecutes_only_from_final_copy() {
    let ctx = TestContext::new();
    let source = python_context();
    let builder = ctx.default_builder();

    let first = builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();
    ctx.executor.reset();

    write_file(
        source.path(),
        "app/main.py",
        "async def app(scope, receive, send):\n    return None\n",
    );
    let second = builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();

    assert_eq!(first_executed(&second), Some(8));
    assert_eq!(second.steps[7].instruction, "COPY . .");
    assert_eq!(ctx.executor.count(), 0, "dependency install must stay cached");
    // Layers below the source copy are shared with the first image.
    let shared = second.image.layers.len() - 1;
    assert_eq!(first.image.layers[..shared], second.image.layers[..shared]);
    assert_ne!(first.image.layers.last(), second.image.layers.last());
}

#[tokio::test]
async fn manifest_change_reinstalls_dependencies() {
    let ctx = TestContext::new();
    let source = python_context();
    let builder = ctx.default_builder();

    builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();
    ctx.executor.reset();

    write_file(source.path(), "requirements.txt", "foo==1.1\n");
    let report = builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();

    assert_eq!(first_executed(&report), Some(5));
    assert_eq!(
        ctx.executor.calls(),
        vec![
            "RUN pip install --upgrade pip".to_string(),
            "RUN pip install --no-cache-dir --default-timeout=900 -r requirements.txt".to_string(),
        ]
    );
    assert_eq!(report.image.dependencies[0].to_string(), "foo==1.1");
}

#[tokio::test]
async fn no_cache_executes_everything_again() {
    let ctx = TestContext::new();
    let source = python_context();

    ctx.default_builder()
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap();
    ctx.executor.reset();

    let report = ctx
        .builder(BuildOptions {
            no_cache: true,
            ..Default::default()
        })
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap();

    assert_eq!(report.cached_count(), 0);
    assert_eq!(ctx.executor.count(), 3);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn failing_step_leaves_no_image_but_keeps_earlier_layers() {
    let ctx = TestContext::with_executor(RecordingExecutor::failing_on("--default-timeout"));
    let source = python_context();

    let err = ctx
        .default_builder()
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StevedoreError::Build(BuildError::StepFailed { step: 7, .. })
    ));
    assert!(ctx.store.store.get(TAG).is_none());

    // Retry with a working executor over the same store.
    let retry = RecordingExecutor::new();
    let retry = Arc::new(retry);
    let executor: Arc<dyn StepExecutor> = retry.clone();
    let bases: Arc<dyn BaseImageSource> = ctx.store.bases.clone();
    let builder = Builder::new(ctx.store.store.clone(), bases, executor, BuildOptions::default());
    let report = builder.build(&ctx.recipe, source.path(), TAG).await.unwrap();

    assert_eq!(first_executed(&report), Some(7));
    assert_eq!(retry.count(), 1);
}

#[tokio::test]
async fn missing_base_image_is_reported() {
    let ctx = TestContext::new();
    let source = python_context();
    let recipe = PythonServiceRecipe {
        python_version: "3.99".into(),
        ..Default::default()
    }
    .recipe()
    .unwrap();

    let err = ctx
        .default_builder()
        .build(&recipe, source.path(), TAG)
        .await
        .unwrap_err();

    match err {
        StevedoreError::Build(BuildError::BaseImageUnavailable { reference, .. }) => {
            assert_eq!(reference, "python:3.99-slim");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctx.executor.count(), 0);
}

#[tokio::test]
async fn strict_mode_rejects_lint_findings() {
    let ctx = TestContext::new();
    let source = python_context();
    let recipe = Recipe::parse(
        "FROM python:3.11-slim\n\
         WORKDIR /app\n\
         COPY . .\n\
         RUN pip install -r requirements.txt\n",
    )
    .unwrap();

    let err = ctx
        .builder(BuildOptions {
            strict: true,
            ..Default::default()
        })
        .build(&recipe, source.path(), TAG)
        .await
        .unwrap_err();

    assert!(matches!(err, StevedoreError::Build(BuildError::Lint(_))));
    assert_eq!(ctx.executor.count(), 0);
}

#[tokio::test]
async fn lint_findings_are_warnings_by_default() {
    let ctx = TestContext::new();
    let source = python_context();
    let recipe = Recipe::parse(
        "FROM python:3.11-slim\n\
         WORKDIR /app\n\
         COPY . .\n\
         RUN pip install -r requirements.txt\n",
    )
    .unwrap();

    let report = ctx
        .default_builder()
        .build(&recipe, source.path(), TAG)
        .await
        .unwrap();
    assert!(!report.warnings.is_empty());
}

#[tokio::test]
async fn concurrent_build_is_refused_while_locked() {
    let ctx = TestContext::new();
    let source = python_context();
    let _held = StoreLock::acquire(ctx.store.path()).unwrap();

    let err = ctx
        .default_builder()
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap_err();
    assert!(matches!(err, StevedoreError::Build(BuildError::Locked(_))));
}

#[tokio::test]
async fn copy_outside_context_is_rejected() {
    let ctx = TestContext::new();
    let source = python_context();
    let recipe = Recipe::new(vec![
        stevedore::build::Instruction::From("python:3.11-slim".parse().unwrap()),
        stevedore::build::Instruction::Copy {
            sources: vec!["../secrets".into()],
            dest: ".".into(),
        },
    ]);

    let err = ctx
        .default_builder()
        .build(&recipe, source.path(), TAG)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StevedoreError::Build(BuildError::CopySource { .. })
    ));
}

// ============================================================================
// RESULTING IMAGE
// ============================================================================

#[tokio::test]
async fn image_records_dependencies_and_runtime_config() {
    let ctx = TestContext::new();
    let source = python_context();

    let report = ctx
        .default_builder()
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap();
    let image = report.image;

    assert_eq!(image.dependencies.len(), 1);
    assert_eq!(image.dependencies[0].to_string(), "foo==1.0");
    assert_eq!(image.config.workdir, "/app");
    assert!(image.config.env.disables_bytecode_cache());
    assert!(image.config.env.forces_unbuffered_output());
    assert!(image.config.exposed_ports.contains(&8000));
    assert_eq!(image.config.cmd.as_ref().unwrap()[0], "gunicorn");
    assert_eq!(image.base.reference.to_string(), "python:3.11-slim");
}

#[tokio::test]
async fn exported_rootfs_contains_base_layers_and_source() {
    let ctx = TestContext::new();
    let source = python_context();
    ctx.default_builder()
        .build(&ctx.recipe, source.path(), TAG)
        .await
        .unwrap();

    let dest = tempfile::tempdir().unwrap();
    ctx.store
        .store
        .export(TAG, dest.path(), ctx.store.bases.as_ref())
        .unwrap();

    let root = dest.path();
    assert!(root.join("etc/os-release").is_file());
    assert!(root.join("app/requirements.txt").is_file());
    assert!(root.join("app/app/main.py").is_file());
    assert!(root.join("var/lib/stevedore-test/step-7").is_file());
}
