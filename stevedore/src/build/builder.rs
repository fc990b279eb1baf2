//! Step-by-step image builder with a chained layer cache.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::Instrument;

use super::cache::{BuildCache, CacheRecord, ROOT_KEY, chain_key};
use super::copy;
use super::executor::{RunRequest, StepExecutor};
use super::lint::{self, LintWarning};
use super::manifest::DependencyManifest;
use super::recipe::{Instruction, Recipe};
use super::snapshot::Snapshot;
use crate::images::archive;
use crate::images::{BaseImage, BaseImageSource, BaseRecord, ImageConfig, ImageRecord, ImageRef, ImageStore};
use crate::runtime::{BuildOptions, StoreLock};
use stevedore_shared::{BuildError, StevedoreError, StevedoreResult};

/// What happened to one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// 1-based position in the recipe.
    pub index: usize,
    pub instruction: String,
    /// Reused from the cache; the step did not execute.
    pub cached: bool,
    pub layer: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub image: ImageRecord,
    pub steps: Vec<StepOutcome>,
    pub warnings: Vec<LintWarning>,
}

impl BuildReport {
    /// Steps that actually ran.
    pub fn executed(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| !s.cached)
    }

    pub fn cached_count(&self) -> usize {
        self.steps.iter().filter(|s| s.cached).count()
    }
}

pub struct Builder {
    store: Arc<ImageStore>,
    bases: Arc<dyn BaseImageSource>,
    executor: Arc<dyn StepExecutor>,
    options: BuildOptions,
}

impl Builder {
    pub fn new(
        store: Arc<ImageStore>,
        bases: Arc<dyn BaseImageSource>,
        executor: Arc<dyn StepExecutor>,
        options: BuildOptions,
    ) -> Self {
        Self {
            store,
            bases,
            executor,
            options,
        }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Validate, lint and run `recipe` against `context`, recording the
    /// result as `tag`.
    ///
    /// Any failure aborts the build without writing an image record.
    /// Layers of steps that completed stay in the store, so a rerun starts
    /// from the first step again and finds them in the cache.
    pub async fn build(&self, recipe: &Recipe, context: &Path, tag: &str) -> StevedoreResult<BuildReport> {
        let build_id = ulid::Ulid::new();
        let span = tracing::info_span!("build", id = %build_id, tag);
        self.build_inner(recipe, context, tag).instrument(span).await
    }

    async fn build_inner(&self, recipe: &Recipe, context: &Path, tag: &str) -> StevedoreResult<BuildReport> {
        self.options.validate()?;
        recipe.validate()?;
        let tag = ImageRef::parse(tag)?.to_string();

        let warnings = lint::check(recipe);
        if !warnings.is_empty() {
            if self.options.strict {
                return Err(BuildError::Lint(warnings.iter().map(ToString::to_string).collect()).into());
            }
            for warning in &warnings {
                tracing::warn!("{}", warning);
            }
        }

        if !context.is_dir() {
            return Err(StevedoreError::InvalidArgument(format!(
                "build context {} is not a directory",
                context.display()
            )));
        }
        let manifest = load_manifest(&context.join(&self.options.manifest))?;

        let layout = self.store.layout();
        let _lock = StoreLock::acquire(layout.home_dir())?;

        let reference = recipe
            .base()
            .ok_or_else(|| BuildError::InvalidRecipe("recipe has no base image".into()))?;
        let base = self
            .bases
            .resolve(reference)
            .map_err(|e| BuildError::BaseImageUnavailable {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!(base = %reference, digest = %base.digest, steps = recipe.len(), "Starting build");

        let mut cache = BuildCache::open(&layout.cache_dir())?;
        let mut staging = Staging::new(&layout.temp_dir())?;
        let mut config = ImageConfig::default();
        let mut layers: Vec<String> = Vec::new();
        let mut steps = Vec::with_capacity(recipe.len());
        let mut key = ROOT_KEY.to_string();

        for (idx, instruction) in recipe.instructions.iter().enumerate() {
            let step = idx + 1;
            let started = Instant::now();
            let canonical = instruction.canonical();

            let inputs = match instruction {
                Instruction::From(_) => Some(base.digest.clone()),
                Instruction::Copy { sources, .. } => {
                    let context = context.to_path_buf();
                    let sources = sources.clone();
                    Some(blocking(move || copy::sources_digest(&context, &sources)).await?)
                }
                _ => None,
            };
            key = chain_key(&key, &canonical, inputs.as_deref());
            apply_metadata(&mut config, instruction)?;

            if let Some(layer) = self.cache_hit(&mut cache, &key)? {
                if let Some(digest) = &layer {
                    if staging.ready {
                        let path = self.store.layer_path(digest);
                        let root = staging.root();
                        blocking(move || archive::apply_layer_file(&path, &root).map(|_| ())).await?;
                    }
                    layers.push(digest.clone());
                }
                tracing::info!(step, cached = true, "{}", canonical);
                steps.push(StepOutcome {
                    index: step,
                    instruction: canonical,
                    cached: true,
                    layer,
                    duration: started.elapsed(),
                });
                continue;
            }

            tracing::info!(step, cached = false, "{}", canonical);
            let layer = if instruction.produces_layer() {
                staging.ensure(&base, &layers, &self.store).await?;
                let layer = self
                    .execute(step, instruction, &canonical, &config, &staging, context)
                    .await?;
                if let Some(digest) = &layer {
                    layers.push(digest.clone());
                }
                layer
            } else {
                None
            };

            cache.insert(
                key.clone(),
                CacheRecord {
                    layer: layer.clone(),
                    instruction: canonical.clone(),
                    created_at: chrono::Utc::now(),
                },
            )?;
            steps.push(StepOutcome {
                index: step,
                instruction: canonical,
                cached: false,
                layer,
                duration: started.elapsed(),
            });
        }

        let base_record = BaseRecord {
            reference: reference.clone(),
            digest: base.digest.clone(),
        };
        let record = ImageRecord {
            id: ImageRecord::compute_id(&base_record, &layers, &config),
            tag,
            base: base_record,
            layers,
            config,
            dependencies: manifest.requirements,
            created_at: chrono::Utc::now(),
        };
        self.store.save(record.clone())?;

        let report = BuildReport {
            image: record,
            steps,
            warnings,
        };
        tracing::info!(
            image = %report.image.short_id(),
            layers = report.image.layers.len(),
            cached = report.cached_count(),
            "Build complete"
        );
        Ok(report)
    }

    /// `Some(layer)` when the step can be skipped. Entries whose layer blob
    /// disappeared are dropped.
    fn cache_hit(&self, cache: &mut BuildCache, key: &str) -> StevedoreResult<Option<Option<String>>> {
        if self.options.no_cache {
            return Ok(None);
        }
        let Some(record) = cache.get(key) else {
            return Ok(None);
        };
        match &record.layer {
            Some(digest) if !self.store.has_layer(digest) => {
                tracing::warn!(%digest, "Cached layer missing from store, rebuilding step");
                cache.invalidate(key)?;
                Ok(None)
            }
            layer => Ok(Some(layer.clone())),
        }
    }

    /// Run one filesystem-changing step in the staging root and commit the
    /// delta it produced as a layer.
    async fn execute(
        &self,
        step: usize,
        instruction: &Instruction,
        canonical: &str,
        config: &ImageConfig,
        staging: &Staging,
        context: &Path,
    ) -> StevedoreResult<Option<String>> {
        let root = staging.root();
        let before = {
            let root = root.clone();
            blocking(move || Snapshot::capture(&root)).await?
        };

        match instruction {
            Instruction::Workdir(_) => {
                let dir = copy::destination(&root, "/", &config.workdir);
                std::fs::create_dir_all(&dir).map_err(|e| {
                    StevedoreError::Storage(format!("Failed to create {}: {}", dir.display(), e))
                })?;
            }
            Instruction::Run(command) => {
                let argv = command.argv();
                self.executor
                    .run(&RunRequest {
                        step,
                        instruction: canonical,
                        argv: &argv,
                        rootfs: &root,
                        workdir: &config.workdir,
                        env: &config.env,
                        timeout: self.options.step_timeout,
                    })
                    .await?;
            }
            Instruction::Copy { sources, dest } => {
                let context = context.to_path_buf();
                let sources = sources.clone();
                let dest = dest.clone();
                let workdir = config.workdir.clone();
                let root = root.clone();
                blocking(move || copy::copy_sources(&context, &sources, &root, &workdir, &dest))
                    .await?;
            }
            _ => return Ok(None),
        }

        let store = Arc::clone(&self.store);
        blocking(move || {
            let after = Snapshot::capture(&root)?;
            let changes = before.diff(&after);
            if changes.is_empty() {
                return Ok(None);
            }
            let blob = archive::write_layer(&root, &changes, &store.layout().temp_dir())?;
            tracing::debug!(step, changes = changes.len(), size = blob.size, "Captured layer");
            store.commit_layer(blob).map(Some)
        })
        .await
    }
}

/// Update the image configuration for a metadata effect of `instruction`.
fn apply_metadata(config: &mut ImageConfig, instruction: &Instruction) -> StevedoreResult<()> {
    match instruction {
        Instruction::Workdir(dir) => {
            config.workdir = copy::resolve_image_path(&config.workdir, dir);
        }
        Instruction::Env(pairs) => {
            for (k, v) in pairs {
                config.env.insert(k.as_str(), v.as_str())?;
            }
        }
        Instruction::Expose(ports) => config.exposed_ports.extend(ports.iter().copied()),
        Instruction::Cmd(command) => config.cmd = Some(command.argv()),
        Instruction::From(_) | Instruction::Run(_) | Instruction::Copy { .. } => {}
    }
    Ok(())
}

fn load_manifest(path: &Path) -> StevedoreResult<DependencyManifest> {
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "No dependency manifest");
        return Ok(DependencyManifest::default());
    }
    let manifest = DependencyManifest::load(path)?;
    tracing::info!(requirements = manifest.len(), "Parsed dependency manifest");
    Ok(manifest)
}

/// Staging root filesystem, materialized on the first step that executes.
struct Staging {
    dir: TempDir,
    ready: bool,
}

impl Staging {
    fn new(temp_root: &Path) -> StevedoreResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(temp_root)
            .map_err(|e| StevedoreError::Storage(format!("Failed to create staging dir: {e}")))?;
        Ok(Self { dir, ready: false })
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("rootfs")
    }

    /// Base plus every layer so far.
    async fn ensure(&mut self, base: &BaseImage, layers: &[String], store: &ImageStore) -> StevedoreResult<()> {
        if self.ready {
            return Ok(());
        }
        let root = self.root();
        let base = base.clone();
        let paths: Vec<PathBuf> = layers.iter().map(|l| store.layer_path(l)).collect();
        blocking(move || {
            base.materialize(&root)?;
            for path in paths {
                archive::apply_layer_file(&path, &root)?;
            }
            Ok(())
        })
        .await?;
        tracing::debug!(layers = layers.len(), "Materialized staging root");
        self.ready = true;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> StevedoreResult<T>
where
    F: FnOnce() -> StevedoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StevedoreError::Internal(format!("blocking task failed: {e}")))?
}
