mod build;
pub mod pypipush;
mod push;
mod remote;
mod run;
mod scan;

use crate::artifacts::ArtifactManifest;
use crate::cache::CacheStore;
use crate::docker::multiplatform::{BuiltImageSet, MultiplatformImageBuilder};
use crate::errors::BuildError;
use crate::logs::StepLog;
use crate::manifest::Step;
use crate::session::BuildContext;
use crate::source::SourceSnapshot;
use crate::sshagent::SshAgentProxy;
use bollard::Docker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a step borrows from the running session.
pub struct StepResources<'a> {
    pub client: &'a Arc<Docker>,
    pub ctx: &'a mut BuildContext,
    pub source: &'a mut SourceSnapshot,
    pub caches: &'a CacheStore,
    pub multiplatform: &'a mut MultiplatformImageBuilder,
}

/// Results flowing between a step's stages.
#[derive(Default)]
pub struct StepContext {
    /// Image produced by the build stage (or the native image of a
    /// multi-platform build).
    pub image: Option<String>,
    pub mp_image: Option<BuiltImageSet>,
    /// The primary container after a run stage, available for committing.
    pub run_container: Option<String>,
    /// Image produced by a post-build stage.
    pub run_image: Option<String>,
}

/// A single resource to release when the step ends, however it ends.
pub enum CleanupAction {
    Container(String),
    ContainerHint(String),
    Network(String),
    Agent(SshAgentProxy),
    Task(tokio::task::JoinHandle<()>),
}

/// The step's typed cleanup stack, unwound LIFO on every exit path.
/// Cleanup failures are recorded but never promoted to step failures.
#[derive(Default)]
pub struct CleanupStack(Vec<CleanupAction>);

impl CleanupStack {
    pub fn new() -> Self {
        CleanupStack::default()
    }

    pub fn push(&mut self, action: CleanupAction) {
        self.0.push(action);
    }

    pub async fn unwind(&mut self, client: &Docker) {
        while let Some(action) = self.0.pop() {
            match action {
                CleanupAction::Container(id) => {
                    if let Err(err) = crate::docker::force_remove_container(client, &id).await {
                        warn!(container = id, error = %err, "cleanup: could not remove container");
                    }
                }
                CleanupAction::ContainerHint(hint) => {
                    crate::docker::remove_container_hint(client, &hint).await;
                }
                CleanupAction::Network(name) => {
                    if let Err(err) = client.remove_network(&name).await {
                        warn!(network = name, error = %err, "cleanup: could not remove network");
                    }
                }
                CleanupAction::Agent(mut agent) => {
                    agent.stop().await;
                }
                CleanupAction::Task(handle) => {
                    handle.abort();
                }
            }
        }
    }
}

/// Manages running one build step: drives the stage sequence and guarantees
/// the cleanup stack unwinds on success, failure, and cancellation alike.
pub struct StepRunner {
    pub name: String,
    /// Unique id for this step execution, used in container and network names.
    pub id: String,
    pub step: Step,
    pub results_dir: PathBuf,
    pub log: StepLog,
    /// Artifacts produced by this step, written to the sidecar at the end.
    pub artifacts: ArtifactManifest,
}

impl StepRunner {
    pub async fn new(
        name: &str,
        step: Step,
        session_results_dir: &PathBuf,
    ) -> Result<StepRunner, BuildError> {
        let results_dir = session_results_dir.join(name);
        std::fs::create_dir_all(&results_dir)
            .map_err(|e| BuildError::Resource(format!("cannot create step results dir; {e}")))?;

        let log = StepLog::create(&results_dir.join("build.log"))
            .await
            .map_err(|e| BuildError::Resource(format!("cannot create step log; {e}")))?;

        Ok(StepRunner {
            name: name.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            step,
            results_dir,
            log,
            artifacts: ArtifactManifest::new(),
        })
    }

    /// Run the step's stages in order. The cleanup stack unwinds before this
    /// returns no matter which stage failed.
    pub async fn run(&mut self, resources: &mut StepResources<'_>) -> Result<(), BuildError> {
        info!(step = %self.name, "Running step");
        self.log
            .write_line(&format!("\nRunning step \"{}\"\n{}", self.name, "_".repeat(40)))
            .await;

        let mut cleanup = CleanupStack::new();
        let mut step_ctx = StepContext::default();

        let result = self.execute(resources, &mut cleanup, &mut step_ctx).await;

        cleanup.unwind(resources.client).await;
        self.write_artifact_sidecar(resources);
        self.log.flush().await;

        result
    }

    async fn execute(
        &mut self,
        resources: &mut StepResources<'_>,
        cleanup: &mut CleanupStack,
        step_ctx: &mut StepContext,
    ) -> Result<(), BuildError> {
        resources.ctx.check_cancelled()?;

        if let Some(remote) = self.step.remote.clone() {
            self.log
                .write_line(&format!("==> Running step: {}:remote", self.name))
                .await;
            return remote::execute(self, resources, &remote).await;
        }

        if let Some(build_spec) = self.step.build.clone() {
            resources.ctx.check_cancelled()?;
            self.log
                .write_line(&format!("==> Running step: {}:build", self.name))
                .await;
            build::execute(self, resources, step_ctx, &build_spec, None).await?;
        }

        if let Some(run_spec) = self.step.run.clone() {
            resources.ctx.check_cancelled()?;
            self.log
                .write_line(&format!("==> Running step: {}:run", self.name))
                .await;
            run::execute(self, resources, cleanup, step_ctx, &run_spec).await?;
        }

        if let Some(commits) = self.step.commit.clone() {
            resources.ctx.check_cancelled()?;
            self.log
                .write_line(&format!("==> Running step: {}:commit", self.name))
                .await;
            push::execute(self, resources, step_ctx, &commits.0, true).await?;
        }

        if let Some(pushes) = self.step.push.clone() {
            resources.ctx.check_cancelled()?;
            self.log
                .write_line(&format!("==> Running step: {}:push", self.name))
                .await;
            push::execute(self, resources, step_ctx, &pushes.0, false).await?;
        }

        // A pure-build step with neither commit nor push still gets the
        // build tag locally when a push was requested, so later steps can
        // reference the image by a stable name.
        if resources.ctx.push
            && self.step.commit.is_none()
            && self.step.push.is_none()
            && self.step.run.is_none()
        {
            if let Some(image) = &step_ctx.image {
                let reference = format!("{}:{}", self.name, resources.ctx.docker_tag);
                resources
                    .client
                    .tag_image(
                        image,
                        Some(bollard::image::TagImageOptions {
                            repo: self.name.clone(),
                            tag: resources.ctx.docker_tag.clone(),
                        }),
                    )
                    .await
                    .map_err(|e| BuildError::Resource(format!("could not tag image; {e}")))?;
                resources.ctx.committed_images.insert(reference);
                resources.ctx.images.insert(
                    self.name.clone(),
                    crate::session::ImageRecord {
                        image: image.clone(),
                        platforms: Vec::new(),
                    },
                );
            }
        }

        if let Some(pypi) = self.step.pypi_push.clone() {
            resources.ctx.check_cancelled()?;
            self.log
                .write_line(&format!("==> Running step: {}:pypi-push", self.name))
                .await;
            pypipush::execute(self, resources, &pypi).await?;
        }

        Ok(())
    }

    /// Write the per-step sidecar and register its entries with the session
    /// under step-qualified names.
    fn write_artifact_sidecar(&mut self, resources: &mut StepResources<'_>) {
        if self.artifacts.is_empty() {
            return;
        }

        let sidecar = self.results_dir.join(crate::artifacts::MANIFEST_FILE);
        if let Err(err) = self.artifacts.write(&sidecar) {
            warn!(step = %self.name, error = %err, "could not write artifact sidecar");
        }

        for (name, metadata) in self.artifacts.entries() {
            resources.ctx.artifacts.add(
                &format!("{}/{name}", self.name),
                metadata.as_object().cloned().unwrap_or_default(),
            );
        }
    }
}
