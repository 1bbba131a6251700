use crate::artifacts::ArtifactManifest;
use crate::cache::CacheStore;
use crate::conf::{GlobalConfig, SecurityScanOverride};
use crate::dag;
use crate::docker::multiplatform::{BuiltImageSet, MultiplatformImageBuilder};
use crate::errors::{BuildError, EXIT_SUCCESS};
use crate::logs::StepLog;
use crate::manifest::{Manifest, PypiPushSpec};
use crate::source::SourceSnapshot;
use crate::steprunner::{pypipush, StepResources, StepRunner};
use crate::vcs::{self, VcsInfo};
use base64::Engine as _;
use bollard::Docker;
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

pub const RESULTS_DIR: &str = "buildrunner.results";
pub const DEFAULT_MANIFEST_FILE: &str = "buildrunner.yaml";

/// An image a step published, recorded for downstream steps.
#[derive(Debug, Clone, Default)]
pub struct ImageRecord {
    pub image: String,
    pub platforms: Vec<String>,
}

/// Python packages registered for one package index repository.
#[derive(Debug, Clone)]
pub struct PypiBatch {
    pub spec: PypiPushSpec,
    pub packages: Vec<PathBuf>,
}

/// Shared state for one build invocation. Steps read broadly but only write
/// through the insert-after-success registries.
pub struct BuildContext {
    pub build_dir: PathBuf,
    pub results_dir: PathBuf,
    pub build_number: u64,
    pub build_time: u64,
    pub build_id: String,
    pub docker_tag: String,
    pub vcs: VcsInfo,
    pub uid: u32,
    pub gid: u32,
    pub push: bool,
    pub local_images: bool,
    pub publish_ports: bool,
    pub cleanup_images: bool,
    pub keep_step_artifacts: bool,
    pub platform: Option<String>,
    pub steps_to_run: Vec<String>,
    pub container_labels: HashMap<String, String>,
    pub global: GlobalConfig,
    pub scan_override: SecurityScanOverride,
    /// The fixed environment injected into every container.
    pub injected_env: BTreeMap<String, String>,
    /// Image references committed or pushed earlier in this session; used
    /// for pull policy defaults.
    pub committed_images: HashSet<String>,
    /// Cross-step image registry: step name to the images it published.
    pub images: BTreeMap<String, ImageRecord>,
    /// Top level artifact registry, merged from each step's sidecar.
    pub artifacts: ArtifactManifest,
    pub repo_tags_to_push: Vec<String>,
    pub mp_tags_to_push: Vec<(BuiltImageSet, String, String)>,
    pub pypi_packages: BTreeMap<String, PypiBatch>,
    pub generated_images: Vec<String>,
    cancelled: Arc<AtomicBool>,
}

impl BuildContext {
    /// Observed before every phase transition and blocking call.
    pub fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn build_injected_env(&mut self) {
        let mut env = BTreeMap::new();
        env.insert(
            "BUILDRUNNER_ARCH".to_string(),
            std::env::consts::ARCH.to_string(),
        );
        env.insert(
            "BUILDRUNNER_BUILD_NUMBER".to_string(),
            self.build_number.to_string(),
        );
        env.insert("BUILDRUNNER_BUILD_ID".to_string(), self.build_id.clone());
        env.insert(
            "BUILDRUNNER_BUILD_DOCKER_TAG".to_string(),
            self.docker_tag.clone(),
        );
        env.insert(
            "BUILDRUNNER_BUILD_TIME".to_string(),
            self.build_time.to_string(),
        );
        env.insert(
            "BUILDRUNNER_STEPS".to_string(),
            self.steps_to_run.join(","),
        );
        env.insert(
            "BUILDRUNNER_INVOKE_USER".to_string(),
            user_name(self.uid),
        );
        env.insert("BUILDRUNNER_INVOKE_UID".to_string(), self.uid.to_string());
        env.insert(
            "BUILDRUNNER_INVOKE_GROUP".to_string(),
            group_name(self.gid),
        );
        env.insert("BUILDRUNNER_INVOKE_GID".to_string(), self.gid.to_string());

        env.insert("VCSINFO_NAME".to_string(), self.vcs.name.clone());
        env.insert("VCSINFO_BRANCH".to_string(), self.vcs.branch.clone());
        env.insert("VCSINFO_NUMBER".to_string(), self.vcs.number.to_string());
        env.insert("VCSINFO_ID".to_string(), self.vcs.id.clone());
        env.insert("VCSINFO_SHORT_ID".to_string(), self.vcs.short_id.clone());
        env.insert("VCSINFO_MODIFIED".to_string(), self.vcs.modified.to_string());
        env.insert("VCSINFO_RELEASE".to_string(), self.vcs.release.clone());

        if self.push {
            env.insert("BUILDRUNNER_DO_PUSH".to_string(), "1".to_string());
        }

        // Global config env wins over the generated set, and matching host
        // environment variables win over both.
        for (key, value) in &self.global.env {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in std::env::vars() {
            if key.starts_with("BUILDRUNNER_") || key.starts_with("VCSINFO_") {
                env.insert(key, value);
            }
        }

        self.injected_env = env;
    }

    #[cfg(test)]
    pub fn for_tests() -> BuildContext {
        let mut ctx = BuildContext {
            build_dir: std::env::temp_dir(),
            results_dir: std::env::temp_dir().join(RESULTS_DIR),
            build_number: 7,
            build_time: 1700000000,
            build_id: "main-abc1234-7".to_string(),
            docker_tag: "main-abc1234-7".to_string(),
            vcs: VcsInfo::default(),
            uid: 1000,
            gid: 1000,
            push: false,
            local_images: false,
            publish_ports: false,
            cleanup_images: false,
            keep_step_artifacts: false,
            platform: None,
            steps_to_run: Vec::new(),
            container_labels: HashMap::new(),
            global: GlobalConfig::default(),
            scan_override: SecurityScanOverride::default(),
            injected_env: BTreeMap::new(),
            committed_images: HashSet::new(),
            images: BTreeMap::new(),
            artifacts: ArtifactManifest::new(),
            repo_tags_to_push: Vec::new(),
            mp_tags_to_push: Vec::new(),
            pypi_packages: BTreeMap::new(),
            generated_images: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        ctx.build_injected_env();
        ctx
    }
}

/// Command line inputs the session needs.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub build_dir: PathBuf,
    pub results_dir: Option<PathBuf>,
    pub global_config_file: Option<String>,
    pub manifest_file: Option<PathBuf>,
    pub build_number: Option<u64>,
    pub push: bool,
    pub cleanup_images: bool,
    pub local_images: bool,
    pub publish_ports: bool,
    pub clean_cache: bool,
    pub keep_step_artifacts: bool,
    pub steps: Vec<String>,
    pub platform: Option<String>,
    pub docker_timeout: u64,
    pub container_labels: Option<String>,
    pub scan_override: SecurityScanOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

struct StepOutcome {
    name: String,
    status: StepStatus,
    duration_seconds: u64,
}

/// Top level orchestration for one build: drives the scheduled steps,
/// finalizes pushes, and guarantees global teardown.
pub struct BuildSession {
    client: Arc<Docker>,
    ctx: BuildContext,
    manifest: Manifest,
    source: SourceSnapshot,
    caches: CacheStore,
    multiplatform: MultiplatformImageBuilder,
    outcomes: Vec<StepOutcome>,
    started: Instant,
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Name of the invoking user. The libc lookup uses a static buffer, so this
/// only runs while the session is being constructed.
fn user_name(uid: u32) -> String {
    unsafe {
        let passwd = libc::getpwuid(uid);
        if !passwd.is_null() {
            return std::ffi::CStr::from_ptr((*passwd).pw_name)
                .to_string_lossy()
                .to_string();
        }
    }
    std::env::var("USER").unwrap_or_else(|_| uid.to_string())
}

/// Name of the invoking user's group.
fn group_name(gid: u32) -> String {
    unsafe {
        let group = libc::getgrgid(gid);
        if !group.is_null() {
            return std::ffi::CStr::from_ptr((*group).gr_name)
                .to_string_lossy()
                .to_string();
        }
    }
    gid.to_string()
}

impl BuildSession {
    pub async fn new(options: SessionOptions) -> Result<BuildSession, BuildError> {
        let build_dir = options
            .build_dir
            .canonicalize()
            .map_err(|e| BuildError::Config(format!("invalid build directory; {e}")))?;

        let vcs_info = vcs::detect(&build_dir);
        let build_time = epoch_seconds();
        let build_number = options.build_number.unwrap_or(build_time);
        let build_id = vcs_info.build_id(build_number);
        let docker_tag = vcs::sanitize_tag(&build_id);

        let global = GlobalConfig::load(&build_dir, options.global_config_file.as_deref())?;

        let results_dir = options
            .results_dir
            .clone()
            .unwrap_or_else(|| build_dir.join(RESULTS_DIR));
        std::fs::create_dir_all(&results_dir)
            .map_err(|e| BuildError::Resource(format!("cannot create results dir; {e}")))?;

        let manifest_path = options
            .manifest_file
            .clone()
            .unwrap_or_else(|| build_dir.join(DEFAULT_MANIFEST_FILE));
        let manifest = Manifest::load(&manifest_path)?;

        // Unknown step selections are refused before any work starts.
        for step in &options.steps {
            if !manifest.steps.contains(step) {
                return Err(BuildError::Config(format!(
                    "the following step does not exist: {step}"
                )));
            }
        }

        let client = Arc::new(crate::docker::new_client(options.docker_timeout)?);
        let version = client
            .version()
            .await
            .map_err(|e| BuildError::Resource(format!("cannot reach docker daemon; {e}")))?;
        info!(
            version = version.version.unwrap_or_default(),
            "connected to docker daemon"
        );

        let caches = CacheStore::new(global.caches_root_path());
        if options.clean_cache {
            caches.clean().map_err(|e| BuildError::Resource(e.to_string()))?;
        }

        let source = SourceSnapshot::new(
            &build_dir,
            &results_dir,
            &global.temp_dir_path(),
            &global.docker_registry,
        );

        let multiplatform = MultiplatformImageBuilder::new(
            global.docker_registry.clone(),
            global.build_registry.clone(),
            global.platform_builders.clone(),
            global.disable_multi_platform,
            global.temp_dir_path(),
        );

        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let mut ctx = BuildContext {
            build_dir,
            results_dir,
            build_number,
            build_time,
            build_id,
            docker_tag,
            vcs: vcs_info,
            uid,
            gid,
            push: options.push,
            local_images: options.local_images,
            publish_ports: options.publish_ports,
            cleanup_images: options.cleanup_images,
            keep_step_artifacts: options.keep_step_artifacts,
            platform: options.platform.clone(),
            steps_to_run: options.steps.clone(),
            container_labels: GlobalConfig::parse_container_labels(
                options.container_labels.as_deref(),
            )?,
            global,
            scan_override: options.scan_override.clone(),
            injected_env: BTreeMap::new(),
            committed_images: HashSet::new(),
            images: BTreeMap::new(),
            artifacts: ArtifactManifest::new(),
            repo_tags_to_push: Vec::new(),
            mp_tags_to_push: Vec::new(),
            pypi_packages: BTreeMap::new(),
            generated_images: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        ctx.build_injected_env();

        Ok(BuildSession {
            client,
            ctx,
            manifest,
            source,
            caches,
            multiplatform,
            outcomes: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Watch for interrupt and termination signals; the flag is observed at
    /// every phase transition.
    pub fn install_signal_handlers(&self) {
        let flag = self.ctx.cancel_flag();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = async {
                    match sigterm.as_mut() {
                        Some(sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
            warn!("signal received, cancelling build");
            flag.store(true, Ordering::SeqCst);
        });
    }

    /// Run the build to completion and return the process exit code.
    pub async fn run(&mut self) -> i32 {
        let result = self.execute().await;

        let mut exit_code = match &result {
            Ok(()) => EXIT_SUCCESS,
            Err(err) => {
                error!(error = %err, "build failed");
                err.exit_code()
            }
        };

        if let Err(err) = self.finalize(result.is_ok()).await {
            error!(error = %err, "finalize failed");
            if exit_code == EXIT_SUCCESS {
                exit_code = err.exit_code();
            }
        }

        // Teardown always runs; its failures never mask the build outcome.
        self.teardown().await;

        if exit_code == EXIT_SUCCESS {
            info!("Build SUCCESS.");
        } else {
            error!("Build ERROR.");
        }

        exit_code
    }

    async fn execute(&mut self) -> Result<(), BuildError> {
        let order = dag::execution_order(&self.manifest, &self.ctx.steps_to_run)?;
        let scheduled: HashSet<&str> = order.iter().map(|name| name.as_str()).collect();

        for name in self.manifest.steps.keys() {
            if !scheduled.contains(name.as_str()) {
                self.outcomes.push(StepOutcome {
                    name: name.clone(),
                    status: StepStatus::Skipped,
                    duration_seconds: 0,
                });
            }
        }

        for (index, name) in order.iter().enumerate() {
            self.ctx.check_cancelled()?;

            let step = self
                .manifest
                .steps
                .get(name)
                .cloned()
                .ok_or_else(|| BuildError::Internal(format!("scheduled step '{name}' missing")))?;

            let step_started = Instant::now();
            let mut runner = StepRunner::new(name, step, &self.ctx.results_dir).await?;

            let mut resources = StepResources {
                client: &self.client,
                ctx: &mut self.ctx,
                source: &mut self.source,
                caches: &self.caches,
                multiplatform: &mut self.multiplatform,
            };

            let result = runner.run(&mut resources).await;
            let duration_seconds = step_started.elapsed().as_secs();

            match result {
                Ok(()) => {
                    self.outcomes.push(StepOutcome {
                        name: name.clone(),
                        status: StepStatus::Succeeded,
                        duration_seconds,
                    });
                }
                Err(err) => {
                    self.outcomes.push(StepOutcome {
                        name: name.clone(),
                        status: StepStatus::Failed,
                        duration_seconds,
                    });
                    // The first failed step stops scheduling; everything
                    // behind it in the order never starts.
                    for skipped in &order[index + 1..] {
                        self.outcomes.push(StepOutcome {
                            name: skipped.clone(),
                            status: StepStatus::Skipped,
                            duration_seconds: 0,
                        });
                    }
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Push registered tags and packages, then write the build summary.
    /// Publishing only happens for fully successful builds with `--push`.
    async fn finalize(&mut self, success: bool) -> Result<(), BuildError> {
        let finalize_result = if success && self.ctx.push {
            self.push_registered().await
        } else {
            if !self.ctx.push {
                info!("Push not requested");
            }
            Ok(())
        };

        if let Err(err) = self.write_build_summary() {
            warn!(error = %err, "could not write build summary");
        }

        if !self.ctx.artifacts.is_empty() {
            let manifest_path = self.ctx.results_dir.join(crate::artifacts::MANIFEST_FILE);
            if let Err(err) = self.ctx.artifacts.write(&manifest_path) {
                warn!(error = %err, "could not write artifact manifest");
            }
        }

        finalize_result
    }

    async fn push_registered(&mut self) -> Result<(), BuildError> {
        info!("Push requested, pushing generated images/packages to remote registries/repositories");

        let log = StepLog::create(&self.ctx.results_dir.join("push.log"))
            .await
            .map_err(|e| BuildError::Resource(e.to_string()))?;

        // Multi-platform images become manifest lists spanning their
        // platforms.
        let mp_pushes = std::mem::take(&mut self.ctx.mp_tags_to_push);
        if !mp_pushes.is_empty() {
            info!(
                image_sets = self.multiplatform.num_built_images,
                tags = mp_pushes.len(),
                "pushing multiplatform image tags"
            );
            for (set, repository, tag) in &mp_pushes {
                self.multiplatform
                    .push_manifest_list(set, repository, tag, &log)
                    .await?;
            }
        }

        for reference in std::mem::take(&mut self.ctx.repo_tags_to_push) {
            info!(reference = %reference, "pushing image");
            log.write_line(&format!("Pushing {reference}")).await;

            let (repository, tag) = match reference.rsplit_once(':') {
                Some((repository, tag)) if !tag.contains('/') => {
                    (repository.to_string(), tag.to_string())
                }
                _ => (reference.clone(), "latest".to_string()),
            };

            let credentials = registry_credentials(&repository);
            let mut stream = self.client.push_image(
                &repository,
                Some(bollard::image::PushImageOptions { tag }),
                credentials,
            );

            while let Some(message) = stream.next().await {
                let info = message.map_err(|e| {
                    BuildError::Integration(format!(
                        "error pushing image: {e}; this could be because you are not \
                         authenticated with the given Docker registry (try 'docker login')"
                    ))
                })?;
                if let Some(error) = info.error {
                    return Err(BuildError::Integration(format!(
                        "error pushing image: {error}"
                    )));
                }
                if let Some(status) = info.status {
                    log.write_line(&status).await;
                }
            }
        }

        let batches = std::mem::take(&mut self.ctx.pypi_packages);
        pypipush::upload_batches(&batches, &log).await?;

        Ok(())
    }

    fn write_build_summary(&self) -> Result<(), BuildError> {
        let steps: Vec<serde_json::Value> = self
            .outcomes
            .iter()
            .map(|outcome| {
                json!({
                    "name": outcome.name,
                    "status": outcome.status.to_string(),
                    "duration_seconds": outcome.duration_seconds,
                })
            })
            .collect();

        let images: BTreeMap<&String, serde_json::Value> = self
            .ctx
            .images
            .iter()
            .map(|(step, record)| {
                (
                    step,
                    json!({
                        "image": record.image,
                        "platforms": record.platforms,
                    }),
                )
            })
            .collect();

        let summary = json!({
            "build_id": self.ctx.build_id,
            "build_number": self.ctx.build_number,
            "build_time": self.ctx.build_time,
            "duration_seconds": self.started.elapsed().as_secs(),
            "steps": steps,
            "images": images,
        });

        let path = self.ctx.results_dir.join("build.json");
        std::fs::write(&path, serde_json::to_string_pretty(&summary).unwrap_or_default())
            .map_err(|e| BuildError::Resource(e.to_string()))?;
        Ok(())
    }

    /// Global teardown. Errors are logged at warning and never mask the
    /// build's primary outcome.
    async fn teardown(&mut self) {
        self.source.cleanup(&self.client).await;
        self.multiplatform.stop_registry().await;

        if self.ctx.cleanup_images {
            info!("Removing local copy of generated images");
            // Child images likely come after their parents, so remove in
            // reverse order.
            for image in self.ctx.generated_images.iter().rev() {
                if let Err(err) = self
                    .client
                    .remove_image(
                        image,
                        Some(bollard::image::RemoveImageOptions {
                            force: true,
                            noprune: false,
                        }),
                        None,
                    )
                    .await
                {
                    warn!(image, error = %err, "error removing image");
                }
            }
        } else {
            info!("Keeping generated images");
        }

        if !self.ctx.keep_step_artifacts {
            self.prune_artifactless_step_dirs();
        }
    }

    /// Step result dirs that produced no artifacts only hold scratch output;
    /// drop them unless the user asked to keep everything.
    fn prune_artifactless_step_dirs(&self) {
        for outcome in &self.outcomes {
            let step_dir = self.ctx.results_dir.join(&outcome.name);
            if !step_dir.is_dir() {
                continue;
            }
            if step_dir.join(crate::artifacts::MANIFEST_FILE).exists() {
                continue;
            }
            if let Err(err) = std::fs::remove_dir_all(&step_dir) {
                warn!(path = %step_dir.display(), error = %err, "could not prune step results dir");
            }
        }
    }
}

/// Registry credentials for a repository, resolved from the user's docker
/// config. Returns None when no auth entry matches; the push then relies on
/// the daemon's own configuration.
pub fn registry_credentials(repository: &str) -> Option<bollard::auth::DockerCredentials> {
    let config_path = dirs::home_dir()?.join(".docker/config.json");
    let contents = std::fs::read_to_string(config_path).ok()?;
    let config: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let auths = config.get("auths")?.as_object()?;

    let registry = registry_host(repository);
    let entry = auths
        .iter()
        .find(|(server, _)| server.contains(registry.as_str()))
        .map(|(_, entry)| entry)?;

    let encoded = entry.get("auth")?.as_str()?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some(bollard::auth::DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry),
        ..Default::default()
    })
}

/// The registry host of an image repository, defaulting to the docker hub.
fn registry_host(repository: &str) -> String {
    match repository.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') => host.to_string(),
        _ => "index.docker.io".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_env_has_fixed_set() {
        let ctx = BuildContext::for_tests();
        for key in [
            "BUILDRUNNER_ARCH",
            "BUILDRUNNER_BUILD_NUMBER",
            "BUILDRUNNER_BUILD_ID",
            "BUILDRUNNER_BUILD_DOCKER_TAG",
            "BUILDRUNNER_BUILD_TIME",
            "BUILDRUNNER_STEPS",
            "BUILDRUNNER_INVOKE_UID",
            "BUILDRUNNER_INVOKE_GID",
            "VCSINFO_NAME",
            "VCSINFO_BRANCH",
            "VCSINFO_NUMBER",
            "VCSINFO_ID",
            "VCSINFO_SHORT_ID",
            "VCSINFO_MODIFIED",
            "VCSINFO_RELEASE",
        ] {
            assert!(ctx.injected_env.contains_key(key), "missing {key}");
        }
        // Without --push the marker variable stays out.
        assert!(!ctx.injected_env.contains_key("BUILDRUNNER_DO_PUSH"));
    }

    #[test]
    fn do_push_marker_set_when_pushing() {
        let mut ctx = BuildContext::for_tests();
        ctx.push = true;
        ctx.build_injected_env();
        assert_eq!(
            ctx.injected_env.get("BUILDRUNNER_DO_PUSH").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn cancellation_flag_round_trip() {
        let ctx = BuildContext::for_tests();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel_flag().store(true, Ordering::SeqCst);
        assert!(matches!(
            ctx.check_cancelled(),
            Err(BuildError::Cancelled)
        ));
    }

    #[test]
    fn invoking_identity_resolves_to_names() {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        // Name lookups always produce something usable, falling back to the
        // numeric id outside a passwd/group database.
        assert!(!user_name(uid).is_empty());
        assert!(!group_name(gid).is_empty());
    }

    #[test]
    fn registry_host_resolution() {
        assert_eq!(registry_host("myorg/app"), "index.docker.io");
        assert_eq!(
            registry_host("registry.example.com/myorg/app"),
            "registry.example.com"
        );
        assert_eq!(registry_host("localhost:5000/app"), "localhost:5000");
    }
}
