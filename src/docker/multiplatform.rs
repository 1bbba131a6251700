use super::builder::BuildRequest;
use super::runner::{ContainerOptions, ContainerRunner, ImageConfig};
use super::DockerError;
use crate::conf::LOCAL_BUILD_REGISTRY;
use crate::logs::StepLog;
use bollard::Docker;
use futures::StreamExt;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const REGISTRY_IMAGE: &str = "registry";
const IMAGE_PREFIX: &str = "buildrunner-mp";

/// Picks one builder out of the candidates configured for a platform. The
/// default spreads load uniformly at random; tests inject a deterministic
/// chooser.
pub type BuilderChooser = Box<dyn Fn(usize) -> usize + Send + Sync>;

/// One platform's image within a multi-platform build.
#[derive(Debug, Clone)]
pub struct BuiltPlatformImage {
    pub platform: String,
    /// Fully qualified reference in the build registry.
    pub image_ref: String,
    /// The builder instance that produced it.
    pub builder: Option<String>,
}

/// The product of one multi-platform build step.
#[derive(Debug, Clone)]
pub struct BuiltImageSet {
    /// Shared intermediate repository in the build registry.
    pub repo: String,
    pub images: Vec<BuiltPlatformImage>,
}

impl BuiltImageSet {
    pub fn platforms(&self) -> Vec<String> {
        self.images.iter().map(|image| image.platform.clone()).collect()
    }

    pub fn native_image(&self) -> Option<&BuiltPlatformImage> {
        let native = native_platform();
        self.images
            .iter()
            .find(|image| image.platform == native)
            .or_else(|| self.images.first())
    }
}

/// The platform of the machine the engine runs on.
pub fn native_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("linux/{arch}")
}

fn sanitize_platform(platform: &str) -> String {
    platform.replace('/', "-")
}

/// Whether the engine itself is running inside a container.
fn running_in_container() -> bool {
    std::env::var("BUILDRUNNER_CONTAINER").is_ok() || std::path::Path::new("/.dockerenv").exists()
}

struct LocalRegistry {
    runner: ContainerRunner,
    address: String,
}

/// Multiple platform image builder. Single-platform builds go through the
/// runtime API; this path delegates to the buildx CLI per platform and
/// stitches the results into manifest lists.
pub struct MultiplatformImageBuilder {
    docker_registry: String,
    build_registry: String,
    platform_builders: BTreeMap<String, Vec<String>>,
    pub disable_multi_platform: bool,
    temp_dir: PathBuf,
    chooser: BuilderChooser,
    registry: Option<LocalRegistry>,
    /// Count of image sets produced this session.
    pub num_built_images: usize,
}

impl MultiplatformImageBuilder {
    pub fn new(
        docker_registry: String,
        build_registry: String,
        platform_builders: BTreeMap<String, Vec<String>>,
        disable_multi_platform: bool,
        temp_dir: PathBuf,
    ) -> Self {
        MultiplatformImageBuilder {
            docker_registry,
            build_registry,
            platform_builders,
            disable_multi_platform,
            temp_dir,
            chooser: Box::new(|len| rand::thread_rng().gen_range(0..len)),
            registry: None,
            num_built_images: 0,
        }
    }

    /// Replace the random builder selection with a deterministic one.
    pub fn with_chooser(mut self, chooser: BuilderChooser) -> Self {
        self.chooser = chooser;
        self
    }

    /// The builder configured for the platform, picked uniformly when more
    /// than one can produce it.
    pub fn choose_builder(&self, platform: &str) -> Option<String> {
        let candidates = self.platform_builders.get(platform)?;
        if candidates.is_empty() {
            return None;
        }
        let index = (self.chooser)(candidates.len());
        Some(candidates[index % candidates.len()].clone())
    }

    /// Address of the registry used to exchange intermediate manifests,
    /// starting a throwaway local registry container if none is configured.
    async fn registry_address(
        &mut self,
        client: &Arc<Docker>,
        network: Option<&str>,
    ) -> Result<String, DockerError> {
        if self.build_registry != LOCAL_BUILD_REGISTRY {
            return Ok(self.build_registry.clone());
        }

        if let Some(registry) = &self.registry {
            return Ok(registry.address.clone());
        }

        debug!("starting local docker registry");
        let image = format!("{}/{}", self.docker_registry, REGISTRY_IMAGE);
        let mut runner =
            ContainerRunner::new(Arc::clone(client), ImageConfig::new(&image, false, None), None)
                .await?;

        let container = runner
            .start(ContainerOptions {
                name: Some(format!("{IMAGE_PREFIX}-registry-{}", uuid::Uuid::new_v4())),
                publish_all_ports: true,
                network: running_in_container()
                    .then(|| network.map(|n| n.to_string()))
                    .flatten(),
                ..Default::default()
            })
            .await?;

        let inspect = client
            .inspect_container(&container, None)
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        let address = if running_in_container() {
            // Hit the registry container directly on the shared network.
            let ip = inspect
                .network_settings
                .as_ref()
                .and_then(|settings| settings.ip_address.clone())
                .ok_or_else(|| {
                    DockerError::Unknown("could not determine registry address".to_string())
                })?;
            format!("{ip}:5000")
        } else {
            let host_port = inspect
                .network_settings
                .and_then(|settings| settings.ports)
                .and_then(|ports| ports.get("5000/tcp").cloned().flatten())
                .and_then(|bindings| bindings.first().cloned())
                .and_then(|binding| binding.host_port)
                .ok_or_else(|| {
                    DockerError::Unknown("unable to find port for registry container".to_string())
                })?;
            format!("localhost:{host_port}")
        };

        info!(address = %address, "started local build registry");
        self.registry = Some(LocalRegistry { runner, address: address.clone() });
        Ok(address)
    }

    /// Build the request for each platform, pushing per-platform images into
    /// the build registry. With multi-platform disabled only the native
    /// platform is built.
    pub async fn build(
        &mut self,
        client: &Arc<Docker>,
        request: &BuildRequest,
        platforms: &[String],
        network: Option<&str>,
        log: &StepLog,
    ) -> Result<BuiltImageSet, DockerError> {
        let platforms: Vec<String> = if self.disable_multi_platform {
            vec![native_platform()]
        } else {
            platforms.to_vec()
        };

        let registry = self.registry_address(client, network).await?;
        let repo = format!("{registry}/{IMAGE_PREFIX}-{}", uuid::Uuid::new_v4());

        let context_dir = self.materialize_context(request)?;

        let mut images = Vec::new();
        for platform in &platforms {
            let builder = self.choose_builder(platform);
            let image_ref = format!("{repo}:{}", sanitize_platform(platform));

            log.write_line(&format!(
                "Building {image_ref} for {platform}{}",
                builder
                    .as_ref()
                    .map(|b| format!(" on builder {b}"))
                    .unwrap_or_default()
            ))
            .await;

            let mut args: Vec<String> = vec![
                "buildx".to_string(),
                "build".to_string(),
                "--platform".to_string(),
                platform.clone(),
                "--tag".to_string(),
                image_ref.clone(),
                "--push".to_string(),
            ];
            if let Some(builder) = &builder {
                args.push("--builder".to_string());
                args.push(builder.clone());
            }
            if request.nocache {
                args.push("--no-cache".to_string());
            }
            if request.pull {
                args.push("--pull".to_string());
            }
            if let Some(target) = &request.target {
                args.push("--target".to_string());
                args.push(target.clone());
            }
            for (key, value) in &request.buildargs {
                args.push("--build-arg".to_string());
                args.push(format!("{key}={value}"));
            }
            args.push(context_dir.path().to_string_lossy().to_string());

            run_docker_cli(&args, log).await?;

            images.push(BuiltPlatformImage {
                platform: platform.clone(),
                image_ref,
                builder,
            });
        }

        self.num_built_images += 1;
        Ok(BuiltImageSet { repo, images })
    }

    /// Produce one manifest list spanning the set's platforms under the
    /// given repository tag. Requires the per-platform images to already be
    /// in the build registry.
    pub async fn push_manifest_list(
        &self,
        set: &BuiltImageSet,
        repository: &str,
        tag: &str,
        log: &StepLog,
    ) -> Result<(), DockerError> {
        log.write_line(&format!(
            "Creating manifest list {repository}:{tag} from {}",
            set.repo
        ))
        .await;

        let mut args: Vec<String> = vec![
            "buildx".to_string(),
            "imagetools".to_string(),
            "create".to_string(),
            "--tag".to_string(),
            format!("{repository}:{tag}"),
        ];
        for image in &set.images {
            args.push(image.image_ref.clone());
        }
        run_docker_cli(&args, log).await
    }

    /// Pull the set's native platform image and tag it locally so later
    /// steps in this session can run it without touching the registry.
    pub async fn tag_native_platform(
        &self,
        client: &Docker,
        set: &BuiltImageSet,
        repository: &str,
        tags: &[String],
    ) -> Result<(), DockerError> {
        let Some(native) = set.native_image() else {
            return Err(DockerError::Unknown(
                "multi-platform build produced no images".to_string(),
            ));
        };

        let mut pull = client.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: native.image_ref.clone(),
                platform: native.platform.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| DockerError::NoSuchImage(e.to_string()))?;
        }

        for tag in tags {
            client
                .tag_image(
                    &native.image_ref,
                    Some(bollard::image::TagImageOptions {
                        repo: repository.to_string(),
                        tag: tag.clone(),
                    }),
                )
                .await
                .map_err(|e| DockerError::Unknown(e.to_string()))?;
        }

        Ok(())
    }

    /// Write the build context out as a directory the buildx CLI can use.
    fn materialize_context(&self, request: &BuildRequest) -> Result<tempfile::TempDir, DockerError> {
        let io_err = |e: std::io::Error| DockerError::BuildFailed(e.to_string());

        std::fs::create_dir_all(&self.temp_dir).map_err(io_err)?;
        let context_dir = tempfile::Builder::new()
            .prefix("mp-context-")
            .tempdir_in(&self.temp_dir)
            .map_err(io_err)?;

        let archive = super::builder::assemble_context(request)?;
        let mut unpacker = tar::Archive::new(archive.as_slice());
        unpacker.unpack(context_dir.path()).map_err(io_err)?;

        Ok(context_dir)
    }

    /// Tear the throwaway registry down. Called once at session teardown.
    pub async fn stop_registry(&mut self) {
        if let Some(mut registry) = self.registry.take() {
            debug!(address = %registry.address, "stopping local build registry");
            registry.runner.cleanup().await;
        }
    }
}

/// Run a docker CLI invocation, streaming its output into the step log.
async fn run_docker_cli(args: &[String], log: &StepLog) -> Result<(), DockerError> {
    debug!(?args, "invoking docker cli");

    let mut child = tokio::process::Command::new("docker")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DockerError::Unknown(format!("could not invoke docker cli: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_log = log.clone();
    let out_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_log.write_line(&line).await;
            }
        }
    });

    let err_log = log.clone();
    let err_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err_log.write_line(&line).await;
            }
        }
    });

    let status = child
        .wait()
        .await
        .map_err(|e| DockerError::Unknown(e.to_string()))?;
    let _ = out_task.await;
    let _ = err_task.await;

    if !status.success() {
        warn!(?args, code = status.code(), "docker cli invocation failed");
        return Err(DockerError::BuildFailed(format!(
            "docker {} exited with {}",
            args.first().map(String::as_str).unwrap_or(""),
            status.code().unwrap_or(-1)
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn builder_config() -> BTreeMap<String, Vec<String>> {
        let mut platform_builders = BTreeMap::new();
        platform_builders.insert(
            "linux/amd64".to_string(),
            vec!["b1".to_string(), "b2".to_string(), "b3".to_string()],
        );
        platform_builders
    }

    #[test]
    fn chooser_seam_is_deterministic() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let calls_clone = StdArc::clone(&calls);

        let builder = MultiplatformImageBuilder::new(
            "docker.io".to_string(),
            LOCAL_BUILD_REGISTRY.to_string(),
            builder_config(),
            false,
            std::env::temp_dir(),
        )
        .with_chooser(Box::new(move |len| {
            calls_clone.fetch_add(1, Ordering::SeqCst) % len
        }));

        assert_eq!(builder.choose_builder("linux/amd64").as_deref(), Some("b1"));
        assert_eq!(builder.choose_builder("linux/amd64").as_deref(), Some("b2"));
        assert_eq!(builder.choose_builder("linux/amd64").as_deref(), Some("b3"));
        assert_eq!(builder.choose_builder("linux/amd64").as_deref(), Some("b1"));
        assert_eq!(builder.choose_builder("linux/arm64"), None);
    }

    #[test]
    fn random_chooser_covers_all_builders() {
        let builder = MultiplatformImageBuilder::new(
            "docker.io".to_string(),
            LOCAL_BUILD_REGISTRY.to_string(),
            builder_config(),
            false,
            std::env::temp_dir(),
        );

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(builder.choose_builder("linux/amd64").unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn platform_sanitization() {
        assert_eq!(sanitize_platform("linux/arm64/v8"), "linux-arm64-v8");
    }

    #[test]
    fn native_platform_is_linux() {
        assert!(native_platform().starts_with("linux/"));
    }
}
