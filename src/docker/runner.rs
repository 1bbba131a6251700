use super::{env_list, remove_container_hint, DockerError, DEFAULT_SHELL};
use crate::cache::CacheStore;
use crate::logs::StepLog;
use crate::manifest::CacheMount;
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Image label that marks a container image as wanting the init process.
pub const SYSTEMD_LABEL: &str = "BUILDRUNNER_SYSTEMD";

/// Captures image-specific configuration for a container about to run.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub image: String,
    pub pull: bool,
    pub platform: Option<String>,
}

impl ImageConfig {
    pub fn new(image: &str, pull: bool, platform: Option<String>) -> Self {
        ImageConfig {
            image: image.to_string(),
            pull,
            platform,
        }
    }
}

/// One host path bind mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl VolumeBind {
    pub fn to_bind_string(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host, self.container, mode)
    }
}

/// The full per-container configuration surface.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub name: Option<String>,
    /// Shell the container idles in and exec'd commands run under.
    pub shell: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub volumes: Vec<VolumeBind>,
    pub volumes_from: Vec<String>,
    pub network: Option<String>,
    pub network_aliases: Vec<String>,
    /// Container port to optional host port. Entries are only honored when
    /// the caller decided ports should be published.
    pub ports: BTreeMap<u16, Option<u16>>,
    pub publish_all_ports: bool,
    pub environment: BTreeMap<String, String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub extra_hosts: BTreeMap<String, String>,
    /// Names or labels of extra containers the command may spawn, removed at
    /// cleanup.
    pub containers: Vec<String>,
    pub systemd: bool,
    pub cap_add: Vec<String>,
    pub privileged: bool,
    pub labels: HashMap<String, String>,
}

/// Manages and orchestrates the lifecycle and execution of one container.
#[derive(Debug)]
pub struct ContainerRunner {
    client: Arc<Docker>,
    pub image: String,
    platform: Option<String>,
    shell: Option<String>,
    container: Option<String>,
    committed_image: Option<String>,
    extra_containers: Vec<String>,
}

impl ContainerRunner {
    /// Prepare a runner for the given image, pulling it according to the
    /// pull policy: pull when requested, or when the image cannot be found
    /// locally. Bare image ids are never pulled.
    pub async fn new(
        client: Arc<Docker>,
        image_config: ImageConfig,
        log: Option<&StepLog>,
    ) -> Result<ContainerRunner, DockerError> {
        let image = image_config.image.to_lowercase();
        if image != image_config.image {
            if let Some(log) = log {
                log.write_line(&format!(
                    "Forcing image name to lowercase: {} => {}",
                    image_config.image, image
                ))
                .await;
            }
        }

        let mut pull = image_config.pull;

        let is_id = image.starts_with("sha256:")
            || (image.len() >= 12 && image.chars().all(|c| c.is_ascii_hexdigit()));
        if is_id {
            pull = false;
        }

        let found = if is_id {
            true
        } else {
            let mut filters = HashMap::new();
            filters.insert("reference".to_string(), vec![image.clone()]);
            let images = client
                .list_images(Some(bollard::image::ListImagesOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| DockerError::Unknown(e.to_string()))?;
            !images.is_empty()
        };

        if pull || !found {
            if let Some(log) = log {
                log.write_line(&format!("Pulling image {image}")).await;
            }
            let mut pull_stream = client.create_image(
                Some(bollard::image::CreateImageOptions {
                    from_image: image.clone(),
                    platform: image_config.platform.clone().unwrap_or_default(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = pull_stream.next().await {
                progress.map_err(|e| DockerError::NoSuchImage(e.to_string()))?;
            }
        }

        Ok(ContainerRunner {
            client,
            image,
            platform: image_config.platform,
            shell: None,
            container: None,
            committed_image: None,
            extra_containers: Vec::new(),
        })
    }

    /// Create and start the container. The container idles in its shell (or
    /// entrypoint/init) with a tty so commands can be exec'd against it.
    pub async fn start(&mut self, opts: ContainerOptions) -> Result<String, DockerError> {
        if self.container.is_some() {
            return Err(DockerError::Unknown("container already started".to_string()));
        }

        self.shell = opts.shell.clone();
        self.extra_containers = opts.containers.clone();

        let mut binds: Vec<String> = opts.volumes.iter().map(VolumeBind::to_bind_string).collect();
        let mut security_opt = None;
        let mut tmpfs = HashMap::new();
        // With a shell the container idles in it and commands are exec'd;
        // without one the image default command runs unmodified.
        let mut command = opts.shell.clone().map(|shell| vec![shell]);

        if opts.systemd {
            // Init needs the cgroup tree and an unconfined seccomp profile.
            binds.push("/sys/fs/cgroup:/sys/fs/cgroup:ro".to_string());
            tmpfs.insert("/run".to_string(), String::new());
            security_opt = Some(vec!["seccomp=unconfined".to_string()]);
            command = Some(vec!["/usr/sbin/init".to_string()]);
        }

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in &opts.ports {
            let port_key = format!("{container_port}/tcp");
            exposed_ports.insert(port_key.clone(), HashMap::new());
            port_bindings.insert(
                port_key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: None,
                    host_port: host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let host_config = bollard::models::HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            volumes_from: if opts.volumes_from.is_empty() {
                None
            } else {
                Some(opts.volumes_from.clone())
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            dns: if opts.dns.is_empty() { None } else { Some(opts.dns.clone()) },
            dns_search: if opts.dns_search.is_empty() {
                None
            } else {
                Some(opts.dns_search.clone())
            },
            extra_hosts: if opts.extra_hosts.is_empty() {
                None
            } else {
                Some(
                    opts.extra_hosts
                        .iter()
                        .map(|(host, ip)| format!("{host}:{ip}"))
                        .collect(),
                )
            },
            security_opt,
            cap_add: if opts.cap_add.is_empty() { None } else { Some(opts.cap_add.clone()) },
            privileged: Some(opts.privileged),
            publish_all_ports: Some(opts.publish_all_ports),
            tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
            ..Default::default()
        };

        let networking_config = opts.network.as_ref().map(|network| {
            let mut endpoints = HashMap::new();
            endpoints.insert(
                network.clone(),
                bollard::models::EndpointSettings {
                    aliases: if opts.network_aliases.is_empty() {
                        None
                    } else {
                        Some(opts.network_aliases.clone())
                    },
                    ..Default::default()
                },
            );
            bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            }
        });

        let mut config = bollard::container::Config {
            image: Some(self.image.clone()),
            cmd: command,
            env: Some(env_list(&opts.environment)),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            user: opts.user.clone(),
            working_dir: opts.working_dir.clone(),
            hostname: opts.hostname.clone(),
            labels: Some(opts.labels.clone()),
            open_stdin: Some(true),
            tty: Some(true),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        if let Some(entrypoint) = &opts.entrypoint {
            config.entrypoint = Some(entrypoint.clone());
            config.cmd = None;
        }

        let create_options = opts.name.as_ref().map(|name| {
            bollard::container::CreateContainerOptions {
                name: name.clone(),
                platform: self.platform.clone(),
            }
        });

        let created = self
            .client
            .create_container(create_options, config)
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        self.container = Some(created.id.clone());
        Ok(created.id)
    }

    /// Run the given command in the container under the configured shell,
    /// streaming output into the step log. Returns the command's exit code.
    pub async fn run(&self, cmd: &str, log: Option<&StepLog>) -> Result<i64, DockerError> {
        self.run_tagged(cmd, log, None).await
    }

    pub async fn run_tagged(
        &self,
        cmd: &str,
        log: Option<&StepLog>,
        tag: Option<&str>,
    ) -> Result<i64, DockerError> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| DockerError::Unknown("container has not been started".to_string()))?;
        let shell = self
            .shell
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let exec = self
            .client
            .create_exec(
                container,
                bollard::exec::CreateExecOptions {
                    cmd: Some(vec![shell, "-c".to_string(), cmd.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        if let bollard::exec::StartExecResults::Attached { mut output, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?
        {
            while let Some(chunk) = output.next().await {
                let chunk = chunk.map_err(|e| DockerError::Unknown(e.to_string()))?;
                if let Some(log) = log {
                    match tag {
                        Some(tag) => log.write_container(tag, &chunk.into_bytes()).await,
                        None => log.write_raw(&chunk.into_bytes()).await,
                    }
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        inspect
            .exit_code
            .ok_or_else(|| DockerError::Unknown(format!("error running cmd ({cmd}): no exit code")))
    }

    /// Upload the given script into the container, mark it executable, and
    /// run it with the configured shell.
    pub async fn run_script(
        &self,
        contents: &str,
        args: &str,
        log: Option<&StepLog>,
    ) -> Result<i64, DockerError> {
        let script_path = format!("/tmp/{}.sh", uuid::Uuid::new_v4());
        self.write_file(&script_path, contents.as_bytes()).await?;
        self.run(&format!("chmod +x {script_path}"), None).await?;
        self.run(&format!("{script_path} {args}"), log).await
    }

    /// Write content to a path inside the container via an archive upload.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DockerError> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| DockerError::Unknown("container has not been started".to_string()))?;

        let (dir, file_name) = match path.rsplit_once('/') {
            Some((dir, name)) => (if dir.is_empty() { "/" } else { dir }, name),
            None => ("/", path),
        };
        self.run(&format!("mkdir -p {dir}"), None).await?;

        let mut archive = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive
            .append_data(&mut header, file_name, contents)
            .map_err(|e| DockerError::Unknown(e.to_string()))?;
        let bytes = archive
            .into_inner()
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        self.client
            .upload_to_container(
                container,
                Some(bollard::container::UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                bytes.into(),
            )
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))
    }

    /// Stream container output to the step log until the container exits,
    /// then return its exit code.
    pub async fn attach_until_finished(
        &self,
        log: Option<&StepLog>,
        tag: Option<&str>,
    ) -> Result<i64, DockerError> {
        let container = self
            .container
            .clone()
            .ok_or_else(|| DockerError::Unknown("container has not been started".to_string()))?;

        let log_task = if let Some(log) = log {
            let client = Arc::clone(&self.client);
            let log = log.clone();
            let tag = tag.map(|t| t.to_string());
            let container = container.clone();
            Some(tokio::spawn(async move {
                let mut stream = client.logs(
                    &container,
                    Some(bollard::container::LogsOptions::<String> {
                        follow: true,
                        stdout: true,
                        stderr: true,
                        ..Default::default()
                    }),
                );
                while let Some(Ok(output)) = stream.next().await {
                    let bytes = output.into_bytes();
                    match &tag {
                        Some(tag) => log.write_container(tag, &bytes).await,
                        None => log.write_raw(&bytes).await,
                    }
                }
            }))
        } else {
            None
        };

        let mut wait = self
            .client
            .wait_container(&container, None::<bollard::container::WaitContainerOptions<String>>);
        let status_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(DockerError::Unknown(e.to_string())),
            None => {
                return Err(DockerError::Unknown(
                    "container wait ended without a status".to_string(),
                ))
            }
        };

        // The log follower ends on its own once the container stops; make
        // sure it has drained before the caller moves on.
        if let Some(task) = log_task {
            let _ = task.await;
        }

        Ok(status_code)
    }

    /// Commit the ending state of the container as an image, returning the
    /// image id.
    pub async fn commit(&mut self) -> Result<String, DockerError> {
        if let Some(image) = &self.committed_image {
            return Ok(image.clone());
        }
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| DockerError::Unknown("container not started".to_string()))?;

        let commit = self
            .client
            .commit_container(
                bollard::image::CommitContainerOptions::<String> {
                    container: container.clone(),
                    ..Default::default()
                },
                bollard::container::Config::<String>::default(),
            )
            .await
            .map_err(|e| DockerError::Unknown(e.to_string()))?;

        let image = commit
            .id
            .ok_or_else(|| DockerError::Unknown("commit returned no image id".to_string()))?;
        self.committed_image = Some(image.clone());
        Ok(image)
    }

    pub async fn stop(&self) {
        if let Some(container) = &self.container {
            let _ = self
                .client
                .stop_container(
                    container,
                    Some(bollard::container::StopContainerOptions { t: 0 }),
                )
                .await;
        }
    }

    /// Remove the container and anything the step told us it spawned.
    pub async fn cleanup(&mut self) {
        for hint in std::mem::take(&mut self.extra_containers) {
            remove_container_hint(&self.client, &hint).await;
        }

        if let Some(container) = self.container.take() {
            if let Err(err) = super::force_remove_container(&self.client, &container).await {
                warn!(container, error = %err, "could not remove container");
            }
        }
    }

    /// Restore cache archives into the container. The first key to match an
    /// archive wins for each target; targets are created empty otherwise.
    pub async fn restore_caches(
        &self,
        store: &CacheStore,
        mounts: &[CacheMount],
        project: &str,
        log: &StepLog,
    ) -> Result<(), DockerError> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| DockerError::Unknown("container not started".to_string()))?;

        let mut restored: HashSet<&str> = HashSet::new();
        for mount in mounts {
            if !restored.insert(mount.target.as_str()) {
                continue;
            }

            self.run(&format!("mkdir -p {}", mount.target), None).await?;

            let Some(archive) = store.resolve_restore(&mount.keys, project) else {
                log.write_line(&format!(
                    "No cache archive matched keys {:?} for {}; starting empty",
                    mount.keys, mount.target
                ))
                .await;
                continue;
            };

            log.write_line(&format!(
                "Restoring cache {} -> {}",
                archive.display(),
                mount.target
            ))
            .await;

            let bytes = tokio::fs::read(&archive)
                .await
                .map_err(|e| DockerError::Unknown(e.to_string()))?;

            self.client
                .upload_to_container(
                    container,
                    Some(bollard::container::UploadToContainerOptions {
                        path: mount.target.clone(),
                        ..Default::default()
                    }),
                    bytes.into(),
                )
                .await
                .map_err(|e| DockerError::Unknown(e.to_string()))?;
        }

        Ok(())
    }

    /// Save cache targets from the finished container back to the host under
    /// each mount's first key.
    pub async fn save_caches(
        &self,
        store: &CacheStore,
        mounts: &[CacheMount],
        project: &str,
        env: &BTreeMap<String, String>,
        log: &StepLog,
    ) -> Result<(), DockerError> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| DockerError::Unknown("container not started".to_string()))?;

        let mut saved: HashSet<&str> = HashSet::new();
        for mount in mounts {
            if !saved.insert(mount.target.as_str()) {
                continue;
            }
            let Some(key) = mount.keys.first() else {
                continue;
            };

            log.write_line(&format!("Saving cache {} under key {key}", mount.target))
                .await;

            let mut stream = self.client.download_from_container(
                container,
                Some(bollard::container::DownloadFromContainerOptions {
                    path: format!("{}/.", mount.target),
                }),
            );

            let mut contents: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| DockerError::Unknown(e.to_string()))?;
                contents.extend_from_slice(&chunk);
            }

            let saved_path = store
                .save(key, project, &contents)
                .map_err(|e| DockerError::Unknown(e.to_string()))?;

            store.append_history(&format!(
                "{} - cache '{}' written by step '{}' in '{}:{}'",
                chrono::Utc::now().format("%m/%d/%Y %H:%M:%S"),
                saved_path.display(),
                env.get("BUILDRUNNER_STEP_NAME").map(String::as_str).unwrap_or(""),
                env.get("VCSINFO_NAME").map(String::as_str).unwrap_or(""),
                env.get("VCSINFO_BRANCH").map(String::as_str).unwrap_or(""),
            ));
        }

        Ok(())
    }
}

/// Whether the image carries a truthy value for the given label.
pub async fn image_label_is_truthy(
    client: &Docker,
    image: &str,
    label: &str,
) -> Result<bool, DockerError> {
    let inspect = client
        .inspect_image(image)
        .await
        .map_err(|e| DockerError::NoSuchImage(e.to_string()))?;

    let value = inspect
        .config
        .and_then(|config| config.labels)
        .and_then(|labels| labels.get(label).cloned());

    debug!(image, label, value = ?value, "inspected image label");

    Ok(matches!(
        value.as_deref(),
        Some(v) if !v.is_empty() && v != "0" && v != "False" && v != "false"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_bind_formats() {
        let bind = VolumeBind {
            host: "/tmp/results".to_string(),
            container: "/artifacts".to_string(),
            read_only: true,
        };
        assert_eq!(bind.to_bind_string(), "/tmp/results:/artifacts:ro");

        let bind = VolumeBind {
            host: "/tmp/source".to_string(),
            container: "/source".to_string(),
            read_only: false,
        };
        assert_eq!(bind.to_bind_string(), "/tmp/source:/source:rw");
    }
}
