use crate::conf::GlobalConfig;
use crate::docker::runner::{image_label_is_truthy, ContainerOptions, VolumeBind, SYSTEMD_LABEL};
use crate::errors::BuildError;
use crate::logs::StepLog;
use crate::manifest::{RunSpec, ServiceSpec, WaitFor};
use crate::session::BuildContext;
use crate::sshagent::SshAgentProxy;
use bollard::Docker;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

pub const SOURCE_MOUNT: &str = "/source";
pub const ARTIFACTS_MOUNT: &str = "/artifacts";
/// Default seconds to wait for a service port to accept connections.
pub const DEFAULT_WAIT_FOR_TIMEOUT: u64 = 600;

/// Assembles the container graph for one step: the primary container plus
/// its services, with all the env, volume, cache, and network plumbing.
///
/// Services register here in declaration order; later containers may only
/// reference services that came before them.
pub struct WorkloadBuilder<'a> {
    ctx: &'a BuildContext,
    step_name: &'a str,
    step_id: &'a str,
    source_container: &'a str,
    network: String,
    services: Vec<(String, String)>,
}

/// The per-workload docker network name. Includes the build tag and step id
/// so concurrent builds sharing a daemon never collide.
pub fn network_name(docker_tag: &str, step_id: &str) -> String {
    let short_id: String = step_id.chars().take(8).collect();
    format!("buildrunner-{docker_tag}-{short_id}")
}

impl<'a> WorkloadBuilder<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        step_name: &'a str,
        step_id: &'a str,
        source_container: &'a str,
    ) -> Self {
        WorkloadBuilder {
            ctx,
            step_name,
            step_id,
            source_container,
            network: network_name(&ctx.docker_tag, step_id),
            services: Vec::new(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Record a started service so later containers can resolve it.
    pub fn register_service(&mut self, service_name: &str, container_name: &str) {
        self.services
            .push((service_name.to_string(), container_name.to_string()));
    }

    pub fn container_for_service(&self, service_name: &str) -> Option<&str> {
        self.services
            .iter()
            .find(|(name, _)| name == service_name)
            .map(|(_, container)| container.as_str())
    }

    pub fn primary_container_name(&self) -> String {
        let short_id: String = self.step_id.chars().take(8).collect();
        format!("buildrunner-{}-{}", self.ctx.docker_tag, short_id)
    }

    pub fn service_container_name(&self, service_name: &str) -> String {
        format!("{}-{service_name}", self.primary_container_name())
    }

    /// The environment every workload container receives.
    pub fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = self.ctx.injected_env.clone();
        env.insert(
            "BUILDRUNNER_STEP_ID".to_string(),
            self.step_id.to_string(),
        );
        env.insert(
            "BUILDRUNNER_STEP_NAME".to_string(),
            self.step_name.to_string(),
        );
        env
    }

    /// Translate `volumes_from` service references into container names,
    /// keeping any `:ro`/`:rw` option. Only earlier services are valid.
    pub fn resolve_volumes_from(&self, refs: &[String]) -> Result<Vec<String>, BuildError> {
        let mut resolved = Vec::new();
        for reference in refs {
            let (service, option) = match reference.rsplit_once(':') {
                Some((service, option)) if option == "ro" || option == "rw" => {
                    (service, Some(option))
                }
                _ => (reference.as_str(), None),
            };

            let Some(container) = self.container_for_service(service) else {
                return Err(BuildError::Config(format!(
                    "'volumes_from' configuration '{reference}' does not reference a valid service container"
                )));
            };

            match option {
                Some(option) => resolved.push(format!("{container}:{option}")),
                None => resolved.push(container.to_string()),
            }
        }
        Ok(resolved)
    }

    /// Resolve file mounts. Aliases consult the local file pool; anything
    /// else is a path that must stay inside the build directory.
    pub fn resolve_files(
        &self,
        files: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeBind>, BuildError> {
        let mut binds = Vec::new();
        for (alias, target) in files {
            let local = match self.ctx.global.local_file(alias) {
                Some(path) => GlobalConfig::expand_user(path),
                None => {
                    let candidate = self.ctx.build_dir.join(alias);
                    let resolved = candidate
                        .canonicalize()
                        .map_err(|_| {
                            BuildError::Config(format!(
                                "cannot find valid alias for files entry '{alias}' nor path at '{}'",
                                candidate.display()
                            ))
                        })?;
                    let build_dir = self
                        .ctx
                        .build_dir
                        .canonicalize()
                        .unwrap_or_else(|_| self.ctx.build_dir.clone());
                    if resolved != build_dir && !resolved.starts_with(&build_dir) {
                        return Err(BuildError::Config(format!(
                            "mount path of '{alias}' attempts to step out of source directory '{}'",
                            build_dir.display()
                        )));
                    }
                    resolved
                }
            };

            if !local.exists() {
                return Err(BuildError::Config(format!(
                    "cannot find valid local file for alias '{alias}'"
                )));
            }

            let (container, read_only) = match target.rsplit_once(':') {
                Some((path, "rw")) => (path.to_string(), false),
                Some((path, "ro")) => (path.to_string(), true),
                _ => (target.clone(), true),
            };

            binds.push(VolumeBind {
                host: local.to_string_lossy().to_string(),
                container,
                read_only,
            });
        }
        Ok(binds)
    }

    /// Assemble the primary container's configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn primary_options(
        &self,
        run: &RunSpec,
        has_commands: bool,
        systemd: bool,
        agent: Option<&SshAgentProxy>,
    ) -> Result<ContainerOptions, BuildError> {
        let mut env = self.base_env();
        env.insert(
            "BUILDRUNNER_SOURCE_CONTAINER".to_string(),
            self.source_container.to_string(),
        );
        env.insert(
            "BUILDRUNNER_BUILD_CONTAINER".to_string(),
            self.primary_container_name(),
        );
        for (key, value) in run.env_strings() {
            env.insert(key, value);
        }

        let mut volumes = vec![VolumeBind {
            host: self.ctx.results_dir.to_string_lossy().to_string(),
            container: ARTIFACTS_MOUNT.to_string(),
            read_only: true,
        }];
        volumes.extend(self.resolve_files(&run.files)?);

        let (daemon_env, daemon_binds) = daemon_plumbing();
        env.extend(daemon_env);
        volumes.extend(daemon_binds);

        let mut volumes_from = vec![self.source_container.to_string()];
        volumes_from.extend(self.resolve_volumes_from(&run.volumes_from)?);

        if let Some(agent) = agent {
            volumes.push(agent.socket_mount());
            let (key, value) = agent.env_entry();
            env.insert(key, value);
        }

        let shell = if has_commands || run.shell.is_some() {
            Some(
                run.shell
                    .clone()
                    .unwrap_or_else(|| crate::docker::DEFAULT_SHELL.to_string()),
            )
        } else {
            None
        };

        Ok(ContainerOptions {
            name: Some(self.primary_container_name()),
            shell,
            working_dir: Some(run.cwd.clone().unwrap_or_else(|| SOURCE_MOUNT.to_string())),
            user: run.user.clone(),
            hostname: run.hostname.clone(),
            dns: self.resolve_hosts(run.dns.clone().unwrap_or_default()),
            dns_search: run
                .dns_search
                .clone()
                .map(|search| search.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            extra_hosts: self.resolve_extra_hosts(&run.extra_hosts),
            environment: env,
            volumes,
            volumes_from,
            network: Some(self.network.clone()),
            network_aliases: Vec::new(),
            ports: if self.ctx.publish_ports {
                run.ports.clone()
            } else {
                BTreeMap::new()
            },
            containers: run.containers.clone(),
            systemd,
            cap_add: run.cap_add.as_ref().map(|c| c.to_vec()).unwrap_or_default(),
            privileged: run.privileged.unwrap_or(false),
            labels: self.ctx.container_labels.clone(),
            ..Default::default()
        })
    }

    /// Assemble a service container's configuration. `/source` is read-only
    /// for services.
    pub fn service_options(
        &self,
        service_name: &str,
        service: &ServiceSpec,
        systemd: bool,
        agent: Option<&SshAgentProxy>,
    ) -> Result<ContainerOptions, BuildError> {
        let mut env = self.base_env();
        for (key, value) in service.env_strings() {
            env.insert(key, value);
        }

        let mut volumes = vec![VolumeBind {
            host: self.ctx.results_dir.to_string_lossy().to_string(),
            container: ARTIFACTS_MOUNT.to_string(),
            read_only: true,
        }];
        volumes.extend(self.resolve_files(&service.files)?);

        let (daemon_env, daemon_binds) = daemon_plumbing();
        env.extend(daemon_env);
        volumes.extend(daemon_binds);

        let mut volumes_from = vec![format!("{}:ro", self.source_container)];
        volumes_from.extend(self.resolve_volumes_from(&service.volumes_from)?);

        if service.inject_ssh_agent {
            if let Some(agent) = agent {
                volumes.push(agent.socket_mount());
                let (key, value) = agent.env_entry();
                env.insert(key, value);
            }
        }

        let shell = if service.cmd.is_some() || service.shell.is_some() {
            Some(
                service
                    .shell
                    .clone()
                    .unwrap_or_else(|| crate::docker::DEFAULT_SHELL.to_string()),
            )
        } else {
            None
        };

        Ok(ContainerOptions {
            name: Some(self.service_container_name(service_name)),
            shell,
            working_dir: service.cwd.clone(),
            user: service.user.clone(),
            hostname: service.hostname.clone(),
            dns: self.resolve_hosts(service.dns.clone().unwrap_or_default()),
            dns_search: service
                .dns_search
                .clone()
                .map(|search| search.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            extra_hosts: self.resolve_extra_hosts(&service.extra_hosts),
            environment: env,
            volumes,
            volumes_from,
            network: Some(self.network.clone()),
            // The service name is its hostname inside the workload network.
            network_aliases: vec![service_name.to_string()],
            ports: service.ports.clone(),
            containers: service.containers.clone(),
            systemd,
            labels: self.ctx.container_labels.clone(),
            ..Default::default()
        })
    }

    /// A host entry naming an earlier service resolves to that service's
    /// network alias; anything else passes through untouched.
    fn resolve_hosts(&self, hosts: Vec<String>) -> Vec<String> {
        hosts
            .into_iter()
            .map(|host| match self.container_for_service(&host) {
                Some(container) => container.to_string(),
                None => host,
            })
            .collect()
    }

    fn resolve_extra_hosts(&self, extra_hosts: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        extra_hosts
            .iter()
            .map(|(host, target)| {
                let resolved = match self.container_for_service(target) {
                    Some(container) => container.to_string(),
                    None => target.clone(),
                };
                (host.clone(), resolved)
            })
            .collect()
    }
}

/// Docker daemon plumbing for workload containers: environment and binds
/// that let clients inside the container reach the host daemon without
/// seeing host credential helpers.
pub fn daemon_plumbing() -> (BTreeMap<String, String>, Vec<VolumeBind>) {
    let mut env = BTreeMap::new();
    let mut binds = Vec::new();

    let mut docker_host = std::env::var("DOCKER_HOST")
        .unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string());

    if let Ok(tls_verify) = std::env::var("DOCKER_TLS_VERIFY") {
        if !tls_verify.is_empty() {
            env.insert("DOCKER_TLS_VERIFY".to_string(), "1".to_string());
        }
    }

    if let Ok(cert_path) = std::env::var("DOCKER_CERT_PATH") {
        if Path::new(&cert_path).exists() {
            binds.push(VolumeBind {
                host: cert_path,
                container: "/dockerdaemon/certs".to_string(),
                read_only: true,
            });
            env.insert(
                "DOCKER_CERT_PATH".to_string(),
                "/dockerdaemon/certs".to_string(),
            );
        }
    }

    // A unix socket daemon is remapped into the container at a fixed path.
    if let Some(socket) = docker_host.strip_prefix("unix://") {
        if Path::new(socket).exists() {
            binds.push(VolumeBind {
                host: socket.to_string(),
                container: "/dockerdaemon/docker.sock".to_string(),
                read_only: false,
            });
            docker_host = "unix:///dockerdaemon/docker.sock".to_string();
        }
    }

    env.insert("DOCKER_HOST".to_string(), docker_host);
    (env, binds)
}

/// Whether the container should boot its init process: an explicit setting
/// wins, else the image label decides.
pub async fn is_systemd(
    client: &Docker,
    configured: Option<bool>,
    image: &str,
) -> Result<bool, BuildError> {
    if let Some(configured) = configured {
        return Ok(configured);
    }
    Ok(image_label_is_truthy(client, image, SYSTEMD_LABEL).await?)
}

/// Block until every listed port on the container accepts connections,
/// polling with exponential backoff capped at one second. Timing out is a
/// step failure.
pub async fn wait_for_ports(
    client: &Docker,
    container_name: &str,
    network: &str,
    wait_for: &[WaitFor],
    log: &StepLog,
) -> Result<(), BuildError> {
    for wait in wait_for {
        let port = wait.port();
        let timeout = Duration::from_secs(wait.timeout().unwrap_or(DEFAULT_WAIT_FOR_TIMEOUT));
        let started = Instant::now();
        let mut backoff = Duration::from_millis(100);

        loop {
            let inspect = client
                .inspect_container(container_name, None)
                .await
                .map_err(|e| BuildError::Resource(e.to_string()))?;

            let status = inspect.state.as_ref().and_then(|state| state.status);
            let alive = matches!(
                status,
                Some(bollard::models::ContainerStateStatusEnum::CREATED)
                    | Some(bollard::models::ContainerStateStatusEnum::RUNNING)
            );
            if !alive {
                return Err(BuildError::Execution(format!(
                    "unable to wait for service port {port}, container {container_name} is not running"
                )));
            }

            let address = inspect
                .network_settings
                .and_then(|settings| settings.networks)
                .and_then(|networks| networks.get(network).cloned())
                .and_then(|endpoint| endpoint.ip_address)
                .filter(|ip| !ip.is_empty());

            if let Some(ip) = address {
                let connect =
                    tokio::time::timeout(Duration::from_secs(1), TcpStream::connect((ip.as_str(), port)))
                        .await;
                if matches!(connect, Ok(Ok(_))) {
                    log.write_line(&format!(
                        "Port {port} is listening in container {container_name}"
                    ))
                    .await;
                    break;
                }
                debug!(container = %container_name, port, "port not ready yet");
            }

            if started.elapsed() > timeout {
                return Err(BuildError::Execution(format!(
                    "timed out waiting for port {port} to be opened in container {container_name} after {} seconds",
                    timeout.as_secs()
                )));
            }

            log.write_line(&format!(
                "Waiting for port {port} to be listening for connections in container {container_name} ({}/{} seconds elapsed)",
                started.elapsed().as_secs(),
                timeout.as_secs()
            ))
            .await;

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> BuildContext {
        let mut ctx = BuildContext::for_tests();
        ctx.docker_tag = "main-abc1234-7".to_string();
        ctx
    }

    fn builder<'a>(ctx: &'a BuildContext) -> WorkloadBuilder<'a> {
        WorkloadBuilder::new(ctx, "test-step", "0f92ab11-aaaa-bbbb-cccc-121212121212", "src-container")
    }

    #[test]
    fn names_include_build_tag_and_step_id() {
        let ctx = context();
        let workload = builder(&ctx);
        assert_eq!(
            workload.primary_container_name(),
            "buildrunner-main-abc1234-7-0f92ab11"
        );
        assert_eq!(
            workload.service_container_name("db"),
            "buildrunner-main-abc1234-7-0f92ab11-db"
        );
        assert_eq!(
            workload.network(),
            "buildrunner-main-abc1234-7-0f92ab11"
        );
    }

    #[test]
    fn base_env_includes_step_identity() {
        let ctx = context();
        let workload = builder(&ctx);
        let env = workload.base_env();
        assert_eq!(
            env.get("BUILDRUNNER_STEP_NAME").map(String::as_str),
            Some("test-step")
        );
        assert!(env.contains_key("BUILDRUNNER_STEP_ID"));
        assert!(env.contains_key("BUILDRUNNER_BUILD_ID"));
        assert!(env.contains_key("VCSINFO_BRANCH"));
    }

    #[test]
    fn volumes_from_requires_registered_service() {
        let ctx = context();
        let mut workload = builder(&ctx);

        let err = workload
            .resolve_volumes_from(&["db".to_string()])
            .unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));

        workload.register_service("db", "buildrunner-x-db");
        let resolved = workload
            .resolve_volumes_from(&["db".to_string(), "db:ro".to_string()])
            .unwrap();
        assert_eq!(resolved, vec!["buildrunner-x-db", "buildrunner-x-db:ro"]);
    }

    #[test]
    fn files_reject_escaping_paths() {
        let ctx = context();
        let workload = builder(&ctx);

        let mut files = BTreeMap::new();
        files.insert("../etc/passwd".to_string(), "/tmp/pw".to_string());
        let err = workload.resolve_files(&files).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn file_mounts_default_read_only() {
        let mut ctx = context();
        ctx.global
            .local_files
            .insert("settings".to_string(), ctx.build_dir.to_string_lossy().to_string());
        let workload = builder(&ctx);

        let mut files = BTreeMap::new();
        files.insert("settings".to_string(), "/etc/settings".to_string());
        let binds = workload.resolve_files(&files).unwrap();
        assert!(binds[0].read_only);

        let mut files = BTreeMap::new();
        files.insert("settings".to_string(), "/etc/settings:rw".to_string());
        let binds = workload.resolve_files(&files).unwrap();
        assert!(!binds[0].read_only);
    }

    #[test]
    fn primary_mounts_source_rw_and_artifacts_ro() {
        let ctx = context();
        let workload = builder(&ctx);
        let run = RunSpec {
            image: Some("busybox".to_string()),
            cmd: Some("true".to_string()),
            ..Default::default()
        };

        let opts = workload.primary_options(&run, true, false, None).unwrap();

        // /source rides in via the snapshot container's volumes.
        assert_eq!(opts.volumes_from[0], "src-container");
        let artifacts = opts
            .volumes
            .iter()
            .find(|bind| bind.container == ARTIFACTS_MOUNT)
            .unwrap();
        assert!(artifacts.read_only);
        assert_eq!(opts.working_dir.as_deref(), Some(SOURCE_MOUNT));
        assert_eq!(opts.shell.as_deref(), Some("/bin/sh"));
    }

    #[test]
    fn service_source_is_read_only() {
        let ctx = context();
        let workload = builder(&ctx);
        let service = ServiceSpec {
            image: Some("postgres".to_string()),
            ..Default::default()
        };

        let opts = workload
            .service_options("db", &service, false, None)
            .unwrap();
        assert_eq!(opts.volumes_from[0], "src-container:ro");
        assert_eq!(opts.network_aliases, vec!["db"]);
        // Image default command runs untouched when no cmd is given.
        assert!(opts.shell.is_none());
    }

    #[test]
    fn daemon_plumbing_always_sets_docker_host() {
        let (env, _) = daemon_plumbing();
        assert!(env.contains_key("DOCKER_HOST"));
    }

    #[test]
    fn ports_only_published_when_requested() {
        let run = RunSpec {
            image: Some("busybox".to_string()),
            ports: [(8080u16, Some(8080u16))].into_iter().collect(),
            ..Default::default()
        };

        let mut ctx = context();
        ctx.publish_ports = false;
        {
            let workload = builder(&ctx);
            let opts = workload.primary_options(&run, false, false, None).unwrap();
            assert!(opts.ports.is_empty());
        }

        ctx.publish_ports = true;
        {
            let workload = builder(&ctx);
            let opts = workload.primary_options(&run, false, false, None).unwrap();
            assert_eq!(opts.ports.len(), 1);
        }
    }
}
