pub mod builder;
pub mod importer;
pub mod multiplatform;
pub mod runner;

use bollard::Docker;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_SHELL: &str = "/bin/sh";
/// Default total timeout for runtime API calls, in seconds.
pub const DEFAULT_DOCKER_TIMEOUT: u64 = 600;

/// Represents the different runtime failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum DockerError {
    /// Failed to communicate with the container runtime.
    #[error("could not connect to the docker daemon; {0}")]
    Connection(String),

    /// Image requested by name could not be found or pulled.
    #[error("docker image not found; {0}")]
    NoSuchImage(String),

    /// Container requested by name could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// The image build stream reported an error.
    #[error("docker build failed; {0}")]
    BuildFailed(String),

    /// An unexpected error occurred.
    #[error("unexpected docker error occurred; {0}")]
    Unknown(String),
}

/// Return a newly configured runtime client honoring `DOCKER_HOST`,
/// `DOCKER_TLS_VERIFY`, and `DOCKER_CERT_PATH`.
pub fn new_client(timeout: u64) -> Result<Docker, DockerError> {
    let docker_host = std::env::var("DOCKER_HOST").unwrap_or_default();
    let tls_verify = std::env::var("DOCKER_TLS_VERIFY").unwrap_or_default();

    let client = if docker_host.starts_with("tcp://") || docker_host.starts_with("http://") {
        if !tls_verify.is_empty() && tls_verify != "0" {
            let cert_path = std::env::var("DOCKER_CERT_PATH").unwrap_or_default();
            let certs = Path::new(&cert_path);
            Docker::connect_with_ssl(
                &docker_host,
                &certs.join("key.pem"),
                &certs.join("cert.pem"),
                &certs.join("ca.pem"),
                timeout,
                bollard::API_DEFAULT_VERSION,
            )
        } else {
            Docker::connect_with_http(&docker_host, timeout, bollard::API_DEFAULT_VERSION)
        }
    } else if let Some(socket) = docker_host.strip_prefix("unix://") {
        Docker::connect_with_unix(socket, timeout, bollard::API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_unix(
            "/var/run/docker.sock",
            timeout,
            bollard::API_DEFAULT_VERSION,
        )
    };

    client.map_err(|e| {
        DockerError::Connection(format!(
            "{e}; Make sure the Docker daemon is installed and running."
        ))
    })
}

/// Remove a container and its anonymous volumes regardless of state.
pub async fn force_remove_container(client: &Docker, name: &str) -> Result<(), DockerError> {
    client
        .remove_container(
            name,
            Some(bollard::container::RemoveContainerOptions {
                v: true,
                force: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| DockerError::NoSuchContainer(e.to_string()))
}

/// Remove containers matching a name or, failing that, a label. Used for the
/// extra containers a step declares it may spawn.
pub async fn remove_container_hint(client: &Docker, hint: &str) {
    if force_remove_container(client, hint).await.is_ok() {
        return;
    }

    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![hint.to_string()]);
    let found = client
        .list_containers(Some(bollard::container::ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .unwrap_or_default();

    if found.is_empty() {
        debug!(hint, "no container found with name or label");
        return;
    }

    for container in found {
        if let Some(id) = container.id {
            let _ = force_remove_container(client, &id).await;
        }
    }
}

pub fn format_env_var(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

/// Flatten an environment map into the `KEY=value` list the runtime expects.
pub fn env_list(env: &std::collections::BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .map(|(key, value)| format_env_var(key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_formatting() {
        assert_eq!(format_env_var("KEY", "value"), "KEY=value");

        let mut env = std::collections::BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(env_list(&env), vec!["A=1", "B=2"]);
    }
}
