use crate::{artifacts, cache, conf, dag, docker, manifest, sshagent};

/// Exit code conventions, mirroring sysexits where one applies.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 78;
pub const EXIT_CANCELLED: i32 = 130;

/// Represents the different failure possibilities of a build.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// Bad manifest, global config, or command line input. Raised before any
    /// containers are started.
    #[error("configuration error; {0}")]
    Config(String),

    /// Could not provision something the build needs from the host or the
    /// container runtime (image pull/build, container start, network, filesystem).
    #[error("resource error; {0}")]
    Resource(String),

    /// A step's command exited abnormally, the expected failure sense was
    /// inverted, or a readiness gate timed out.
    #[error("execution error; {0}")]
    Execution(String),

    /// A collaborator outside the engine failed (remote host, registry,
    /// package index, ssh agent).
    #[error("integration error; {0}")]
    Integration(String),

    /// The user interrupted the build.
    #[error("build cancelled")]
    Cancelled,

    /// An engine invariant was broken. Always a bug.
    #[error("internal error; {0}")]
    Internal(String),
}

impl BuildError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config(_) => EXIT_CONFIG,
            BuildError::Cancelled => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<manifest::ManifestError> for BuildError {
    fn from(err: manifest::ManifestError) -> Self {
        BuildError::Config(err.to_string())
    }
}

impl From<conf::ConfigError> for BuildError {
    fn from(err: conf::ConfigError) -> Self {
        BuildError::Config(err.to_string())
    }
}

impl From<dag::DagError> for BuildError {
    fn from(err: dag::DagError) -> Self {
        BuildError::Config(err.to_string())
    }
}

impl From<docker::DockerError> for BuildError {
    fn from(err: docker::DockerError) -> Self {
        BuildError::Resource(err.to_string())
    }
}

impl From<cache::CacheError> for BuildError {
    fn from(err: cache::CacheError) -> Self {
        BuildError::Resource(err.to_string())
    }
}

impl From<sshagent::AgentError> for BuildError {
    fn from(err: sshagent::AgentError) -> Self {
        BuildError::Integration(err.to_string())
    }
}

impl From<artifacts::ArtifactError> for BuildError {
    fn from(err: artifacts::ArtifactError) -> Self {
        match err {
            artifacts::ArtifactError::PatternEscapesSource(_) => {
                BuildError::Config(err.to_string())
            }
            _ => BuildError::Execution(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(BuildError::Config("bad".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(BuildError::Cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(
            BuildError::Execution("exit 3".into()).exit_code(),
            EXIT_FAILURE
        );
        assert_eq!(
            BuildError::Resource("no image".into()).exit_code(),
            EXIT_FAILURE
        );
    }
}
