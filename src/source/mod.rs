use crate::docker::builder::{build_image, BuildRequest, DockerfileSource};
use crate::docker::runner::{ContainerOptions, ContainerRunner, ImageConfig};
use crate::docker::DockerError;
use crate::logs::StepLog;
use bollard::Docker;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Patterns listed here are excluded from the source snapshot.
pub const IGNORE_FILE: &str = ".buildignore";

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("could not create source archive; {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

/// An immutable read-only view of the working tree shared with every
/// container as `/source`. The archive, image, and backing container are
/// each produced at most once per invocation and reused across steps.
pub struct SourceSnapshot {
    build_dir: PathBuf,
    results_dir_name: String,
    temp_dir: PathBuf,
    docker_registry: String,
    archive: Option<PathBuf>,
    image: Option<String>,
    container: Option<String>,
}

impl SourceSnapshot {
    pub fn new(
        build_dir: &Path,
        results_dir: &Path,
        temp_dir: &Path,
        docker_registry: &str,
    ) -> Self {
        let results_dir_name = results_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        SourceSnapshot {
            build_dir: build_dir.to_path_buf(),
            results_dir_name,
            temp_dir: temp_dir.to_path_buf(),
            docker_registry: docker_registry.to_string(),
            archive: None,
            image: None,
            container: None,
        }
    }

    fn ignore_patterns(&self) -> Vec<glob::Pattern> {
        let ignore_file = self.build_dir.join(IGNORE_FILE);
        let Ok(contents) = std::fs::read_to_string(&ignore_file) else {
            return Vec::new();
        };
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match glob::Pattern::new(line) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    warn!(pattern = line, error = %err, "skipping invalid ignore pattern");
                    None
                }
            })
            .collect()
    }

    /// Create the source archive for the source image and remote builds.
    pub fn archive_path(&mut self) -> Result<PathBuf, SourceError> {
        if let Some(archive) = &self.archive {
            return Ok(archive.clone());
        }

        info!("Creating source archive");
        let excludes = self.ignore_patterns();

        std::fs::create_dir_all(&self.temp_dir)?;
        let file = tempfile::Builder::new()
            .prefix("buildrunner-source-")
            .suffix(".tar")
            .tempfile_in(&self.temp_dir)?;
        let (file, path) = file.keep().map_err(|e| SourceError::Io(e.error))?;

        let mut archive = tar::Builder::new(file);
        archive.follow_symlinks(false);
        self.append_filtered(&mut archive, &self.build_dir.clone(), "", &excludes)?;
        archive.finish()?;

        debug!(archive = %path.display(), "source archive written");
        self.archive = Some(path.clone());
        Ok(path)
    }

    fn append_filtered(
        &self,
        archive: &mut tar::Builder<std::fs::File>,
        dir: &Path,
        prefix: &str,
        excludes: &[glob::Pattern],
    ) -> Result<(), SourceError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };

            // The results tree never belongs in the snapshot.
            if prefix.is_empty() && name == self.results_dir_name {
                continue;
            }
            if excludes
                .iter()
                .any(|pattern| pattern.matches(&relative) || pattern.matches(&name))
            {
                continue;
            }

            let path = entry.path();
            if path.is_dir() {
                self.append_filtered(archive, &path, &relative, excludes)?;
            } else if path.is_file() {
                archive.append_path_with_name(&path, &relative)?;
            }
        }
        Ok(())
    }

    /// Get, creating if necessary, the image source containers are backed by.
    pub async fn image(&mut self, client: &Docker) -> Result<String, SourceError> {
        if let Some(image) = &self.image {
            return Ok(image.clone());
        }

        info!("Creating source image");
        let archive = self.archive_path()?;

        let dockerfile = format!(
            "FROM {}/busybox:latest\nADD source.tar /source\nVOLUME /source\n",
            self.docker_registry
        );

        let mut inject = BTreeMap::new();
        inject.insert(archive, "source.tar".to_string());

        let request = BuildRequest {
            dockerfile: Some(DockerfileSource::Inline(dockerfile)),
            inject,
            nocache: true,
            pull: false,
            ..Default::default()
        };

        let image = build_image(client, &request, None).await?;
        self.image = Some(image.clone());
        Ok(image)
    }

    /// Get, creating if necessary, the long lived container whose `/source`
    /// volume backs every workload in this invocation.
    pub async fn container(
        &mut self,
        client: &Arc<Docker>,
        labels: &HashMap<String, String>,
        log: &StepLog,
    ) -> Result<String, SourceError> {
        if let Some(container) = &self.container {
            return Ok(container.clone());
        }

        let image = self.image(client.as_ref()).await?;
        let mut runner =
            ContainerRunner::new(Arc::clone(client), ImageConfig::new(&image, false, None), None)
                .await?;
        let container = runner
            .start(ContainerOptions {
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;

        log.write_line(&format!(
            "Created source container {}",
            &container[..container.len().min(10)]
        ))
        .await;

        self.container = Some(container.clone());
        Ok(container)
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Destroy everything the snapshot produced. Failures are logged and
    /// swallowed so teardown can continue.
    pub async fn cleanup(&mut self, client: &Docker) {
        if let Some(container) = self.container.take() {
            info!(container = %&container[..container.len().min(10)], "Destroying source container");
            if let Err(err) = crate::docker::force_remove_container(client, &container).await {
                warn!(error = %err, "failed to remove source container");
            }
        }

        if let Some(image) = self.image.take() {
            info!("Destroying source image");
            if let Err(err) = client
                .remove_image(
                    &image,
                    Some(bollard::image::RemoveImageOptions {
                        force: true,
                        noprune: false,
                    }),
                    None,
                )
                .await
            {
                warn!(error = %err, "failed to remove source image");
            }
        }

        if let Some(archive) = self.archive.take() {
            info!("Destroying source archive");
            if let Err(err) = std::fs::remove_file(&archive) {
                warn!(error = %err, "failed to remove source archive");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::io::Read;

    struct TestHarness {
        base: PathBuf,
    }

    impl TestHarness {
        fn new() -> Self {
            let mut rng = rand::thread_rng();
            let id: u16 = rng.gen();
            let base = std::env::temp_dir().join(format!("buildrunner_tests_source_{id}"));
            std::fs::create_dir_all(&base).unwrap();
            Self { base }
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                let mut sink = Vec::new();
                entry.read_to_end(&mut sink).unwrap();
                name
            })
            .collect()
    }

    #[test]
    fn archive_skips_results_and_ignored() {
        let harness = TestHarness::new();
        let build_dir = harness.base.join("project");
        std::fs::create_dir_all(build_dir.join("src")).unwrap();
        std::fs::create_dir_all(build_dir.join("buildrunner.results")).unwrap();
        std::fs::write(build_dir.join("src/lib.rs"), b"pub fn x() {}").unwrap();
        std::fs::write(build_dir.join("secret.pem"), b"key").unwrap();
        std::fs::write(build_dir.join("buildrunner.results/old.log"), b"stale").unwrap();
        std::fs::write(build_dir.join(IGNORE_FILE), b"*.pem\n").unwrap();

        let mut snapshot = SourceSnapshot::new(
            &build_dir,
            &build_dir.join("buildrunner.results"),
            &harness.base.join("tmp"),
            "docker.io",
        );

        let archive = snapshot.archive_path().unwrap();
        let names = archive_names(&archive);

        assert!(names.contains(&"src/lib.rs".to_string()));
        assert!(!names.iter().any(|name| name.contains("secret.pem")));
        assert!(!names.iter().any(|name| name.contains("buildrunner.results")));

        // A second call reuses the same archive.
        let again = snapshot.archive_path().unwrap();
        assert_eq!(archive, again);

        std::fs::remove_file(archive).unwrap();
    }
}
