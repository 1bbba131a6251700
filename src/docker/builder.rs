use super::DockerError;
use crate::logs::StepLog;
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a Dockerfile comes from: a file on disk or inline contents.
#[derive(Debug, Clone)]
pub enum DockerfileSource {
    Path(PathBuf),
    Inline(String),
}

/// A fully resolved single-platform build request. Inject sources have
/// already been glob-expanded to concrete files by the build task.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub path: Option<PathBuf>,
    pub dockerfile: Option<DockerfileSource>,
    /// Source file to in-context destination. Injected files override files
    /// from `path` at the same destination.
    pub inject: BTreeMap<PathBuf, String>,
    pub nocache: bool,
    pub pull: bool,
    pub buildargs: BTreeMap<String, String>,
    pub cache_from: Vec<String>,
    pub target: Option<String>,
    pub platform: Option<String>,
}

impl BuildRequest {
    fn dockerfile_contents(&self) -> Result<Option<String>, DockerError> {
        match &self.dockerfile {
            None => Ok(None),
            Some(DockerfileSource::Inline(contents)) => Ok(Some(contents.clone())),
            Some(DockerfileSource::Path(path)) => std::fs::read_to_string(path)
                .map(Some)
                .map_err(|e| DockerError::BuildFailed(format!("cannot read {}: {e}", path.display()))),
        }
    }
}

/// Assemble the build context archive: the optional `path` tree first, then
/// injected files over it, then the Dockerfile itself. If neither `path` nor
/// `inject` were given only the Dockerfile is sent.
pub fn assemble_context(request: &BuildRequest) -> Result<Vec<u8>, DockerError> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(true);

    let io_err = |e: std::io::Error| DockerError::BuildFailed(e.to_string());

    if let Some(path) = &request.path {
        append_tree(&mut archive, path, Path::new("")).map_err(io_err)?;
    }

    for (source, dest) in &request.inject {
        if source.is_dir() {
            append_tree(&mut archive, source, Path::new(dest)).map_err(io_err)?;
        } else {
            archive
                .append_path_with_name(source, dest)
                .map_err(io_err)?;
        }
    }

    let has_injected_dockerfile = request
        .inject
        .values()
        .any(|dest| dest == "Dockerfile" || dest == "./Dockerfile");

    if !has_injected_dockerfile {
        if let Some(contents) = request.dockerfile_contents()? {
            let bytes = contents.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            archive
                .append_data(&mut header, "Dockerfile", bytes)
                .map_err(io_err)?;
        }
    }

    archive.into_inner().map_err(io_err)
}

fn append_tree(
    archive: &mut tar::Builder<Vec<u8>>,
    source: &Path,
    prefix: &Path,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        if path.is_dir() {
            append_tree(archive, &path, &name)?;
        } else {
            archive.append_path_with_name(&path, &name)?;
        }
    }
    Ok(())
}

/// Stream the assembled context to the runtime and run the build, writing
/// build output to the step log. Returns the resulting image id.
pub async fn build_image(
    client: &Docker,
    request: &BuildRequest,
    log: Option<&StepLog>,
) -> Result<String, DockerError> {
    // Make cache_from references available locally where possible; a failed
    // pull is fine, the reference is still passed through so the runtime can
    // hit its local cache.
    for reference in &request.cache_from {
        let mut pull = client.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: reference.clone(),
                platform: request.platform.clone().unwrap_or_default(),
                ..Default::default()
            }),
            None,
            None,
        );
        let mut failed = false;
        while let Some(progress) = pull.next().await {
            if progress.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            if let Some(log) = log {
                log.write_line(&format!(
                    "WARNING: Unable to pull the cache_from image: {reference}"
                ))
                .await;
            }
        } else if let Some(log) = log {
            log.write_line(&format!("Using cache_from image: {reference}")).await;
        }
    }

    let context = assemble_context(request)?;
    debug!(bytes = context.len(), "assembled build context");

    let buildargs: HashMap<String, String> = request
        .buildargs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let options = bollard::image::BuildImageOptions::<String> {
        dockerfile: "Dockerfile".to_string(),
        nocache: request.nocache,
        pull: request.pull,
        buildargs,
        cachefrom: request.cache_from.clone(),
        target: request.target.clone().unwrap_or_default(),
        platform: request.platform.clone().unwrap_or_default(),
        rm: true,
        ..Default::default()
    };

    let mut image_id: Option<String> = None;
    let mut stream = client.build_image(options, None, Some(context.into()));

    while let Some(message) = stream.next().await {
        let info = message.map_err(|e| DockerError::BuildFailed(e.to_string()))?;

        if let Some(output) = info.stream {
            if let Some(log) = log {
                log.write_raw(output.as_bytes()).await;
            }
        }

        if let Some(aux) = info.aux {
            if let Some(id) = aux.id {
                image_id = Some(id);
            }
        }

        if let Some(error) = info.error {
            let detail = info
                .error_detail
                .and_then(|d| d.message)
                .unwrap_or_default();
            return Err(DockerError::BuildFailed(format!("{error} {detail}")));
        }
    }

    image_id.ok_or_else(|| {
        DockerError::BuildFailed("build completed without producing an image id".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::io::Read;

    fn entries(context: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(context);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).unwrap();
                (name, contents)
            })
            .collect()
    }

    #[test]
    fn dockerfile_only_context() {
        let request = BuildRequest {
            dockerfile: Some(DockerfileSource::Inline("FROM scratch\n".to_string())),
            ..Default::default()
        };
        let context = assemble_context(&request).unwrap();
        let found = entries(&context);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "Dockerfile");
        assert_eq!(found[0].1, b"FROM scratch\n");
    }

    #[test]
    fn injected_files_override_path_files() {
        let mut rng = rand::thread_rng();
        let id: u16 = rng.gen();
        let base = std::env::temp_dir().join(format!("buildrunner_tests_builder_{id}"));
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("app.conf"), b"from path").unwrap();
        let injected = base.join("override.conf");
        std::fs::write(&injected, b"from inject").unwrap();

        let mut inject = BTreeMap::new();
        inject.insert(injected.clone(), "app.conf".to_string());

        let request = BuildRequest {
            path: Some(base.clone()),
            inject,
            dockerfile: Some(DockerfileSource::Inline("FROM scratch\n".to_string())),
            ..Default::default()
        };

        let context = assemble_context(&request).unwrap();
        let found = entries(&context);

        // Later archive entries win when paths repeat, so the injected copy
        // must come after the path copy.
        let copies: Vec<&(String, Vec<u8>)> =
            found.iter().filter(|(name, _)| name == "app.conf").collect();
        assert!(copies.len() >= 2);
        assert_eq!(copies.last().unwrap().1, b"from inject");

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn injected_dockerfile_suppresses_inline() {
        let mut rng = rand::thread_rng();
        let id: u16 = rng.gen();
        let base = std::env::temp_dir().join(format!("buildrunner_tests_builder_df_{id}"));
        std::fs::create_dir_all(&base).unwrap();
        let injected = base.join("Dockerfile.build");
        std::fs::write(&injected, b"FROM alpine\n").unwrap();

        let mut inject = BTreeMap::new();
        inject.insert(injected, "Dockerfile".to_string());

        let request = BuildRequest {
            inject,
            dockerfile: Some(DockerfileSource::Inline("FROM scratch\n".to_string())),
            ..Default::default()
        };

        let context = assemble_context(&request).unwrap();
        let found = entries(&context);
        let dockerfiles: Vec<&(String, Vec<u8>)> = found
            .iter()
            .filter(|(name, _)| name == "Dockerfile")
            .collect();
        assert_eq!(dockerfiles.len(), 1);
        assert_eq!(dockerfiles[0].1, b"FROM alpine\n");

        std::fs::remove_dir_all(&base).unwrap();
    }
}
