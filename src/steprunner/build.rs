use super::{StepContext, StepResources, StepRunner};
use crate::docker::builder::{build_image, BuildRequest, DockerfileSource};
use crate::docker::importer;
use crate::errors::BuildError;
use crate::manifest::BuildSpec;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Execute a build stage, leaving the produced image in the step context.
/// `image_to_prepend` carries the committed run image for post-build.
pub async fn execute(
    runner: &StepRunner,
    resources: &mut StepResources<'_>,
    step_ctx: &mut StepContext,
    spec: &BuildSpec,
    image_to_prepend: Option<String>,
) -> Result<(), BuildError> {
    let build_dir = resources.ctx.build_dir.clone();

    // An import short circuits everything else and loads the archive as-is.
    if let Some(archive) = &spec.import {
        if spec.platforms.is_none() {
            runner
                .log
                .write_line(&format!("  Importing {archive} as a Docker image"))
                .await;
            let image =
                importer::import_image(resources.client, &build_dir.join(archive)).await?;
            step_ctx.image = Some(image);
            return Ok(());
        }
    }

    let inject = resolve_inject(&build_dir, &spec.inject)?;

    let path = match &spec.path {
        Some(path) => {
            let absolute = to_abs_path(&build_dir, path);
            if !absolute.exists() {
                return Err(BuildError::Config(format!(
                    "step {}:build:path:{}: invalid build context path",
                    runner.name,
                    absolute.display()
                )));
            }
            Some(absolute)
        }
        None => None,
    };

    let dockerfile =
        resolve_dockerfile(&build_dir, spec, path.as_deref(), &inject, &image_to_prepend)?;

    let Some(dockerfile) = dockerfile else {
        return Err(BuildError::Config(
            "cannot find a Dockerfile in the given path or inject configurations".to_string(),
        ));
    };

    let base_image = image_to_prepend.clone().or_else(|| {
        dockerfile
            .lines()
            .find_map(|line| {
                let trimmed = line.trim();
                trimmed
                    .strip_prefix("FROM ")
                    .or_else(|| trimmed.strip_prefix("from "))
            })
            .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
    });

    // Images committed earlier in this session default to no pull; unknown
    // bases default to pull. The local-images flag forces no pull for all.
    let pull = if resources.ctx.local_images {
        false
    } else if let Some(pull) = spec.pull {
        runner
            .log
            .write_line(&format!("Pulling image was overridden via config to {pull}"))
            .await;
        pull
    } else {
        match &base_image {
            None => true,
            Some(base) => !resources.ctx.committed_images.contains(base),
        }
    };

    let request = BuildRequest {
        path,
        dockerfile: Some(DockerfileSource::Inline(dockerfile)),
        inject,
        nocache: spec.no_cache,
        pull,
        buildargs: spec.buildargs.clone(),
        cache_from: spec.cache_from.clone(),
        target: spec.target.clone(),
        platform: spec.platform.clone(),
    };

    runner.log.write_line("Running docker build").await;

    if let Some(platforms) = &spec.platforms {
        let set = resources
            .multiplatform
            .build(resources.client, &request, platforms, None, &runner.log)
            .await?;

        // Make the native platform image available locally for later stages.
        if let Some(native) = set.native_image() {
            let mut pull_stream = resources.client.create_image(
                Some(bollard::image::CreateImageOptions {
                    from_image: native.image_ref.clone(),
                    platform: native.platform.clone(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = pull_stream.next().await {
                progress
                    .map_err(|e| BuildError::Resource(format!("cannot pull built image; {e}")))?;
            }
            step_ctx.image = Some(native.image_ref.clone());
        }

        step_ctx.mp_image = Some(set);
    } else {
        let image = build_image(resources.client, &request, Some(&runner.log)).await?;
        resources.ctx.generated_images.push(image.clone());
        step_ctx.image = Some(image);
    }

    Ok(())
}

fn to_abs_path(build_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        build_dir.join(candidate)
    }
}

/// Expand the inject glob map into concrete source files and in-context
/// destinations. A destination ending in a separator (or naming `.`/`..`)
/// is a directory; multiple matches always land in a directory.
pub fn resolve_inject(
    build_dir: &Path,
    inject: &BTreeMap<String, Option<String>>,
) -> Result<BTreeMap<PathBuf, String>, BuildError> {
    let mut resolved = BTreeMap::new();

    for (src_glob, dest) in inject {
        let dest = dest.clone().unwrap_or_default();

        let absolute = to_abs_path(build_dir, src_glob);
        let mut matches: Vec<PathBuf> = glob::glob(&absolute.to_string_lossy())
            .map_err(|e| BuildError::Config(format!("invalid inject glob '{src_glob}'; {e}")))?
            .filter_map(Result::ok)
            .collect();
        matches.sort();

        if matches.is_empty() {
            return Err(BuildError::Config(format!(
                "unable to expand inject glob: {src_glob}"
            )));
        }

        let dest_is_dir = dest.ends_with('/')
            || dest.is_empty()
            || matches!(
                Path::new(&dest).file_name().map(|n| n.to_string_lossy()),
                Some(ref name) if name == "." || name == ".."
            );

        if matches.len() == 1 && !dest_is_dir {
            resolved.insert(matches[0].clone(), normalize_dest(&dest));
        } else {
            for source in matches {
                let file_name = source
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                let joined = if dest.is_empty() {
                    file_name
                } else {
                    format!("{}/{file_name}", dest.trim_end_matches('/'))
                };
                resolved.insert(source, normalize_dest(&joined));
            }
        }
    }

    Ok(resolved)
}

fn normalize_dest(dest: &str) -> String {
    dest.trim_start_matches("./").trim_start_matches('/').to_string()
}

/// Resolve the Dockerfile to its final inline contents, checking the spec,
/// the context path, and injected destinations in that order.
fn resolve_dockerfile(
    build_dir: &Path,
    spec: &BuildSpec,
    path: Option<&Path>,
    inject: &BTreeMap<PathBuf, String>,
    image_to_prepend: &Option<String>,
) -> Result<Option<String>, BuildError> {
    let mut contents: Option<String> = None;

    if let Some(dockerfile) = &spec.dockerfile {
        let absolute = to_abs_path(build_dir, dockerfile);
        if absolute.exists() {
            contents = Some(std::fs::read_to_string(&absolute).map_err(|e| {
                BuildError::Config(format!("cannot read {}: {e}", absolute.display()))
            })?);
        } else {
            // Not a file, so treat the value as inline Dockerfile contents.
            contents = Some(dockerfile.clone());
        }
    }

    if contents.is_none() {
        if let Some(path) = path {
            let candidate = path.join("Dockerfile");
            if candidate.exists() {
                contents = Some(std::fs::read_to_string(&candidate).map_err(|e| {
                    BuildError::Config(format!("cannot read {}: {e}", candidate.display()))
                })?);
            }
        }
    }

    if contents.is_none() {
        for (source, dest) in inject {
            if dest == "Dockerfile" {
                contents = Some(std::fs::read_to_string(source).map_err(|e| {
                    BuildError::Config(format!("cannot read {}: {e}", source.display()))
                })?);
                break;
            }
        }
    }

    if let (Some(contents), Some(prepend)) = (&mut contents, image_to_prepend) {
        *contents = format!("FROM {prepend}\n{contents}");
    }

    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    struct TestHarness {
        base: PathBuf,
    }

    impl TestHarness {
        fn new() -> Self {
            let mut rng = rand::thread_rng();
            let id: u16 = rng.gen();
            let base = std::env::temp_dir().join(format!("buildrunner_tests_build_{id}"));
            std::fs::create_dir_all(&base).unwrap();
            Self { base }
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }

    #[test]
    fn inject_single_source_to_file_dest() {
        let harness = TestHarness::new();
        std::fs::write(harness.base.join("app.conf"), b"conf").unwrap();

        let mut inject = BTreeMap::new();
        inject.insert("app.conf".to_string(), Some("etc/app.conf".to_string()));

        let resolved = resolve_inject(&harness.base, &inject).unwrap();
        assert_eq!(
            resolved.get(&harness.base.join("app.conf")).map(String::as_str),
            Some("etc/app.conf")
        );
    }

    #[test]
    fn inject_trailing_separator_means_directory() {
        let harness = TestHarness::new();
        std::fs::write(harness.base.join("app.conf"), b"conf").unwrap();

        let mut inject = BTreeMap::new();
        inject.insert("app.conf".to_string(), Some("etc/".to_string()));

        let resolved = resolve_inject(&harness.base, &inject).unwrap();
        assert_eq!(
            resolved.get(&harness.base.join("app.conf")).map(String::as_str),
            Some("etc/app.conf")
        );
    }

    #[test]
    fn inject_multiple_sources_require_directory() {
        let harness = TestHarness::new();
        std::fs::write(harness.base.join("one.sh"), b"1").unwrap();
        std::fs::write(harness.base.join("two.sh"), b"2").unwrap();

        let mut inject = BTreeMap::new();
        inject.insert("*.sh".to_string(), Some("scripts".to_string()));

        let resolved = resolve_inject(&harness.base, &inject).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved.get(&harness.base.join("one.sh")).map(String::as_str),
            Some("scripts/one.sh")
        );
    }

    #[test]
    fn inject_unmatched_glob_is_fatal() {
        let harness = TestHarness::new();
        let mut inject = BTreeMap::new();
        inject.insert("missing-*.txt".to_string(), None);

        let err = resolve_inject(&harness.base, &inject).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn dockerfile_inline_and_prepend() {
        let harness = TestHarness::new();
        let spec = BuildSpec {
            dockerfile: Some("FROM scratch\nCMD [\"/x\"]\n".to_string()),
            ..Default::default()
        };

        let contents = resolve_dockerfile(&harness.base, &spec, None, &BTreeMap::new(), &None)
            .unwrap()
            .unwrap();
        assert!(contents.starts_with("FROM scratch"));

        let contents = resolve_dockerfile(
            &harness.base,
            &spec,
            None,
            &BTreeMap::new(),
            &Some("sha256:abc".to_string()),
        )
        .unwrap()
        .unwrap();
        assert!(contents.starts_with("FROM sha256:abc\n"));
    }

    #[test]
    fn dockerfile_found_in_context_path() {
        let harness = TestHarness::new();
        let context = harness.base.join("docker");
        std::fs::create_dir_all(&context).unwrap();
        std::fs::write(context.join("Dockerfile"), b"FROM alpine\n").unwrap();

        let spec = BuildSpec::default();
        let contents =
            resolve_dockerfile(&harness.base, &spec, Some(&context), &BTreeMap::new(), &None)
                .unwrap()
                .unwrap();
        assert_eq!(contents, "FROM alpine\n");
    }
}
