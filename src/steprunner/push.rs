use super::{scan, StepContext, StepResources, StepRunner};
use crate::errors::BuildError;
use crate::manifest::PushSpec;
use crate::session::ImageRecord;
use crate::vcs::sanitize_tag;
use bollard::Docker;
use serde_json::json;

/// Commit a container's current state as an image, returning the image id.
pub async fn commit_container(client: &Docker, container: &str) -> Result<String, BuildError> {
    let commit = client
        .commit_container(
            bollard::image::CommitContainerOptions::<String> {
                container: container.to_string(),
                ..Default::default()
            },
            bollard::container::Config::<String>::default(),
        )
        .await
        .map_err(|e| BuildError::Resource(format!("could not commit container; {e}")))?;

    commit
        .id
        .ok_or_else(|| BuildError::Resource("commit returned no image id".to_string()))
}

/// Execute a commit or push stage. Tagging is always local; the actual
/// uploads are deferred to session finalize and only happen with `--push`.
pub async fn execute(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    step_ctx: &mut StepContext,
    pushes: &[PushSpec],
    commit_only: bool,
) -> Result<(), BuildError> {
    if let Some(set) = step_ctx.mp_image.clone() {
        execute_multi_platform(runner, resources, &set, pushes, commit_only).await
    } else {
        execute_single_platform(runner, resources, step_ctx, pushes, commit_only).await
    }
}

/// The tags a push record resolves to: its explicit tags plus the build
/// docker tag unless disabled.
fn resolve_tags(push: &PushSpec, docker_tag: &str) -> Vec<String> {
    let mut tags: Vec<String> = push.tags.iter().map(|tag| sanitize_tag(tag)).collect();
    if push.add_build_tag && !tags.iter().any(|tag| tag == docker_tag) {
        tags.push(docker_tag.to_string());
    }
    tags
}

async fn execute_single_platform(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    step_ctx: &mut StepContext,
    pushes: &[PushSpec],
    commit_only: bool,
) -> Result<(), BuildError> {
    let log = runner.log.clone();

    // Prefer a post-build image, then the committed end state of the run
    // container, then the build stage's image.
    let image_to_use = if let Some(image) = &step_ctx.run_image {
        image.clone()
    } else if let Some(container) = &step_ctx.run_container {
        commit_container(resources.client, container).await?
    } else if let Some(image) = &step_ctx.image {
        image.clone()
    } else {
        return Err(BuildError::Execution(
            "cannot find an image to tag/push from a previous stage".to_string(),
        ));
    };

    log.write_line(&format!("Using image {image_to_use} for tagging")).await;
    resources.ctx.generated_images.push(image_to_use.clone());

    let record = ImageRecord {
        image: image_to_use.clone(),
        platforms: Vec::new(),
    };

    for push in pushes {
        let tags = resolve_tags(push, &resources.ctx.docker_tag);
        let action = if commit_only { "Committing" } else { "Preparing" };
        log.write_line(&format!(
            "{action} resulting image as \"{}\" with tags {}.",
            push.repository,
            tags.join(", ")
        ))
        .await;

        for tag in &tags {
            resources
                .client
                .tag_image(
                    &image_to_use,
                    Some(bollard::image::TagImageOptions {
                        repo: push.repository.clone(),
                        tag: tag.clone(),
                    }),
                )
                .await
                .map_err(|e| BuildError::Resource(format!("could not tag image; {e}")))?;

            let reference = format!("{}:{tag}", push.repository);
            resources.ctx.committed_images.insert(reference.clone());

            if !commit_only {
                resources.ctx.repo_tags_to_push.push(reference);
            }
        }

        if !commit_only {
            let mut metadata = serde_json::Map::new();
            metadata.insert("type".to_string(), json!("docker-image"));
            metadata.insert("docker:image".to_string(), json!(image_to_use));
            metadata.insert("docker:repository".to_string(), json!(push.repository));
            metadata.insert("docker:tags".to_string(), json!(tags));

            if let Some(last_tag) = tags.last() {
                if let Some(results) = scan::security_scan(
                    resources,
                    &log,
                    &push.repository,
                    last_tag,
                    false,
                    push.security_scan.as_ref(),
                )
                .await?
                {
                    metadata.insert(scan::ARTIFACT_SECURITY_SCAN_KEY.to_string(), results);
                }
            }

            runner.artifacts.add(&image_to_use, metadata);
        }
    }

    // Later steps resolve this step's images through the registry; it is
    // only written once the stage has fully succeeded.
    resources
        .ctx
        .images
        .insert(runner.name.clone(), record);

    Ok(())
}

async fn execute_multi_platform(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    set: &crate::docker::multiplatform::BuiltImageSet,
    pushes: &[PushSpec],
    commit_only: bool,
) -> Result<(), BuildError> {
    let log = runner.log.clone();

    let image_ids: Vec<String> = set.images.iter().map(|i| i.image_ref.clone()).collect();
    let platform_refs: Vec<String> = set
        .images
        .iter()
        .map(|image| format!("{}:{}", image.platform, image.image_ref))
        .collect();

    let mut record = ImageRecord {
        image: String::new(),
        platforms: set.platforms(),
    };

    for push in pushes {
        let tags = resolve_tags(push, &resources.ctx.docker_tag);

        for tag in &tags {
            let reference = format!("{}:{tag}", push.repository);
            resources.ctx.committed_images.insert(reference.clone());

            if !commit_only {
                // The manifest list is assembled at finalize, once for each
                // repository tag, spanning every built platform.
                resources
                    .ctx
                    .mp_tags_to_push
                    .push((set.clone(), push.repository.clone(), tag.clone()));
            }
        }

        // Tag the native platform image locally for cross-step reuse.
        resources
            .multiplatform
            .tag_native_platform(resources.client, set, &push.repository, &tags)
            .await?;

        record.image = push.repository.clone();

        if !commit_only {
            let mut metadata = serde_json::Map::new();
            metadata.insert("type".to_string(), json!("docker-image"));
            metadata.insert("docker:image".to_string(), json!(image_ids.join(",")));
            metadata.insert("docker:repository".to_string(), json!(push.repository));
            metadata.insert("docker:tags".to_string(), json!(tags));
            metadata.insert("docker:platforms".to_string(), json!(platform_refs));

            let mut scan_results = serde_json::Map::new();
            for image in &set.images {
                if let Some((repo, tag)) = image.image_ref.rsplit_once(':') {
                    if let Some(results) = scan::security_scan(
                        resources,
                        &log,
                        repo,
                        tag,
                        true,
                        push.security_scan.as_ref(),
                    )
                    .await?
                    {
                        scan_results.insert(image.platform.clone(), results);
                    }
                }
            }
            if !scan_results.is_empty() {
                metadata.insert(
                    scan::ARTIFACT_SECURITY_SCAN_KEY.to_string(),
                    serde_json::Value::Object(scan_results),
                );
            }

            runner.artifacts.add(&push.repository, metadata);
        }
    }

    resources
        .ctx
        .images
        .insert(runner.name.clone(), record);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_spec(yaml: &str) -> PushSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn build_tag_appended_by_default() {
        let push = push_spec("repository: myorg/app\ntags: [stable]\n");
        let tags = resolve_tags(&push, "main-abc1234-7");
        assert_eq!(tags, vec!["stable", "main-abc1234-7"]);
    }

    #[test]
    fn build_tag_suppressed_when_disabled() {
        let push = push_spec("repository: myorg/app\ntags: [stable]\nadd_build_tag: false\n");
        let tags = resolve_tags(&push, "main-abc1234-7");
        assert_eq!(tags, vec!["stable"]);
    }

    #[test]
    fn explicit_tags_are_sanitized() {
        let push = push_spec("repository: myorg/app\ntags: [\"Feature/One\"]\n");
        let tags = resolve_tags(&push, "tag");
        assert_eq!(tags[0], "feature_one");
    }
}
