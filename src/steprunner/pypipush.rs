use super::{StepResources, StepRunner};
use crate::errors::BuildError;
use crate::logs::StepLog;
use crate::manifest::PypiPushSpec;
use crate::session::PypiBatch;
use std::process::Stdio;
use tracing::info;

const PACKAGE_TYPES: [&str; 2] = ["python-sdist", "python-wheel"];

/// Register this step's python packages for upload to the given repository.
/// The actual upload happens once at session finalize, with `--push`.
pub async fn execute(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    spec: &PypiPushSpec,
) -> Result<(), BuildError> {
    if !resources.ctx.push {
        runner
            .log
            .write_line("Push not requested with \"--push\": skipping")
            .await;
        return Ok(());
    }

    runner
        .log
        .write_line(&format!(
            "Preparing resulting packages for push to \"{}\".",
            spec.repository
        ))
        .await;

    let batch = resources
        .ctx
        .pypi_packages
        .entry(spec.repository.clone())
        .or_insert_with(|| PypiBatch {
            spec: spec.clone(),
            packages: Vec::new(),
        });

    // Only this step's package artifacts join the batch.
    for (name, metadata) in runner.artifacts.entries() {
        let is_package = metadata
            .get("type")
            .and_then(|value| value.as_str())
            .map(|artifact_type| PACKAGE_TYPES.contains(&artifact_type))
            .unwrap_or(false);
        if is_package {
            batch.packages.push(runner.results_dir.join(name));
        }
    }

    Ok(())
}

/// Upload every registered package batch through the package index client.
pub async fn upload_batches(
    batches: &std::collections::BTreeMap<String, PypiBatch>,
    log: &StepLog,
) -> Result<(), BuildError> {
    for (repository, batch) in batches {
        if batch.packages.is_empty() {
            continue;
        }

        info!(repository = %repository, packages = batch.packages.len(), "uploading python packages");
        log.write_line(&format!("Uploading python packages to {repository}")).await;

        let mut command = tokio::process::Command::new("twine");
        command.arg("upload").arg("--disable-progress-bar");

        if batch.spec.skip_existing {
            command.arg("--skip-existing");
        }

        // A repository url with credentials comes from the manifest; a bare
        // name defers to the uploader's own configuration.
        if let (Some(username), Some(password)) = (&batch.spec.username, &batch.spec.password) {
            command
                .arg("--repository-url")
                .arg(repository)
                .arg("--username")
                .arg(username)
                .env("TWINE_PASSWORD", password);
        } else {
            command.arg("--repository").arg(repository);
        }

        for package in &batch.packages {
            command.arg(package);
        }

        let status = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| BuildError::Integration(format!("could not invoke twine: {e}")))?;

        if !status.success() {
            return Err(BuildError::Integration(format!(
                "package upload to {repository} failed"
            )));
        }
    }

    Ok(())
}
