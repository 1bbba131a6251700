use super::{build, push, CleanupAction, CleanupStack, StepContext, StepResources, StepRunner};
use crate::artifacts::ArtifactCollector;
use crate::cache::CacheStore;
use crate::docker::runner::{ContainerRunner, ImageConfig};
use crate::errors::BuildError;
use crate::logs::StepLog;
use crate::manifest::{normalize_caches, RunSpec, ServiceSpec};
use crate::provisioners::create_provisioners;
use crate::session::BuildContext;
use crate::sshagent::{self, SshAgentProxy};
use crate::workload::{self, WorkloadBuilder};
use bollard::Docker;
use std::sync::Arc;

struct ResolvedService {
    name: String,
    spec: ServiceSpec,
    image: String,
}

/// Execute a run stage: assemble the workload, drive the primary container's
/// commands, capture artifacts, and honor xfail semantics.
pub async fn execute(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    cleanup: &mut CleanupStack,
    step_ctx: &mut StepContext,
    run: &RunSpec,
) -> Result<(), BuildError> {
    let log = runner.log.clone();

    // Pick the image to run: an explicit one, else whatever the build stage
    // produced.
    let image = match &run.image {
        Some(image) => image.to_lowercase(),
        None => step_ctx.image.clone().ok_or_else(|| {
            BuildError::Config(
                "run configuration must specify an 'image' attribute or be preceded by a build stage"
                    .to_string(),
            )
        })?,
    };

    let pull = resolve_pull(resources.ctx, run.pull, run.image.as_deref());
    if run.pull.is_none() && run.image.is_some() {
        log.write_line(&format!(
            "Pull was not specified in configuration, defaulting to {pull}"
        ))
        .await;
    }

    // Resolve service images up front; services building their own image go
    // through the regular build stage machinery.
    let mut services = Vec::new();
    for (service_name, service) in run.services.0.clone() {
        let service_image = match (&service.image, &service.build) {
            (Some(image), _) => image.to_lowercase(),
            (None, Some(build_spec)) => {
                let mut service_ctx = StepContext::default();
                build::execute(runner, resources, &mut service_ctx, build_spec, None).await?;
                service_ctx.image.ok_or_else(|| {
                    BuildError::Internal(format!(
                        "service '{service_name}' build produced no image"
                    ))
                })?
            }
            (None, None) => {
                return Err(BuildError::Config(format!(
                    "service '{service_name}' must specify an image or build context"
                )))
            }
        };
        services.push(ResolvedService {
            name: service_name,
            spec: service,
            image: service_image,
        });
    }

    // The workload network everything for this step attaches to.
    let network = workload::network_name(&resources.ctx.docker_tag, &runner.id);
    resources
        .client
        .create_network(bollard::network::CreateNetworkOptions {
            name: network.clone(),
            check_duplicate: true,
            ..Default::default()
        })
        .await
        .map_err(|e| BuildError::Resource(format!("cannot create workload network; {e}")))?;
    cleanup.push(CleanupAction::Network(network.clone()));

    let source_container = resources
        .source
        .container(resources.client, &resources.ctx.container_labels, &log)
        .await
        .map_err(|e| BuildError::Resource(e.to_string()))?;

    let mut agent = if run.ssh_keys.is_empty() {
        None
    } else {
        let temp_dir = resources.ctx.global.temp_dir_path();
        let keys = sshagent::resolve_keys(&resources.ctx.global, &run.ssh_keys, &temp_dir)?;
        Some(SshAgentProxy::start(keys, &temp_dir).await?)
    };

    let result = run_workload(
        runner,
        resources.client,
        resources.ctx,
        resources.caches,
        &source_container,
        run,
        &image,
        pull,
        &services,
        agent.as_ref(),
        cleanup,
        step_ctx,
    )
    .await;

    // The agent has to outlive the workload, so it only enters the cleanup
    // stack once the workload is done with it.
    if let Some(agent) = agent.take() {
        cleanup.push(CleanupAction::Agent(agent));
    }

    result?;

    // Post-build: commit the run container's end state and rebuild with the
    // committed image prepended to the Dockerfile.
    if let Some(post_build) = &run.post_build {
        log.write_line("Running post-build processing").await;
        let container = step_ctx.run_container.clone().ok_or_else(|| {
            BuildError::Internal("post-build without a run container".to_string())
        })?;
        let committed = push::commit_container(resources.client, &container).await?;

        let mut post_ctx = StepContext::default();
        build::execute(runner, resources, &mut post_ctx, post_build, Some(committed)).await?;
        step_ctx.run_image = post_ctx.image;
    }

    Ok(())
}

fn resolve_pull(ctx: &BuildContext, configured: Option<bool>, image: Option<&str>) -> bool {
    if ctx.local_images {
        return false;
    }
    if let Some(pull) = configured {
        return pull;
    }
    match image {
        // Images produced earlier in this session are local by definition.
        Some(image) => !ctx.committed_images.contains(image),
        // No explicit image means the build stage just produced it locally.
        None => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_workload(
    runner: &mut StepRunner,
    client: &Arc<Docker>,
    ctx: &BuildContext,
    caches: &CacheStore,
    source_container: &str,
    run: &RunSpec,
    image: &str,
    pull: bool,
    services: &[ResolvedService],
    agent: Option<&SshAgentProxy>,
    cleanup: &mut CleanupStack,
    step_ctx: &mut StepContext,
) -> Result<(), BuildError> {
    let log = runner.log.clone();
    let step_name = runner.name.clone();
    let step_id = runner.id.clone();

    let mut workload = WorkloadBuilder::new(ctx, &step_name, &step_id, source_container);

    // Services come up first, in declaration order, each gated by its
    // wait_for ports before the next one starts.
    for service in services {
        start_service(client, ctx, &mut workload, service, agent, cleanup, &log).await?;
    }

    // The primary container.
    log.write_line(&format!("Creating build container from image \"{image}\""))
        .await;

    let mut cmds: Vec<String> = Vec::new();
    if let Some(cmd) = &run.cmd {
        cmds.push(cmd.clone());
    }
    if let Some(more) = &run.cmds {
        cmds.extend(more.iter().cloned());
    }

    let provisioners = match &run.provisioners {
        Some(spec) if !spec.is_empty() => create_provisioners(spec, &ctx.build_dir)?,
        _ => Vec::new(),
    };

    let has_commands = !cmds.is_empty() || !provisioners.is_empty();
    let systemd = workload::is_systemd(client, run.systemd, image).await?;
    let options = workload.primary_options(run, has_commands, systemd, agent)?;
    let base_env = options.environment.clone();

    for hint in &run.containers {
        cleanup.push(CleanupAction::ContainerHint(hint.clone()));
    }

    let platform = run.platform.clone().or_else(|| ctx.platform.clone());
    let mut primary = ContainerRunner::new(
        Arc::clone(client),
        ImageConfig::new(image, pull, platform),
        Some(&log),
    )
    .await?;

    let container_id = primary.start(options).await?;
    cleanup.push(CleanupAction::Container(container_id.clone()));
    log.write_line(&format!(
        "Started build container {}",
        &container_id[..container_id.len().min(10)]
    ))
    .await;

    let cache_mounts = normalize_caches(&run.caches);
    if !cache_mounts.is_empty() {
        primary
            .restore_caches(caches, &cache_mounts, &ctx.vcs.name, &log)
            .await?;
    }

    let exit_code = if has_commands {
        // Newer git refuses to operate on an unowned tree; mark the mount
        // safe first and ignore any error.
        let _ = primary
            .run("git config --global --add safe.directory /source", None)
            .await;

        for provisioner in &provisioners {
            provisioner.provision(&primary, &log).await?;
        }

        let mut exit_code = 0;
        for cmd in &cmds {
            log.write_line(&format!("cmd> {cmd}")).await;
            exit_code = primary.run(cmd, Some(&log)).await?;
            log.write_line(&format!("Command \"{cmd}\" exited with code {exit_code}"))
                .await;
            if exit_code != 0 {
                break;
            }
        }
        exit_code
    } else {
        let exit_code = primary.attach_until_finished(Some(&log), None).await?;
        log.write_line(&format!("Container exited with code {exit_code}"))
            .await;
        exit_code
    };

    if exit_code == 0 && !cache_mounts.is_empty() {
        primary
            .save_caches(caches, &cache_mounts, &ctx.vcs.name, &base_env, &log)
            .await?;
    } else if exit_code != 0 && !cache_mounts.is_empty() {
        log.write_line("Skipping cache save due to failed exit code").await;
    }

    primary.stop().await;
    step_ctx.run_container = Some(container_id);

    let success = if run.xfail {
        exit_code != 0
    } else {
        exit_code == 0
    };

    // Artifacts from a failed non-xfail run are not captured.
    if success && !run.artifacts.is_empty() {
        capture_artifacts(runner, client, ctx, source_container, run).await?;
    }

    if !success {
        if run.xfail {
            return Err(BuildError::Execution(
                "command succeeded but the step expected failure (xfail)".to_string(),
            ));
        }
        return Err(BuildError::Execution(format!(
            "run container exited with code {exit_code}"
        )));
    }

    if run.xfail && exit_code != 0 {
        log.write_line(&format!(
            "Step \"{step_name}\" failed with exit code {exit_code}; treating as success due to xfail"
        ))
        .await;
    }

    Ok(())
}

async fn start_service(
    client: &Arc<Docker>,
    ctx: &BuildContext,
    workload: &mut WorkloadBuilder<'_>,
    service: &ResolvedService,
    agent: Option<&SshAgentProxy>,
    cleanup: &mut CleanupStack,
    log: &StepLog,
) -> Result<(), BuildError> {
    log.write_line(&format!(
        "Creating service container \"{}\" from image \"{}\"",
        service.name, service.image
    ))
    .await;

    let systemd = workload::is_systemd(client, service.spec.systemd, &service.image).await?;
    let options = workload.service_options(&service.name, &service.spec, systemd, agent)?;
    let container_name = workload.service_container_name(&service.name);

    for hint in &service.spec.containers {
        cleanup.push(CleanupAction::ContainerHint(hint.clone()));
    }

    let pull = resolve_pull(ctx, service.spec.pull, Some(&service.image));
    let mut service_runner = ContainerRunner::new(
        Arc::clone(client),
        ImageConfig::new(&service.image, pull, None),
        Some(log),
    )
    .await?;

    let container_id = service_runner.start(options).await?;
    cleanup.push(CleanupAction::Container(container_id.clone()));
    workload.register_service(&service.name, &container_name);

    if let Some(spec) = &service.spec.provisioners {
        if !spec.is_empty() {
            for provisioner in create_provisioners(spec, &ctx.build_dir)? {
                provisioner.provision(&service_runner, log).await?;
            }
        }
    }

    // Tail the service in the background: run its command if it has one,
    // otherwise just stream its output into the step log.
    let service_cmd = service.spec.cmd.clone();
    let service_name = service.name.clone();
    let service_log = log.clone();
    let handle = tokio::spawn(async move {
        match service_cmd {
            Some(cmd) => {
                if let Ok(exit_code) = service_runner
                    .run_tagged(&cmd, Some(&service_log), Some(&service_name))
                    .await
                {
                    if exit_code != 0 {
                        service_log
                            .write_line(&format!(
                                "Service command \"{cmd}\" exited with code {exit_code}"
                            ))
                            .await;
                    }
                }
            }
            None => {
                let _ = service_runner
                    .attach_until_finished(Some(&service_log), Some(&service_name))
                    .await;
            }
        }
    });
    cleanup.push(CleanupAction::Task(handle));

    if !service.spec.wait_for.is_empty() {
        workload::wait_for_ports(
            client,
            &container_name,
            workload.network(),
            &service.spec.wait_for,
            log,
        )
        .await?;
    }

    log.write_line(&format!(
        "Started service container \"{}\" ({})",
        service.name,
        &container_id[..container_id.len().min(10)]
    ))
    .await;

    Ok(())
}

async fn capture_artifacts(
    runner: &mut StepRunner,
    client: &Arc<Docker>,
    ctx: &BuildContext,
    source_container: &str,
    run: &RunSpec,
) -> Result<(), BuildError> {
    let log = runner.log.clone();
    log.write_line("Gathering artifacts").await;

    let cwd = run
        .cwd
        .clone()
        .unwrap_or_else(|| workload::SOURCE_MOUNT.to_string());

    let mut collector = ArtifactCollector::start(
        client,
        &ctx.global.docker_registry,
        source_container,
        &runner.results_dir,
        &runner.name,
        &cwd,
        ctx.uid,
        ctx.gid,
        &ctx.container_labels,
    )
    .await?;

    let collect_result = collector
        .collect(&run.artifacts, &mut runner.artifacts, &log)
        .await;

    // Ownership fixup and lister teardown run even when collection failed.
    let finish_result = collector.finish(&log).await;

    collect_result?;
    finish_result?;
    Ok(())
}
