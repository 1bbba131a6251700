use super::{StepResources, StepRunner};
use crate::artifacts::{spec_metadata, validate_pattern};
use crate::errors::BuildError;
use crate::logs::StepLog;
use crate::manifest::RemoteSpec;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Execute a remote step: ship the source archive to the build server, run
/// the command there, and rsync any artifacts back.
pub async fn execute(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    remote: &RemoteSpec,
) -> Result<(), BuildError> {
    let log = runner.log.clone();

    // The host is a build-servers alias first, a literal user@host second.
    let host = resources
        .ctx
        .global
        .build_server(&remote.host)
        .unwrap_or(&remote.host)
        .to_string();

    log.write_line(&format!("Building on remote host {host}\n")).await;

    let remote_dir = format!(
        "/tmp/buildrunner/{}-{}",
        resources.ctx.build_id, runner.name
    );

    log.write_line(&format!(
        "[{host}] Creating temporary remote directory '{remote_dir}'"
    ))
    .await;
    if run_ssh(&host, &format!("mkdir -p {remote_dir}"), &log).await? != 0 {
        return Err(BuildError::Integration(
            "error creating remote directory".to_string(),
        ));
    }

    let result = run_remote_build(runner, resources, remote, &host, &remote_dir).await;

    // The remote temp dir goes away no matter how the build went.
    let log = runner.log.clone();
    log.write_line(&format!(
        "[{host}] Cleaning up remote temp directory {remote_dir}"
    ))
    .await;
    if run_ssh(&host, &format!("rm -Rf {remote_dir}"), &log).await? != 0 && result.is_ok() {
        return Err(BuildError::Integration(
            "error cleaning up remote directory".to_string(),
        ));
    }

    result
}

async fn run_remote_build(
    runner: &mut StepRunner,
    resources: &mut StepResources<'_>,
    remote: &RemoteSpec,
    host: &str,
    remote_dir: &str,
) -> Result<(), BuildError> {
    let log = runner.log.clone();

    let archive = resources
        .source
        .archive_path()
        .map_err(|e| BuildError::Resource(e.to_string()))?;

    log.write_line(&format!("[{host}] Pushing archive file to remote directory"))
        .await;
    let status = run_process(
        "rsync",
        &[
            "-a".to_string(),
            archive.to_string_lossy().to_string(),
            format!("{host}:{remote_dir}/source.tar"),
        ],
        &log,
    )
    .await?;
    if status != 0 {
        return Err(BuildError::Integration(
            "error uploading source archive to host".to_string(),
        ));
    }

    log.write_line(&format!(
        "[{host}] Extracting source tree archive on remote host:"
    ))
    .await;
    if run_ssh(
        host,
        &format!("(cd {remote_dir}; tar -xf source.tar && rm -f source.tar)"),
        &log,
    )
    .await?
        != 0
    {
        return Err(BuildError::Integration(
            "error extracting archive file".to_string(),
        ));
    }

    log.write_line(&format!("[{host}] Running command '{}'", remote.cmd))
        .await;
    let command_status = run_ssh(host, &format!("(cd {remote_dir}; {})", remote.cmd), &log).await?;

    // Artifacts are fetched even when the command failed so failure output
    // is preserved; the failure still decides the step outcome below.
    fetch_artifacts(runner, remote, host, remote_dir).await?;

    if command_status != 0 {
        return Err(BuildError::Execution(format!(
            "remote build command exited with code {command_status}"
        )));
    }

    Ok(())
}

async fn fetch_artifacts(
    runner: &mut StepRunner,
    remote: &RemoteSpec,
    host: &str,
    remote_dir: &str,
) -> Result<(), BuildError> {
    if remote.artifacts.is_empty() {
        return Ok(());
    }

    let log = runner.log.clone();
    let mut gathered = Vec::new();

    for (pattern, spec) in remote.artifacts.iter() {
        validate_pattern(pattern)?;

        // See whether anything matches before invoking the transfer.
        let listing = capture_ssh(host, &format!("ls -A1 {remote_dir}/{pattern}")).await?;
        let Some(listing) = listing else {
            continue;
        };

        for remote_file in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let status = run_process(
                "rsync",
                &[
                    "-a".to_string(),
                    format!("{host}:{remote_file}"),
                    format!("{}/", runner.results_dir.display()),
                ],
                &log,
            )
            .await?;
            if status != 0 {
                return Err(BuildError::Integration(format!(
                    "error retrieving remote artifact {remote_file}"
                )));
            }

            let name = Path::new(remote_file)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| remote_file.to_string());

            gathered.push(name.clone());
            runner.artifacts.add(&name, spec_metadata(spec.as_ref()));
        }
    }

    log.write_line("\nGathered artifacts:").await;
    for name in &gathered {
        log.write_line(&format!("- found {name}")).await;
    }

    Ok(())
}

/// Run a command on the remote host, streaming output into the step log.
async fn run_ssh(host: &str, cmd: &str, log: &StepLog) -> Result<i32, BuildError> {
    run_process("ssh", &[host.to_string(), cmd.to_string()], log).await
}

/// Run a command on the remote host and return its stdout, or None when it
/// exits non-zero.
async fn capture_ssh(host: &str, cmd: &str) -> Result<Option<String>, BuildError> {
    let output = tokio::process::Command::new("ssh")
        .arg(host)
        .arg(cmd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BuildError::Integration(format!("could not invoke ssh: {e}")))?;

    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
}

async fn run_process(program: &str, args: &[String], log: &StepLog) -> Result<i32, BuildError> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BuildError::Integration(format!("could not invoke {program}: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_log = log.clone();
    let out_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_log.write_line(&line).await;
            }
        }
    });

    let err_log = log.clone();
    let err_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err_log.write_line(&line).await;
            }
        }
    });

    let status = child
        .wait()
        .await
        .map_err(|e| BuildError::Integration(e.to_string()))?;
    let _ = out_task.await;
    let _ = err_task.await;

    Ok(status.code().unwrap_or(-1))
}
