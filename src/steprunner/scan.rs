use super::StepResources;
use crate::conf::{SecurityScanConfig, SecurityScanOverride};
use crate::docker::runner::{ContainerOptions, ContainerRunner, ImageConfig, VolumeBind};
use crate::errors::BuildError;
use crate::logs::StepLog;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub const ARTIFACT_SECURITY_SCAN_KEY: &str = "docker:security-scan";

const DEFAULT_TRIVY_CACHE_DIR: &str = "/root/.cache/trivy";
const CONTAINER_RUN_DIR: &str = "/trivy";

/// Scan an image for vulnerabilities when scanning is enabled, returning the
/// parsed results for the artifact metadata. A max score above the
/// configured threshold fails the step.
pub async fn security_scan(
    resources: &mut StepResources<'_>,
    log: &StepLog,
    repository: &str,
    tag: &str,
    pull: bool,
    push_override: Option<&SecurityScanOverride>,
) -> Result<Option<Value>, BuildError> {
    let merged = resources
        .ctx
        .global
        .security_scan
        .merge(push_override)
        .merge(Some(&resources.ctx.scan_override));

    if !merged.enabled {
        debug!(image = %format!("{repository}:{tag}"), "image scanning is disabled, skipping scan");
        return Ok(None);
    }

    if merged.scanner != "trivy" {
        return Err(BuildError::Config(format!(
            "unsupported scanner {}",
            merged.scanner
        )));
    }

    info!(image = %format!("{repository}:{tag}"), scanner = %merged.scanner, "scanning image for security issues");
    let results = run_trivy(resources, log, &merged, repository, tag, pull).await?;
    Ok(Some(parse_trivy_results(&merged, &results)?))
}

async fn run_trivy(
    resources: &mut StepResources<'_>,
    log: &StepLog,
    config: &SecurityScanConfig,
    repository: &str,
    tag: &str,
    pull: bool,
) -> Result<Value, BuildError> {
    let client = resources.client;
    let ctx = &resources.ctx;

    if pull {
        let mut stream = client.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: format!("{repository}:{tag}"),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| BuildError::Resource(format!("cannot pull image to scan; {e}")))?;
        }
    }

    let run_dir = tempfile::Builder::new()
        .suffix("-trivy-run")
        .tempdir_in(ctx.global.temp_dir_path())
        .map_err(|e| BuildError::Resource(e.to_string()))?;

    let container_cache_dir = config
        .config
        .get("cache-dir")
        .and_then(|value| value.as_str())
        .unwrap_or(DEFAULT_TRIVY_CACHE_DIR)
        .to_string();

    let local_cache_dir = match &config.cache_dir {
        Some(dir) => std::path::PathBuf::from(dir),
        None => ctx.global.temp_dir_path().join("trivy-cache"),
    };
    std::fs::create_dir_all(&local_cache_dir).map_err(|e| BuildError::Resource(e.to_string()))?;

    // Render the scanner's run config with the in-container cache dir.
    let mut scan_config = config.config.clone();
    scan_config.insert(
        "cache-dir".to_string(),
        serde_yaml::Value::String(container_cache_dir.clone()),
    );
    let config_yaml =
        serde_yaml::to_string(&scan_config).map_err(|e| BuildError::Internal(e.to_string()))?;
    std::fs::write(run_dir.path().join("config.yaml"), config_yaml)
        .map_err(|e| BuildError::Resource(e.to_string()))?;

    let image = format!(
        "{}/aquasec/trivy:{}",
        ctx.global.docker_registry, config.version
    );
    let mut scanner = ContainerRunner::new(
        Arc::clone(client),
        ImageConfig::new(&image, false, None),
        Some(log),
    )
    .await?;

    scanner
        .start(ContainerOptions {
            entrypoint: Some(vec!["/bin/sh".to_string()]),
            volumes: vec![
                VolumeBind {
                    host: run_dir.path().to_string_lossy().to_string(),
                    container: CONTAINER_RUN_DIR.to_string(),
                    read_only: false,
                },
                VolumeBind {
                    host: local_cache_dir.to_string_lossy().to_string(),
                    container: container_cache_dir,
                    read_only: false,
                },
                VolumeBind {
                    host: "/var/run/docker.sock".to_string(),
                    container: "/var/run/docker.sock".to_string(),
                    read_only: false,
                },
            ],
            labels: ctx.container_labels.clone(),
            ..Default::default()
        })
        .await?;

    scanner.run("trivy --version", Some(log)).await?;

    let started = std::time::Instant::now();
    let exit_code = scanner
        .run(
            &format!(
                "trivy --config {CONTAINER_RUN_DIR}/config.yaml image -f json -o {CONTAINER_RUN_DIR}/results.json {repository}:{tag}"
            ),
            Some(log),
        )
        .await?;
    info!(
        seconds = started.elapsed().as_secs(),
        "image security scan finished"
    );

    // Results have to be readable by the invoking user before the scanner
    // container goes away.
    let _ = scanner
        .run(
            &format!("chown -R {}:{} {CONTAINER_RUN_DIR}", ctx.uid, ctx.gid),
            None,
        )
        .await;
    scanner.cleanup().await;

    if exit_code != 0 {
        return Err(BuildError::Execution(format!(
            "could not scan {repository}:{tag} with trivy, see errors above"
        )));
    }

    let results_file = run_dir.path().join("results.json");
    let contents = std::fs::read_to_string(&results_file).map_err(|_| {
        BuildError::Execution(format!(
            "results file from trivy for {repository}:{tag} does not exist, check for errors above"
        ))
    })?;

    serde_json::from_str(&contents).map_err(|e| {
        BuildError::Execution(format!(
            "could not read trivy results for {repository}:{tag}; {e}"
        ))
    })
}

/// Reduce the scanner's report to a max score and vulnerability list,
/// enforcing the configured score threshold.
fn parse_trivy_results(
    config: &SecurityScanConfig,
    results: &Value,
) -> Result<Value, BuildError> {
    let mut max_score = 0.0f64;
    let mut vulnerabilities = Vec::new();

    for result in results
        .get("Results")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        let Some(found) = result.get("Vulnerabilities").and_then(Value::as_array) else {
            continue;
        };
        for vulnerability in found {
            let score = vulnerability
                .pointer("/CVSS/nvd/V3Score")
                .and_then(Value::as_f64);
            vulnerabilities.push(json!({
                "cvss_v3_score": score,
                "severity": vulnerability.get("Severity"),
                "vulnerability_id": vulnerability.get("VulnerabilityID"),
                "pkg_name": vulnerability.get("PkgName"),
                "installed_version": vulnerability.get("InstalledVersion"),
                "primary_url": vulnerability.get("PrimaryURL"),
            }));
            if let Some(score) = score {
                max_score = max_score.max(score);
            }
        }
    }

    if let Some(threshold) = config.max_score_threshold {
        if max_score >= threshold {
            return Err(BuildError::Execution(format!(
                "max vulnerability score ({max_score}) is above the configured threshold ({threshold})"
            )));
        }
        info!(max_score, threshold, "max vulnerability score is below the threshold");
    } else {
        debug!(max_score, "no max score threshold is configured");
    }

    Ok(json!({
        "max_score": max_score,
        "vulnerabilities": vulnerabilities,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_config(threshold: Option<f64>) -> SecurityScanConfig {
        SecurityScanConfig {
            enabled: true,
            max_score_threshold: threshold,
            ..Default::default()
        }
    }

    #[test]
    fn results_below_threshold_pass() {
        let results = json!({
            "Results": [
                {"Vulnerabilities": [
                    {"VulnerabilityID": "CVE-1", "Severity": "LOW",
                     "CVSS": {"nvd": {"V3Score": 3.1}}},
                    {"VulnerabilityID": "CVE-2", "Severity": "MEDIUM",
                     "CVSS": {"nvd": {"V3Score": 5.4}}}
                ]}
            ]
        });

        let parsed = parse_trivy_results(&scan_config(Some(7.0)), &results).unwrap();
        assert_eq!(parsed["max_score"], json!(5.4));
        assert_eq!(parsed["vulnerabilities"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn results_above_threshold_fail() {
        let results = json!({
            "Results": [
                {"Vulnerabilities": [
                    {"VulnerabilityID": "CVE-1", "Severity": "CRITICAL",
                     "CVSS": {"nvd": {"V3Score": 9.8}}}
                ]}
            ]
        });

        let err = parse_trivy_results(&scan_config(Some(7.0)), &results).unwrap_err();
        assert!(matches!(err, BuildError::Execution(_)));
    }

    #[test]
    fn empty_results_score_zero() {
        let parsed = parse_trivy_results(&scan_config(None), &json!({})).unwrap();
        assert_eq!(parsed["max_score"], json!(0.0));
    }
}
