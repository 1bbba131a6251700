use crate::docker::runner::{ContainerOptions, ContainerRunner, ImageConfig, VolumeBind};
use crate::docker::DockerError;
use crate::logs::StepLog;
use crate::manifest::{ArtifactSpec, OrderedMap};
use bollard::Docker;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Image used to list and archive artifacts out of the source volume. It
/// needs GNU tar for the less common compression codecs.
pub const ARTIFACT_LISTER_IMAGE: &str = "ubuntu:22.04";

/// Results dir as mounted inside the lister container.
const STEP_RESULTS_MOUNT: &str = "/stepresults";
const FILE_INFO_DELIMITER: &str = "~!~";

pub const MANIFEST_FILE: &str = "artifacts.json";

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("artifact pattern '{0}' escapes the source tree")]
    PatternEscapesSource(String),

    #[error("rename is not supported with wildcard patterns; '{0}' is not valid with rename")]
    RenameWithWildcard(String),

    #[error("error gathering artifact {0}")]
    Gather(String),

    #[error("could not write artifact manifest; {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

/// Map a compression codec to the tar flag that produces it.
pub fn compression_flag(codec: &str) -> Option<&'static str> {
    match codec {
        "gz" => Some("--gzip"),
        "bz2" => Some("--bzip2"),
        "xz" => Some("--xz"),
        "lzma" => Some("--lzma"),
        "lzip" => Some("--lzip"),
        "lzop" => Some("--lzop"),
        "z" => Some("-Z"),
        _ => None,
    }
}

/// Patterns resolve inside `/source`; anything absolute or dotted out is
/// refused before a container ever sees it.
pub fn validate_pattern(pattern: &str) -> Result<(), ArtifactError> {
    if pattern.starts_with('/') {
        return Err(ArtifactError::PatternEscapesSource(pattern.to_string()));
    }
    for component in pattern.split('/') {
        if component == ".." {
            return Err(ArtifactError::PatternEscapesSource(pattern.to_string()));
        }
    }
    Ok(())
}

fn yaml_to_json(value: &serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => json!(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!(i)
            } else if let Some(f) = n.as_f64() {
                json!(f)
            } else {
                Value::Null
            }
        }
        serde_yaml::Value::String(s) => json!(s),
        serde_yaml::Value::Sequence(seq) => Value::Array(seq.iter().map(yaml_to_json).collect()),
        serde_yaml::Value::Mapping(map) => {
            let mut object = Map::new();
            for (key, value) in map {
                if let serde_yaml::Value::String(key) = key {
                    object.insert(key.clone(), yaml_to_json(value));
                }
            }
            Value::Object(object)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

/// Merged metadata for one produced artifact.
pub fn spec_metadata(spec: Option<&ArtifactSpec>) -> Map<String, Value> {
    let mut metadata = Map::new();
    let Some(spec) = spec else {
        return metadata;
    };
    if let Some(format) = &spec.format {
        metadata.insert("format".to_string(), json!(format));
    }
    if let Some(artifact_type) = &spec.artifact_type {
        metadata.insert("type".to_string(), json!(artifact_type));
    }
    if let Some(compression) = &spec.compression {
        metadata.insert("compression".to_string(), json!(compression));
    }
    if let Some(push) = spec.push {
        metadata.insert("push".to_string(), json!(push));
    }
    for (key, value) in &spec.extra {
        metadata.insert(key.clone(), yaml_to_json(value));
    }
    metadata
}

/// The artifact sidecar: produced file name to merged metadata. Writing
/// preserves entries from an earlier partial run of the same results dir.
#[derive(Debug, Default, Clone)]
pub struct ArtifactManifest {
    entries: Map<String, Value>,
}

impl ArtifactManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, metadata: Map<String, Value>) {
        self.entries.insert(name.to_string(), Value::Object(metadata));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    /// Write the manifest, merging over any manifest already on disk.
    pub fn write(&self, path: &Path) -> Result<(), ArtifactError> {
        let mut merged = match std::fs::read_to_string(path) {
            Ok(existing) => serde_json::from_str::<Map<String, Value>>(&existing)
                .unwrap_or_default(),
            Err(_) => Map::new(),
        };
        for (key, value) in &self.entries {
            merged.insert(key.clone(), value.clone());
        }
        std::fs::write(path, serde_json::to_string_pretty(&merged)?.as_bytes())?;
        Ok(())
    }
}

impl From<serde_json::Error> for ArtifactError {
    fn from(err: serde_json::Error) -> Self {
        ArtifactError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

/// Build the in-container tar command that archives one directory.
pub fn archive_tar_command(
    artifact_dir: &str,
    dest_name: &str,
    compression: &str,
    output_file: &str,
) -> String {
    let flag = compression_flag(compression).unwrap_or("--auto-compress");
    let base = Path::new(artifact_dir)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| artifact_dir.to_string());
    let parent = Path::new(artifact_dir)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut command = format!("tar {flag} --xform 's|^{base}|{dest_name}|' -cv");
    if !parent.is_empty() && parent != "." {
        command.push_str(&format!(" -C {parent}"));
    }
    command.push_str(&format!(" -f {output_file} {base}"));
    command
}

/// Gathers artifacts from a finished workload into the step results dir.
///
/// The collector runs a helper container that shares the source container's
/// volumes and has the step results dir mounted, so globbing and archiving
/// happen with the exact filesystem state the step produced.
pub struct ArtifactCollector {
    lister: ContainerRunner,
    results_dir: PathBuf,
    step_name: String,
    uid: u32,
    gid: u32,
}

impl ArtifactCollector {
    pub async fn start(
        client: &Arc<Docker>,
        docker_registry: &str,
        source_container: &str,
        results_dir: &Path,
        step_name: &str,
        cwd: &str,
        uid: u32,
        gid: u32,
        labels: &HashMap<String, String>,
    ) -> Result<ArtifactCollector, ArtifactError> {
        let image = format!("{docker_registry}/{ARTIFACT_LISTER_IMAGE}");
        let mut lister = ContainerRunner::new(
            Arc::clone(client),
            ImageConfig::new(&image, false, None),
            None,
        )
        .await?;

        lister
            .start(ContainerOptions {
                shell: Some("/bin/sh".to_string()),
                working_dir: Some(cwd.to_string()),
                volumes_from: vec![source_container.to_string()],
                volumes: vec![VolumeBind {
                    host: results_dir.to_string_lossy().to_string(),
                    container: STEP_RESULTS_MOUNT.to_string(),
                    read_only: false,
                }],
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;

        Ok(ArtifactCollector {
            lister,
            results_dir: results_dir.to_path_buf(),
            step_name: step_name.to_string(),
            uid,
            gid,
        })
    }

    /// Glob each pattern inside the source tree and pull every hit out into
    /// the results dir, applying the configured format rule.
    pub async fn collect(
        &mut self,
        patterns: &OrderedMap<Option<ArtifactSpec>>,
        manifest: &mut ArtifactManifest,
        log: &StepLog,
    ) -> Result<(), ArtifactError> {
        for (pattern, spec) in patterns.iter() {
            validate_pattern(pattern)?;
            let spec = spec.as_ref();

            if spec.and_then(|s| s.rename.as_ref()).is_some() && pattern.contains('*') {
                return Err(ArtifactError::RenameWithWildcard(pattern.clone()));
            }

            let stat_output = format!("{}.out", uuid::Uuid::new_v4());
            let stat_output_local = self.results_dir.join(&stat_output);

            let exit_code = self
                .lister
                .run(
                    &format!(
                        "stat -c \"%n{FILE_INFO_DELIMITER}%F\" {pattern} >{STEP_RESULTS_MOUNT}/{stat_output}"
                    ),
                    Some(log),
                )
                .await?;

            if exit_code == 0 {
                let output = std::fs::read_to_string(&stat_output_local).unwrap_or_default();
                for line in output.lines() {
                    let Some((artifact_file, file_type)) = line.split_once(FILE_INFO_DELIMITER)
                    else {
                        continue;
                    };
                    let is_dir = file_type.trim() == "directory";

                    if is_dir {
                        self.archive_dir(artifact_file, spec, manifest, log).await?;
                    } else {
                        self.archive_single_file(artifact_file, spec, manifest, log)
                            .await?;
                    }
                }
            }

            if stat_output_local.exists() {
                let _ = std::fs::remove_file(&stat_output_local);
            }
        }

        Ok(())
    }

    async fn archive_single_file(
        &self,
        artifact_file: &str,
        spec: Option<&ArtifactSpec>,
        manifest: &mut ArtifactManifest,
        log: &StepLog,
    ) -> Result<(), ArtifactError> {
        let base_name = Path::new(artifact_file)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| artifact_file.to_string());

        let mut metadata = spec_metadata(spec);
        let output_name = match spec.and_then(|s| s.rename.as_ref()) {
            Some(rename) => {
                metadata.insert(
                    "rename".to_string(),
                    json!({"old": artifact_file, "new": rename}),
                );
                rename.clone()
            }
            None => base_name,
        };

        log.write_line(&format!("- found file {artifact_file}")).await;

        let exit_code = self
            .lister
            .run(
                &format!("cp -L {artifact_file} {STEP_RESULTS_MOUNT}/{output_name}"),
                Some(log),
            )
            .await?;
        if exit_code != 0 {
            return Err(ArtifactError::Gather(artifact_file.to_string()));
        }

        self.register(manifest, &output_name, metadata);
        Ok(())
    }

    async fn archive_dir(
        &self,
        artifact_dir: &str,
        spec: Option<&ArtifactSpec>,
        manifest: &mut ArtifactManifest,
        log: &StepLog,
    ) -> Result<(), ArtifactError> {
        if spec.and_then(|s| s.format.as_deref()) == Some("uncompressed") {
            return self.mirror_dir(artifact_dir, spec, manifest, log).await;
        }

        let base_name = Path::new(artifact_dir)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| artifact_dir.to_string());

        let mut metadata = spec_metadata(spec);
        let dest_name = match spec.and_then(|s| s.rename.as_ref()) {
            Some(rename) => {
                metadata.insert(
                    "rename".to_string(),
                    json!({"old": artifact_dir, "new": rename}),
                );
                rename.clone()
            }
            None => base_name.clone(),
        };

        let archive_type = spec
            .and_then(|s| s.artifact_type.as_deref())
            .unwrap_or("tar");
        let compression = spec
            .and_then(|s| s.compression.as_deref())
            .unwrap_or("gz");

        let (output_name, command) = if archive_type == "zip" {
            let output_name = format!("{dest_name}.zip");
            (
                output_name.clone(),
                format!("zip -r {STEP_RESULTS_MOUNT}/{output_name} {artifact_dir}"),
            )
        } else {
            let output_name = format!("{dest_name}.tar.{compression}");
            (
                output_name.clone(),
                archive_tar_command(
                    artifact_dir,
                    &dest_name,
                    compression,
                    &format!("{STEP_RESULTS_MOUNT}/{output_name}"),
                ),
            )
        };

        log.write_line(&format!("- found directory {artifact_dir}")).await;
        debug!(command = %command, "archiving directory artifact");

        let exit_code = self.lister.run(&command, Some(log)).await?;
        if exit_code != 0 {
            return Err(ArtifactError::Gather(artifact_dir.to_string()));
        }

        metadata.insert("buildrunner.compressed.directory".to_string(), json!("true"));
        self.register(manifest, &output_name, metadata);
        Ok(())
    }

    /// Mirror a directory's files into the results tree verbatim.
    async fn mirror_dir(
        &self,
        artifact_dir: &str,
        spec: Option<&ArtifactSpec>,
        manifest: &mut ArtifactManifest,
        log: &StepLog,
    ) -> Result<(), ArtifactError> {
        let find_output = format!("{}.out", uuid::Uuid::new_v4());
        let find_output_local = self.results_dir.join(&find_output);

        let exit_code = self
            .lister
            .run(
                &format!("find {artifact_dir} -type f >{STEP_RESULTS_MOUNT}/{find_output}"),
                Some(log),
            )
            .await?;

        if exit_code == 0 {
            let output = std::fs::read_to_string(&find_output_local).unwrap_or_default();
            for file in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let dir_name = Path::new(file)
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();

                let exit_code = self
                    .lister
                    .run(&format!("mkdir -p {STEP_RESULTS_MOUNT}/{dir_name}"), Some(log))
                    .await?;
                if exit_code != 0 {
                    return Err(ArtifactError::Gather(artifact_dir.to_string()));
                }

                let exit_code = self
                    .lister
                    .run(&format!("cp -r {file} {STEP_RESULTS_MOUNT}/{file}"), Some(log))
                    .await?;
                if exit_code != 0 {
                    return Err(ArtifactError::Gather(file.to_string()));
                }

                self.register(manifest, file, spec_metadata(spec));
            }
        }

        if find_output_local.exists() {
            let _ = std::fs::remove_file(&find_output_local);
        }

        Ok(())
    }

    fn register(&self, manifest: &mut ArtifactManifest, name: &str, metadata: Map<String, Value>) {
        // Artifacts flagged push=false are produced but stay out of the
        // sidecar.
        if metadata.get("push").and_then(Value::as_bool) == Some(false) {
            debug!(step = %self.step_name, name, "omitting artifact from sidecar");
            return;
        }
        manifest.add(name, metadata);
    }

    /// Hand the extracted files to the invoking user and tear the helper
    /// container down.
    pub async fn finish(mut self, log: &StepLog) -> Result<(), ArtifactError> {
        let exit_code = self
            .lister
            .run(
                &format!("chown -R {}:{} {STEP_RESULTS_MOUNT}", self.uid, self.gid),
                Some(log),
            )
            .await?;

        self.lister.cleanup().await;

        if exit_code != 0 {
            return Err(ArtifactError::Gather(
                "unable to change ownership of gathered artifacts".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("dist/*.whl").is_ok());
        assert!(validate_pattern("build.log").is_ok());
        assert!(matches!(
            validate_pattern("/etc/passwd"),
            Err(ArtifactError::PatternEscapesSource(_))
        ));
        assert!(matches!(
            validate_pattern("../outside"),
            Err(ArtifactError::PatternEscapesSource(_))
        ));
        assert!(matches!(
            validate_pattern("dist/../../outside"),
            Err(ArtifactError::PatternEscapesSource(_))
        ));
    }

    #[test]
    fn compression_flags() {
        assert_eq!(compression_flag("gz"), Some("--gzip"));
        assert_eq!(compression_flag("bz2"), Some("--bzip2"));
        assert_eq!(compression_flag("xz"), Some("--xz"));
        assert_eq!(compression_flag("lzip"), Some("--lzip"));
        assert_eq!(compression_flag("z"), Some("-Z"));
        assert_eq!(compression_flag("rar"), None);
    }

    #[test]
    fn tar_command_shape() {
        let command = archive_tar_command(
            "reports/coverage",
            "coverage",
            "gz",
            "/stepresults/coverage.tar.gz",
        );
        assert_eq!(
            command,
            "tar --gzip --xform 's|^coverage|coverage|' -cv -C reports -f /stepresults/coverage.tar.gz coverage"
        );

        let command = archive_tar_command("flat", "renamed", "xz", "/stepresults/renamed.tar.xz");
        assert_eq!(
            command,
            "tar --xz --xform 's|^flat|renamed|' -cv -f /stepresults/renamed.tar.xz flat"
        );
    }

    #[test]
    fn manifest_merges_on_write() {
        let mut rng = rand::thread_rng();
        let id: u16 = rng.gen();
        let dir = std::env::temp_dir().join(format!("buildrunner_tests_artifacts_{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(MANIFEST_FILE);

        let mut first = ArtifactManifest::new();
        first.add("a.tar.gz", Map::new());
        first.write(&path).unwrap();

        let mut second = ArtifactManifest::new();
        second.add("b.log", Map::new());
        second.write(&path).unwrap();

        let merged: Map<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(merged.contains_key("a.tar.gz"));
        assert!(merged.contains_key("b.log"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn spec_metadata_carries_extras() {
        let spec: ArtifactSpec = serde_yaml::from_str(
            r#"
type: python-sdist
push: true
owner: platform-team
"#,
        )
        .unwrap();

        let metadata = spec_metadata(Some(&spec));
        assert_eq!(metadata.get("type"), Some(&json!("python-sdist")));
        assert_eq!(metadata.get("push"), Some(&json!(true)));
        assert_eq!(metadata.get("owner"), Some(&json!("platform-team")));
    }

    #[test]
    fn identical_input_produces_identical_manifest() {
        let mut first = ArtifactManifest::new();
        let mut second = ArtifactManifest::new();
        for manifest in [&mut first, &mut second] {
            let mut metadata = Map::new();
            metadata.insert("type".to_string(), json!("log"));
            manifest.add("build.log", metadata);
        }
        assert_eq!(
            serde_json::to_string(first.entries()).unwrap(),
            serde_json::to_string(second.entries()).unwrap()
        );
    }
}
