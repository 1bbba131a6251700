use crate::docker::runner::ContainerRunner;
use crate::errors::BuildError;
use crate::logs::StepLog;
use crate::manifest::ProvisionersSpec;
use std::path::Path;

/// A provisioner prepares a running container before or instead of the
/// step's commands. Failure of any provisioner fails the step.
#[derive(Debug)]
pub enum Provisioner {
    /// A shell script from the source tree, uploaded and executed.
    Shell { script: String, args: String },
    /// An inline salt state tree applied with a local highstate run.
    Salt { states: serde_yaml::Value },
}

/// Materialize provisioner configuration into runnable provisioners.
pub fn create_provisioners(
    spec: &ProvisionersSpec,
    build_dir: &Path,
) -> Result<Vec<Provisioner>, BuildError> {
    let mut provisioners = Vec::new();

    if let Some(script_spec) = &spec.shell {
        // The value is a script path, optionally followed by arguments.
        let mut parts = script_spec.split_whitespace();
        let script_path = parts
            .next()
            .ok_or_else(|| BuildError::Config("shell provisioner needs a script path".to_string()))?;
        let args = parts.collect::<Vec<&str>>().join(" ");

        let local = build_dir.join(script_path);
        let script = std::fs::read_to_string(&local).map_err(|_| {
            BuildError::Config(format!(
                "cannot find shell provisioner script at '{}'",
                local.display()
            ))
        })?;

        provisioners.push(Provisioner::Shell { script, args });
    }

    if let Some(states) = &spec.salt {
        provisioners.push(Provisioner::Salt {
            states: states.clone(),
        });
    }

    Ok(provisioners)
}

impl Provisioner {
    pub async fn provision(
        &self,
        runner: &ContainerRunner,
        log: &StepLog,
    ) -> Result<(), BuildError> {
        match self {
            Provisioner::Shell { script, args } => {
                log.write_line("Running shell provisioner...").await;
                let exit_code = runner.run_script(script, args, Some(log)).await?;
                if exit_code != 0 {
                    return Err(BuildError::Execution(
                        "shell provisioner failed".to_string(),
                    ));
                }
                Ok(())
            }
            Provisioner::Salt { states } => {
                log.write_line("Running salt provisioner...").await;

                let exit_code = runner.run("salt-call --version", None).await?;
                if exit_code != 0 {
                    return Err(BuildError::Execution(
                        "salt provisioner requires salt-call in the image".to_string(),
                    ));
                }

                // Render a throwaway file root holding the state tree and
                // apply it locally.
                let file_root = format!("/tmp/salt-{}", uuid::Uuid::new_v4());
                let rendered = serde_yaml::to_string(states)
                    .map_err(|e| BuildError::Internal(e.to_string()))?;

                runner
                    .write_file(&format!("{file_root}/top.sls"), b"base: {\"*\": [\"dr\"]}\n")
                    .await?;
                runner
                    .write_file(&format!("{file_root}/dr.sls"), rendered.as_bytes())
                    .await?;

                let sudo = if runner.run("sudo -h", None).await? == 0 {
                    "sudo "
                } else {
                    ""
                };

                let exit_code = runner
                    .run(
                        &format!(
                            "{sudo}salt-call --local --file-root={file_root} state.highstate"
                        ),
                        Some(log),
                    )
                    .await?;
                if exit_code != 0 {
                    return Err(BuildError::Execution(
                        "unable to provision with salt".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn shell_provisioner_reads_script_from_source() {
        let mut rng = rand::thread_rng();
        let id: u16 = rng.gen();
        let base = std::env::temp_dir().join(format!("buildrunner_tests_prov_{id}"));
        std::fs::create_dir_all(base.join("scripts")).unwrap();
        std::fs::write(base.join("scripts/setup.sh"), b"#!/bin/sh\necho ready\n").unwrap();

        let spec = ProvisionersSpec {
            shell: Some("scripts/setup.sh --fast".to_string()),
            salt: None,
        };

        let provisioners = create_provisioners(&spec, &base).unwrap();
        assert_eq!(provisioners.len(), 1);
        match &provisioners[0] {
            Provisioner::Shell { script, args } => {
                assert!(script.contains("echo ready"));
                assert_eq!(args, "--fast");
            }
            other => panic!("expected shell provisioner, got {other:?}"),
        }

        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn missing_script_is_a_config_error() {
        let spec = ProvisionersSpec {
            shell: Some("does/not/exist.sh".to_string()),
            salt: None,
        };
        let err = create_provisioners(&spec, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn salt_states_pass_through() {
        let states: serde_yaml::Value = serde_yaml::from_str("nginx:\n  pkg.installed\n").unwrap();
        let spec = ProvisionersSpec {
            shell: None,
            salt: Some(states),
        };
        let provisioners = create_provisioners(&spec, Path::new("/tmp")).unwrap();
        assert!(matches!(provisioners[0], Provisioner::Salt { .. }));
    }
}
