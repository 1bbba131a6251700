use config::{Config, FileFormat};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const DEFAULT_GLOBAL_CONFIG: &str = include_str!("./default_global_config.yaml");

pub const DEFAULT_CACHES_ROOT: &str = "~/.buildrunner/caches";
/// Marker for using a throwaway local registry instead of an upstream registry.
pub const LOCAL_BUILD_REGISTRY: &str = "local";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load global configuration; {0}")]
    Load(String),

    #[error("unknown ssh key alias '{0}'")]
    UnknownSshKeyAlias(String),

    #[error("ssh key entry must specify either 'file' or 'key'")]
    InvalidSshKey,
}

/// A single private key the agent proxy may forward into containers.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SshKeyConfig {
    /// Path to a private key file on the host.
    pub file: Option<String>,
    /// Inline private key material.
    pub key: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "prompt-password")]
    pub prompt_password: Option<bool>,
    /// Names steps use to select this key.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Image vulnerability scan settings. Steps may override individual fields on
/// their push records; `merge` resolves the effective settings.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SecurityScanConfig {
    pub enabled: bool,
    pub scanner: String,
    pub version: String,
    #[serde(rename = "cache-dir")]
    pub cache_dir: Option<String>,
    pub config: BTreeMap<String, serde_yaml::Value>,
    #[serde(rename = "max-score-threshold")]
    pub max_score_threshold: Option<f64>,
}

impl Default for SecurityScanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scanner: "trivy".to_string(),
            version: "latest".to_string(),
            cache_dir: None,
            config: BTreeMap::new(),
            max_score_threshold: None,
        }
    }
}

/// Per push overrides for the scan settings. All fields optional.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SecurityScanOverride {
    pub enabled: Option<bool>,
    pub scanner: Option<String>,
    pub version: Option<String>,
    pub config: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(rename = "max-score-threshold")]
    pub max_score_threshold: Option<f64>,
}

impl SecurityScanConfig {
    /// Overlay the push level overrides onto the global settings without
    /// mutating either.
    pub fn merge(&self, overrides: Option<&SecurityScanOverride>) -> SecurityScanConfig {
        let mut merged = self.clone();
        let Some(overrides) = overrides else {
            return merged;
        };

        if let Some(enabled) = overrides.enabled {
            merged.enabled = enabled;
        }
        if let Some(scanner) = &overrides.scanner {
            merged.scanner = scanner.clone();
        }
        if let Some(version) = &overrides.version {
            merged.version = version.clone();
        }
        if let Some(config) = &overrides.config {
            for (key, value) in config {
                merged.config.insert(key.clone(), value.clone());
            }
        }
        if let Some(threshold) = overrides.max_score_threshold {
            merged.max_score_threshold = Some(threshold);
        }
        merged
    }
}

/// Top level global config model.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct GlobalConfig {
    /// Environment entries injected into every container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Alias to remote build host list for the remote step mode.
    #[serde(rename = "build-servers", default)]
    pub build_servers: BTreeMap<String, Vec<String>>,

    #[serde(rename = "ssh-keys", default)]
    pub ssh_keys: Vec<SshKeyConfig>,

    /// Alias to host path (or inline content) for file mounts.
    #[serde(rename = "local-files", default)]
    pub local_files: BTreeMap<String, String>,

    #[serde(rename = "caches-root", default)]
    pub caches_root: String,

    #[serde(rename = "docker-registry", default)]
    pub docker_registry: String,

    #[serde(rename = "temp-dir", default)]
    pub temp_dir: String,

    #[serde(rename = "disable-multi-platform", default)]
    pub disable_multi_platform: bool,

    #[serde(rename = "build-registry", default)]
    pub build_registry: String,

    /// Platform name to the builder instances able to produce it.
    #[serde(rename = "platform-builders", default)]
    pub platform_builders: BTreeMap<String, Vec<String>>,

    #[serde(rename = "security-scan", default)]
    pub security_scan: SecurityScanConfig,
}

impl GlobalConfig {
    /// Load the global configuration by layering the embedded defaults, the
    /// well known user/project files, and an optional explicit override file,
    /// then applying environment variables last.
    pub fn load(build_dir: &Path, path_override: Option<&str>) -> Result<GlobalConfig, ConfigError> {
        let mut builder = Config::builder()
            .add_source(config::File::from_str(DEFAULT_GLOBAL_CONFIG, FileFormat::Yaml));

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".buildrunner.yaml");
            builder = builder.add_source(
                config::File::from(user_config).required(false).format(FileFormat::Yaml),
            );
        }

        match path_override {
            Some(path) => {
                builder = builder
                    .add_source(config::File::with_name(path).required(true).format(FileFormat::Yaml));
            }
            None => {
                let project_config = build_dir.join(".buildrunner.yaml");
                builder = builder.add_source(
                    config::File::from(project_config).required(false).format(FileFormat::Yaml),
                );
            }
        }

        let mut parsed = builder
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .try_deserialize::<GlobalConfig>()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        parsed.apply_env_overrides();
        Ok(parsed)
    }

    /// Environment variables always override everything.
    fn apply_env_overrides(&mut self) {
        let overrides: &[(&str, fn(&mut GlobalConfig, String))] = &[
            ("BUILDRUNNER_CACHES_ROOT", |c, v| c.caches_root = v),
            ("BUILDRUNNER_DOCKER_REGISTRY", |c, v| c.docker_registry = v),
            ("BUILDRUNNER_TEMPDIR", |c, v| c.temp_dir = v),
            ("BUILDRUNNER_BUILD_REGISTRY", |c, v| c.build_registry = v),
        ];

        for (name, apply) in overrides {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    apply(self, value);
                }
            }
        }
    }

    /// Expand a leading tilde against the invoking user's home directory.
    pub fn expand_user(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    pub fn caches_root_path(&self) -> PathBuf {
        if self.caches_root.is_empty() {
            Self::expand_user(DEFAULT_CACHES_ROOT)
        } else {
            Self::expand_user(&self.caches_root)
        }
    }

    pub fn temp_dir_path(&self) -> PathBuf {
        if self.temp_dir.is_empty() {
            std::env::temp_dir()
        } else {
            Self::expand_user(&self.temp_dir)
        }
    }

    /// Resolve a remote build server alias to a concrete host. Aliases map to
    /// a list of equivalent hosts; the first entry wins.
    pub fn build_server(&self, alias: &str) -> Option<&str> {
        self.build_servers
            .get(alias)
            .and_then(|hosts| hosts.first())
            .map(|s| s.as_str())
    }

    pub fn local_file(&self, alias: &str) -> Option<&str> {
        self.local_files.get(alias).map(|s| s.as_str())
    }

    /// Collect the key entries matching the given aliases. Every alias must
    /// resolve to at least one configured key.
    pub fn ssh_keys_for_aliases(
        &self,
        aliases: &[String],
    ) -> Result<Vec<SshKeyConfig>, ConfigError> {
        let mut keys = Vec::new();
        for alias in aliases {
            let mut found = false;
            for key in &self.ssh_keys {
                if key.aliases.iter().any(|a| a == alias) {
                    if key.file.is_none() && key.key.is_none() {
                        return Err(ConfigError::InvalidSshKey);
                    }
                    keys.push(key.clone());
                    found = true;
                }
            }
            if !found {
                return Err(ConfigError::UnknownSshKeyAlias(alias.clone()));
            }
        }
        Ok(keys)
    }

    /// Parse `key1=value1,key2=value2` container label strings from the CLI.
    pub fn parse_container_labels(
        labels: Option<&str>,
    ) -> Result<HashMap<String, String>, ConfigError> {
        let mut parsed = HashMap::new();
        let Some(labels) = labels else {
            return Ok(parsed);
        };
        for pair in labels.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::Load(format!(
                    "invalid container label '{pair}', must be key=value"
                )));
            };
            parsed.insert(key.to_string(), value.to_string());
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> GlobalConfig {
        let merged = Config::builder()
            .add_source(config::File::from_str(DEFAULT_GLOBAL_CONFIG, FileFormat::Yaml))
            .add_source(config::File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap();
        merged.try_deserialize().unwrap()
    }

    #[test]
    fn defaults_parse() {
        let config = parse("{}");
        assert_eq!(config.docker_registry, "docker.io");
        assert_eq!(config.build_registry, LOCAL_BUILD_REGISTRY);
        assert!(!config.security_scan.enabled);
        assert_eq!(config.security_scan.scanner, "trivy");
    }

    #[test]
    fn build_server_alias_resolution() {
        let config = parse(
            r#"
build-servers:
  linux-large:
    - builder@bigbox.example.com
    - builder@backup.example.com
"#,
        );
        assert_eq!(
            config.build_server("linux-large"),
            Some("builder@bigbox.example.com")
        );
        assert_eq!(config.build_server("missing"), None);
    }

    #[test]
    fn ssh_key_alias_lookup() {
        let config = parse(
            r#"
ssh-keys:
  - file: /home/user/.ssh/id_rsa
    aliases: [deploy]
"#,
        );
        let keys = config.ssh_keys_for_aliases(&["deploy".to_string()]).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].file.as_deref(), Some("/home/user/.ssh/id_rsa"));

        let err = config
            .ssh_keys_for_aliases(&["nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSshKeyAlias(_)));
    }

    #[test]
    fn scan_config_merge_overlays_fields() {
        let config = parse(
            r#"
security-scan:
  enabled: false
  max-score-threshold: 7.0
"#,
        );
        let overrides = SecurityScanOverride {
            enabled: Some(true),
            max_score_threshold: Some(9.5),
            ..Default::default()
        };
        let merged = config.security_scan.merge(Some(&overrides));
        assert!(merged.enabled);
        assert_eq!(merged.max_score_threshold, Some(9.5));
        // Untouched fields keep their global values.
        assert_eq!(merged.scanner, "trivy");
    }

    #[test]
    fn container_labels_parse() {
        let labels = GlobalConfig::parse_container_labels(Some("team=ci,env=prod")).unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("ci"));
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));

        assert!(GlobalConfig::parse_container_labels(Some("notapair")).is_err());
    }
}
