use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

/// Manifest versions from this one on may declare explicit step dependencies.
pub const DEPENDS_MIN_VERSION: f64 = 2.0;

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("cannot find build manifest at {0}")]
    MissingFile(String),

    #[error("could not read build manifest; {0}")]
    Io(#[from] std::io::Error),

    #[error("the build manifest contains malformed yaml; {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid build manifest; {0}")]
    Validation(String),
}

/// A mapping that remembers declaration order. Step and service ordering is
/// semantic, so plain maps will not do.
#[derive(Debug, Clone)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn get(&self, name: &str) -> Option<&V> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.0.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, V)> = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    if entries.iter().any(|(existing, _)| *existing == key) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate entry '{key}'"
                        )));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Docker build context for a step or service. The scalar spelling
/// `build: <path>` is normalized into the path form.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(from = "BuildSpecDe")]
pub struct BuildSpec {
    pub path: Option<String>,
    /// Path to a Dockerfile, or the inline Dockerfile contents.
    pub dockerfile: Option<String>,
    pub target: Option<String>,
    pub pull: Option<bool>,
    pub platform: Option<String>,
    pub platforms: Option<Vec<String>>,
    /// Source glob to in-context destination. Injected files override files
    /// from `path` at the same destination.
    pub inject: BTreeMap<String, Option<String>>,
    pub no_cache: bool,
    pub buildargs: BTreeMap<String, String>,
    pub cache_from: Vec<String>,
    /// Load this archive verbatim instead of building.
    pub import: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BuildSpecDe {
    Path(String),
    Full(BuildSpecMap),
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BuildSpecMap {
    path: Option<String>,
    dockerfile: Option<String>,
    target: Option<String>,
    pull: Option<bool>,
    platform: Option<String>,
    platforms: Option<Vec<String>>,
    #[serde(default)]
    inject: BTreeMap<String, Option<String>>,
    #[serde(rename = "no-cache", default)]
    no_cache: bool,
    #[serde(default)]
    buildargs: BTreeMap<String, String>,
    #[serde(default)]
    cache_from: Vec<String>,
    import: Option<String>,
}

impl From<BuildSpecDe> for BuildSpec {
    fn from(de: BuildSpecDe) -> Self {
        match de {
            BuildSpecDe::Path(path) => BuildSpec {
                path: Some(path),
                ..Default::default()
            },
            BuildSpecDe::Full(map) => BuildSpec {
                path: map.path,
                dockerfile: map.dockerfile,
                target: map.target,
                pull: map.pull,
                platform: map.platform,
                platforms: map.platforms,
                inject: map.inject,
                no_cache: map.no_cache,
                buildargs: map.buildargs,
                cache_from: map.cache_from,
                import: map.import,
            },
        }
    }
}

impl BuildSpec {
    /// The base image of an inline Dockerfile, when one can be determined.
    pub fn dockerfile_base_image(&self) -> Option<String> {
        let dockerfile = self.dockerfile.as_ref()?;
        for line in dockerfile.lines() {
            let trimmed = line.trim();
            if let Some(image) = trimmed
                .strip_prefix("FROM ")
                .or_else(|| trimmed.strip_prefix("from "))
            {
                return Some(image.split_whitespace().next().unwrap_or("").to_string());
            }
        }
        None
    }
}

/// Artifact descriptor attached to a capture pattern. Extra keys ride along
/// as metadata into the sidecar.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ArtifactSpec {
    /// `uncompressed` mirrors a directory verbatim instead of archiving it.
    pub format: Option<String>,
    /// Archive type for directories (`tar` or `zip`), also used as the
    /// artifact type in metadata.
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub compression: Option<String>,
    pub push: Option<bool>,
    pub rename: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// One readiness gate on a service container.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WaitFor {
    Port(u16),
    Spec { port: u16, timeout: Option<u64> },
}

impl WaitFor {
    pub fn port(&self) -> u16 {
        match self {
            WaitFor::Port(port) => *port,
            WaitFor::Spec { port, .. } => *port,
        }
    }

    pub fn timeout(&self) -> Option<u64> {
        match self {
            WaitFor::Port(_) => None,
            WaitFor::Spec { timeout, .. } => *timeout,
        }
    }
}

/// The two accepted cache spellings: `name: /container/path` or
/// `/container/path: [key, ...]`.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum CacheValue {
    Target(String),
    Keys(Vec<String>),
}

/// A container path and the ordered cache keys used to populate it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMount {
    pub target: String,
    pub keys: Vec<String>,
}

/// Normalize the cache map to `{target -> [keys]}`. In the name-to-target
/// form the key doubles as the single cache key.
pub fn normalize_caches(caches: &OrderedMap<CacheValue>) -> Vec<CacheMount> {
    let mut mounts: Vec<CacheMount> = Vec::new();
    for (name, value) in caches.iter() {
        match value {
            CacheValue::Target(target) => mounts.push(CacheMount {
                target: target.clone(),
                keys: vec![name.clone()],
            }),
            CacheValue::Keys(keys) => mounts.push(CacheMount {
                target: name.clone(),
                keys: keys.clone(),
            }),
        }
    }
    mounts
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ProvisionersSpec {
    /// Path to a shell script inside the source tree.
    pub shell: Option<String>,
    /// Inline salt state tree.
    pub salt: Option<serde_yaml::Value>,
}

impl ProvisionersSpec {
    pub fn is_empty(&self) -> bool {
        self.shell.is_none() && self.salt.is_none()
    }
}

/// `cap_add` accepts a single capability or a list.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum CapAdd {
    One(String),
    Many(Vec<String>),
}

impl CapAdd {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            CapAdd::One(cap) => vec![cap.clone()],
            CapAdd::Many(caps) => caps.clone(),
        }
    }
}

/// The run portion of a step: the primary container and its configuration.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    pub image: Option<String>,
    pub cmd: Option<String>,
    pub cmds: Option<Vec<String>>,
    pub provisioners: Option<ProvisionersSpec>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub dns: Option<Vec<String>>,
    pub dns_search: Option<String>,
    #[serde(default)]
    pub extra_hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub caches: OrderedMap<CacheValue>,
    #[serde(default)]
    pub ports: BTreeMap<u16, Option<u16>>,
    #[serde(default)]
    pub volumes_from: Vec<String>,
    pub pull: Option<bool>,
    pub systemd: Option<bool>,
    #[serde(default)]
    pub containers: Vec<String>,
    pub cap_add: Option<CapAdd>,
    pub privileged: Option<bool>,
    pub platform: Option<String>,
    #[serde(default)]
    pub xfail: bool,
    #[serde(default)]
    pub services: OrderedMap<ServiceSpec>,
    #[serde(rename = "ssh-keys", default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub artifacts: OrderedMap<Option<ArtifactSpec>>,
    #[serde(rename = "post-build")]
    pub post_build: Option<BuildSpec>,
    #[serde(rename = "no-cache", default)]
    pub no_cache: bool,
}

impl RunSpec {
    /// Stringified environment entries. Manifest values may be scalars of any
    /// type; containers only see strings.
    pub fn env_strings(&self) -> BTreeMap<String, String> {
        env_value_strings(&self.env)
    }
}

/// A linked service container supporting the primary container of a run step.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    pub cmd: Option<String>,
    pub provisioners: Option<ProvisionersSpec>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub dns: Option<Vec<String>>,
    pub dns_search: Option<String>,
    #[serde(default)]
    pub extra_hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeMap<u16, Option<u16>>,
    #[serde(default)]
    pub volumes_from: Vec<String>,
    pub pull: Option<bool>,
    pub systemd: Option<bool>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub wait_for: Vec<WaitFor>,
    #[serde(rename = "inject-ssh-agent", default)]
    pub inject_ssh_agent: bool,
}

impl ServiceSpec {
    pub fn env_strings(&self) -> BTreeMap<String, String> {
        env_value_strings(&self.env)
    }
}

fn env_value_strings(env: &BTreeMap<String, serde_yaml::Value>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Null => String::new(),
                other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// An image commit/push record. The scalar spelling is a bare
/// `repository[:tag]`; a tag embedded in the repository is split off.
#[derive(Deserialize, Debug, Clone)]
#[serde(from = "PushSpecDe")]
pub struct PushSpec {
    pub repository: String,
    pub tags: Vec<String>,
    pub add_build_tag: bool,
    pub security_scan: Option<crate::conf::SecurityScanOverride>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PushSpecDe {
    Repo(String),
    Full {
        repository: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default = "default_true")]
        add_build_tag: bool,
        #[serde(rename = "security-scan")]
        security_scan: Option<crate::conf::SecurityScanOverride>,
    },
}

fn default_true() -> bool {
    true
}

impl From<PushSpecDe> for PushSpec {
    fn from(de: PushSpecDe) -> Self {
        let (repository, mut tags, add_build_tag, security_scan) = match de {
            PushSpecDe::Repo(repo) => (repo, Vec::new(), true, None),
            PushSpecDe::Full {
                repository,
                tags,
                add_build_tag,
                security_scan,
            } => (repository, tags, add_build_tag, security_scan),
        };

        // Repositories are always lower case; an embedded tag moves to the
        // tag list.
        let mut repository = repository.to_lowercase();
        if let Some(index) = repository.rfind(':') {
            // Distinguish a tag separator from a registry port.
            if !repository[index + 1..].contains('/') {
                let tag = repository[index + 1..].to_string();
                repository.truncate(index);
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }

        PushSpec {
            repository,
            tags,
            add_build_tag,
            security_scan,
        }
    }
}

/// Push/commit accept a scalar, a map, or a list of either.
#[derive(Deserialize, Debug, Clone)]
#[serde(from = "PushListDe")]
pub struct PushList(pub Vec<PushSpec>);

#[derive(Deserialize)]
#[serde(untagged)]
enum PushListDe {
    One(PushSpec),
    Many(Vec<PushSpec>),
}

impl From<PushListDe> for PushList {
    fn from(de: PushListDe) -> Self {
        match de {
            PushListDe::One(push) => PushList(vec![push]),
            PushListDe::Many(pushes) => PushList(pushes),
        }
    }
}

/// A step delegated to a remote build server over ssh.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RemoteSpec {
    /// Build server alias, or a literal `user@host`.
    pub host: String,
    pub cmd: String,
    #[serde(default)]
    pub artifacts: OrderedMap<Option<ArtifactSpec>>,
}

/// Python package upload record. The scalar spelling names the repository.
#[derive(Deserialize, Debug, Clone)]
#[serde(from = "PypiPushSpecDe")]
pub struct PypiPushSpec {
    pub repository: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub skip_existing: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PypiPushSpecDe {
    Repo(String),
    Full {
        repository: String,
        username: Option<String>,
        password: Option<String>,
        #[serde(default)]
        skip_existing: bool,
    },
}

impl From<PypiPushSpecDe> for PypiPushSpec {
    fn from(de: PypiPushSpecDe) -> Self {
        match de {
            PypiPushSpecDe::Repo(repository) => PypiPushSpec {
                repository,
                username: None,
                password: None,
                skip_existing: false,
            },
            PypiPushSpecDe::Full {
                repository,
                username,
                password,
                skip_existing,
            } => PypiPushSpec {
                repository,
                username,
                password,
                skip_existing,
            },
        }
    }
}

/// A named unit of the build manifest, the scheduling atom.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub build: Option<BuildSpec>,
    pub run: Option<RunSpec>,
    pub remote: Option<RemoteSpec>,
    pub commit: Option<PushList>,
    pub push: Option<PushList>,
    #[serde(rename = "pypi-push")]
    pub pypi_push: Option<PypiPushSpec>,
    pub depends: Option<Vec<String>>,
}

impl Step {
    /// Image repositories this step publishes through commit or push.
    pub fn produced_repositories(&self) -> Vec<&str> {
        let mut repos = Vec::new();
        for list in [&self.commit, &self.push].into_iter().flatten() {
            for push in &list.0 {
                repos.push(push.repository.as_str());
            }
        }
        repos
    }

    /// Image references this step consumes, used to infer scheduling edges.
    pub fn referenced_images(&self) -> Vec<String> {
        let mut images = Vec::new();
        if let Some(run) = &self.run {
            if let Some(image) = &run.image {
                images.push(image.clone());
            }
            for (_, service) in run.services.iter() {
                if let Some(image) = &service.image {
                    images.push(image.clone());
                }
            }
        }
        if let Some(build) = &self.build {
            if let Some(image) = build.dockerfile_base_image() {
                images.push(image);
            }
        }
        images
    }
}

/// The normalized build manifest: fully materialized values, no templating.
#[derive(Deserialize, Debug, Clone)]
pub struct Manifest {
    pub version: Option<f64>,
    pub steps: OrderedMap<Step>,
}

impl Manifest {
    pub fn from_str(contents: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(contents)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::MissingFile(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn supports_depends(&self) -> bool {
        self.version.map(|v| v >= DEPENDS_MIN_VERSION).unwrap_or(false)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.steps.is_empty() {
            return Err(ManifestError::Validation(
                "the 'steps' configuration was not provided".to_string(),
            ));
        }

        for (name, step) in self.steps.iter() {
            self.validate_step(name, step)?;
        }

        Ok(())
    }

    fn validate_step(&self, name: &str, step: &Step) -> Result<(), ManifestError> {
        let fail = |msg: String| Err(ManifestError::Validation(msg));

        if step.remote.is_some() {
            if step.build.is_some()
                || step.run.is_some()
                || step.commit.is_some()
                || step.push.is_some()
            {
                return fail(format!(
                    "step '{name}' is remote and may not also define build, run, commit, or push"
                ));
            }
            return Ok(());
        }

        if step.build.is_none() && step.run.is_none() {
            return fail(format!(
                "step '{name}' must define at least one of build, run, or remote"
            ));
        }

        for list in [&step.commit, &step.push].into_iter().flatten() {
            for push in &list.0 {
                if push.repository.is_empty() {
                    return fail(format!("step '{name}' has a push with no repository"));
                }
                if !push.add_build_tag && push.tags.is_empty() {
                    return fail(format!(
                        "step '{name}' push of '{}' disables the build tag but lists no tags",
                        push.repository
                    ));
                }
            }
        }

        if step.depends.is_some() && !self.supports_depends() {
            return fail(format!(
                "step '{name}' uses 'depends' which requires manifest version {DEPENDS_MIN_VERSION} or later"
            ));
        }

        if let Some(run) = &step.run {
            for (service_name, service) in run.services.iter() {
                match (&service.image, &service.build) {
                    (None, None) => {
                        return fail(format!(
                            "service '{service_name}' of step '{name}' must specify an image or build context"
                        ))
                    }
                    (Some(_), Some(_)) => {
                        return fail(format!(
                            "service '{service_name}' of step '{name}' must specify either an image or a build context, not both"
                        ))
                    }
                    _ => {}
                }
            }
        }

        if let Some(build) = &step.build {
            if build.import.is_none()
                && build.path.is_none()
                && build.dockerfile.is_none()
                && build.inject.is_empty()
            {
                return fail(format!(
                    "step '{name}' build must specify a path, dockerfile, or inject attribute"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_preserved() {
        let manifest = Manifest::from_str(
            r#"
steps:
  zeta:
    run:
      image: busybox
      cmd: "true"
  alpha:
    run:
      image: busybox
      cmd: "true"
  midway:
    run:
      image: busybox
      cmd: "true"
"#,
        )
        .unwrap();

        let names: Vec<&String> = manifest.steps.keys().collect();
        assert_eq!(names, ["zeta", "alpha", "midway"]);
    }

    #[test]
    fn build_string_form_is_a_path() {
        let manifest = Manifest::from_str(
            r#"
steps:
  image:
    build: docker/
"#,
        )
        .unwrap();

        let step = manifest.steps.get("image").unwrap();
        assert_eq!(step.build.as_ref().unwrap().path.as_deref(), Some("docker/"));
    }

    #[test]
    fn push_scalar_splits_embedded_tag() {
        let manifest = Manifest::from_str(
            r#"
steps:
  release:
    build:
      dockerfile: |
        FROM scratch
    push: myorg/app:stable
"#,
        )
        .unwrap();

        let step = manifest.steps.get("release").unwrap();
        let pushes = &step.push.as_ref().unwrap().0;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].repository, "myorg/app");
        assert_eq!(pushes[0].tags, vec!["stable"]);
        assert!(pushes[0].add_build_tag);
    }

    #[test]
    fn push_list_form() {
        let manifest = Manifest::from_str(
            r#"
steps:
  release:
    build:
      dockerfile: |
        FROM scratch
    push:
      - repository: myorg/app
        tags: [one, two]
      - myorg/mirror
"#,
        )
        .unwrap();

        let pushes = &manifest.steps.get("release").unwrap().push.as_ref().unwrap().0;
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].tags, vec!["one", "two"]);
        assert_eq!(pushes[1].repository, "myorg/mirror");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let manifest = Manifest::from_str(
            r#"
steps:
  release:
    build:
      dockerfile: |
        FROM scratch
    push: registry.example.com:5000/myorg/app
"#,
        )
        .unwrap();

        let pushes = &manifest.steps.get("release").unwrap().push.as_ref().unwrap().0;
        assert_eq!(pushes[0].repository, "registry.example.com:5000/myorg/app");
        assert!(pushes[0].tags.is_empty());
    }

    #[test]
    fn no_build_tag_with_empty_tags_is_rejected() {
        let err = Manifest::from_str(
            r#"
steps:
  release:
    build:
      dockerfile: |
        FROM scratch
    push:
      repository: myorg/app
      add_build_tag: false
"#,
        )
        .unwrap_err();

        assert!(matches!(err, ManifestError::Validation(_)));
    }

    #[test]
    fn depends_requires_version() {
        let err = Manifest::from_str(
            r#"
steps:
  one:
    run:
      image: busybox
      cmd: "true"
  two:
    depends: [one]
    run:
      image: busybox
      cmd: "true"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));

        Manifest::from_str(
            r#"
version: 2.0
steps:
  one:
    run:
      image: busybox
      cmd: "true"
  two:
    depends: [one]
    run:
      image: busybox
      cmd: "true"
"#,
        )
        .unwrap();
    }

    #[test]
    fn service_requires_image_xor_build() {
        let err = Manifest::from_str(
            r#"
steps:
  test:
    run:
      image: busybox
      cmd: "true"
      services:
        db: {}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));

        let err = Manifest::from_str(
            r#"
steps:
  test:
    run:
      image: busybox
      cmd: "true"
      services:
        db:
          image: postgres
          build: db/
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));
    }

    #[test]
    fn remote_excludes_other_modes() {
        let err = Manifest::from_str(
            r#"
steps:
  off-host:
    remote:
      host: bigbox
      cmd: make all
    run:
      image: busybox
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));
    }

    #[test]
    fn caches_normalize_both_forms() {
        let manifest = Manifest::from_str(
            r#"
steps:
  test:
    run:
      image: maven:3
      cmd: mvn package
      caches:
        maven: /root/.m2
        /root/.ivy2:
          - ivy-exact
          - ivy-
"#,
        )
        .unwrap();

        let run = manifest.steps.get("test").unwrap().run.as_ref().unwrap();
        let mounts = normalize_caches(&run.caches);
        assert_eq!(
            mounts,
            vec![
                CacheMount {
                    target: "/root/.m2".to_string(),
                    keys: vec!["maven".to_string()],
                },
                CacheMount {
                    target: "/root/.ivy2".to_string(),
                    keys: vec!["ivy-exact".to_string(), "ivy-".to_string()],
                },
            ]
        );
    }

    #[test]
    fn wait_for_forms() {
        let manifest = Manifest::from_str(
            r#"
steps:
  test:
    run:
      image: busybox
      cmd: "true"
      services:
        web:
          image: nginx
          wait_for:
            - 8080
            - port: 9090
              timeout: 5
"#,
        )
        .unwrap();

        let run = manifest.steps.get("test").unwrap().run.as_ref().unwrap();
        let service = run.services.get("web").unwrap();
        assert_eq!(service.wait_for[0].port(), 8080);
        assert_eq!(service.wait_for[0].timeout(), None);
        assert_eq!(service.wait_for[1].port(), 9090);
        assert_eq!(service.wait_for[1].timeout(), Some(5));
    }

    #[test]
    fn env_values_are_stringified() {
        let manifest = Manifest::from_str(
            r#"
steps:
  test:
    run:
      image: busybox
      cmd: "true"
      env:
        COUNT: 3
        VERBOSE: true
        NAME: widget
"#,
        )
        .unwrap();

        let run = manifest.steps.get("test").unwrap().run.as_ref().unwrap();
        let env = run.env_strings();
        assert_eq!(env.get("COUNT").map(String::as_str), Some("3"));
        assert_eq!(env.get("VERBOSE").map(String::as_str), Some("true"));
        assert_eq!(env.get("NAME").map(String::as_str), Some("widget"));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let err = Manifest::from_str(
            r#"
steps:
  one:
    run:
      image: busybox
  one:
    run:
      image: busybox
"#,
        )
        .unwrap_err();
        // serde_yaml already refuses duplicate mapping keys.
        assert!(matches!(
            err,
            ManifestError::Parse(_) | ManifestError::Validation(_)
        ));
    }

    #[test]
    fn referenced_images_cover_run_services_and_dockerfile() {
        let manifest = Manifest::from_str(
            r#"
steps:
  test:
    build:
      dockerfile: |
        FROM myorg/base
        RUN true
    run:
      image: myorg/tester
      cmd: "true"
      services:
        db:
          image: myorg/db
"#,
        )
        .unwrap();

        let step = manifest.steps.get("test").unwrap();
        let images = step.referenced_images();
        assert!(images.contains(&"myorg/tester".to_string()));
        assert!(images.contains(&"myorg/db".to_string()));
        assert!(images.contains(&"myorg/base".to_string()));
    }

    #[test]
    fn empty_steps_rejected() {
        let err = Manifest::from_str("steps: {}\n").unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));
    }
}
