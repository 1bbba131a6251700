use std::path::Path;
use std::process::Command;

/// Source control information for the build directory, probed once at startup.
///
/// The probe shells out to git; a directory without a usable repository gets
/// placeholder values so builds can still run from exported trees.
#[derive(Debug, Clone)]
pub struct VcsInfo {
    /// Repository name, taken from the top level directory name.
    pub name: String,
    pub branch: String,
    /// Number of commits reachable from HEAD.
    pub number: u64,
    /// Full commit id.
    pub id: String,
    /// First seven characters of the commit id.
    pub short_id: String,
    /// Whether the working tree has uncommitted changes.
    pub modified: bool,
    /// Closest tag description, falling back to the commit id.
    pub release: String,
}

impl Default for VcsInfo {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            branch: "unknown".to_string(),
            number: 0,
            id: "unknown".to_string(),
            short_id: "unknown".to_string(),
            modified: false,
            release: "unknown".to_string(),
        }
    }
}

fn git_output(build_dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(build_dir)
        .args(args)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Probe the given build directory for source control information.
pub fn detect(build_dir: &Path) -> VcsInfo {
    let mut info = VcsInfo::default();

    let Some(toplevel) = git_output(build_dir, &["rev-parse", "--show-toplevel"]) else {
        return info;
    };

    if let Some(name) = Path::new(&toplevel).file_name() {
        info.name = name.to_string_lossy().to_string();
    }

    if let Some(id) = git_output(build_dir, &["rev-parse", "HEAD"]) {
        info.short_id = id.chars().take(7).collect();
        info.id = id;
    }

    if let Some(branch) = git_output(build_dir, &["rev-parse", "--abbrev-ref", "HEAD"]) {
        info.branch = branch;
    }

    if let Some(count) = git_output(build_dir, &["rev-list", "--count", "HEAD"]) {
        info.number = count.parse().unwrap_or(0);
    }

    // status --porcelain emits nothing for a clean tree, so the helper's
    // empty-output-is-None behavior gives us the modified flag directly.
    info.modified = Command::new("git")
        .arg("-C")
        .arg(build_dir)
        .args(["status", "--porcelain"])
        .output()
        .map(|out| !out.stdout.is_empty())
        .unwrap_or(false);

    info.release = git_output(build_dir, &["describe", "--tags", "--always"])
        .unwrap_or_else(|| info.short_id.clone());

    info
}

impl VcsInfo {
    /// A deterministic identifier combining branch, short commit id, a
    /// modified marker, and the build number.
    pub fn build_id(&self, build_number: u64) -> String {
        let modified = if self.modified { "-M" } else { "" };
        format!(
            "{}-{}{}-{}",
            self.branch, self.short_id, modified, build_number
        )
    }
}

/// Force a string into something Docker will accept as a tag: lowercased, any
/// disallowed character replaced with an underscore, truncated to 128 chars.
pub fn sanitize_tag(tag: &str) -> String {
    let mut sanitized: String = tag
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    // A tag may not begin with a period or a dash.
    while sanitized.starts_with('.') || sanitized.starts_with('-') {
        sanitized.remove(0);
    }

    sanitized.truncate(128);
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_includes_modified_marker() {
        let mut info = VcsInfo {
            branch: "main".to_string(),
            short_id: "abc1234".to_string(),
            ..Default::default()
        };

        assert_eq!(info.build_id(42), "main-abc1234-42");

        info.modified = true;
        assert_eq!(info.build_id(42), "main-abc1234-M-42");
    }

    #[test]
    fn sanitize_tag_replaces_invalid_chars() {
        assert_eq!(sanitize_tag("Feature/My Branch"), "feature_my_branch");
        assert_eq!(sanitize_tag(".hidden"), "hidden");
        assert_eq!(sanitize_tag("ok-1.2.3"), "ok-1.2.3");
    }

    #[test]
    fn sanitize_tag_truncates() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_tag(&long).len(), 128);
    }

    #[test]
    fn detect_outside_repository_returns_placeholder() {
        let info = detect(Path::new("/"));
        assert_eq!(info.name, "unknown");
        assert_eq!(info.number, 0);
    }
}
