use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const CACHE_ARCHIVE_EXT: &str = "tar";

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("could not access cache archive; {0}")]
    Io(#[from] std::io::Error),
}

/// Host side archive backed cache store. Archives are shared across
/// concurrent builds, so every write lands in a sibling temp file first and
/// is moved into place with an atomic rename.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: PathBuf) -> Self {
        CacheStore { root }
    }

    /// The archive file a given cache key maps to. A project name prefixes
    /// the file so unrelated repositories sharing a caches root do not
    /// collide.
    pub fn archive_file(&self, key: &str, project: &str) -> PathBuf {
        let file_name = if project.is_empty() {
            format!("{key}.{CACHE_ARCHIVE_EXT}")
        } else {
            format!("{project}-{key}.{CACHE_ARCHIVE_EXT}")
        };
        self.root.join(file_name)
    }

    /// Find the archive to restore for an ordered key list. Exact matches
    /// win; otherwise the most recently modified archive sharing the key as
    /// a prefix is taken; a key with no match falls through to the next.
    pub fn resolve_restore(&self, keys: &[String], project: &str) -> Option<PathBuf> {
        for key in keys {
            let exact = self.archive_file(key, project);
            if exact.is_file() {
                debug!(archive = %exact.display(), "Found exact cache match");
                return Some(exact);
            }

            if let Some(found) = self.newest_prefix_match(&exact) {
                debug!(archive = %found.display(), "Found cache prefix match");
                return Some(found);
            }
        }
        None
    }

    fn newest_prefix_match(&self, wanted: &Path) -> Option<PathBuf> {
        let stem = wanted.file_stem()?.to_string_lossy().to_string();
        let entries = fs::read_dir(&self.root).ok()?;

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&stem) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match &newest {
                Some((best, _)) if *best >= modified => {}
                _ => newest = Some((modified, path)),
            }
        }

        newest.map(|(_, path)| path)
    }

    /// Write archive bytes for the given key. The archive only becomes
    /// visible to other readers once fully written.
    pub fn save(&self, key: &str, project: &str, contents: &[u8]) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&self.root)?;
        let destination = self.archive_file(key, project);

        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        temp.write_all(contents)?;
        temp.flush()?;
        temp.persist(&destination).map_err(|e| e.error)?;

        Ok(destination)
    }

    /// Append a line to the cache history log next to the archives. History
    /// is advisory; failures only warn.
    pub fn append_history(&self, line: &str) {
        let history = self.root.join("cache_history.log");
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!(error = %err, "could not append to cache history log");
        }
    }

    /// Remove every archive under the caches root.
    pub fn clean(&self) -> Result<(), CacheError> {
        if self.root.exists() {
            info!(root = %self.root.display(), "Cleaning cache dir");
            fs::remove_dir_all(&self.root)?;
        } else {
            info!(root = %self.root.display(), "Cache dir is already clean");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::time::Duration;

    struct TestHarness {
        store: CacheStore,
        path: PathBuf,
    }

    impl TestHarness {
        fn new() -> Self {
            let mut rng = rand::thread_rng();
            let append_num: u16 = rng.gen();
            let path = std::env::temp_dir().join(format!("buildrunner_tests_cache_{append_num}"));
            fs::create_dir_all(&path).unwrap();
            Self {
                store: CacheStore::new(path.clone()),
                path,
            }
        }

        fn touch(&self, name: &str, age: Duration) {
            let path = self.path.join(name);
            fs::write(&path, b"archive").unwrap();
            let mtime = SystemTime::now() - age;
            let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.set_modified(mtime).unwrap();
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn save_then_exact_restore() {
        let harness = TestHarness::new();

        let saved = harness.store.save("m2repo", "", b"cache bytes").unwrap();
        assert!(saved.ends_with("m2repo.tar"));

        let restored = harness
            .store
            .resolve_restore(&["m2repo".to_string()], "")
            .unwrap();
        assert_eq!(restored, saved);
        assert_eq!(fs::read(restored).unwrap(), b"cache bytes");
    }

    #[test]
    fn prefix_match_picks_newest() {
        let harness = TestHarness::new();
        harness.touch("m2repo-abc.tar", Duration::from_secs(600));
        harness.touch("m2repo-def.tar", Duration::from_secs(60));

        let restored = harness
            .store
            .resolve_restore(&["m2repo-zzz".to_string(), "m2repo-".to_string()], "")
            .unwrap();
        assert!(restored.ends_with("m2repo-def.tar"));
    }

    #[test]
    fn keys_are_walked_in_order() {
        let harness = TestHarness::new();
        harness.touch("second.tar", Duration::from_secs(1));
        harness.touch("first.tar", Duration::from_secs(600));

        // The older archive still wins because its key comes first.
        let restored = harness
            .store
            .resolve_restore(&["first".to_string(), "second".to_string()], "")
            .unwrap();
        assert!(restored.ends_with("first.tar"));
    }

    #[test]
    fn no_match_returns_none() {
        let harness = TestHarness::new();
        assert!(harness
            .store
            .resolve_restore(&["missing".to_string()], "")
            .is_none());
    }

    #[test]
    fn project_name_prefixes_archive() {
        let harness = TestHarness::new();
        let file = harness.store.archive_file("m2repo", "widget");
        assert!(file.ends_with("widget-m2repo.tar"));
    }

    #[test]
    fn clean_removes_archives() {
        let harness = TestHarness::new();
        harness.store.save("m2repo", "", b"bytes").unwrap();
        harness.store.clean().unwrap();
        assert!(!harness.path.exists());
    }
}
