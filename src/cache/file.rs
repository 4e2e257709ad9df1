use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::cache::{CacheError, LocalCache};

/// One file per key under a root directory. Writes go through a temp file
/// and a rename so a crash never leaves a half-written value behind.
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| CacheError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key.replace(':', "__")))
    }

    /// Keys never start with '.', so a dot-prefixed temp name cannot clash
    /// with another key's file or temp file.
    fn temp_path_for(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join(format!(".{name}.tmp"))
    }
}

impl LocalCache for FileCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let tmp = self.temp_path_for(&path);
        let io_err = |source| CacheError::Io {
            key: key.to_string(),
            source,
        };

        fs::write(&tmp, value).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileCache;
    use crate::cache::LocalCache;

    #[test]
    fn values_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();

        let cache = FileCache::open(dir.path()).unwrap();
        cache.set("track_log:R1", "[1,2,3]").unwrap();
        drop(cache);

        let reopened = FileCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get("track_log:R1").unwrap().as_deref(), Some("[1,2,3]"));
    }

    #[test]
    fn removing_missing_key_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();

        cache.remove("route_session").unwrap();
        assert_eq!(cache.get("route_session").unwrap(), None);
    }

    #[test]
    fn keys_differing_after_a_dot_keep_separate_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();

        cache.set("track_log:a.b", "first").unwrap();
        cache.set("track_log:a.c", "second").unwrap();
        cache.set("track_log:a", "bare").unwrap();
        cache.set("track_log:a.tmp", "suffixed").unwrap();

        assert_eq!(cache.get("track_log:a.b").unwrap().as_deref(), Some("first"));
        assert_eq!(cache.get("track_log:a.c").unwrap().as_deref(), Some("second"));
        assert_eq!(cache.get("track_log:a").unwrap().as_deref(), Some("bare"));
        assert_eq!(cache.get("track_log:a.tmp").unwrap().as_deref(), Some("suffixed"));

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn path_traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();

        assert!(cache.set("../escape", "x").is_err());
        assert!(cache.get("a/b").is_err());
        assert!(cache.set("", "x").is_err());
    }
}
