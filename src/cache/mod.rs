//! Device-local key/value storage that survives restarts.
//!
//! Keys are single-writer: nothing here guards against two processes writing
//! the same key.

pub mod file;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use file::FileCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error on key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed value under {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait LocalCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

pub fn get_json<T: DeserializeOwned>(
    cache: &dyn LocalCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CacheError::Malformed {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(cache: &dyn LocalCache, key: &str, value: &T) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value).map_err(|source| CacheError::Malformed {
        key: key.to_string(),
        source,
    })?;
    cache.set(key, &raw)
}

#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{get_json, set_json, LocalCache, MemoryCache};

    #[test]
    fn memory_cache_get_set_remove() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").unwrap(), None);

        cache.set("k", "v1").unwrap();
        cache.set("k", "v2").unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v2"));

        cache.remove("k").unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn malformed_json_is_reported() {
        let cache = MemoryCache::new();
        cache.set("numbers", "not json").unwrap();

        let result = get_json::<Vec<u32>>(&cache, "numbers");
        assert!(result.is_err());

        set_json(&cache, "numbers", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(get_json::<Vec<u32>>(&cache, "numbers").unwrap(), Some(vec![1, 2, 3]));
    }
}
