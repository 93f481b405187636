//! A small bounded cache of ensemble results.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};

use crate::{config::CacheConfig, preprocess::PreprocessPreset, prelude::*};

use super::EnsembleResult;

/// Identifies one ensemble run: what we looked at and how.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CacheKey {
    content_sha256: String,
    mime_type: String,
    engines: Option<Vec<String>>,
    preset: Option<PreprocessPreset>,
}

impl CacheKey {
    pub fn new(
        content: &[u8],
        mime_type: &str,
        engines: Option<&[String]>,
        preset: Option<PreprocessPreset>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self {
            content_sha256: hex::encode(hasher.finalize()),
            mime_type: mime_type.to_owned(),
            engines: engines.map(<[String]>::to_vec),
            preset,
        }
    }
}

/// Cache with a size limit and a time-to-live. At capacity, the oldest entry
/// is evicted.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (Instant, EnsembleResult)>>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            ttl: Duration::from_secs(config.ttl_secs),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a fresh entry.
    pub fn get(&self, key: &CacheKey) -> Option<EnsembleResult> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<EnsembleResult> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.retain(|_, (inserted, _)| now.duration_since(*inserted) < self.ttl);
        entries.get(key).map(|(_, result)| result.clone())
    }

    /// Store a result.
    pub fn insert(&self, key: CacheKey, result: EnsembleResult) {
        self.insert_at(key, result, Instant::now());
    }

    fn insert_at(&self, key: CacheKey, result: EnsembleResult, now: Instant) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (inserted, _))| *inserted)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                trace!(?oldest, "Evicting cached ensemble result");
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (now, result));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::tests::ensemble_of;

    fn cache(capacity: usize, ttl_secs: u64) -> ResultCache {
        ResultCache::new(&CacheConfig {
            enabled: true,
            capacity,
            ttl_secs,
        })
    }

    #[test]
    fn keys_depend_on_everything() {
        let base = CacheKey::new(b"doc", "image/png", None, None);
        assert_eq!(base, CacheKey::new(b"doc", "image/png", None, None));
        assert_ne!(base, CacheKey::new(b"doc2", "image/png", None, None));
        assert_ne!(base, CacheKey::new(b"doc", "image/jpeg", None, None));
        assert_ne!(
            base,
            CacheKey::new(b"doc", "image/png", Some(&["paddle".to_owned()]), None)
        );
        assert_ne!(
            base,
            CacheKey::new(b"doc", "image/png", None, Some(PreprocessPreset::Minimal))
        );
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let cache = cache(2, 3600);
        let start = Instant::now();
        let key = |s: &str| CacheKey::new(s.as_bytes(), "image/png", None, None);
        cache.insert_at(key("a"), ensemble_of(0.9), start);
        cache.insert_at(key("b"), ensemble_of(0.8), start + Duration::from_secs(1));
        cache.insert_at(key("c"), ensemble_of(0.7), start + Duration::from_secs(2));
        assert_eq!(cache.len(), 2);
        let now = start + Duration::from_secs(3);
        assert!(cache.get_at(&key("a"), now).is_none());
        assert_eq!(cache.get_at(&key("b"), now).unwrap().confidence, 0.8);
        assert_eq!(cache.get_at(&key("c"), now).unwrap().confidence, 0.7);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = cache(8, 60);
        let start = Instant::now();
        let key = CacheKey::new(b"a", "image/png", None, None);
        cache.insert_at(key.clone(), ensemble_of(0.9), start);
        assert!(cache.get_at(&key, start + Duration::from_secs(59)).is_some());
        assert!(cache.get_at(&key, start + Duration::from_secs(60)).is_none());
        assert_eq!(cache.len(), 0);
    }
}
