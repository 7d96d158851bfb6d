//! Spec equivalence checks
//!
//! Hashes from the builder are authoritative. When either side cannot be
//! hashed both sides fall back to normalization, so a comparison never mixes
//! a hash with a normalized form.

use crate::builder::SpaceBuilder;
use crate::identity::cache::BoundedCache;
use crate::identity::normalize::{normalize, NormalizedSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default number of memoized specs
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Decides whether two spec texts describe the same environment
pub struct IdentityComparator {
    builder: Arc<dyn SpaceBuilder>,
    volatile_prefixes: Vec<String>,
    normalized: BoundedCache<String, Arc<NormalizedSpec>>,
    hashes: BoundedCache<(PathBuf, String), String>,
}

impl IdentityComparator {
    pub fn new(
        builder: Arc<dyn SpaceBuilder>,
        volatile_prefixes: Vec<String>,
        normalized: BoundedCache<String, Arc<NormalizedSpec>>,
        hashes: BoundedCache<(PathBuf, String), String>,
    ) -> Self {
        Self {
            builder,
            volatile_prefixes,
            normalized,
            hashes,
        }
    }

    /// Comparator with caches of `cache_capacity` entries each
    pub fn with_capacity(
        builder: Arc<dyn SpaceBuilder>,
        volatile_prefixes: Vec<String>,
        cache_capacity: usize,
    ) -> Self {
        Self::new(
            builder,
            volatile_prefixes,
            BoundedCache::new(cache_capacity),
            BoundedCache::new(cache_capacity),
        )
    }

    /// Whether spec A and spec B denote the same environment
    pub async fn matches(&self, a_text: &str, a_path: &Path, b_text: &str, b_path: &Path) -> bool {
        match (self.hash(a_text, a_path).await, self.hash(b_text, b_path).await) {
            (Some(a), Some(b)) => a == b,
            _ => {
                let a = self.normalized(a_text);
                let b = self.normalized(b_text);
                a.equivalent(&b)
            }
        }
    }

    async fn hash(&self, text: &str, path: &Path) -> Option<String> {
        let key = (path.to_path_buf(), text.to_string());
        if let Some(hash) = self.hashes.get(&key) {
            return Some(hash);
        }

        match self.builder.hash(text, path).await {
            Ok(hash) => {
                self.hashes.insert(key, hash.clone());
                Some(hash)
            }
            Err(e) => {
                debug!("Hashing {} failed, using normalized comparison: {}", path.display(), e);
                None
            }
        }
    }

    fn normalized(&self, text: &str) -> Arc<NormalizedSpec> {
        self.normalized.get_or_insert_with(text.to_string(), || {
            Arc::new(normalize(text, &self.volatile_prefixes))
        })
    }

    /// Number of memoized normalized specs
    pub fn cached_specs(&self) -> usize {
        self.normalized.len()
    }
}
