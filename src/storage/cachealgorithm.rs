//! Cache admission and eviction
//!
//! A miss served through the connection consults this algorithm: admit when
//! the file fits the cache at all and passes the relevance check, evicting
//! the oldest rarely-used residents if headroom is short. When even full
//! eviction of eligible files cannot make room, the cache is left untouched.

use std::rc::Rc;

use crate::storage::files::{RequestedFile, StoredFile};
use crate::storage::StorageElement;

/// Residents accessed fewer times than this are eviction candidates.
const FEW_USED_THRESHOLD: u32 = 3;

/// Outcome of an admission decision.
#[derive(Debug, Default)]
pub struct CacheDecision {
    pub admit: bool,
    pub evict: Vec<Rc<StoredFile>>,
}

/// The (admission predicate, eviction strategy) pair.
#[derive(Debug, Clone, Default)]
pub struct CacheAlgorithm;

impl CacheAlgorithm {
    pub fn new() -> Self {
        Self
    }

    /// File-level relevance check; admits everything by default.
    fn relevant(&self, _file: &RequestedFile, _storage: &dyn StorageElement) -> bool {
        true
    }

    /// Decide whether `file` should be cached in `storage` and which
    /// residents have to go first.
    pub fn consider(&self, file: &RequestedFile, storage: &dyn StorageElement) -> CacheDecision {
        if file.filesize > storage.size() || !self.relevant(file, storage) {
            return CacheDecision::default();
        }
        if storage.available() >= file.filesize {
            return CacheDecision {
                admit: true,
                evict: Vec::new(),
            };
        }
        let mut residents = storage.stored_files();
        residents.sort_by(|a, b| {
            a.cachedsince
                .get()
                .partial_cmp(&b.cachedsince.get())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut headroom = storage.available();
        let mut evict = Vec::new();
        for resident in residents {
            if resident.numberofaccesses.get() >= FEW_USED_THRESHOLD {
                continue;
            }
            headroom += resident.filesize;
            evict.push(resident);
            if headroom >= file.filesize {
                return CacheDecision { admit: true, evict };
            }
        }
        CacheDecision::default()
    }
}
