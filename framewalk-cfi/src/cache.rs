use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Cie, CfiError};

/// Parsed CIEs of one section, keyed by their section offset.
///
/// Lookups take a shared lock. A missing CIE is parsed outside of any lock and then inserted
/// under the exclusive lock. If two threads race to parse the same CIE, the first insert wins and
/// both observe the same [`Arc`].
#[derive(Debug, Default)]
pub struct CieCache {
    entries: RwLock<HashMap<u64, Arc<Cie>>>,
}

impl CieCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached CIE at `offset`, if it was parsed before.
    pub fn get(&self, offset: u64) -> Option<Arc<Cie>> {
        self.entries.read().get(&offset).cloned()
    }

    /// Returns the CIE at `offset`, parsing it with `parse` on first use.
    ///
    /// Errors are not cached, a later call retries the parse.
    pub fn get_or_try_insert<F>(&self, offset: u64, parse: F) -> Result<Arc<Cie>, CfiError>
    where
        F: FnOnce() -> Result<Cie, CfiError>,
    {
        if let Some(cie) = self.get(offset) {
            return Ok(cie);
        }

        let cie = Arc::new(parse()?);
        let mut entries = self.entries.write();
        Ok(Arc::clone(entries.entry(offset).or_insert(cie)))
    }

    /// The number of cached CIEs.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no CIE has been parsed yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops all cached CIEs.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
