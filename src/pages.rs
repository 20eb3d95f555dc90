//! Page Lists Module
//!
//! The SLRU segments: one LRU list per page level (0 = coldest), each with
//! a byte budget fixed at construction. The lists hold keys; entries live
//! in the cache core's key map and carry their current level, so a key is
//! unlinked from the level the entry names.

use std::collections::VecDeque;

use crate::key::CacheKey;

/// One LRU segment. Front = most recently used, back = eviction candidate.
#[derive(Debug)]
struct Page {
    max_size: u64,
    current_size: u64,
    lru: VecDeque<CacheKey>,
}

/// The ordered set of SLRU segments.
#[derive(Debug)]
pub(crate) struct PageSet {
    pages: Vec<Page>,
}

impl PageSet {
    /// Build the segments from per-page byte budgets; the list length
    /// determines the number of levels.
    pub fn new(page_sizes: &[u64]) -> Self {
        let pages = page_sizes
            .iter()
            .map(|&max_size| Page {
                max_size,
                current_size: 0,
                lru: VecDeque::new(),
            })
            .collect();
        Self { pages }
    }

    /// Number of levels.
    pub fn level_count(&self) -> usize {
        self.pages.len()
    }

    /// Highest (hottest) level.
    pub fn top_level(&self) -> usize {
        self.pages.len() - 1
    }

    pub fn max_size(&self, level: usize) -> u64 {
        self.pages[level].max_size
    }

    pub fn current_size(&self, level: usize) -> u64 {
        self.pages[level].current_size
    }

    /// Current byte total across all levels.
    pub fn total_size(&self) -> u64 {
        self.pages.iter().map(|p| p.current_size).sum()
    }

    /// Current accounted bytes of every level, coldest first. Not the
    /// configured budgets; those come from [`PageSet::max_size`].
    pub fn page_byte_totals(&self) -> Vec<u64> {
        self.pages.iter().map(|p| p.current_size).collect()
    }

    /// Link a key at the MRU end of a level, accounting its size.
    pub fn push_front(&mut self, level: usize, key: CacheKey, size: u64) {
        let page = &mut self.pages[level];
        page.lru.push_front(key);
        page.current_size += size;
    }

    /// Unlink a key from a level, releasing its accounted size.
    pub fn unlink(&mut self, level: usize, key: &CacheKey, size: u64) {
        let page = &mut self.pages[level];
        if let Some(pos) = page.lru.iter().position(|k| k == key) {
            page.lru.remove(pos);
            page.current_size = page.current_size.saturating_sub(size);
        }
    }

    /// Oldest key of a level, without unlinking it.
    pub fn peek_back(&self, level: usize) -> Option<&CacheKey> {
        self.pages[level].lru.back()
    }

    /// Keys linked at a level, MRU first.
    pub fn level_keys(&self, level: usize) -> impl Iterator<Item = &CacheKey> {
        self.pages[level].lru.iter()
    }

    /// Adjust the accounted size of a key already linked at `level` after
    /// its payload was replaced in place.
    pub fn resize(&mut self, level: usize, old_size: u64, new_size: u64) {
        let page = &mut self.pages[level];
        page.current_size = page.current_size.saturating_sub(old_size) + new_size;
    }

    /// True when the level is over budget once `reserve` extra bytes are
    /// accounted to it.
    pub fn over_budget(&self, level: usize, reserve: u64) -> bool {
        let page = &self.pages[level];
        page.current_size + reserve > page.max_size
    }

    /// Check size accounting against an authoritative per-key size map.
    /// Used by tests and debug assertions.
    #[cfg(test)]
    pub fn validate_consistency<F>(&self, size_of: F) -> std::result::Result<(), String>
    where
        F: Fn(&CacheKey) -> Option<u64>,
    {
        for (level, page) in self.pages.iter().enumerate() {
            let mut total = 0u64;
            for key in &page.lru {
                match size_of(key) {
                    Some(size) => total += size,
                    None => {
                        return Err(format!("page {} links nonexistent key {}", level, key));
                    }
                }
            }
            if total != page.current_size {
                return Err(format!(
                    "page {} size mismatch: tracked {} vs linked {}",
                    level, page.current_size, total
                ));
            }
        }
        Ok(())
    }
}
