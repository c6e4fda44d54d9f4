//! Per-connection prepared statement cache.
//!
//! Maps normalized SQL text to the handle the connection's adapter returned from
//! `prepare`. Bounded; the least recently used entry is evicted and its handle
//! closed on the adapter.

use super::adapter::{Adapter, StatementHandle};
use crate::error::DbResult;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Cache key for `sql`: runs of whitespace outside quoted sections collapse to a
/// single space, leading and trailing whitespace is dropped.
///
/// Quoted sections (`'...'`, `"..."`, `` `...` ``) are copied verbatim, so string
/// literals and quoted identifiers keep their exact spacing. Placeholders are never
/// rewritten.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for ch in sql.chars() {
        match quote {
            Some(q) => {
                out.push(ch);
                // A doubled quote ('') reopens on the next char
                if ch == q {
                    quote = None;
                }
            }
            None if ch.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if matches!(ch, '\'' | '"' | '`') {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    handle: StatementHandle,
    last_used: u64,
}

/// Bounded LRU map from normalized SQL to prepared statement handle.
///
/// Owned by exactly one `Connection`; handles are never shared across connections.
#[derive(Debug)]
pub struct PreparedStatementCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    /// Recency index: use tick -> key. The first entry is the LRU one.
    order: BTreeMap<u64, String>,
    tick: u64,
    stats: CacheStats,
}

impl PreparedStatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Whether a statement equivalent to `sql` is cached.
    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(&normalize_sql(sql))
    }

    fn touch(&mut self, key: &str) -> Option<StatementHandle> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.last_used);
        entry.last_used = tick;
        self.order.insert(tick, key.to_string());
        Some(entry.handle)
    }

    /// Return the cached handle for `sql`, preparing it on `adapter` on a miss.
    ///
    /// Prepare errors propagate and leave the cache unchanged.
    pub async fn get_or_prepare(
        &mut self,
        adapter: &mut dyn Adapter,
        sql: &str,
    ) -> DbResult<StatementHandle> {
        let key = normalize_sql(sql);
        if let Some(handle) = self.touch(&key) {
            self.stats.hits += 1;
            return Ok(handle);
        }

        self.stats.misses += 1;
        let handle = adapter.prepare(sql).await?;

        self.tick += 1;
        self.order.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                handle,
                last_used: self.tick,
            },
        );

        while self.entries.len() > self.capacity {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.stats.evictions += 1;
                debug!(statement = %evicted.handle, "Evicting prepared statement");
                if let Err(e) = adapter.close_statement(evicted.handle).await {
                    warn!(statement = %evicted.handle, error = %e, "Failed to close evicted statement");
                }
            }
        }

        Ok(handle)
    }

    /// Close every cached statement on `adapter` and empty the cache.
    pub async fn clear(&mut self, adapter: &mut dyn Adapter) {
        self.order.clear();
        for (_, entry) in self.entries.drain() {
            if let Err(e) = adapter.close_statement(entry.handle).await {
                debug!(statement = %entry.handle, error = %e, "Failed to close statement");
            }
        }
    }

    /// Forget all entries without touching the backend (the connection is gone).
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize_sql("  SELECT   id,\n\tname  FROM users  WHERE id = ?  "),
            "SELECT id, name FROM users WHERE id = ?"
        );
    }

    #[test]
    fn test_normalize_keeps_quoted_text() {
        assert_eq!(
            normalize_sql("SELECT  'a   b'  FROM   t"),
            "SELECT 'a   b' FROM t"
        );
        assert_eq!(
            normalize_sql("SELECT \"my  col\",  `x  y`  FROM t"),
            "SELECT \"my  col\", `x  y` FROM t"
        );
    }

    #[test]
    fn test_normalize_doubled_quote_escape() {
        assert_eq!(
            normalize_sql("SELECT 'it''s   ok'   FROM t"),
            "SELECT 'it''s   ok' FROM t"
        );
    }

    #[test]
    fn test_normalize_distinguishes_literals() {
        assert_ne!(
            normalize_sql("SELECT 'a b'"),
            normalize_sql("SELECT 'a  b'")
        );
    }

    #[test]
    fn test_normalize_keeps_placeholders() {
        assert_eq!(
            normalize_sql("UPDATE t SET a = $1 WHERE b = $2"),
            "UPDATE t SET a = $1 WHERE b = $2"
        );
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = PreparedStatementCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.is_empty());
    }
}
