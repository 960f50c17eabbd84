//! Per-key debounce and single-flight primitives.
//!
//! Two call sites need "only one of these in flight at a time" semantics:
//! git pulls on the same path (debounce a repeated pull within a short
//! window, see `git::pull`) and workspace image builds (single-flight a
//! build so N concurrent callers trigger exactly one `docker build`, see
//! `bin/core/src/docker/mod.rs`). Both are expressed here.

use std::{
  collections::hash_map::RandomState,
  hash::Hash,
  sync::Arc,
};

use dashmap::DashMap;
use tokio::sync::Mutex;

/// The cached outcome of the last run for a given key, plus the
/// timestamp it was recorded at. Callers holding the per-key lock decide
/// whether the cached result is still fresh enough to reuse.
pub struct CacheEntry<V> {
  pub last_ts: i64,
  last_res: Option<Result<V, String>>,
}

impl<V: Clone> CacheEntry<V> {
  /// Reconstruct the last stored result. Errors are carried as their
  /// `Display` rendering, since most cached values (eg `GitRes`) do not
  /// implement `Clone` through an `anyhow::Error`.
  pub fn clone_res(&self) -> anyhow::Result<V> {
    match &self.last_res {
      Some(Ok(v)) => Ok(v.clone()),
      Some(Err(e)) => Err(anyhow::anyhow!("{e}")),
      None => Err(anyhow::anyhow!("no cached result for key")),
    }
  }

  pub fn set(&mut self, res: &anyhow::Result<V>, ts: i64) {
    self.last_ts = ts;
    self.last_res = Some(match res {
      Ok(v) => Ok(v.clone()),
      Err(e) => Err(format!("{e:#}")),
    });
  }
}

impl<V> Default for CacheEntry<V> {
  fn default() -> Self {
    Self { last_ts: 0, last_res: None }
  }
}

/// Keyed debounce cache: each key gets its own `Mutex<CacheEntry<V>>`,
/// never removed (cardinality is one per repo path / image name for the
/// process lifetime, which is small).
pub struct TimeoutCache<K, V> {
  locks: DashMap<K, Arc<Mutex<CacheEntry<V>>>, RandomState>,
}

impl<K: Eq + Hash, V> Default for TimeoutCache<K, V> {
  fn default() -> Self {
    Self { locks: DashMap::new() }
  }
}

impl<K: Eq + Hash + Clone, V> TimeoutCache<K, V> {
  /// Get (creating if necessary) the lock guarding `key`'s cache entry.
  /// Callers are expected to `.lock().await` it immediately, check
  /// `last_ts`, and either return the cached result or run their
  /// operation and `.set()` the new one before releasing the lock.
  pub async fn get_lock(
    &self,
    key: K,
  ) -> Arc<Mutex<CacheEntry<V>>> {
    self
      .locks
      .entry(key)
      .or_insert_with(|| Arc::new(Mutex::new(CacheEntry::default())))
      .clone()
  }
}

/// Pure single-flight mutual exclusion with no cached value: N concurrent
/// callers for the same key all wait on the same lock, but unlike
/// `TimeoutCache` there is nothing to short-circuit with — every caller
/// still runs the body once the lock is acquired, it's just guaranteed
/// that only one caller at a time is inside the critical section for that
/// key. Used to serialize "ensure image built" so the caller can check
/// "does the image already exist" after acquiring the lock instead of
/// before, closing the build-twice race.
pub struct KeyedLock<K> {
  locks: DashMap<K, Arc<Mutex<()>>, RandomState>,
}

impl<K: Eq + Hash> Default for KeyedLock<K> {
  fn default() -> Self {
    Self { locks: DashMap::new() }
  }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
  pub async fn get_lock(&self, key: K) -> Arc<Mutex<()>> {
    self.locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn debounce_cache_roundtrips_value_and_error() {
    let cache: TimeoutCache<String, u32> = TimeoutCache::default();
    let lock = cache.get_lock("a".to_string()).await;
    let mut locked = lock.lock().await;
    assert_eq!(locked.last_ts, 0);
    locked.set(&Ok(7), 100);
    assert_eq!(locked.clone_res().unwrap(), 7);

    locked.set(&Err(anyhow::anyhow!("boom")), 200);
    assert!(locked.clone_res().unwrap_err().to_string().contains("boom"));
  }

  #[tokio::test]
  async fn same_key_returns_same_lock() {
    let cache: TimeoutCache<&str, u32> = TimeoutCache::default();
    let a = cache.get_lock("k").await;
    let b = cache.get_lock("k").await;
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[tokio::test]
  async fn keyed_lock_serializes_same_key() {
    let locks: KeyedLock<&str> = KeyedLock::default();
    let l1 = locks.get_lock("img").await;
    let l2 = locks.get_lock("img").await;
    let _g1 = l1.lock().await;
    assert!(l2.try_lock().is_err());
  }
}
