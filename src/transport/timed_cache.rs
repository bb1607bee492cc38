/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Bounded LRU map with optional per-entry expiry.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

/// Thread-safe LRU cache whose entries may expire.
///
/// Expired entries are never returned and are purged lazily when touched.
pub struct TimedCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
    default_ttl: Option<Duration>,
}

impl<K: Hash + Eq, V: Clone> TimedCache<K, V> {
    /// Cache holding at most `capacity` entries (zero is treated as one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl: None,
        }
    }

    /// Cache whose entries expire after `ttl` unless set with their own
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            default_ttl: Some(ttl),
            ..Self::new(capacity)
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace, promoting the key to most recent
    pub fn set(&self, key: K, value: V) {
        let expires = self.default_ttl.map(|ttl| Instant::now() + ttl);
        self.lock().put(key, Entry { value, expires });
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires = Some(Instant::now() + ttl);
        self.lock().put(key, Entry { value, expires });
    }

    /// Live value for `key`, promoting it to most recent
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        if entries.peek(key)?.is_expired(Instant::now()) {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn get_or(&self, key: &K, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Return the live value or insert the one built by `make`, under one lock
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        let now = Instant::now();
        let mut entries = self.lock();
        if entries.peek(&key).is_some_and(|entry| entry.is_expired(now)) {
            entries.pop(&key);
        }
        let expires = self.default_ttl.map(|ttl| now + ttl);
        entries
            .get_or_insert(key, || Entry {
                value: make(),
                expires,
            })
            .value
            .clone()
    }

    /// Membership test; a live key is promoted to most recent like on `get`
    pub fn contains(&self, key: &K) -> bool {
        let mut entries = self.lock();
        match entries.peek(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.pop(key);
                false
            }
            Some(_) => {
                entries.promote(key);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.lock()
            .pop(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, expired ones that were not yet purged included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }
}
