/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Idle connection pool keyed by destination class.
//!
//! Buckets are LIFO: the most recently returned connection is the warmest and
//! is handed out first. Nothing is checked while the bucket lock is held; an
//! entry is popped, inspected, then either returned to the caller or closed.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::stream::Transport;
use crate::service::ServiceHandle;

/// Idle lifetime by cache key class
#[derive(Debug, Clone)]
pub struct KeepAlivePolicy {
    pub trusted_prefix: String,
    pub trusted: Duration,
    pub default: Duration,
}

impl KeepAlivePolicy {
    pub fn is_trusted(&self, key: &str) -> bool {
        !self.trusted_prefix.is_empty() && key.starts_with(&self.trusted_prefix)
    }

    pub fn keep_alive(&self, key: &str) -> Duration {
        if self.is_trusted(key) {
            self.trusted
        } else {
            self.default
        }
    }
}

/// Latency bounds a harvested connection must beat to be admitted
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Admission {
    /// Plain TCP: 1.5x the winner, clamped to [0.5s, 1.5s]
    pub const PLAIN: Admission = Admission {
        floor: Duration::from_millis(500),
        ceiling: Duration::from_millis(1500),
    };

    /// TLS: 1.5x the winner, clamped to [1.0s, 1.5s]
    pub const TLS: Admission = Admission {
        floor: Duration::from_millis(1000),
        ceiling: Duration::from_millis(1500),
    };

    pub fn threshold(&self, reference: Duration) -> Duration {
        reference.mul_f64(1.5).clamp(self.floor, self.ceiling)
    }
}

/// One idle connection
pub struct PooledConnection {
    pub stream: Transport,
    pub peer: SocketAddr,
    pub idle_since: Instant,
}

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evicted: AtomicU64,
    pub rejected: AtomicU64,
}

/// Idle connections grouped by cache key
pub struct ConnectionPool {
    name: &'static str,
    buckets: Mutex<HashMap<String, VecDeque<PooledConnection>>>,
    policy: KeepAlivePolicy,
    admission: Admission,
    write_wait: Duration,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(
        name: &'static str,
        policy: KeepAlivePolicy,
        admission: Admission,
        write_wait: Duration,
    ) -> Self {
        Self {
            name,
            buckets: Mutex::new(HashMap::new()),
            policy,
            admission,
            write_wait,
            stats: PoolStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<PooledConnection>>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn policy(&self) -> &KeepAlivePolicy {
        &self.policy
    }

    /// Idle connections stored under `key`
    pub fn idle_count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn total_idle(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    fn pop_newest(&self, key: &str) -> Option<PooledConnection> {
        let mut buckets = self.lock();
        let bucket = buckets.get_mut(key)?;
        let conn = bucket.pop_back();
        if bucket.is_empty() {
            buckets.remove(key);
        }
        conn
    }

    async fn is_usable(&self, conn: &mut PooledConnection, keep_alive: Duration) -> bool {
        if conn.idle_since.elapsed() > keep_alive {
            trace!("{}: {} idle too long", self.name, conn.peer);
            return false;
        }
        conn.stream.is_idle_healthy(self.write_wait).await
    }

    /// Hand out the newest healthy idle connection for `key`
    pub async fn checkout(&self, key: &str) -> Option<PooledConnection> {
        let keep_alive = self.policy.keep_alive(key);
        while let Some(mut conn) = self.pop_newest(key) {
            if self.is_usable(&mut conn, keep_alive).await {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!("{}: reusing connection to {} for {}", self.name, conn.peer, key);
                return Some(conn);
            }
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Return a connection to the pool
    pub fn checkin(&self, key: &str, stream: Transport, peer: SocketAddr) {
        let conn = PooledConnection {
            stream,
            peer,
            idle_since: Instant::now(),
        };
        self.lock().entry(key.to_string()).or_default().push_back(conn);
    }

    /// Admit a race loser that was `latency` slow when the winner took `reference`
    pub fn offer(
        &self,
        key: &str,
        stream: Transport,
        peer: SocketAddr,
        latency: Duration,
        reference: Duration,
    ) -> bool {
        if latency < self.admission.threshold(reference) {
            self.checkin(key, stream, peer);
            true
        } else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Close every idle connection that went stale, readable or unwritable.
    ///
    /// Returns the number of evicted connections.
    pub async fn sweep(&self) -> usize {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        let mut evicted = 0;

        for key in keys {
            let Some(bucket) = self.lock().remove(&key) else {
                continue;
            };
            let keep_alive = self.policy.keep_alive(&key);
            let mut kept = VecDeque::with_capacity(bucket.len());
            for mut conn in bucket.into_iter().rev() {
                if self.is_usable(&mut conn, keep_alive).await {
                    kept.push_front(conn);
                } else {
                    evicted += 1;
                }
            }

            let mut buckets = self.lock();
            let returned = buckets.remove(&key).unwrap_or_default();
            kept.extend(returned);
            if !kept.is_empty() {
                buckets.insert(key, kept);
            }
        }

        if evicted > 0 {
            self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!("{}: swept {} idle connections", self.name, evicted);
        }
        evicted
    }

    /// Sweep every `interval` until the handle is stopped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> ServiceHandle {
        let pool = Arc::clone(self);
        ServiceHandle::spawn_periodic(self.name, interval, move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.sweep().await;
            }
        })
    }
}
