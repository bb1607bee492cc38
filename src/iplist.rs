/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Named pools of candidate front-end IPs.
//!
//! Every mutation bumps a version counter so readers holding a snapshot can
//! tell when to refresh it. The pools are persisted as an `[iplist]` table
//! whose values are `|`-joined addresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};

#[derive(Debug, Default, Serialize, Deserialize)]
struct IpListFile {
    #[serde(default)]
    iplist: BTreeMap<String, String>,
}

/// Shared, versioned IP pools
#[derive(Debug, Default)]
pub struct IpList {
    pools: Mutex<BTreeMap<String, Vec<String>>>,
    version: AtomicU64,
    last_active: Mutex<Option<Instant>>,
}

impl IpList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<String>>> {
        self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Incremented on every mutation
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Snapshot of one pool, best first
    pub fn get(&self, name: &str) -> Vec<String> {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn len(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, Vec::len)
    }

    pub fn contains(&self, name: &str, ip: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|pool| pool.iter().any(|known| known == ip))
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Drop `ip` from every pool; true if it was present anywhere
    pub fn remove(&self, ip: &str) -> bool {
        let mut removed = false;
        for pool in self.lock().values_mut() {
            let before = pool.len();
            pool.retain(|known| known != ip);
            removed |= pool.len() != before;
        }
        if removed {
            self.bump();
        }
        removed
    }

    /// Put `ips` at the head of `name`, keeping their order and skipping duplicates
    pub fn prepend(&self, name: &str, ips: Vec<String>) -> usize {
        let mut pools = self.lock();
        let pool = pools.entry(name.to_string()).or_default();
        let mut head: Vec<String> = Vec::with_capacity(ips.len());
        for ip in ips {
            let ip = ip.trim().to_string();
            if ip.is_empty() || head.contains(&ip) {
                continue;
            }
            head.push(ip);
        }
        pool.retain(|known| !head.contains(known));
        let added = head.len();
        head.append(pool);
        *pool = head;
        drop(pools);
        if added > 0 {
            self.bump();
        }
        added
    }

    /// The least recently validated IP of `name`
    pub fn tail(&self, name: &str) -> Option<String> {
        self.lock().get(name).and_then(|pool| pool.last().cloned())
    }

    /// Move `ip` to the head of `name`
    pub fn promote(&self, name: &str, ip: &str) -> bool {
        let mut pools = self.lock();
        let Some(pool) = pools.get_mut(name) else {
            return false;
        };
        let Some(index) = pool.iter().position(|known| known == ip) else {
            return false;
        };
        let ip = pool.remove(index);
        pool.insert(0, ip);
        drop(pools);
        self.bump();
        true
    }

    /// Record that a consumer used the pools just now
    pub fn mark_active(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    pub fn last_active(&self) -> Option<Instant> {
        *self
            .last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load pools from `path`; a missing file yields empty pools
    pub fn load(path: &Path) -> TransportResult<Self> {
        let list = Self::new();
        if !path.exists() {
            debug!("no IP list at {}", path.display());
            return Ok(list);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| TransportError::persist(path.display().to_string(), e))?;
        let file: IpListFile = toml::from_str(&content).map_err(|e| TransportError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        for (name, joined) in file.iplist {
            let ips = joined.split('|').map(str::to_string).collect();
            list.prepend(&name, ips);
        }
        info!(
            "loaded {} IP pools from {}",
            list.pool_names().len(),
            path.display()
        );
        Ok(list)
    }

    /// Write every pool to `path` via a temporary file and a rename
    pub fn save(&self, path: &Path) -> TransportResult<()> {
        let file = IpListFile {
            iplist: self
                .lock()
                .iter()
                .map(|(name, pool)| (name.clone(), pool.join("|")))
                .collect(),
        };
        let content = toml::to_string(&file).map_err(|e| TransportError::Config {
            message: e.to_string(),
        })?;
        write_atomic(path, &content)
    }
}

/// Replace `path` with `content` without exposing a half-written file
pub(crate) fn write_atomic(path: &Path, content: &str) -> TransportResult<()> {
    let fail = |e| TransportError::persist(path.display().to_string(), e);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(fail)?;
    fs::rename(&tmp, path).map_err(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prepend_dedups_and_bumps_version() {
        let list = IpList::new();
        assert_eq!(list.prepend("gws", ips(&["1.1.1.1", "2.2.2.2"])), 2);
        let v = list.version();
        assert_eq!(list.prepend("gws", ips(&["3.3.3.3", "1.1.1.1", "3.3.3.3"])), 2);
        assert!(list.version() > v);
        assert_eq!(list.get("gws"), ips(&["3.3.3.3", "1.1.1.1", "2.2.2.2"]));
    }

    #[test]
    fn test_remove_hits_every_pool() {
        let list = IpList::new();
        list.prepend("gws", ips(&["1.1.1.1", "2.2.2.2"]));
        list.prepend("com", ips(&["1.1.1.1"]));
        assert!(list.remove("1.1.1.1"));
        assert!(!list.contains("gws", "1.1.1.1"));
        assert_eq!(list.len("com"), 0);

        let v = list.version();
        assert!(!list.remove("9.9.9.9"));
        assert_eq!(list.version(), v);
    }

    #[test]
    fn test_promote_moves_to_head() {
        let list = IpList::new();
        list.prepend("gws", ips(&["a", "b", "c"]));
        assert_eq!(list.tail("gws").as_deref(), Some("c"));
        assert!(list.promote("gws", "c"));
        assert_eq!(list.get("gws"), ips(&["c", "a", "b"]));
        assert!(list.promote("gws", "b"));
        assert_eq!(list.get("gws"), ips(&["b", "c", "a"]));
        assert!(!list.promote("gws", "z"));
        assert!(!list.promote("missing", "a"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("iplist.toml");

        let list = IpList::new();
        list.prepend("google_gws", ips(&["1.1.1.1", "2.2.2.2"]));
        list.prepend("google_com", ips(&["2.2.2.2"]));
        list.save(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("[iplist]"));
        assert!(written.contains("\"1.1.1.1|2.2.2.2\""));
        assert!(!path.with_extension("tmp").exists());

        let loaded = IpList::load(&path).unwrap();
        assert_eq!(loaded.get("google_gws"), ips(&["1.1.1.1", "2.2.2.2"]));
        assert_eq!(loaded.get("google_com"), ips(&["2.2.2.2"]));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let list = IpList::load(&dir.path().join("absent.toml")).unwrap();
        assert!(list.pool_names().is_empty());
    }

    #[test]
    fn test_activity_marker() {
        let list = IpList::new();
        assert!(list.last_active().is_none());
        list.mark_active();
        assert!(list.last_active().is_some());
    }
}
