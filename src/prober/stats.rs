/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Per-IP probe outcome counters, persisted as a `[statistics]` table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{TransportError, TransportResult};
use crate::iplist::write_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    #[serde(default)]
    statistics: BTreeMap<String, [u64; 2]>,
}

/// Successes and failures of one IP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectStat {
    pub successes: u64,
    pub failures: u64,
}

pub struct ConnectStats {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ConnectStat>>,
}

impl ConnectStats {
    /// Counters backed by `path`; existing counts are loaded when present
    pub fn open(path: impl Into<PathBuf>) -> TransportResult<Self> {
        let path = path.into();
        let mut entries = BTreeMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| TransportError::persist(path.display().to_string(), e))?;
            let file: StatsFile = toml::from_str(&content).map_err(|e| TransportError::Config {
                message: format!("{}: {}", path.display(), e),
            })?;
            for (ip, [successes, failures]) in file.statistics {
                entries.insert(ip, ConnectStat { successes, failures });
            }
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ConnectStat>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_success(&self, ip: &str, weight: u64) {
        self.lock().entry(ip.to_string()).or_default().successes += weight;
    }

    pub fn record_failure(&self, ip: &str) {
        self.lock().entry(ip.to_string()).or_default().failures += 1;
    }

    pub fn get(&self, ip: &str) -> ConnectStat {
        self.lock().get(ip).copied().unwrap_or_default()
    }

    pub fn save(&self) -> TransportResult<()> {
        let file = StatsFile {
            statistics: self
                .lock()
                .iter()
                .map(|(ip, stat)| (ip.clone(), [stat.successes, stat.failures]))
                .collect(),
        };
        let content = toml::to_string(&file).map_err(|e| TransportError::Config {
            message: e.to_string(),
        })?;
        write_atomic(&self.path, &content)
    }
}
