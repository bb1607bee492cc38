/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Background validation of the trusted IP pool.
//!
//! Exactly one of probe-all, probe-one or update runs at a time; the state
//! word decides who gets in. A forced probe-all waits for a probe-one to
//! finish instead of being turned away.

pub mod discovery;
pub mod stats;

pub use discovery::{HttpIpSource, IpSource, NoDiscovery};
pub use stats::{ConnectStat, ConnectStats};

use async_trait::async_trait;
use chrono::Timelike;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::FinderConfig;
use crate::error::{TransportError, TransportResult};
use crate::iplist::IpList;
use crate::service::ServiceHandle;
use crate::transport::RaceConnector;

/// Extra milliseconds of handshake budget by local hour, for busy evenings
const HOURLY_DELAY_MS: [u64; 24] = [
    120, 80, 40, 0, 0, 0, 0, 0, 20, 40, 60, 80, //
    100, 100, 80, 80, 100, 140, 180, 240, 300, 300, 260, 180,
];

/// Poll interval of a forced probe-all waiting for a probe-one
const FORCED_WAIT: Duration = Duration::from_millis(200);

/// Times one TLS handshake to an IP
#[async_trait]
pub trait HandshakeProbe: Send + Sync {
    async fn probe(&self, ip: &str, timeout: Duration) -> TransportResult<Duration>;
}

/// Probes through the race connector so good probe connections land in its pool
pub struct ConnectorProbe {
    connector: Arc<RaceConnector>,
    cache_key: String,
    port: u16,
}

impl ConnectorProbe {
    pub fn new(connector: Arc<RaceConnector>, cache_key: impl Into<String>, port: u16) -> Self {
        Self {
            connector,
            cache_key: cache_key.into(),
            port,
        }
    }
}

#[async_trait]
impl HandshakeProbe for ConnectorProbe {
    async fn probe(&self, ip: &str, timeout: Duration) -> TransportResult<Duration> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| TransportError::protocol(format!("'{}' is not an IP address", ip)))?;
        self.connector
            .probe_handshake(ip, self.port, &self.cache_key, timeout)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    ProbingAll,
    ProbingOne,
    Updating,
}

/// What a prober operation ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Another operation held the state word
    Refused(ProbeState),
    Done {
        tested: usize,
        removed: usize,
        remaining: usize,
        updated: bool,
    },
}

enum Claim {
    Acquired,
    Wait,
    Refused(ProbeState),
}

#[derive(Debug, Clone)]
pub struct ProberSettings {
    pub min_ip_count: usize,
    pub max_timeout: Duration,
    pub driver_interval: Duration,
    pub idle_probe: Duration,
    pub forced_probe: Duration,
    pub probe_cycle: Duration,
    pub primary_pool: String,
    pub secondary_pool: String,
    pub iplist_file: PathBuf,
}

impl From<&FinderConfig> for ProberSettings {
    fn from(finder: &FinderConfig) -> Self {
        Self {
            min_ip_count: finder.min_ip_count,
            max_timeout: Duration::from_millis(finder.max_timeout_ms),
            driver_interval: Duration::from_secs(finder.driver_interval_secs.max(1)),
            idle_probe: Duration::from_secs(finder.idle_probe_secs),
            forced_probe: Duration::from_secs(finder.forced_probe_secs),
            probe_cycle: Duration::from_secs(finder.probe_cycle_secs),
            primary_pool: finder.primary_pool.clone(),
            secondary_pool: finder.secondary_pool.clone(),
            iplist_file: finder.iplist_file.clone(),
        }
    }
}

/// Handshake budget for a pool of `pool_len` IPs at local `hour`
pub fn probe_timeout_at(max_timeout: Duration, pool_len: usize, hour: usize) -> Duration {
    let base = (max_timeout.as_millis() as f64 * 1.3).max(1000.0) as u64;
    let crowd = pool_len.min(20) as u64 * 10;
    let evening = HOURLY_DELAY_MS[hour % 24];
    Duration::from_millis(base + crowd + evening)
}

pub struct IpProber {
    iplist: Arc<IpList>,
    stats: ConnectStats,
    probe: Arc<dyn HandshakeProbe>,
    source: Arc<dyn IpSource>,
    settings: ProberSettings,
    state: Mutex<ProbeState>,
    last_test: Mutex<Option<Instant>>,
}

impl IpProber {
    pub fn new(
        iplist: Arc<IpList>,
        stats: ConnectStats,
        probe: Arc<dyn HandshakeProbe>,
        source: Arc<dyn IpSource>,
        settings: ProberSettings,
    ) -> Self {
        Self {
            iplist,
            stats,
            probe,
            source,
            settings,
            state: Mutex::new(ProbeState::Idle),
            last_test: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ProbeState {
        *self.lock_state()
    }

    fn set_state(&self, state: ProbeState) {
        *self.lock_state() = state;
    }

    fn claim(&self, target: ProbeState, wait_for_one: bool) -> Claim {
        let mut state = self.lock_state();
        match *state {
            ProbeState::Idle => {
                *state = target;
                Claim::Acquired
            }
            ProbeState::ProbingOne if wait_for_one => Claim::Wait,
            busy => Claim::Refused(busy),
        }
    }

    pub fn stats(&self) -> &ConnectStats {
        &self.stats
    }

    pub fn last_test(&self) -> Option<Instant> {
        *self
            .last_test
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_tested(&self) {
        *self
            .last_test
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    /// Budget for one handshake right now
    pub fn probe_timeout(&self) -> Duration {
        let hour = chrono::Local::now().hour() as usize;
        probe_timeout_at(
            self.settings.max_timeout,
            self.iplist.len(&self.settings.primary_pool),
            hour,
        )
    }

    fn needs_update(&self) -> bool {
        let primary = self.iplist.len(&self.settings.primary_pool);
        let secondary = self.iplist.len(&self.settings.secondary_pool);
        primary < self.settings.min_ip_count || secondary < self.settings.min_ip_count / 3
    }

    async fn probe_ip(&self, ip: &str, timeout: Duration) -> TransportResult<Duration> {
        // the probe enforces the budget itself; this only guards against a hung probe
        match tokio::time::timeout(timeout * 2, self.probe.probe(ip, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::protocol(format!("probe of {} hung", ip))),
        }
    }

    /// Handshake with every IP of the trusted pool and drop the failures
    pub async fn probe_all(&self, force: bool) -> ProbeOutcome {
        loop {
            match self.claim(ProbeState::ProbingAll, force) {
                Claim::Acquired => break,
                Claim::Wait => tokio::time::sleep(FORCED_WAIT).await,
                Claim::Refused(busy) => {
                    debug!("probe-all skipped, prober is {:?}", busy);
                    return ProbeOutcome::Refused(busy);
                }
            }
        }

        let ips = self.iplist.get(&self.settings.primary_pool);
        let timeout = self.probe_timeout();
        let mut probes: FuturesUnordered<_> = ips
            .iter()
            .map(|ip| async move { (ip, self.probe_ip(ip, timeout).await) })
            .collect();

        let mut removed = 0;
        while let Some((ip, result)) = probes.next().await {
            match result {
                Ok(latency) => debug!("{} answered in {:?}", ip, latency),
                Err(e) => {
                    debug!("{} failed: {}", ip, e);
                    if self.iplist.remove(ip) {
                        removed += 1;
                    }
                }
            }
        }
        drop(probes);

        self.mark_tested();
        self.iplist.mark_active();
        let updated = self.finish().await;
        let remaining = self.iplist.len(&self.settings.primary_pool);
        info!(
            "probed {} IPs, removed {}, {} remain",
            ips.len(),
            removed,
            remaining
        );
        ProbeOutcome::Done {
            tested: ips.len(),
            removed,
            remaining,
            updated,
        }
    }

    /// Re-validate the least recently validated IP of the trusted pool
    pub async fn probe_one(&self) -> ProbeOutcome {
        if let Claim::Refused(busy) = self.claim(ProbeState::ProbingOne, false) {
            return ProbeOutcome::Refused(busy);
        }

        let primary = &self.settings.primary_pool;
        let mut tested = 0;
        let mut removed = 0;
        if let Some(ip) = self.iplist.tail(primary) {
            tested = 1;
            let timeout = self.probe_timeout();
            match self.probe_ip(&ip, timeout).await {
                Ok(latency) => {
                    self.iplist.promote(primary, &ip);
                    let weight = if self.iplist.contains(&self.settings.secondary_pool, &ip) {
                        2
                    } else {
                        1
                    };
                    self.stats.record_success(&ip, weight);
                    debug!("{} still good ({:?})", ip, latency);
                }
                Err(e) => {
                    self.iplist.remove(&ip);
                    self.stats.record_failure(&ip);
                    removed = 1;
                    info!("dropped {}: {}", ip, e);
                }
            }
            if let Err(e) = self.stats.save() {
                warn!("could not save IP statistics: {}", e);
            }
        }

        self.mark_tested();
        let updated = self.finish().await;
        ProbeOutcome::Done {
            tested,
            removed,
            remaining: self.iplist.len(primary),
            updated,
        }
    }

    /// Leave a probing state, running an update first when the pools ran low
    async fn finish(&self) -> bool {
        let updated = self.needs_update();
        if updated {
            self.set_state(ProbeState::Updating);
            self.refresh().await;
        }
        self.set_state(ProbeState::Idle);
        updated
    }

    /// Ask the IP source for fresh IPs
    pub async fn update(&self) -> ProbeOutcome {
        if let Claim::Refused(busy) = self.claim(ProbeState::Updating, false) {
            return ProbeOutcome::Refused(busy);
        }
        self.refresh().await;
        self.set_state(ProbeState::Idle);
        ProbeOutcome::Done {
            tested: 0,
            removed: 0,
            remaining: self.iplist.len(&self.settings.primary_pool),
            updated: true,
        }
    }

    async fn refresh(&self) {
        let known = self.iplist.get(&self.settings.primary_pool);
        let wanted = self.settings.min_ip_count.saturating_sub(known.len()).max(1);
        match self.source.discover(&known, wanted).await {
            Ok(found) => {
                let mut added = 0;
                for (pool, ips) in found {
                    added += self.iplist.prepend(&pool, ips);
                }
                if added > 0 {
                    info!("added {} fresh IPs", added);
                    if let Err(e) = self.iplist.save(&self.settings.iplist_file) {
                        warn!("could not save IP list: {}", e);
                    }
                }
            }
            Err(e) => warn!("IP update failed: {}", e),
        }

        let remaining = self.iplist.len(&self.settings.primary_pool);
        if remaining < self.settings.min_ip_count {
            warn!(
                "only {} usable IPs in {}, want {}",
                remaining, self.settings.primary_pool, self.settings.min_ip_count
            );
        }
    }

    /// One driver step
    pub async fn tick(&self) {
        let Some(active) = self.iplist.last_active() else {
            self.probe_all(false).await;
            return;
        };
        let since_test = self.last_test().map_or(Duration::MAX, |t| t.elapsed());
        let pool_len = self.iplist.len(&self.settings.primary_pool).max(1) as u32;
        let cadence = self.settings.probe_cycle / pool_len;
        let due = active.elapsed() > self.settings.idle_probe || since_test > self.settings.forced_probe;
        if due && since_test > cadence {
            self.probe_one().await;
        }
    }

    /// Run the driver until the handle is stopped
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let prober = Arc::clone(self);
        ServiceHandle::spawn_periodic("ip-prober", self.settings.driver_interval, move || {
            let prober = Arc::clone(&prober);
            async move { prober.tick().await }
        })
    }

    /// Kick off a forced probe-all in the background unless one is already
    /// running or an update holds the prober
    pub fn trigger_probe_all(self: &Arc<Self>) -> bool {
        match self.state() {
            ProbeState::ProbingAll | ProbeState::Updating => false,
            ProbeState::Idle | ProbeState::ProbingOne => {
                let prober = Arc::clone(self);
                tokio::spawn(async move {
                    prober.probe_all(true).await;
                });
                true
            }
        }
    }
}
