/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Connection racing across candidate IPs.
//!
//! A connect first tries the pool. On a miss, the candidates are ranked by
//! remembered latency, a window of them is dialed in parallel and the first
//! one through wins. Racers run as detached tasks: once a winner is known the
//! remaining ones are drained in the background, and fast enough losers are
//! parked in the pool for the next caller.

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use super::limiter::ConnectLimiter;
use super::pool::{ConnectionPool, KeepAlivePolicy};
use super::resolve::Resolver;
use super::stream::Transport;
use super::timed_cache::TimedCache;
use super::tls::TlsContext;
use crate::config::LinkConfig;
use crate::error::{Phase, TransportError, TransportResult};

/// One logical connect
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub cache_key: String,
    /// Steady-state timeout handed to whoever uses the connection
    pub timeout: Duration,
    pub tls: bool,
    /// Race rounds; `None` uses the configured default
    pub retries: Option<usize>,
    /// Sub-fetch of a range download: race the best few instead of a window
    pub range_fetch: bool,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16, cache_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            cache_key: cache_key.into(),
            timeout: Duration::from_secs(8),
            tls: false,
            retries: None,
            range_fetch: false,
        }
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn range_fetch(mut self, range_fetch: bool) -> Self {
        self.range_fetch = range_fetch;
        self
    }
}

/// A ready connection
pub struct Connected {
    pub stream: Transport,
    pub peer: SocketAddr,
    /// Connect (plus handshake) time; zero for a pooled connection
    pub latency: Duration,
    pub reused: bool,
    pub timeout: Duration,
}

/// Remembered connect and handshake times per address
pub struct LatencyBook {
    tcp: TimedCache<SocketAddr, Duration>,
    tls: TimedCache<SocketAddr, Duration>,
    penalty_base: Duration,
}

impl LatencyBook {
    pub fn new(capacity: usize, penalty_base: Duration) -> Self {
        Self {
            tcp: TimedCache::new(capacity),
            tls: TimedCache::new(capacity),
            penalty_base,
        }
    }

    pub fn record_tcp(&self, addr: SocketAddr, latency: Duration) {
        self.tcp.set(addr, latency);
    }

    pub fn record_tls(&self, addr: SocketAddr, latency: Duration) {
        self.tls.set(addr, latency);
    }

    pub fn tcp_time(&self, addr: &SocketAddr) -> Option<Duration> {
        self.tcp.get(addr)
    }

    pub fn tls_time(&self, addr: &SocketAddr) -> Option<Duration> {
        self.tls.get(addr)
    }

    fn penalty(&self) -> Duration {
        self.penalty_base + Duration::from_secs_f64(rand::rng().random::<f64>())
    }

    /// Push a failed address to the back of future rankings
    pub fn penalize(&self, addr: SocketAddr, tls: bool, connect_failed: bool) {
        if tls {
            self.tls.set(addr, self.penalty());
        }
        if !tls || connect_failed {
            self.tcp.set(addr, self.penalty());
        }
    }

    /// Ranking key; `None` means never measured.
    ///
    /// TLS on 443 ranks by the slower of connect and handshake time.
    pub fn rank(&self, addr: &SocketAddr, tls: bool) -> Option<Duration> {
        match (tls, addr.port()) {
            (true, 443) => match (self.tcp_time(addr), self.tls_time(addr)) {
                (Some(tcp), Some(tls)) => Some(tcp.max(tls)),
                (tcp, tls) => tcp.or(tls),
            },
            (true, _) => self.tls_time(addr).or_else(|| self.tcp_time(addr)),
            (false, _) => self.tcp_time(addr),
        }
    }

    /// Sort fastest first, unmeasured addresses last
    pub fn sort(&self, candidates: &mut [SocketAddr], tls: bool) {
        candidates.sort_by_cached_key(|addr| match self.rank(addr, tls) {
            Some(latency) => (false, latency),
            None => (true, Duration::ZERO),
        });
    }
}

/// Addresses dialed in one round: the best few plus a random share of the rest.
///
/// `candidates` must already be ranked. The random share grows with `round`.
pub fn race_window<R: Rng + ?Sized>(
    candidates: &[SocketAddr],
    max_window: usize,
    round: usize,
    rng: &mut R,
) -> Vec<SocketAddr> {
    if candidates.len() <= max_window {
        return candidates.to_vec();
    }
    let best = ((max_window + 1) / 2).saturating_sub(round).max(1).min(max_window);
    let mut window = candidates[..best].to_vec();
    window.extend(
        candidates[best..]
            .choose_multiple(rng, max_window - best)
            .copied(),
    );
    window
}

#[derive(Debug, Clone, Copy)]
enum DialMode {
    Race,
    /// Handshake may take the whole budget, and taking longer is a failure
    Probe { budget: Duration },
}

struct Attempt {
    stream: Transport,
    peer: SocketAddr,
    latency: Duration,
}

/// Opens one connection to one address and records how it went
struct Dialer {
    tls: Arc<TlsContext>,
    latency: Arc<LatencyBook>,
    limiter: ConnectLimiter,
    trust: KeepAlivePolicy,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Dialer {
    async fn dial(
        &self,
        addr: SocketAddr,
        host: &str,
        cache_key: &str,
        tls: bool,
        mode: DialMode,
    ) -> TransportResult<Attempt> {
        let _slot = self.limiter.acquire(addr.ip()).await;
        let result = self.open(addr, host, cache_key, tls, mode).await;
        if let Err(err) = &result {
            let connect_failed = matches!(
                err,
                TransportError::Connect { .. }
                    | TransportError::Timeout {
                        phase: Phase::Connect,
                        ..
                    }
            );
            self.latency.penalize(addr, tls, connect_failed);
        }
        result
    }

    async fn open(
        &self,
        addr: SocketAddr,
        host: &str,
        cache_key: &str,
        tls: bool,
        mode: DialMode,
    ) -> TransportResult<Attempt> {
        let started = Instant::now();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| TransportError::connect(addr, e))?;
        let _ = socket.set_linger(Some(Duration::ZERO));
        let _ = socket.set_recv_buffer_size(32 * 1024);

        let tcp = match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(TransportError::connect(addr, e)),
            Err(_) => return Err(TransportError::timeout(addr, Phase::Connect)),
        };
        let _ = tcp.set_nodelay(true);
        let tcp_time = started.elapsed();
        self.latency.record_tcp(addr, tcp_time);

        if !tls {
            return Ok(Attempt {
                stream: Transport::from(tcp),
                peer: addr,
                latency: tcp_time,
            });
        }

        let budget = match mode {
            DialMode::Race => self.handshake_timeout,
            DialMode::Probe { budget } => budget,
        };
        let stream = tokio::time::timeout(budget, self.tls.handshake(tcp, host, addr))
            .await
            .map_err(|_| TransportError::timeout(addr, Phase::Handshake))??;
        let tls_time = started.elapsed();
        if matches!(mode, DialMode::Probe { .. }) && tls_time > budget {
            return Err(TransportError::timeout(addr, Phase::Handshake));
        }
        if self.trust.is_trusted(cache_key) {
            self.tls.verify_organization(&stream, addr)?;
        }
        self.latency.record_tls(addr, tls_time);

        Ok(Attempt {
            stream: Transport::from(stream),
            peer: addr,
            latency: tls_time,
        })
    }
}

#[derive(Debug, Clone)]
struct RaceSettings {
    max_window: usize,
    max_retry: usize,
    range_candidates: usize,
    probe_host: String,
}

/// Races connections to the candidates of a host and remembers how each did
pub struct RaceConnector {
    resolver: Arc<dyn Resolver>,
    dialer: Arc<Dialer>,
    plain_pool: Arc<ConnectionPool>,
    tls_pool: Arc<ConnectionPool>,
    settings: RaceSettings,
}

impl RaceConnector {
    pub fn new(
        link: &LinkConfig,
        range_threads: usize,
        resolver: Arc<dyn Resolver>,
        tls: Arc<TlsContext>,
        plain_pool: Arc<ConnectionPool>,
        tls_pool: Arc<ConnectionPool>,
    ) -> Self {
        let dialer = Dialer {
            tls,
            latency: Arc::new(LatencyBook::new(link.latency_cache_size, link.timeout())),
            limiter: ConnectLimiter::new(link.limiter_size, link.limiter_slots),
            trust: tls_pool.policy().clone(),
            connect_timeout: link.connect_fast_timeout(),
            handshake_timeout: link.handshake_fast_timeout(),
        };
        Self {
            resolver,
            dialer: Arc::new(dialer),
            plain_pool,
            tls_pool,
            settings: RaceSettings {
                max_window: link.max_window.max(1),
                max_retry: link.max_retry.max(1),
                range_candidates: range_threads + 1,
                probe_host: link.platform_server_name.clone(),
            },
        }
    }

    pub fn latency(&self) -> &LatencyBook {
        &self.dialer.latency
    }

    pub fn pool(&self, tls: bool) -> &Arc<ConnectionPool> {
        if tls {
            &self.tls_pool
        } else {
            &self.plain_pool
        }
    }

    /// Park a connection the caller is done with
    pub fn release(&self, cache_key: &str, conn: Connected) {
        let tls = conn.stream.is_tls();
        self.pool(tls).checkin(cache_key, conn.stream, conn.peer);
    }

    /// Record that `peer` misbehaved after the connection was handed out
    pub fn penalize(&self, peer: SocketAddr, tls: bool) {
        self.dialer.latency.penalize(peer, tls, false);
    }

    pub async fn connect(&self, req: &ConnectRequest) -> TransportResult<Connected> {
        let span = crate::span_connect!(req.host.as_str(), req.cache_key.as_str());
        self.connect_inner(req).instrument(span).await
    }

    async fn connect_inner(&self, req: &ConnectRequest) -> TransportResult<Connected> {
        if let Some(idle) = self.pool(req.tls).checkout(&req.cache_key).await {
            return Ok(Connected {
                stream: idle.stream,
                peer: idle.peer,
                latency: Duration::ZERO,
                reused: true,
                timeout: req.timeout,
            });
        }

        let mut candidates: Vec<SocketAddr> = Vec::new();
        for ip in self.resolver.resolve(&req.host).await? {
            let addr = SocketAddr::new(ip, req.port);
            if !candidates.contains(&addr) {
                candidates.push(addr);
            }
        }
        if candidates.is_empty() {
            return Err(TransportError::Resolve {
                host: req.host.clone(),
            });
        }

        let rounds = req.retries.unwrap_or(self.settings.max_retry).max(1);
        let mut attempted = 0;
        let mut last_error = None;

        for round in 0..rounds {
            if candidates.is_empty() {
                break;
            }
            attempted += 1;
            self.dialer.latency.sort(&mut candidates, req.tls);
            let window = if req.range_fetch {
                candidates
                    .iter()
                    .take(self.settings.range_candidates)
                    .copied()
                    .collect()
            } else {
                race_window(&candidates, self.settings.max_window, round, &mut rand::rng())
            };

            let mut racers: FuturesUnordered<JoinHandle<TransportResult<Attempt>>> = window
                .into_iter()
                .map(|addr| {
                    let dialer = Arc::clone(&self.dialer);
                    let host = req.host.clone();
                    let key = req.cache_key.clone();
                    let tls = req.tls;
                    tokio::spawn(async move {
                        dialer.dial(addr, &host, &key, tls, DialMode::Race).await
                    })
                })
                .collect();

            let mut reported = false;
            while let Some(joined) = racers.next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("racer task failed: {}", e);
                        continue;
                    }
                };
                match outcome {
                    Ok(winner) => {
                        debug!(
                            "{} won the race for {} in {:?}",
                            winner.peer, req.host, winner.latency
                        );
                        self.harvest(racers, req.cache_key.clone(), req.tls, winner.latency);
                        return Ok(Connected {
                            stream: winner.stream,
                            peer: winner.peer,
                            latency: winner.latency,
                            reused: false,
                            timeout: req.timeout,
                        });
                    }
                    Err(err) if !err.is_retryable() => {
                        warn!("giving up on {}: {}", req.host, err);
                        return Err(err);
                    }
                    Err(err) => {
                        if let Some(addr) = err.addr() {
                            candidates.retain(|candidate| *candidate != addr);
                        }
                        if reported {
                            debug!("{}", err);
                        } else {
                            warn!("race round {} for {}: {}", round + 1, req.host, err);
                            reported = true;
                        }
                        last_error = Some(err);
                    }
                }
            }
        }

        let last = last_error.unwrap_or_else(|| TransportError::Resolve {
            host: req.host.clone(),
        });
        Err(TransportError::Exhausted {
            host: req.host.clone(),
            attempts: attempted,
            last: Box::new(last),
        })
    }

    fn harvest(
        &self,
        mut racers: FuturesUnordered<JoinHandle<TransportResult<Attempt>>>,
        cache_key: String,
        tls: bool,
        reference: Duration,
    ) {
        if racers.is_empty() {
            return;
        }
        let pool = Arc::clone(self.pool(tls));
        tokio::spawn(async move {
            while let Some(joined) = racers.next().await {
                if let Ok(Ok(loser)) = joined {
                    let peer = loser.peer;
                    if pool.offer(&cache_key, loser.stream, peer, loser.latency, reference) {
                        debug!("parked race loser {} for {}", peer, cache_key);
                    }
                }
            }
        });
    }

    /// One TLS handshake to `ip`, bypassing the pool, timed end to end.
    ///
    /// The peer dropping the socket mid-handshake earns one more try. A good
    /// connection is parked in the TLS pool under `cache_key`.
    pub async fn probe_handshake(
        &self,
        ip: IpAddr,
        port: u16,
        cache_key: &str,
        budget: Duration,
    ) -> TransportResult<Duration> {
        let addr = SocketAddr::new(ip, port);
        let host = self.settings.probe_host.clone();
        let mut eof_retries = 1;
        loop {
            match self
                .dialer
                .dial(addr, &host, cache_key, true, DialMode::Probe { budget })
                .await
            {
                Ok(found) => {
                    self.tls_pool.checkin(cache_key, found.stream, found.peer);
                    return Ok(found.latency);
                }
                Err(err) if eof_retries > 0 && err.is_unexpected_eof() => {
                    debug!("{} closed during handshake, retrying", addr);
                    eof_retries -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{
        acceptor, connector_with, fixture_link, loopback, serve_tls, test_connector as connector,
        FixedResolver, FRONT_CERT, FRONT_KEY, IMPOSTOR_CERT, IMPOSTOR_KEY,
    };
    use tokio::net::TcpListener;

    /// Accept forever, keeping every socket open
    fn serve(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
    }

    fn addrs(n: u8) -> Vec<SocketAddr> {
        (1..=n).map(|i| SocketAddr::new(loopback(i), 80)).collect()
    }

    #[test]
    fn test_window_takes_everything_when_small() {
        let candidates = addrs(3);
        let window = race_window(&candidates, 4, 0, &mut rand::rng());
        assert_eq!(window, candidates);
    }

    #[test]
    fn test_window_random_share_grows_per_round() {
        let candidates = addrs(10);
        for round in 0..3 {
            let window = race_window(&candidates, 4, round, &mut rand::rng());
            assert_eq!(window.len(), 4);
            let mut unique = window.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), 4);

            let best = if round == 0 { 2 } else { 1 };
            assert_eq!(&window[..best], &candidates[..best]);
        }
    }

    #[test]
    fn test_ranking_puts_unmeasured_last() {
        let book = LatencyBook::new(16, Duration::from_secs(8));
        let candidates = addrs(3);
        book.record_tcp(candidates[2], Duration::from_millis(10));
        book.record_tcp(candidates[1], Duration::from_millis(50));

        let mut ranked = candidates.clone();
        book.sort(&mut ranked, false);
        assert_eq!(ranked, vec![candidates[2], candidates[1], candidates[0]]);

        book.penalize(candidates[2], false, true);
        book.sort(&mut ranked, false);
        assert_eq!(ranked[0], candidates[1]);
        assert!(book.tcp_time(&candidates[2]).unwrap() >= Duration::from_secs(8));
    }

    #[test]
    fn test_tls_on_443_ranks_by_slower_phase() {
        let book = LatencyBook::new(16, Duration::from_secs(8));
        let addr = SocketAddr::new(loopback(1), 443);
        book.record_tcp(addr, Duration::from_millis(20));
        book.record_tls(addr, Duration::from_millis(90));
        assert_eq!(book.rank(&addr, true), Some(Duration::from_millis(90)));
        assert_eq!(book.rank(&addr, false), Some(Duration::from_millis(20)));

        book.record_tcp(addr, Duration::from_millis(120));
        assert_eq!(book.rank(&addr, true), Some(Duration::from_millis(120)));

        let other = SocketAddr::new(loopback(1), 8443);
        book.record_tcp(other, Duration::from_millis(120));
        book.record_tls(other, Duration::from_millis(90));
        assert_eq!(book.rank(&other, true), Some(Duration::from_millis(90)));
    }

    #[test]
    fn test_connect_penalty_outranks_good_handshake() {
        let book = LatencyBook::new(16, Duration::from_secs(8));
        let penalized = SocketAddr::new(loopback(1), 443);
        let steady = SocketAddr::new(loopback(2), 443);
        book.record_tls(penalized, Duration::from_millis(50));
        book.record_tcp(penalized, Duration::from_secs(8));
        book.record_tls(steady, Duration::from_millis(200));
        book.record_tcp(steady, Duration::from_millis(100));

        let mut ranked = vec![penalized, steady];
        book.sort(&mut ranked, true);
        assert_eq!(ranked, vec![steady, penalized]);
    }

    #[tokio::test]
    async fn test_fast_address_wins_over_failing_ones() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve(listener);

        let ips = vec![loopback(2), loopback(3), loopback(1), loopback(4)];
        let connector = connector(ips, 4);
        let req = ConnectRequest::new("upstream.test", port, "upstream.test:80").retries(1);

        let conn = connector.connect(&req).await.unwrap();
        assert_eq!(conn.peer, SocketAddr::new(loopback(1), port));
        assert!(!conn.reused);

        // the refused addresses were pushed back in the ranking
        tokio::time::sleep(Duration::from_millis(50)).await;
        let refused = SocketAddr::new(loopback(2), port);
        assert!(connector.latency().tcp_time(&refused).unwrap() >= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_all_failing_surfaces_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ips = vec![loopback(1), loopback(2)];
        let connector = connector(ips.clone(), 4);
        let req = ConnectRequest::new("upstream.test", port, "upstream.test:80").retries(3);

        match connector.connect(&req).await {
            Err(err @ TransportError::Exhausted { .. }) => {
                let origin = err.addr().unwrap();
                assert!(ips.contains(&origin.ip()));
                // every address failed in round one, nothing left for more rounds
                assert!(matches!(err, TransportError::Exhausted { attempts: 1, .. }));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(conn) => panic!("connected to {}", conn.peer),
        }
    }

    #[tokio::test]
    async fn test_local_error_ends_the_race() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve(listener);

        let connector = connector(vec![loopback(1), loopback(2)], 4);
        let req = ConnectRequest::new("not a host name", port, "odd:443")
            .tls(true)
            .retries(3);
        match connector.connect(&req).await {
            Err(TransportError::Config { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(conn) => panic!("connected to {}", conn.peer),
        }
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve(listener);

        let connector = connector(vec![loopback(1)], 4);
        let req = ConnectRequest::new("upstream.test", port, "upstream.test:80");
        let conn = connector.connect(&req).await.unwrap();
        let local = conn.stream.tcp().local_addr().unwrap();
        connector.release(&req.cache_key, conn);

        let again = connector.connect(&req).await.unwrap();
        assert!(again.reused);
        assert_eq!(again.stream.tcp().local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn test_fast_loser_is_parked() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();
        let second = TcpListener::bind(SocketAddr::new(loopback(2), port))
            .await
            .unwrap();
        serve(first);
        serve(second);

        let connector = connector(vec![loopback(1), loopback(2)], 4);
        let req = ConnectRequest::new("upstream.test", port, "upstream.test:80");
        let _conn = connector.connect(&req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.pool(false).idle_count("upstream.test:80"), 1);
    }

    fn tls_connector(ips: Vec<IpAddr>) -> RaceConnector {
        connector_with(&fixture_link(4), Arc::new(FixedResolver(ips)))
    }

    /// Trusted key, dialed under a name the certificate does not carry
    fn trusted_request(port: u16) -> ConnectRequest {
        ConnectRequest::new("elsewhere.test", port, "google_gws:443")
            .tls(true)
            .retries(1)
    }

    #[tokio::test]
    async fn test_trusted_front_passes_chain_and_organization() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve_tls(listener, acceptor(FRONT_CERT, FRONT_KEY), 0);

        let connector = tls_connector(vec![loopback(1)]);
        let conn = connector.connect(&trusted_request(port)).await.unwrap();
        assert!(conn.stream.is_tls());
        let addr = SocketAddr::new(loopback(1), port);
        assert!(connector.latency().tls_time(&addr).unwrap() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_organization_mismatch_is_penalized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve_tls(listener, acceptor(IMPOSTOR_CERT, IMPOSTOR_KEY), 0);

        let connector = tls_connector(vec![loopback(1)]);
        match connector.connect(&trusted_request(port)).await {
            Err(TransportError::Exhausted { last, .. }) => match *last {
                TransportError::Trust { organization, .. } => {
                    assert_eq!(organization.as_deref(), Some("Mallory Ltd"))
                }
                other => panic!("unexpected error: {}", other),
            },
            Err(other) => panic!("unexpected error: {}", other),
            Ok(conn) => panic!("connected to {}", conn.peer),
        }
        let addr = SocketAddr::new(loopback(1), port);
        assert!(connector.latency().tls_time(&addr).unwrap() >= Duration::from_secs(8));

        // the organization is pinned for trusted keys only
        let other = ConnectRequest::new("elsewhere.test", port, "elsewhere.test:443").tls(true);
        assert!(connector.connect(&other).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_ca_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve_tls(listener, acceptor(FRONT_CERT, FRONT_KEY), 0);

        // built-in roots only
        let connector = connector(vec![loopback(1)], 4);
        match connector.connect(&trusted_request(port)).await {
            Err(TransportError::Exhausted { last, .. }) => {
                assert!(matches!(*last, TransportError::Handshake { .. }))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(conn) => panic!("connected to {}", conn.peer),
        }
    }

    #[tokio::test]
    async fn test_tls_loser_is_parked() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();
        let second = TcpListener::bind(SocketAddr::new(loopback(2), port))
            .await
            .unwrap();
        serve_tls(first, acceptor(FRONT_CERT, FRONT_KEY), 0);
        serve_tls(second, acceptor(FRONT_CERT, FRONT_KEY), 0);

        let connector = tls_connector(vec![loopback(1), loopback(2)]);
        let conn = connector.connect(&trusted_request(port)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let pool = connector.pool(true);
        assert_eq!(pool.idle_count("google_gws:443"), 1);
        let parked = pool.checkout("google_gws:443").await.unwrap();
        assert!(parked.stream.is_tls());
        assert_ne!(parked.peer, conn.peer);
    }

    #[tokio::test]
    async fn test_handshake_eof_is_retried_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve_tls(listener, acceptor(FRONT_CERT, FRONT_KEY), 1);

        let connector = tls_connector(Vec::new());
        let took = connector
            .probe_handshake(loopback(1), port, "google_gws:443", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(took < Duration::from_secs(2));
        assert_eq!(connector.pool(true).idle_count("google_gws:443"), 1);
    }

    #[tokio::test]
    async fn test_second_handshake_eof_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve_tls(listener, acceptor(FRONT_CERT, FRONT_KEY), 2);

        let connector = tls_connector(Vec::new());
        let err = connector
            .probe_handshake(loopback(1), port, "google_gws:443", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_unexpected_eof());
        assert_eq!(connector.pool(true).idle_count("google_gws:443"), 0);
    }
}
