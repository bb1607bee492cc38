/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Connection racing and pooling: ranked candidates are raced, the winner is
//! handed out, losers and returned connections are kept warm in LIFO pools.

pub mod http;
pub mod limiter;
pub mod pool;
pub mod race;
pub mod resolve;
pub mod stream;
pub mod timed_cache;
pub mod tls;
pub mod verifier;

pub use http::{HttpClient, HttpRequest, HttpResponse, ResponseBody};
pub use pool::{Admission, ConnectionPool, KeepAlivePolicy};
pub use race::{ConnectRequest, Connected, RaceConnector};
pub use resolve::{matches_suffix, PoolResolver, Resolver, SystemResolver};
pub use stream::Transport;
pub use timed_cache::TimedCache;
pub use tls::TlsContext;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::TransportResult;
use crate::service::ServiceHandle;

/// Everything needed to open connections, built once at startup
pub struct TransportStack {
    pub connector: Arc<RaceConnector>,
    pub http: Arc<HttpClient>,
    pub plain_pool: Arc<ConnectionPool>,
    pub tls_pool: Arc<ConnectionPool>,
    sweep_plain: Duration,
    sweep_tls: Duration,
}

impl TransportStack {
    pub fn build(config: &Config, resolver: Arc<dyn Resolver>) -> TransportResult<Self> {
        let link = &config.link;
        let policy = KeepAlivePolicy {
            trusted_prefix: link.trusted_prefix.clone(),
            trusted: Duration::from_secs(link.trusted_keep_alive_secs),
            default: Duration::from_secs(link.keep_alive_secs),
        };
        // writability must show up within the probe budget plus a margin
        let write_wait = Duration::from_millis(config.finder.max_timeout_ms).mul_f64(1.2);

        let plain_pool = Arc::new(ConnectionPool::new(
            "plain-pool",
            policy.clone(),
            Admission::PLAIN,
            write_wait,
        ));
        let tls_pool = Arc::new(ConnectionPool::new(
            "tls-pool",
            policy,
            Admission::TLS,
            write_wait,
        ));
        let tls = Arc::new(TlsContext::from_config(link)?);
        let connector = Arc::new(RaceConnector::new(
            link,
            config.range.threads,
            resolver,
            tls,
            plain_pool.clone(),
            tls_pool.clone(),
        ));
        let http = Arc::new(HttpClient::new(connector.clone(), link.max_retry));

        Ok(Self {
            connector,
            http,
            plain_pool,
            tls_pool,
            sweep_plain: Duration::from_secs(link.sweep_plain_secs.max(1)),
            sweep_tls: Duration::from_secs(link.sweep_tls_secs.max(1)),
        })
    }

    /// Start both pool sweepers
    pub fn start_sweepers(&self) -> Vec<ServiceHandle> {
        vec![
            self.plain_pool.spawn_sweeper(self.sweep_plain),
            self.tls_pool.spawn_sweeper(self.sweep_tls),
        ]
    }
}
