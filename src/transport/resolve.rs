/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Host name to candidate IP resolution.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::{TransportError, TransportResult};
use crate::iplist::IpList;

/// Turns a logical host into candidate addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> TransportResult<Vec<IpAddr>>;
}

/// Literal IPs pass through, names go to the system resolver
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> TransportResult<Vec<IpAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let resolved = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| TransportError::Resolve {
                host: host.to_string(),
            })?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// Hosts under the configured suffixes resolve to the trusted IP pool
pub struct PoolResolver {
    iplist: Arc<IpList>,
    pool: String,
    suffixes: Vec<String>,
    fallback: Arc<dyn Resolver>,
}

impl PoolResolver {
    pub fn new(
        iplist: Arc<IpList>,
        pool: impl Into<String>,
        suffixes: Vec<String>,
        fallback: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            iplist,
            pool: pool.into(),
            suffixes,
            fallback,
        }
    }

    fn routed(&self, host: &str) -> bool {
        matches_suffix(host, &self.suffixes)
    }
}

/// True if `host` sits under one of `suffixes` (`.example.com` also matches
/// `example.com` itself)
pub fn matches_suffix(host: &str, suffixes: &[String]) -> bool {
    suffixes
        .iter()
        .any(|suffix| host.ends_with(suffix.as_str()) || host == suffix.trim_start_matches('.'))
}

#[async_trait]
impl Resolver for PoolResolver {
    async fn resolve(&self, host: &str) -> TransportResult<Vec<IpAddr>> {
        if self.routed(host) {
            let ips: Vec<IpAddr> = self
                .iplist
                .get(&self.pool)
                .iter()
                .filter_map(|ip| ip.parse().ok())
                .collect();
            if !ips.is_empty() {
                return Ok(ips);
            }
        }
        self.fallback.resolve(host).await
    }
}
