/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Where fresh candidate IPs come from.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// New IPs keyed by pool name
pub type Discovered = BTreeMap<String, Vec<String>>;

/// Supplies candidate IPs the pools do not know yet
#[async_trait]
pub trait IpSource: Send + Sync {
    /// Find about `wanted` IPs not already in `known`
    async fn discover(&self, known: &[String], wanted: usize) -> TransportResult<Discovered>;
}

/// Source used when nothing is configured
pub struct NoDiscovery;

#[async_trait]
impl IpSource for NoDiscovery {
    async fn discover(&self, _known: &[String], wanted: usize) -> TransportResult<Discovered> {
        debug!("no discovery source configured, {} IPs wanted", wanted);
        Ok(Discovered::new())
    }
}

/// Parse a listing of bare IPs (one per line, for `default_pool`) and
/// `name = ip|ip|...` lines. Comments start with `#` or `;`.
pub fn parse_listing(text: &str, default_pool: &str) -> Discovered {
    let mut found = Discovered::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let (pool, values) = match line.split_once('=') {
            Some((name, values)) => (name.trim(), values),
            None => (default_pool, line),
        };
        let ips = found.entry(pool.to_string()).or_default();
        for ip in values.split(['|', ',', ' ']).map(str::trim) {
            if ip.parse::<IpAddr>().is_ok() && !ips.iter().any(|known| known == ip) {
                ips.push(ip.to_string());
            }
        }
    }
    found.retain(|_, ips| !ips.is_empty());
    found
}

/// Fetches a listing over HTTP
pub struct HttpIpSource {
    client: reqwest::Client,
    url: String,
    default_pool: String,
}

impl HttpIpSource {
    pub fn new(url: impl Into<String>, default_pool: impl Into<String>) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("frontrace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Discovery {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
            default_pool: default_pool.into(),
        })
    }
}

#[async_trait]
impl IpSource for HttpIpSource {
    async fn discover(&self, known: &[String], wanted: usize) -> TransportResult<Discovered> {
        let discovery = |e: reqwest::Error| TransportError::Discovery {
            message: format!("{}: {}", self.url, e),
        };
        let text = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(discovery)?
            .text()
            .await
            .map_err(discovery)?;

        let mut found = parse_listing(&text, &self.default_pool);
        for ips in found.values_mut() {
            ips.retain(|ip| !known.contains(ip));
        }
        if let Some(primary) = found.get_mut(&self.default_pool) {
            primary.truncate(wanted.max(1));
        }
        found.retain(|_, ips| !ips.is_empty());
        debug!("discovered {} new IPs", found.values().map(Vec::len).sum::<usize>());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing() {
        let text = "\
# fresh front-ends
203.0.113.1
203.0.113.2
not-an-ip
google_com = 198.51.100.1|198.51.100.2|198.51.100.1
203.0.113.1
";
        let found = parse_listing(text, "google_gws");
        assert_eq!(found["google_gws"], vec!["203.0.113.1", "203.0.113.2"]);
        assert_eq!(found["google_com"], vec!["198.51.100.1", "198.51.100.2"]);
    }

    #[test]
    fn test_empty_listing() {
        assert!(parse_listing("\n# nothing\n", "google_gws").is_empty());
    }

    #[tokio::test]
    async fn test_no_discovery_is_empty() {
        assert!(NoDiscovery.discover(&[], 3).await.unwrap().is_empty());
    }
}
