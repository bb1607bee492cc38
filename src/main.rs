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

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use frontrace::config::Config;
use frontrace::iplist::IpList;
use frontrace::logging;
use frontrace::prober::{
    ConnectStats, ConnectorProbe, HttpIpSource, IpProber, IpSource, NoDiscovery, ProberSettings,
};
use frontrace::range::{HttpRangeSource, RangeFetch, RangeSettings, RangeSource, SubFetch};
use frontrace::transport::{matches_suffix, PoolResolver, SystemResolver, TransportStack};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  frontrace contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "frontrace")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Connection racing, IP pool probing and range-fetch reassembly.")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Configuration file")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "LEVEL", help = "Override the configured log level")]
    log_level: Option<String>,
    #[arg(long, help = "Probe every pooled IP once at startup")]
    probe_all: bool,
    #[arg(
        long,
        value_name = "URL",
        help = "Fetch URL with parallel range requests and write the response to stdout"
    )]
    fetch: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    logging::init_with_file(level, config.logging.file.as_deref());

    let finder = &config.finder;
    let iplist = Arc::new(IpList::load(&finder.iplist_file)?);
    info!(
        "{} IPs in {}, {} in {}",
        iplist.len(&finder.primary_pool),
        finder.primary_pool,
        iplist.len(&finder.secondary_pool),
        finder.secondary_pool
    );

    let resolver = Arc::new(PoolResolver::new(
        iplist.clone(),
        finder.primary_pool.clone(),
        finder.pool_hosts.clone(),
        Arc::new(SystemResolver),
    ));
    let stack = TransportStack::build(&config, resolver)?;

    let stats = ConnectStats::open(&finder.statistics_file)?;
    let probe = Arc::new(ConnectorProbe::new(
        stack.connector.clone(),
        format!("{}:443", finder.primary_pool),
        443,
    ));
    let source: Arc<dyn IpSource> = match &finder.discovery_url {
        Some(url) => Arc::new(HttpIpSource::new(url.clone(), finder.primary_pool.clone())?),
        None => Arc::new(NoDiscovery),
    };
    let prober = Arc::new(IpProber::new(
        iplist.clone(),
        stats,
        probe,
        source,
        ProberSettings::from(finder),
    ));

    let mut services = stack.start_sweepers();
    services.push(prober.start());

    if cli.probe_all {
        let outcome = prober.probe_all(true).await;
        info!("startup probe: {:?}", outcome);
    }

    let result = match cli.fetch.as_deref() {
        Some(url) => fetch_to_stdout(&config, &stack, &iplist, &prober, url).await,
        None => {
            info!("frontrace {} running, Ctrl-C to stop", VERSION);
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for Ctrl-C")
        }
    };

    for service in services {
        service.stop().await;
    }
    if let Err(e) = iplist.save(&finder.iplist_file) {
        warn!("failed to save IP list: {}", e);
    }
    result
}

async fn fetch_to_stdout(
    config: &Config,
    stack: &TransportStack,
    iplist: &Arc<IpList>,
    prober: &Arc<IpProber>,
    url: &str,
) -> Result<()> {
    let url = Url::parse(url).with_context(|| format!("invalid URL '{}'", url))?;
    let pooled = url
        .host_str()
        .is_some_and(|host| matches_suffix(host, &config.finder.pool_hosts));
    let settings = RangeSettings::from_config(config);

    let mut source = HttpRangeSource::new(stack.http.clone(), config.range_timeout(), pooled);
    if pooled {
        let port = url.port_or_known_default().unwrap_or(443);
        source = source.with_cache_key(format!("{}:{}", config.finder.primary_pool, port));
    }
    let source = Arc::new(source);

    let first = SubFetch {
        url: url.clone(),
        start: 0,
        end: settings.max_size - 1,
        slot: String::new(),
        headers: Vec::new(),
    };
    let initial = source
        .fetch(&first)
        .await
        .with_context(|| format!("initial request to {} failed", url))?;

    let mut fetch = RangeFetch::new(source, url, Vec::new(), initial, settings)?
        .with_slots(&config.range.app_ids)
        .with_prober(prober.clone());
    if pooled {
        fetch = fetch.with_ip_pool(iplist.clone(), config.finder.primary_pool.clone());
    }

    let mut stdout = tokio::io::stdout();
    let written = fetch.fetch(&mut stdout).await?;
    info!("fetched {} bytes", written);
    Ok(())
}
