/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Range-fetch reassembly. A large resource is split into ranged sub-fetches
//! that a few fetchlets run concurrently; the writer emits the chunks strictly
//! in offset order.

pub mod queue;
pub mod slots;
pub mod source;

pub use queue::{OrderedQueue, RangeResult, RangeTask, ResultBuffer};
pub use slots::SlotPool;
pub use source::{
    parse_content_range, HttpRangeSource, RangeBody, RangeResponse, RangeSource, SubFetch,
};

use bytes::Bytes;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

use crate::config::Config;
use crate::error::{TransportError, TransportResult};
use crate::iplist::IpList;
use crate::prober::IpProber;

/// Headers rewritten when the client head is built
const FRAMING_HEADERS: &[&str] = &["Content-Range", "Content-Length", "Transfer-Encoding"];

/// Tuning of one range fetch
#[derive(Debug, Clone)]
pub struct RangeSettings {
    pub max_size: u64,
    pub buf_size: usize,
    pub threads: usize,
    /// The IP snapshot never shrinks below this
    pub min_ip: usize,
    /// Bytes per second
    pub low_speed: u64,
    /// Start delay between consecutive fetchlets after a probe was triggered
    pub stagger: Duration,
    pub read_timeout: Duration,
    /// Longest the writer waits without progress
    pub silence_timeout: Duration,
    pub gap_wait: Duration,
    pub pop_wait: Duration,
    pub slot_backoff: Duration,
    pub backpressure_poll: Duration,
}

impl RangeSettings {
    pub fn from_config(config: &Config) -> Self {
        let range = &config.range;
        let threads = range.threads.max(1);
        Self {
            max_size: range.max_size.max(1),
            buf_size: range.buf_size.max(1),
            threads,
            min_ip: threads.saturating_sub(2).max(3),
            low_speed: range.low_speed,
            stagger: Duration::from_secs_f64(config.finder.max_timeout_ms as f64 / 500.0),
            read_timeout: config.range_timeout(),
            silence_timeout: Duration::from_secs(120),
            gap_wait: Duration::from_millis(100),
            pop_wait: Duration::from_secs(1),
            slot_backoff: Duration::from_secs(2),
            backpressure_poll: Duration::from_millis(100),
        }
    }

    /// Buffered bytes above which fetchlet `index` holds back far-ahead ranges
    pub fn delay_size(&self, index: usize) -> u64 {
        let weight = self.threads.saturating_sub(index) as f64;
        (weight * self.max_size as f64 * self.threads as f64 * 0.66) as u64
    }
}

/// Split `[end+1, length)` into chunks on `max_size` boundaries, after the
/// already answered `[start, end]`.
pub fn plan(start: u64, end: u64, length: u64, max_size: u64) -> Vec<RangeTask> {
    let max_size = max_size.max(1);
    let mut tasks = vec![RangeTask::new(start, end)];
    let mut begin = end + 1;
    while begin < length {
        let boundary = (begin / max_size + 1) * max_size;
        let stop = boundary.min(length) - 1;
        tasks.push(RangeTask::new(begin, stop));
        begin = stop + 1;
    }
    tasks
}

/// Head sent to the client: a full 200 when the fetch starts at zero,
/// otherwise a 206 echoing the initial range.
pub fn response_head(start: u64, end: u64, length: u64, headers: &[(String, String)]) -> Vec<u8> {
    let mut head = if start == 0 {
        String::from("HTTP/1.1 200 OK\r\n")
    } else {
        String::from("HTTP/1.1 206 Partial Content\r\n")
    };
    for (name, value) in headers {
        if FRAMING_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if start != 0 {
        head.push_str(&format!("Content-Range: bytes {}-{}/{}\r\n", start, end, length));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", length - start));
    head.into_bytes()
}

/// One range fetch, built from the first partial response
pub struct RangeFetch {
    source: Arc<dyn RangeSource>,
    settings: RangeSettings,
    url: Url,
    headers: Vec<(String, String)>,
    initial: RangeResponse,
    start: u64,
    end: u64,
    length: u64,
    slot_ids: Vec<String>,
    ip_pool: Option<(Arc<IpList>, String)>,
    prober: Option<Arc<IpProber>>,
}

impl RangeFetch {
    /// `headers` are the client's request headers, forwarded on every
    /// sub-fetch.
    pub fn new(
        source: Arc<dyn RangeSource>,
        url: Url,
        headers: Vec<(String, String)>,
        initial: RangeResponse,
        settings: RangeSettings,
    ) -> TransportResult<Self> {
        let (start, end, length) = initial.content_range().ok_or_else(|| {
            TransportError::protocol(format!("{} answered without a usable Content-Range", url))
        })?;
        Ok(Self {
            source,
            settings,
            url,
            headers,
            initial,
            start,
            end,
            length,
            slot_ids: Vec::new(),
            ip_pool: None,
            prober: None,
        })
    }

    pub fn with_slots(mut self, ids: &[String]) -> Self {
        self.slot_ids = ids.to_vec();
        self
    }

    /// Check and prune responders against a snapshot of `pool`
    pub fn with_ip_pool(mut self, iplist: Arc<IpList>, pool: impl Into<String>) -> Self {
        self.ip_pool = Some((iplist, pool.into()));
        self
    }

    /// Kick a full probe when the fetch starts
    pub fn with_prober(mut self, prober: Arc<IpProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn head(&self) -> Vec<u8> {
        response_head(self.start, self.end, self.length, &self.initial.headers)
    }

    /// Write the head and every byte from the initial offset to the end of the
    /// resource into `output`. Returns the body bytes written.
    pub async fn fetch<W>(self, output: &mut W) -> TransportResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let span = crate::span_range_fetch!(self.url.as_str());
        self.run(output).instrument(span).await
    }

    async fn run<W>(self, output: &mut W) -> TransportResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let head = self.head();
        let stagger = match &self.prober {
            Some(prober) if prober.trigger_probe_all() => self.settings.stagger,
            _ => Duration::ZERO,
        };
        let state = self.into_state();
        let _stop = StopOnDrop(state.clone());

        output.write_all(&head).await.map_err(|e| {
            info!("client went away before the head was written: {}", e);
            TransportError::ClientGone
        })?;

        info!(
            "fetching {}-{} of {} bytes with {} fetchlets",
            state.initial_start,
            state.length - 1,
            state.length,
            state.settings.threads
        );
        for index in 0..state.settings.threads {
            let state = state.clone();
            let delay = stagger * index as u32;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                state.fetchlet(index).await;
            });
        }

        state.drain(output).await
    }

    fn into_state(self) -> Arc<FetchState> {
        let tasks = OrderedQueue::new();
        for task in plan(self.start, self.end, self.length, self.settings.max_size) {
            tasks.push(task);
        }
        if let Some((iplist, _)) = &self.ip_pool {
            iplist.mark_active();
        }
        Arc::new(FetchState {
            slots: SlotPool::new(&self.slot_ids, self.settings.threads),
            source: self.source,
            url: Mutex::new(self.url),
            headers: self.headers,
            tasks,
            results: ResultBuffer::new(),
            ip_pool: self.ip_pool,
            snapshot: Mutex::new(Snapshot::default()),
            initial: Mutex::new(Some(self.initial)),
            initial_start: self.start,
            length: self.length,
            expected: AtomicU64::new(self.start),
            stopped: AtomicBool::new(false),
            settings: self.settings,
        })
    }
}

#[derive(Default)]
struct Snapshot {
    version: Option<u64>,
    ips: Vec<String>,
}

struct FetchState {
    source: Arc<dyn RangeSource>,
    settings: RangeSettings,
    url: Mutex<Url>,
    headers: Vec<(String, String)>,
    tasks: OrderedQueue<RangeTask>,
    results: ResultBuffer,
    slots: SlotPool,
    ip_pool: Option<(Arc<IpList>, String)>,
    snapshot: Mutex<Snapshot>,
    initial: Mutex<Option<RangeResponse>>,
    initial_start: u64,
    length: u64,
    expected: AtomicU64,
    stopped: AtomicBool,
}

/// Raises the stop flag however the writer exits
struct StopOnDrop(Arc<FetchState>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stopped.store(true, Ordering::SeqCst);
    }
}

impl FetchState {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn expected(&self) -> u64 {
        self.expected.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_url(&self) -> Url {
        self.url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn redirect(&self, location: &str) -> Result<Url, url::ParseError> {
        let mut url = self.url.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = url.join(location)?;
        *url = next.clone();
        Ok(next)
    }

    /// The initial response, if `start` is the range it answers
    fn take_initial(&self, start: u64) -> Option<RangeResponse> {
        if start != self.initial_start {
            return None;
        }
        self.initial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn refresh_snapshot(&self) {
        let Some((iplist, pool)) = &self.ip_pool else {
            return;
        };
        let version = iplist.version();
        let mut snapshot = self.snapshot();
        if snapshot.version != Some(version) {
            snapshot.ips = iplist.get(pool);
            snapshot.version = Some(version);
            debug!("IP snapshot refreshed, {} addresses", snapshot.ips.len());
        }
    }

    fn in_snapshot(&self, peer: IpAddr) -> bool {
        let snapshot = self.snapshot();
        snapshot.ips.is_empty() || snapshot.ips.iter().any(|ip| *ip == peer.to_string())
    }

    /// Drop `peer` from the snapshot unless that would leave fewer than `min_ip`
    fn drop_ip(&self, peer: IpAddr, reason: &str) {
        let ip = peer.to_string();
        let mut snapshot = self.snapshot();
        if snapshot.ips.len() <= self.settings.min_ip {
            return;
        }
        if let Some(pos) = snapshot.ips.iter().position(|known| *known == ip) {
            snapshot.ips.remove(pos);
            warn!("dropped {} IP {}, {} left", reason, ip, snapshot.ips.len());
        }
    }

    fn sub_fetch(&self, task: RangeTask, slot: &str) -> SubFetch {
        SubFetch {
            url: self.current_url(),
            start: task.start,
            end: task.end,
            slot: slot.to_string(),
            headers: self.headers.clone(),
        }
    }

    async fn fetchlet(&self, index: usize) {
        let delay_size = self.settings.delay_size(index);
        while !self.is_stopped() {
            self.refresh_snapshot();
            let Some(task) = self.tasks.pop_timeout(self.settings.pop_wait).await else {
                continue;
            };
            let Some(slot) = self.slots.take(self.settings.pop_wait).await else {
                self.tasks.push(task);
                continue;
            };
            if self.slots.last_status(&slot).is_some_and(|status| status >= 500) {
                tokio::time::sleep(self.settings.slot_backoff).await;
            }
            while task.start.saturating_sub(self.expected()) > self.settings.max_size
                && self.results.pending_bytes() > delay_size
            {
                if self.is_stopped() {
                    return;
                }
                tokio::time::sleep(self.settings.backpressure_poll).await;
            }
            if self.is_stopped() {
                return;
            }
            if self.run_task(index, task, &slot).await {
                self.slots.give_back(slot);
            }
        }
        debug!("fetchlet {} stopped", index);
    }

    /// Fetch one range. Returns whether the slot goes back into circulation.
    async fn run_task(&self, index: usize, task: RangeTask, slot: &str) -> bool {
        let request = self.sub_fetch(task, slot);
        let mut response = match self.take_initial(task.start) {
            Some(response) => response,
            None => match self.source.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("[{}] fetch {}-{} failed: {}", index, task.start, task.end, e);
                    self.tasks.push(task);
                    return true;
                }
            },
        };

        if let Some(peer) = response.peer {
            if self.source.uses_ip_pool() && !self.in_snapshot(peer) {
                debug!("[{}] {} is not in the IP snapshot, requeue {}-{}", index, peer, task.start, task.end);
                self.tasks.push(task);
                return true;
            }
        }

        self.slots
            .record_status(slot, response.app_status.unwrap_or(response.status));
        if let Some(app_status) = response.app_status.filter(|status| *status != 200) {
            warn!("[{}] slot {} answered {}, requeue {}-{}", index, slot, app_status, task.start, task.end);
            self.tasks.push(task);
            return true;
        }

        if let Some(location) = response.header("Location") {
            match self.redirect(location) {
                Ok(next) => info!("[{}] range fetch redirected to {}", index, next),
                Err(e) => warn!("[{}] unusable redirect {:?}: {}", index, location, e),
            }
            self.tasks.push(task);
            return true;
        }

        if !(200..300).contains(&response.status) {
            error!("[{}] range {}-{} failed with status {}", index, task.start, task.end, response.status);
            self.tasks.push(task);
            let retired = self.slots.retire(slot);
            if retired {
                warn!("[{}] slot {} taken out of rotation", index, slot);
            }
            return !retired;
        }

        match response.content_range() {
            Some((start, _, _)) if start == task.start => {}
            Some((start, _, _)) => {
                warn!("[{}] asked for {} but data starts at {}, requeue", index, task.start, start);
                self.tasks.push(task);
                return true;
            }
            None => {
                warn!("[{}] no Content-Range for {}-{}, requeue", index, task.start, task.end);
                self.tasks.push(task);
                return true;
            }
        }

        let started = Instant::now();
        let mut offset = task.start;
        let mut buf = vec![0u8; self.settings.buf_size];
        let mut failure = None;
        let mut ended_early = false;
        while offset <= task.end {
            if self.is_stopped() {
                return true;
            }
            match tokio::time::timeout(self.settings.read_timeout, response.body.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    ended_early = true;
                    break;
                }
                Ok(Ok(n)) => {
                    let take = (task.end + 1 - offset).min(n as u64) as usize;
                    self.results.push(offset, Bytes::copy_from_slice(&buf[..take]));
                    offset += take as u64;
                }
                Ok(Err(e)) => {
                    failure = Some(e.to_string());
                    break;
                }
                Err(_) => {
                    failure = Some(format!("no data for {:?}", self.settings.read_timeout));
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            warn!("[{}] range {}-{} stopped at {}: {}", index, task.start, task.end, offset, reason);
            if let Some(peer) = response.peer {
                self.drop_ip(peer, "failing");
            }
            self.tasks.push(RangeTask::new(offset, task.end));
            return true;
        }
        if ended_early {
            debug!("[{}] range {}-{} ended at {}, requeue the rest", index, task.start, task.end, offset);
            self.tasks.push(RangeTask::new(offset, task.end));
            return true;
        }

        debug!("[{}] received {}-{}", index, task.start, task.end);
        if let Some(peer) = response.peer {
            let speed = task.len() as f64 / started.elapsed().as_secs_f64().max(0.001);
            if speed < self.settings.low_speed as f64 {
                self.drop_ip(peer, "slow");
            }
        }
        if let Some((iplist, _)) = &self.ip_pool {
            iplist.mark_active();
        }
        self.source.release(&request, response);
        true
    }

    /// Write buffered chunks in offset order until the resource is complete
    async fn drain<W>(&self, output: &mut W) -> TransportResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut expected = self.initial_start;
        let mut progress = Instant::now();
        while expected < self.length {
            if progress.elapsed() >= self.settings.silence_timeout {
                error!("no data at offset {} for {:?}", expected, self.settings.silence_timeout);
                return Err(TransportError::protocol(format!(
                    "range fetch stalled at offset {}",
                    expected
                )));
            }
            match self.results.front() {
                Some(begin) if begin == expected => {
                    let Some(result) = self.results.pop() else {
                        continue;
                    };
                    output.write_all(&result.data).await.map_err(|e| {
                        info!("client went away at offset {}: {}", expected, e);
                        TransportError::ClientGone
                    })?;
                    expected += result.data.len() as u64;
                    self.expected.store(expected, Ordering::SeqCst);
                    progress = Instant::now();
                }
                Some(begin) if begin > expected => {
                    tokio::time::sleep(self.settings.gap_wait).await;
                }
                Some(begin) => {
                    error!("chunk at {} precedes expected offset {}", begin, expected);
                    return Err(TransportError::protocol(format!(
                        "chunk at {} precedes expected offset {}",
                        begin, expected
                    )));
                }
                None => {
                    let left = self.settings.silence_timeout.saturating_sub(progress.elapsed());
                    self.results.wait_nonempty(left).await;
                }
            }
        }
        output.flush().await.map_err(|_| TransportError::ClientGone)?;

        let written = expected - self.initial_start;
        info!("range fetch complete, {} bytes written", written);
        Ok(written)
    }
}
