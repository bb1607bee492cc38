/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Caps the number of simultaneous connects to a single IP.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::timed_cache::TimedCache;

/// Per-IP connect slots, bounded in the number of IPs tracked
pub struct ConnectLimiter {
    slots: TimedCache<IpAddr, Arc<Semaphore>>,
    per_ip: usize,
}

/// Held while a connect to one IP is in flight; dropping it frees the slot
#[derive(Debug)]
pub struct ConnectSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConnectLimiter {
    pub fn new(tracked_ips: usize, per_ip: usize) -> Self {
        Self {
            slots: TimedCache::new(tracked_ips),
            per_ip: per_ip.max(1),
        }
    }

    fn semaphore(&self, ip: IpAddr) -> Arc<Semaphore> {
        self.slots
            .get_or_insert_with(ip, || Arc::new(Semaphore::new(self.per_ip)))
    }

    /// Wait for a free slot for `ip`
    pub async fn acquire(&self, ip: IpAddr) -> ConnectSlot {
        loop {
            // semaphores here are never closed
            if let Ok(permit) = self.semaphore(ip).acquire_owned().await {
                return ConnectSlot { _permit: permit };
            }
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectSlot> {
        self.semaphore(ip)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectSlot { _permit: permit })
    }

    /// Slots currently free for `ip`
    pub fn available(&self, ip: IpAddr) -> usize {
        self.slots
            .get(&ip)
            .map(|sem| sem.available_permits())
            .unwrap_or(self.per_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[tokio::test]
    async fn test_slots_are_bounded_per_ip() {
        let limiter = ConnectLimiter::new(8, 2);
        let first = limiter.acquire(ip(1)).await;
        let _second = limiter.acquire(ip(1)).await;
        assert!(limiter.try_acquire(ip(1)).is_none());
        assert_eq!(limiter.available(ip(1)), 0);

        // another IP is unaffected
        assert!(limiter.try_acquire(ip(2)).is_some());

        drop(first);
        assert_eq!(limiter.available(ip(1)), 1);
        assert!(limiter.try_acquire(ip(1)).is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let limiter = Arc::new(ConnectLimiter::new(8, 1));
        let held = limiter.acquire(ip(3)).await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _slot = limiter.acquire(ip(3)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
