/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Slot identifiers gating concurrent sub-fetches.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub struct SlotPool {
    idle: Mutex<VecDeque<String>>,
    notify: Notify,
    total: AtomicUsize,
    last_status: Mutex<HashMap<String, u16>>,
}

impl SlotPool {
    /// Pool over `ids`, or `count` anonymous slots when no ids are configured
    pub fn new(ids: &[String], count: usize) -> Self {
        let idle: VecDeque<String> = if ids.is_empty() {
            (1..=count.max(1)).map(|i| format!("slot-{}", i)).collect()
        } else {
            ids.iter().cloned().collect()
        };
        Self {
            total: AtomicUsize::new(idle.len()),
            idle: Mutex::new(idle),
            notify: Notify::new(),
            last_status: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn statuses(&self) -> MutexGuard<'_, HashMap<String, u16>> {
        self.last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a slot, waiting up to `wait`
    pub async fn take(&self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(slot) = self.lock().pop_front() {
                return Some(slot);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.lock().pop_front();
            }
        }
    }

    pub fn give_back(&self, slot: String) {
        self.lock().push_back(slot);
        self.notify.notify_one();
    }

    /// Retire a taken slot for good, unless it is the last one
    pub fn retire(&self, slot: &str) -> bool {
        let retired = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total > 1).then(|| total - 1)
            })
            .is_ok();
        if retired {
            self.statuses().remove(slot);
        }
        retired
    }

    pub fn record_status(&self, slot: &str, status: u16) {
        self.statuses().insert(slot.to_string(), status);
    }

    pub fn last_status(&self, slot: &str) -> Option<u16> {
        self.statuses().get(slot).copied()
    }

    /// Slots still in circulation
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }
}
