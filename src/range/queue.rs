/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Min-ordered queues shared between fetchlets and the writer.

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Inclusive byte range still to be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RangeTask {
    pub start: u64,
    pub end: u64,
}

impl RangeTask {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end + 1 - self.start
    }
}

/// Bytes fetched for the offset `start`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RangeResult {
    pub start: u64,
    pub data: Bytes,
}

/// Priority queue popping the smallest item first, with bounded waits
pub struct OrderedQueue<T: Ord> {
    heap: Mutex<BinaryHeap<Reverse<T>>>,
    notify: Notify,
}

impl<T: Ord> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }
}

impl<T: Ord> OrderedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Reverse<T>>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: T) {
        self.lock().push(Reverse(item));
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop().map(|Reverse(item)| item)
    }

    /// Look at the smallest item without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().peek().map(|Reverse(item)| f(item))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the smallest item, waiting up to `wait` for one to show up
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Wait up to `wait` until the queue holds something
    pub async fn wait_nonempty(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if !self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return !self.is_empty();
            }
        }
    }
}

/// Fetched chunks waiting to be written in offset order
#[derive(Default)]
pub struct ResultBuffer {
    queue: OrderedQueue<RangeResult>,
    pending: AtomicU64,
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, start: u64, data: Bytes) {
        self.pending.fetch_add(data.len() as u64, Ordering::SeqCst);
        self.queue.push(RangeResult { start, data });
    }

    /// Offset of the lowest buffered chunk
    pub fn front(&self) -> Option<u64> {
        self.queue.peek_with(|result| result.start)
    }

    pub fn pop(&self) -> Option<RangeResult> {
        let result = self.queue.try_pop()?;
        self.pending
            .fetch_sub(result.data.len() as u64, Ordering::SeqCst);
        Some(result)
    }

    /// Bytes fetched but not yet written
    pub fn pending_bytes(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn wait_nonempty(&self, wait: Duration) -> bool {
        self.queue.wait_nonempty(wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pops_smallest_first() {
        let queue = OrderedQueue::new();
        queue.push(RangeTask::new(500, 999));
        queue.push(RangeTask::new(0, 99));
        queue.push(RangeTask::new(100, 499));
        assert_eq!(queue.peek_with(|t| t.start), Some(0));
        assert_eq!(queue.try_pop(), Some(RangeTask::new(0, 99)));
        assert_eq!(queue.try_pop(), Some(RangeTask::new(100, 499)));
        assert_eq!(queue.try_pop(), Some(RangeTask::new(500, 999)));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_bounded_wait() {
        let queue: Arc<OrderedQueue<RangeTask>> = Arc::new(OrderedQueue::new());
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)).await, None);

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(RangeTask::new(7, 9));
        });
        assert_eq!(
            queue.pop_timeout(Duration::from_secs(2)).await,
            Some(RangeTask::new(7, 9))
        );
    }

    #[test]
    fn test_result_buffer_tracks_pending_bytes() {
        let buffer = ResultBuffer::new();
        buffer.push(8, Bytes::from_static(b"world"));
        buffer.push(0, Bytes::from_static(b"hello, "));
        assert_eq!(buffer.pending_bytes(), 12);
        assert_eq!(buffer.front(), Some(0));

        let first = buffer.pop().unwrap();
        assert_eq!(first.data, Bytes::from_static(b"hello, "));
        assert_eq!(buffer.pending_bytes(), 5);
        assert_eq!(buffer.front(), Some(8));
        assert_eq!(RangeTask::new(0, 99).len(), 100);
    }
}
