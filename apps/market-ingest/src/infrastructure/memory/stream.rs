//! In-memory stream buffer with consumer groups.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::application::ports::{BufferError, StreamBuffer};
use crate::domain::stream::{ClaimResult, EntryId, GroupStart, StreamEntry, StreamInfo};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<EntryId, String>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

/// In-memory implementation of `StreamBuffer`.
///
/// Mirrors the delivery rules of a Redis stream: ids increase
/// monotonically, each group tracks its own delivery cursor and pending
/// list, and the log is trimmed to `max_len` once it grows past
/// `max_len + trim_slack`. A `max_len` of 0 keeps every entry.
#[derive(Debug)]
pub struct InMemoryStreamBuffer {
    inner: Mutex<Inner>,
    appended: Notify,
    max_len: u64,
    trim_slack: u64,
    unavailable: AtomicBool,
}

impl InMemoryStreamBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(max_len: u64, trim_slack: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
            max_len,
            trim_slack,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Pending count for `group`, or 0 if it does not exist.
    #[must_use]
    pub fn pending_now(&self, group: &str) -> u64 {
        self.inner
            .lock()
            .groups
            .get(group)
            .map_or(0, |g| g.pending.len() as u64)
    }

    /// How many times `id` has been delivered to `group`.
    #[must_use]
    pub fn delivery_count(&self, group: &str, id: EntryId) -> Option<u32> {
        self.inner
            .lock()
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.deliveries)
    }

    /// Consumer owning pending entry `id` in `group`.
    #[must_use]
    pub fn pending_owner(&self, group: &str, id: EntryId) -> Option<String> {
        self.inner
            .lock()
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.consumer.clone())
    }

    fn check_available(&self) -> Result<(), BufferError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BufferError::Connection("buffer unavailable".to_string()));
        }
        Ok(())
    }

    fn deliver(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BufferError> {
        let mut inner = self.inner.lock();
        let Inner { entries, groups, .. } = &mut *inner;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| BufferError::NoGroup(group.to_string()))?;

        let delivered: Vec<StreamEntry> = entries
            .range(state.last_delivered..)
            .filter(|(id, _)| **id > state.last_delivered)
            .take(count)
            .map(|(id, payload)| StreamEntry::new(*id, payload.clone()))
            .collect();

        let now = Instant::now();
        for entry in &delivered {
            state.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }
        if let Some(last) = delivered.last() {
            state.last_delivered = last.id;
        }
        Ok(delivered)
    }

    fn trim(&self, inner: &mut Inner) {
        let len = inner.entries.len() as u64;
        if self.max_len == 0 || len <= self.max_len.saturating_add(self.trim_slack) {
            return;
        }
        let excess = len - self.max_len;
        for _ in 0..excess {
            inner.entries.pop_first();
        }
    }
}

#[async_trait]
impl StreamBuffer for InMemoryStreamBuffer {
    async fn ensure_group(&self, group: &str, start: GroupStart) -> Result<(), BufferError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let last_delivered = match start {
            GroupStart::Beginning => EntryId::ZERO,
            GroupStart::Latest => inner.last_id,
        };
        inner
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn produce(&self, payload: &str) -> Result<EntryId, BufferError> {
        self.check_available()?;
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);

        let id = {
            let mut inner = self.inner.lock();
            let id = inner.last_id.successor(now_ms);
            inner.last_id = id;
            inner.entries.insert(id, payload.to_string());
            self.trim(&mut inner);
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BufferError> {
        let deadline = Instant::now() + block_timeout;

        loop {
            self.check_available()?;
            let appended = self.appended.notified();

            let delivered = self.deliver(group, consumer, batch_size)?;
            if !delivered.is_empty() || block_timeout.is_zero() {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<u64, BufferError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let Some(state) = inner.groups.get_mut(group) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter(|id| state.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<ClaimResult, BufferError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let Inner { entries, groups, .. } = &mut *inner;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| BufferError::NoGroup(group.to_string()))?;

        let now = Instant::now();
        let stale: Vec<EntryId> = state
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
            .take(count)
            .map(|(id, _)| *id)
            .collect();

        let mut result = ClaimResult::default();
        for id in stale {
            match entries.get(&id) {
                Some(payload) => {
                    if let Some(pending) = state.pending.get_mut(&id) {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at = now;
                        pending.deliveries += 1;
                    }
                    result.entries.push(StreamEntry::new(id, payload.clone()));
                }
                None => {
                    state.pending.remove(&id);
                    result.deleted.push(id);
                }
            }
        }
        Ok(result)
    }

    async fn length(&self) -> Result<u64, BufferError> {
        self.check_available()?;
        Ok(self.inner.lock().entries.len() as u64)
    }

    async fn pending(&self, group: &str) -> Result<u64, BufferError> {
        self.check_available()?;
        self.inner
            .lock()
            .groups
            .get(group)
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| BufferError::NoGroup(group.to_string()))
    }

    async fn info(&self) -> Result<StreamInfo, BufferError> {
        self.check_available()?;
        let inner = self.inner.lock();
        Ok(StreamInfo {
            length: inner.entries.len() as u64,
            first_id: inner.entries.keys().next().copied(),
            last_id: inner.entries.keys().next_back().copied(),
            max_len: self.max_len,
        })
    }

    async fn latest(&self, count: usize) -> Result<Vec<StreamEntry>, BufferError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .entries
            .iter()
            .rev()
            .take(count)
            .map(|(id, payload)| StreamEntry::new(*id, payload.clone()))
            .collect())
    }

    async fn oldest_unacked(&self, group: &str) -> Result<Option<EntryId>, BufferError> {
        self.check_available()?;
        let inner = self.inner.lock();
        let state = inner
            .groups
            .get(group)
            .ok_or_else(|| BufferError::NoGroup(group.to_string()))?;

        let pending = state.pending.keys().next().copied();
        let undelivered = inner
            .entries
            .range((Excluded(state.last_delivered), Unbounded))
            .next()
            .map(|(id, _)| *id);
        Ok(match (pending, undelivered) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    async fn trim_older_than(&self, cutoff: EntryId) -> Result<u64, BufferError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let kept = inner.entries.split_off(&cutoff);
        let removed = std::mem::replace(&mut inner.entries, kept);
        Ok(removed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: &str = "g";

    async fn buffer_with(n: usize, max_len: u64, slack: u64) -> InMemoryStreamBuffer {
        let buffer = InMemoryStreamBuffer::new(max_len, slack);
        buffer.ensure_group(GROUP, GroupStart::Beginning).await.unwrap();
        for i in 0..n {
            buffer.produce(&format!("p{i}")).await.unwrap();
        }
        buffer
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let buffer = buffer_with(50, 1000, 0).await;
        let entries = buffer.latest(50).await.unwrap();
        assert!(entries.windows(2).all(|w| w[0].id > w[1].id));
    }

    #[tokio::test]
    async fn delivers_each_entry_once_per_group() {
        let buffer = buffer_with(5, 100, 0).await;

        let first = buffer.consume(GROUP, "a", 3, Duration::ZERO).await.unwrap();
        let second = buffer.consume(GROUP, "b", 10, Duration::ZERO).await.unwrap();
        let third = buffer.consume(GROUP, "a", 10, Duration::ZERO).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(third.is_empty());
        assert!(first.last().unwrap().id < second[0].id);
        assert_eq!(buffer.pending(GROUP).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn ack_clears_pending_and_is_idempotent() {
        let buffer = buffer_with(2, 100, 0).await;
        let entries = buffer.consume(GROUP, "a", 10, Duration::ZERO).await.unwrap();
        let ids: Vec<EntryId> = entries.iter().map(|e| e.id).collect();

        assert_eq!(buffer.ack(GROUP, &ids).await.unwrap(), 2);
        assert_eq!(buffer.ack(GROUP, &ids).await.unwrap(), 0);
        assert_eq!(buffer.pending(GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trims_to_cap_once_slack_is_exceeded() {
        let buffer = buffer_with(12, 10, 2).await;
        assert_eq!(buffer.length().await.unwrap(), 12);

        buffer.produce("overflow").await.unwrap();
        let info = buffer.info().await.unwrap();
        assert_eq!(info.length, 10);
        assert_eq!(info.max_len, 10);
    }

    #[tokio::test]
    async fn zero_cap_never_trims() {
        let buffer = buffer_with(500, 0, 0).await;
        let info = buffer.info().await.unwrap();
        assert_eq!(info.length, 500);
        assert_eq!(info.max_len, 0);
    }

    #[tokio::test]
    async fn latest_group_skips_existing_entries() {
        let buffer = buffer_with(3, 100, 0).await;
        buffer.ensure_group("late", GroupStart::Latest).await.unwrap();
        buffer.produce("new").await.unwrap();

        let entries = buffer.consume("late", "a", 10, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "new");
    }

    #[tokio::test]
    async fn missing_group_is_reported() {
        let buffer = InMemoryStreamBuffer::new(10, 0);
        assert!(matches!(
            buffer.consume("nope", "a", 1, Duration::ZERO).await,
            Err(BufferError::NoGroup(_))
        ));
    }

    #[tokio::test]
    async fn blocking_consume_wakes_on_append() {
        let buffer = std::sync::Arc::new(buffer_with(0, 100, 0).await);
        let reader = buffer.clone();
        let task = tokio::spawn(async move {
            reader
                .consume(GROUP, "a", 10, Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.produce("late arrival").await.unwrap();

        let entries = task.await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_consume_times_out_empty() {
        let buffer = buffer_with(0, 100, 0).await;
        let entries = buffer
            .consume(GROUP, "a", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn claim_takes_only_idle_entries_and_reports_trimmed() {
        // Cap 2 with no slack: the first entry is already trimmed.
        let buffer = buffer_with(3, 2, 0).await;
        let delivered = buffer.consume(GROUP, "dead", 10, Duration::ZERO).await.unwrap();
        assert_eq!(delivered.len(), 2);

        let early = buffer
            .claim_stale(GROUP, "alive", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        buffer.produce("pushes out the oldest").await.unwrap();

        let claimed = buffer
            .claim_stale(GROUP, "alive", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.entries.len(), 1);
        assert_eq!(claimed.deleted, vec![delivered[0].id]);
        assert_eq!(
            buffer.pending_owner(GROUP, claimed.entries[0].id).as_deref(),
            Some("alive")
        );
        assert_eq!(buffer.delivery_count(GROUP, claimed.entries[0].id), Some(2));
        assert_eq!(buffer.pending_now(GROUP), 1);
    }

    #[tokio::test]
    async fn age_trim_removes_only_entries_below_cutoff() {
        let buffer = buffer_with(6, 0, 0).await;
        let ids: Vec<EntryId> = buffer
            .latest(6)
            .await
            .unwrap()
            .iter()
            .rev()
            .map(|e| e.id)
            .collect();

        assert_eq!(buffer.trim_older_than(ids[4]).await.unwrap(), 4);
        let info = buffer.info().await.unwrap();
        assert_eq!(info.length, 2);
        assert_eq!(info.first_id, Some(ids[4]));

        assert_eq!(buffer.trim_older_than(EntryId::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oldest_unacked_prefers_pending_then_undelivered() {
        let buffer = buffer_with(4, 0, 0).await;
        let ids: Vec<EntryId> = buffer
            .latest(4)
            .await
            .unwrap()
            .iter()
            .rev()
            .map(|e| e.id)
            .collect();
        assert_eq!(buffer.oldest_unacked(GROUP).await.unwrap(), Some(ids[0]));

        let delivered = buffer.consume(GROUP, "a", 2, Duration::ZERO).await.unwrap();
        buffer.ack(GROUP, &[delivered[0].id]).await.unwrap();
        assert_eq!(buffer.oldest_unacked(GROUP).await.unwrap(), Some(ids[1]));

        buffer.ack(GROUP, &[delivered[1].id]).await.unwrap();
        assert_eq!(buffer.oldest_unacked(GROUP).await.unwrap(), Some(ids[2]));

        let rest = buffer.consume(GROUP, "a", 10, Duration::ZERO).await.unwrap();
        let rest_ids: Vec<EntryId> = rest.iter().map(|e| e.id).collect();
        buffer.ack(GROUP, &rest_ids).await.unwrap();
        assert_eq!(buffer.oldest_unacked(GROUP).await.unwrap(), None);

        assert!(matches!(
            buffer.oldest_unacked("nope").await,
            Err(BufferError::NoGroup(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_buffer_fails_with_retryable_error() {
        let buffer = InMemoryStreamBuffer::new(10, 0);
        buffer.set_unavailable(true);
        let err = buffer.produce("x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
