//! The affinity slot scheduler (C2).
//!
//! Physical `(endpoint, endpoint-slot)` pairs are pooled behind a counting
//! semaphore. `request_slot` prefers a free record that last served the same
//! `(user, user_slot)` key (affinity, for a warm KV-cache) and otherwise
//! evicts the least-recently-released record. Starvation of cold sessions is
//! deliberate: evicting a warm slot just to be fair throws away the cache.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub parallel: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSlot {
    pub endpoint_index: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: i64,
    pub user_slot: i64,
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    key: SessionKey,
    last_release: i64,
}

#[derive(Debug, Clone, Copy)]
enum SlotRecord {
    Free(Usage),
    InUse,
}

pub struct SlotQueue {
    endpoints: Vec<String>,
    endpoint_slots: Vec<EndpointSlot>,
    records: Mutex<Vec<SlotRecord>>,
    semaphore: Arc<Semaphore>,
}

/// Handle to an acquired physical slot. Holds the semaphore permit; dropping
/// it without going through `release_slot` leaks the permit forever, so the
/// handle carries no `Drop` impl of its own — release is always explicit.
pub struct SlotHandle {
    pub index: usize,
    pub endpoint_slot: EndpointSlot,
    pub endpoint_url: String,
    pub session: SessionKey,
    permit: OwnedSemaphorePermit,
}

impl SlotQueue {
    pub fn new(endpoints: &[EndpointConfig]) -> Self {
        let mut endpoint_urls = Vec::with_capacity(endpoints.len());
        let mut endpoint_slots = Vec::new();
        let mut records = Vec::new();
        let mut rng = rand::thread_rng();

        for (endpoint_index, ep) in endpoints.iter().enumerate() {
            endpoint_urls.push(ep.url.clone());
            for slot in 0..ep.parallel {
                endpoint_slots.push(EndpointSlot {
                    endpoint_index,
                    slot,
                });
                let seed = rng.gen_range(0..=10_000);
                records.push(SlotRecord::Free(Usage {
                    key: SessionKey {
                        user: -1,
                        user_slot: -1,
                    },
                    last_release: seed,
                }));
            }
        }

        let n = endpoint_slots.len();
        Self {
            endpoints: endpoint_urls,
            endpoint_slots,
            records: Mutex::new(records),
            semaphore: Arc::new(Semaphore::new(n)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.endpoint_slots.len()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Blocks until a physical slot is free, then returns the affinity match
    /// for `(user, user_slot)` if one is free, else the slot with the oldest
    /// `last_release`. Ties are broken by scan order (lowest index first).
    pub async fn request_slot(&self, user: i64, user_slot: i64) -> SlotHandle {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("slot semaphore never closes");

        let key = SessionKey { user, user_slot };
        let mut records = self.records.lock().await;

        let mut match_idx: Option<usize> = None;
        let mut oldest_idx: Option<usize> = None;
        let mut oldest_time = i64::MAX;

        for (i, record) in records.iter().enumerate() {
            if let SlotRecord::Free(usage) = record {
                if usage.key == key {
                    match_idx = Some(i);
                    break;
                }
                if usage.last_release < oldest_time {
                    oldest_time = usage.last_release;
                    oldest_idx = Some(i);
                }
            }
        }

        let idx = match_idx
            .or(oldest_idx)
            .expect("a permit was acquired so at least one record must be free");
        records[idx] = SlotRecord::InUse;
        let endpoint_slot = self.endpoint_slots[idx];

        SlotHandle {
            index: idx,
            endpoint_slot,
            endpoint_url: self.endpoints[endpoint_slot.endpoint_index].clone(),
            session: key,
            permit,
        }
    }

    /// Releases a previously acquired slot. Releasing a record that is not
    /// currently `InUse` is a programming error.
    pub async fn release_slot(&self, handle: SlotHandle) {
        let mut records = self.records.lock().await;
        debug_assert!(
            matches!(records[handle.index], SlotRecord::InUse),
            "double release of slot {}",
            handle.index
        );
        records[handle.index] = SlotRecord::Free(Usage {
            key: handle.session,
            last_release: now_unix_seconds(),
        });
        drop(records);
        drop(handle.permit);
    }
}

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(parallel: &[usize]) -> Vec<EndpointConfig> {
        parallel
            .iter()
            .enumerate()
            .map(|(i, &p)| EndpointConfig {
                url: format!("http://backend-{i}"),
                parallel: p,
            })
            .collect()
    }

    #[tokio::test]
    async fn affinity_hit_returns_same_slot() {
        let queue = SlotQueue::new(&endpoints(&[2]));
        let a = queue.request_slot(7, 0).await;
        let a_idx = a.index;
        queue.release_slot(a).await;

        let again = queue.request_slot(7, 0).await;
        assert_eq!(again.index, a_idx);
        queue.release_slot(again).await;
    }

    #[tokio::test]
    async fn distinct_user_slot_gets_a_different_physical_slot() {
        let queue = SlotQueue::new(&endpoints(&[2]));
        let a = queue.request_slot(7, 0).await;
        let a_idx = a.index;
        // slot a stays held; request a second physical slot for the same user
        // but a different user_slot id
        let b = queue.request_slot(7, 1).await;
        assert_ne!(a_idx, b.index);
        queue.release_slot(a).await;
        queue.release_slot(b).await;
    }

    #[tokio::test]
    async fn lru_eviction_prefers_oldest_release() {
        let queue = SlotQueue::new(&endpoints(&[2]));
        let a = queue.request_slot(1, 0).await;
        let a_idx = a.index;
        let b = queue.request_slot(2, 0).await;
        // release a first, then sleep so wall-clock ordering is unambiguous
        queue.release_slot(a).await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        queue.release_slot(b).await;

        // both slots are free now; a's record (released first, so "more
        // idle" under a coarse clock) must win over b's fresher release.
        let next = queue.request_slot(99, 0).await;
        assert_eq!(next.index, a_idx);
        queue.release_slot(next).await;
    }

    #[tokio::test]
    async fn affinity_beats_lru() {
        let queue = SlotQueue::new(&endpoints(&[2]));
        let a = queue.request_slot(7, 0).await;
        let a_idx = a.index;
        let b = queue.request_slot(9, 0).await;
        queue.release_slot(b).await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        queue.release_slot(a).await;

        // b is the LRU candidate (released much earlier), but 7's affinity
        // match must win regardless.
        let again = queue.request_slot(7, 0).await;
        assert_eq!(again.index, a_idx);
        queue.release_slot(again).await;
    }

    #[tokio::test]
    async fn capacity_is_bounded_by_total_parallelism() {
        let queue = SlotQueue::new(&endpoints(&[2, 1]));
        assert_eq!(queue.capacity(), 3);
        assert_eq!(queue.available_permits(), 3);
        let a = queue.request_slot(1, 0).await;
        let b = queue.request_slot(2, 0).await;
        let c = queue.request_slot(3, 0).await;
        assert_eq!(queue.available_permits(), 0);
        queue.release_slot(a).await;
        queue.release_slot(b).await;
        queue.release_slot(c).await;
        assert_eq!(queue.available_permits(), 3);
    }
}
