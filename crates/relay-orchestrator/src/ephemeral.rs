use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{Priority, RelayResult};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Identifies one ordered priority set: the tier of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TierKey {
    /// Agent owning the tier.
    pub agent_id: Uuid,
    /// Priority level of the tier.
    pub priority: Priority,
}

impl TierKey {
    pub fn new(agent_id: Uuid, priority: Priority) -> Self {
        Self { agent_id, priority }
    }
}

/// Atomic primitives of the fast queue/lock store.
///
/// Each call is atomic on its own; callers compose them and must expect
/// interleavings between calls. `try_lock` is the only exclusivity primitive.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Store (or replace) the payload record of a task with an expiry.
    async fn put_payload(&self, task_id: Uuid, data: String, ttl: Duration) -> RelayResult<()>;

    /// Fetch a live payload record.
    async fn get_payload(&self, task_id: Uuid) -> RelayResult<Option<String>>;

    /// Delete a payload record. Returns whether one existed.
    async fn delete_payload(&self, task_id: Uuid) -> RelayResult<bool>;

    /// Insert into a tier ordered by `enqueued_at`. Re-inserting moves the entry.
    async fn tier_insert(
        &self,
        key: TierKey,
        task_id: Uuid,
        enqueued_at: DateTime<Utc>,
    ) -> RelayResult<()>;

    /// Remove from a tier. Returns `true` only for the caller that removed it.
    async fn tier_remove(&self, key: TierKey, task_id: Uuid) -> RelayResult<bool>;

    /// Up to `limit` entries of a tier, oldest first.
    async fn tier_range(&self, key: TierKey, limit: usize) -> RelayResult<Vec<Uuid>>;

    /// Number of entries in a tier.
    async fn tier_len(&self, key: TierKey) -> RelayResult<usize>;

    /// Create the task's lock if absent (or expired). Returns whether it was acquired.
    async fn try_lock(&self, task_id: Uuid, ttl: Duration) -> RelayResult<bool>;

    /// Release a lock. Returns whether a live lock existed.
    async fn unlock(&self, task_id: Uuid) -> RelayResult<bool>;

    /// Whether a live lock exists for the task.
    async fn is_locked(&self, task_id: Uuid) -> RelayResult<bool>;

    /// Add to an agent's assignment set. Returns whether it was newly added.
    async fn assign(&self, agent_id: Uuid, task_id: Uuid) -> RelayResult<bool>;

    /// Remove from an agent's assignment set. Returns whether it was present.
    async fn unassign(&self, agent_id: Uuid, task_id: Uuid) -> RelayResult<bool>;

    /// Members of an agent's assignment set.
    async fn assignments(&self, agent_id: Uuid) -> RelayResult<Vec<Uuid>>;

    /// Reclaim expired payloads and locks. Returns how many records were dropped.
    async fn purge_expired(&self) -> RelayResult<usize>;
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// (enqueue time in micros, insertion sequence, task id)
type TierEntry = (i64, u64, Uuid);

#[derive(Default)]
struct Tier {
    order: BTreeSet<TierEntry>,
    index: HashMap<Uuid, TierEntry>,
}

impl Tier {
    fn insert(&mut self, entry: TierEntry) {
        if let Some(previous) = self.index.insert(entry.2, entry) {
            self.order.remove(&previous);
        }
        self.order.insert(entry);
    }

    fn remove(&mut self, task_id: Uuid) -> bool {
        match self.index.remove(&task_id) {
            Some(entry) => self.order.remove(&entry),
            None => false,
        }
    }
}

#[derive(Default)]
struct Arena {
    payloads: HashMap<Uuid, Expiring<String>>,
    tiers: HashMap<TierKey, Tier>,
    locks: HashMap<Uuid, Expiring<()>>,
    assignments: HashMap<Uuid, HashSet<Uuid>>,
    sequence: u64,
}

/// In-process [`EphemeralStore`].
///
/// All maps live in one arena behind a single mutex, so every primitive is
/// atomic. Expired payloads and locks are treated as absent on access and
/// reclaimed by [`EphemeralStore::purge_expired`].
#[derive(Default)]
pub struct MemoryEphemeralStore {
    arena: Mutex<Arena>,
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn put_payload(&self, task_id: Uuid, data: String, ttl: Duration) -> RelayResult<()> {
        self.arena
            .lock()
            .payloads
            .insert(task_id, Expiring::new(data, ttl));
        Ok(())
    }

    async fn get_payload(&self, task_id: Uuid) -> RelayResult<Option<String>> {
        let now = Instant::now();
        let mut arena = self.arena.lock();
        let live = arena
            .payloads
            .get(&task_id)
            .map(|p| p.is_live(now).then(|| p.value.clone()));
        match live {
            Some(Some(data)) => Ok(Some(data)),
            Some(None) => {
                arena.payloads.remove(&task_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_payload(&self, task_id: Uuid) -> RelayResult<bool> {
        let now = Instant::now();
        Ok(self
            .arena
            .lock()
            .payloads
            .remove(&task_id)
            .is_some_and(|p| p.is_live(now)))
    }

    async fn tier_insert(
        &self,
        key: TierKey,
        task_id: Uuid,
        enqueued_at: DateTime<Utc>,
    ) -> RelayResult<()> {
        let mut arena = self.arena.lock();
        arena.sequence += 1;
        let entry = (enqueued_at.timestamp_micros(), arena.sequence, task_id);
        arena.tiers.entry(key).or_default().insert(entry);
        Ok(())
    }

    async fn tier_remove(&self, key: TierKey, task_id: Uuid) -> RelayResult<bool> {
        let mut arena = self.arena.lock();
        let Some(tier) = arena.tiers.get_mut(&key) else {
            return Ok(false);
        };
        let removed = tier.remove(task_id);
        if tier.index.is_empty() {
            arena.tiers.remove(&key);
        }
        Ok(removed)
    }

    async fn tier_range(&self, key: TierKey, limit: usize) -> RelayResult<Vec<Uuid>> {
        let arena = self.arena.lock();
        Ok(arena
            .tiers
            .get(&key)
            .map(|tier| tier.order.iter().take(limit).map(|e| e.2).collect())
            .unwrap_or_default())
    }

    async fn tier_len(&self, key: TierKey) -> RelayResult<usize> {
        Ok(self
            .arena
            .lock()
            .tiers
            .get(&key)
            .map_or(0, |tier| tier.index.len()))
    }

    async fn try_lock(&self, task_id: Uuid, ttl: Duration) -> RelayResult<bool> {
        let now = Instant::now();
        let mut arena = self.arena.lock();
        if arena.locks.get(&task_id).is_some_and(|l| l.is_live(now)) {
            return Ok(false);
        }
        arena.locks.insert(task_id, Expiring::new((), ttl));
        Ok(true)
    }

    async fn unlock(&self, task_id: Uuid) -> RelayResult<bool> {
        let now = Instant::now();
        Ok(self
            .arena
            .lock()
            .locks
            .remove(&task_id)
            .is_some_and(|l| l.is_live(now)))
    }

    async fn is_locked(&self, task_id: Uuid) -> RelayResult<bool> {
        let now = Instant::now();
        Ok(self
            .arena
            .lock()
            .locks
            .get(&task_id)
            .is_some_and(|l| l.is_live(now)))
    }

    async fn assign(&self, agent_id: Uuid, task_id: Uuid) -> RelayResult<bool> {
        Ok(self
            .arena
            .lock()
            .assignments
            .entry(agent_id)
            .or_default()
            .insert(task_id))
    }

    async fn unassign(&self, agent_id: Uuid, task_id: Uuid) -> RelayResult<bool> {
        let mut arena = self.arena.lock();
        let Some(set) = arena.assignments.get_mut(&agent_id) else {
            return Ok(false);
        };
        let removed = set.remove(&task_id);
        if set.is_empty() {
            arena.assignments.remove(&agent_id);
        }
        Ok(removed)
    }

    async fn assignments(&self, agent_id: Uuid) -> RelayResult<Vec<Uuid>> {
        Ok(self
            .arena
            .lock()
            .assignments
            .get(&agent_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn purge_expired(&self) -> RelayResult<usize> {
        let now = Instant::now();
        let mut arena = self.arena.lock();
        let before = arena.payloads.len() + arena.locks.len();
        arena.payloads.retain(|_, p| p.is_live(now));
        arena.locks.retain(|_, l| l.is_live(now));
        let purged = before - (arena.payloads.len() + arena.locks.len());
        if purged > 0 {
            debug!(purged, "Purged expired ephemeral records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tier_is_fifo_within_same_instant() {
        let store = MemoryEphemeralStore::new();
        let key = TierKey::new(Uuid::new_v4(), Priority::Normal);
        let at = Utc::now();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.tier_insert(key, *id, at).await.unwrap();
        }
        assert_eq!(store.tier_range(key, 10).await.unwrap(), ids);
        assert_eq!(store.tier_range(key, 2).await.unwrap(), ids[..2].to_vec());
    }

    #[tokio::test]
    async fn test_reinsert_moves_entry() {
        let store = MemoryEphemeralStore::new();
        let key = TierKey::new(Uuid::new_v4(), Priority::High);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now();
        store.tier_insert(key, a, t0).await.unwrap();
        store.tier_insert(key, b, t0).await.unwrap();
        store
            .tier_insert(key, a, t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(store.tier_len(key).await.unwrap(), 2);
        assert_eq!(store.tier_range(key, 10).await.unwrap(), vec![b, a]);
    }

    #[tokio::test]
    async fn test_tier_remove_only_once() {
        let store = MemoryEphemeralStore::new();
        let key = TierKey::new(Uuid::new_v4(), Priority::Low);
        let id = Uuid::new_v4();
        store.tier_insert(key, id, Utc::now()).await.unwrap();
        assert!(store.tier_remove(key, id).await.unwrap());
        assert!(!store.tier_remove(key, id).await.unwrap());
        assert_eq!(store.tier_len(key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryEphemeralStore::new();
        let id = Uuid::new_v4();
        assert!(store.try_lock(id, Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_lock(id, Duration::from_secs(60)).await.unwrap());
        assert!(store.is_locked(id).await.unwrap());
        assert!(store.unlock(id).await.unwrap());
        assert!(store.try_lock(id, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_reacquired() {
        let store = MemoryEphemeralStore::new();
        let id = Uuid::new_v4();
        assert!(store.try_lock(id, Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_locked(id).await.unwrap());
        assert!(store.try_lock(id, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_lock_single_winner() {
        let store = Arc::new(MemoryEphemeralStore::new());
        let id = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.try_lock(id, Duration::from_secs(60)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_payload_expiry_and_purge() {
        let store = MemoryEphemeralStore::new();
        let (short, long) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .put_payload(short, "{}".into(), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .put_payload(long, "{}".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store.try_lock(short, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert!(store.get_payload(short).await.unwrap().is_none());
        assert_eq!(store.get_payload(long).await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_assignment_set() {
        let store = MemoryEphemeralStore::new();
        let agent = Uuid::new_v4();
        let task = Uuid::new_v4();
        assert!(store.assign(agent, task).await.unwrap());
        assert!(!store.assign(agent, task).await.unwrap());
        assert_eq!(store.assignments(agent).await.unwrap(), vec![task]);
        assert!(store.unassign(agent, task).await.unwrap());
        assert!(store.assignments(agent).await.unwrap().is_empty());
    }
}
