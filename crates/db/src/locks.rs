//! In-process advisory locks keyed by parent collection.
//!
//! SQLite cannot lock a single parent row, so writers that touch the same
//! board's lists or the same list's cards queue up here before opening their
//! transaction. Keys are always acquired in [`ParentKey`] order, which makes
//! two requests that need overlapping sets of parents unable to deadlock.

use std::{collections::BTreeSet, fmt, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// A parent whose child collection is being mutated.
///
/// The derived ordering sorts every board before every list, then by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParentKey {
    Board(Uuid),
    List(Uuid),
}

impl ParentKey {
    pub fn id(&self) -> Uuid {
        match self {
            ParentKey::Board(id) | ParentKey::List(id) => *id,
        }
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentKey::Board(id) => write!(f, "board:{id}"),
            ParentKey::List(id) => write!(f, "list:{id}"),
        }
    }
}

type LockTable = DashMap<ParentKey, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct ParentLocks {
    table: Arc<LockTable>,
}

impl ParentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key in `keys`, in canonical order.
    ///
    /// Duplicates are ignored. The returned guard releases all of them when
    /// dropped.
    pub async fn acquire<I>(&self, keys: I) -> ParentLockGuard
    where
        I: IntoIterator<Item = ParentKey>,
    {
        let ordered: BTreeSet<ParentKey> = keys.into_iter().collect();
        let mut held = Vec::with_capacity(ordered.len());

        for key in ordered {
            // Clone the Arc out so the shard lock is released before awaiting.
            let mutex = self
                .table
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let guard = mutex.lock_owned().await;
            held.push((key, guard));
        }

        ParentLockGuard {
            table: self.table.clone(),
            held,
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub struct ParentLockGuard {
    table: Arc<LockTable>,
    held: Vec<(ParentKey, OwnedMutexGuard<()>)>,
}

impl ParentLockGuard {
    pub fn keys(&self) -> impl Iterator<Item = ParentKey> + '_ {
        self.held.iter().map(|(key, _)| *key)
    }
}

impl Drop for ParentLockGuard {
    fn drop(&mut self) {
        // Release in reverse order, then drop table entries nobody else holds.
        while let Some((key, guard)) = self.held.pop() {
            drop(guard);
            self.table
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_boards_order_before_lists() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        let mut keys = vec![
            ParentKey::List(low),
            ParentKey::Board(high),
            ParentKey::List(high),
            ParentKey::Board(low),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                ParentKey::Board(low),
                ParentKey::Board(high),
                ParentKey::List(low),
                ParentKey::List(high),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = ParentLocks::new();
        let key = ParentKey::List(Uuid::new_v4());

        let first = locks.acquire([key]).await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.acquire([key]).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_block() {
        let locks = ParentLocks::new();
        let _a = locks.acquire([ParentKey::List(Uuid::new_v4())]).await;

        let b = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire([ParentKey::List(Uuid::new_v4())]),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_opposite_order_requests_do_not_deadlock() {
        let locks = ParentLocks::new();
        let a = ParentKey::List(Uuid::new_v4());
        let b = ParentKey::List(Uuid::new_v4());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let locks = locks.clone();
            let keys = if i % 2 == 0 { [a, b] } else { [b, a] };
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(keys).await;
                tokio::task::yield_now().await;
            }));
        }

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_entries_are_cleaned_up() {
        let locks = ParentLocks::new();
        let key = ParentKey::Board(Uuid::new_v4());

        let guard = locks.acquire([key, key]).await;
        assert_eq!(guard.keys().count(), 1);
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }
}
