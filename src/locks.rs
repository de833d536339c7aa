use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per deliberation id. Compile and adjust on the same
/// deliberation queue behind each other inside this process; the version
/// column on the row catches writers in other processes.
#[derive(Debug, Default)]
pub struct DeliberationLocks {
    slots: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DeliberationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, deliberation_id: Uuid) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            // a slot only the table references has no holder and no waiter
            slots.retain(|id, slot| *id == deliberation_id || Arc::strong_count(slot) > 1);
            slots
                .entry(deliberation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn acquire_optional(&self, deliberation_id: Option<Uuid>) -> Option<OwnedMutexGuard<()>> {
        match deliberation_id {
            Some(id) => Some(self.acquire(id).await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_waits_for_release() {
        let locks = Arc::new(DeliberationLocks::new());
        let id = Uuid::from_u128(7);
        let guard = locks.acquire(id).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_ids_do_not_block() {
        let locks = DeliberationLocks::new();
        let _first = locks.acquire(Uuid::from_u128(1)).await;
        let _second = locks.acquire(Uuid::from_u128(2)).await;
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = DeliberationLocks::new();
        for id in 0..50u128 {
            drop(locks.acquire(Uuid::from_u128(id)).await);
        }
        assert_eq!(locks.tracked().await, 1);

        let held = locks.acquire(Uuid::from_u128(100)).await;
        drop(locks.acquire(Uuid::from_u128(101)).await);
        assert_eq!(locks.tracked().await, 2);
        drop(held);
    }
}
