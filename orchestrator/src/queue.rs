use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    job::{JobPosition, JobRecord},
    store::{keys, Store, StoreError},
};

/// Pending jobs, newest at the front of the list and the next to run at the back.
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub job: JobRecord,
    pub pos: usize,
}

#[derive(Deserialize)]
struct QueuedId {
    uuid: Uuid,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.store.list_push_front(keys::PENDING_QUEUE, job).await
    }

    pub async fn dequeue_one(&self) -> Result<Option<JobRecord>, StoreError> {
        self.store.list_pop_back(keys::PENDING_QUEUE).await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.list_len(keys::PENDING_QUEUE).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    pub async fn list(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let jobs: Vec<JobRecord> = self.store.list_range(keys::PENDING_QUEUE).await?;
        Ok(jobs
            .into_iter()
            .enumerate()
            .map(|(pos, job)| QueueEntry { job, pos })
            .collect())
    }

    /// Distance of `id` from the head of the pending set, counting the running job
    /// when `working` is set. Ids not in the queue report position 0.
    pub async fn position_of(&self, id: Uuid, working: bool) -> Result<JobPosition, StoreError> {
        let pending: Vec<QueuedId> = self.store.list_range(keys::PENDING_QUEUE).await?;
        let running = usize::from(working);
        let pos = pending
            .iter()
            .rev()
            .position(|entry| entry.uuid == id)
            .map(|ahead| ahead + running)
            .unwrap_or(0);
        Ok(JobPosition {
            pos,
            total: pending.len() + running,
            working,
        })
    }

    pub async fn remove(&self, id: Uuid) -> Result<usize, StoreError> {
        let mut removed = 0;
        for raw in self.store.list_range_raw(keys::PENDING_QUEUE).await? {
            let matches = serde_json::from_str::<QueuedId>(&raw)
                .map(|entry| entry.uuid == id)
                .unwrap_or(false);
            if matches {
                removed += self.store.list_remove_raw(keys::PENDING_QUEUE, &raw).await?;
            }
        }
        Ok(removed)
    }
}
