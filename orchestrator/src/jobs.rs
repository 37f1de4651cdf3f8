use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::KeyExpiry,
    job::{JobRecord, StatsRecord},
    store::{keys, Store, StoreError},
};

pub const IDLE_STATUS: &str = "Awaiting prompts.";

/// One expiring record per job id plus the worker's status singletons.
#[derive(Clone)]
pub struct JobStateStore {
    store: Store,
    expiry: KeyExpiry,
}

impl JobStateStore {
    pub fn new(store: Store, expiry: KeyExpiry) -> Self {
        Self { store, expiry }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.store.get(&keys::job(id)).await
    }

    /// Stores a freshly submitted record; it lapses if no worker picks it up in time.
    pub async fn create(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.store
            .set_ex(&keys::job(job.uuid), job, self.expiry.pending_ttl())
            .await
    }

    pub async fn put(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.store
            .set_ex(&keys::job(job.uuid), job, self.expiry.job_ttl())
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.store.delete(&keys::job(id)).await
    }

    pub async fn known_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.store.job_ids().await
    }

    pub async fn set_status(&self, status: &Value) -> Result<(), StoreError> {
        self.store
            .set_ex(keys::CURRENT_STATUS, status, self.expiry.working_ttl())
            .await
    }

    pub async fn set_idle(&self) -> Result<(), StoreError> {
        self.store
            .set(keys::CURRENT_STATUS, &json!({ "status": IDLE_STATUS }))
            .await
    }

    pub async fn status(&self) -> Result<Option<Value>, StoreError> {
        self.store.get(keys::CURRENT_STATUS).await
    }

    pub async fn set_working(&self, id: Uuid) -> Result<(), StoreError> {
        self.store
            .set_ex(keys::CURRENT_WORKING, &id, self.expiry.working_ttl())
            .await
    }

    pub async fn clear_working(&self) -> Result<(), StoreError> {
        self.store.delete(keys::CURRENT_WORKING).await
    }

    pub async fn working(&self) -> Result<Option<Uuid>, StoreError> {
        self.store.get(keys::CURRENT_WORKING).await
    }

    pub async fn put_stats(&self, stats: &StatsRecord) -> Result<(), StoreError> {
        self.store.set(keys::LAST_STATS, stats).await
    }

    /// Reads the last stats record and removes it so each one is exported once.
    pub async fn take_stats(&self) -> Result<Option<StatsRecord>, StoreError> {
        let stats = self.store.get(keys::LAST_STATS).await?;
        if stats.is_some() {
            self.store.delete(keys::LAST_STATS).await?;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Map;

    use super::*;
    use crate::job::{Initiator, JobEvent};

    fn state_store() -> JobStateStore {
        JobStateStore::new(Store::memory(), KeyExpiry::default())
    }

    #[tokio::test]
    async fn records_are_keyed_by_id() {
        let jobs = state_store();
        let job = JobRecord::new(Map::new(), Initiator::Api);
        jobs.create(&job).await.unwrap();

        let mut stored = jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(stored.event, JobEvent::Queued);

        stored.transition(JobEvent::Generating).unwrap();
        jobs.put(&stored).await.unwrap();
        assert_eq!(jobs.get(job.uuid).await.unwrap().unwrap().event, JobEvent::Generating);
        assert_eq!(jobs.known_ids().await.unwrap(), vec![job.uuid]);

        jobs.delete(job.uuid).await.unwrap();
        assert!(jobs.get(job.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_records_expire() {
        let jobs = JobStateStore::new(
            Store::memory(),
            KeyExpiry {
                working_ttl_secs: 1,
                job_ttl_secs: 1,
                pending_ttl_secs: 0,
            },
        );
        let job = JobRecord::new(Map::new(), Initiator::Api);
        jobs.create(&job).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(jobs.get(job.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn singletons_round_trip() {
        let jobs = state_store();
        let id = Uuid::new_v4();
        assert!(jobs.working().await.unwrap().is_none());
        jobs.set_working(id).await.unwrap();
        assert_eq!(jobs.working().await.unwrap(), Some(id));
        jobs.clear_working().await.unwrap();
        assert!(jobs.working().await.unwrap().is_none());

        jobs.set_status(&json!({"uuid": id, "status": {"event": "step"}}))
            .await
            .unwrap();
        assert_eq!(jobs.status().await.unwrap().unwrap()["status"]["event"], "step");
        jobs.set_idle().await.unwrap();
        assert_eq!(jobs.status().await.unwrap().unwrap()["status"], IDLE_STATUS);
    }

    #[tokio::test]
    async fn stats_are_consumed_on_read() {
        let jobs = state_store();
        assert!(jobs.take_stats().await.unwrap().is_none());
        let stats = StatsRecord {
            skin: 1.5,
            charlen: 3,
            processtime: 2.25,
            queuesize: 0,
        };
        jobs.put_stats(&stats).await.unwrap();
        assert_eq!(jobs.take_stats().await.unwrap(), Some(stats));
        assert!(jobs.take_stats().await.unwrap().is_none());
    }
}
