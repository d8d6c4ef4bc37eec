//! Queue consumer: resolve, persist, import, report
//!
//! One processor per queue. Processing is at-most-once and best-effort: any
//! failure is logged and the task dropped, with no requeue and no dead-letter.
//! The requester learns of a dropped task only by the absence of its
//! completion message. A crashed consumer is reported unhealthy but never
//! restarted; that takes a process restart.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::connection::{ConnectionError, ResponsePublisher};
use crate::protocol::ResponseBody;
use crate::services::{CreatedEntity, EntityCreator, FeedResolver, Importer, ServiceError};

use super::CreationTask;

/// Response type tag on completion messages
pub const CREATED_RESPONSE_TYPE: &str = "CREATED_SUBSCRIPTIONS";

/// Single consumer of a creation queue
pub struct TaskProcessor {
    handle: JoinHandle<()>,
    disabled: Arc<AtomicBool>,
    stats: Arc<ProcessorStats>,
}

#[derive(Default)]
struct ProcessorStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time processor counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub processed: u64,
    pub failed: u64,
}

impl TaskProcessor {
    /// Spawn the consumer task for `rx`
    pub fn spawn(
        mut rx: mpsc::UnboundedReceiver<CreationTask>,
        resolver: Arc<dyn FeedResolver>,
        creator: Arc<dyn EntityCreator>,
        importer: Arc<dyn Importer>,
        publisher: Arc<dyn ResponsePublisher>,
    ) -> Self {
        let disabled = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ProcessorStats::default());

        let loop_disabled = Arc::clone(&disabled);
        let loop_stats = Arc::clone(&stats);
        let handle = tokio::spawn(async move {
            info!("task processor started");
            while let Some(task) = rx.recv().await {
                match process_task(
                    &task,
                    resolver.as_ref(),
                    creator.as_ref(),
                    importer.as_ref(),
                    publisher.as_ref(),
                )
                .await
                {
                    Ok(entities) => {
                        loop_stats.processed.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            queue_id = task.queue_id,
                            created = entities.len(),
                            "creation task processed"
                        );
                    }
                    Err(e) => {
                        loop_stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            queue_id = task.queue_id,
                            username = %task.username,
                            error = %e,
                            "creation task failed; dropping"
                        );
                    }
                }
                // A dequeued task always runs to completion; the flag only
                // stops further consumption.
                if loop_disabled.load(Ordering::SeqCst) {
                    info!("task processor disabled; stopping");
                    break;
                }
            }
            info!("task processor stopped");
        });

        Self {
            handle,
            disabled,
            stats,
        }
    }

    /// Liveness: the consumer task exists, is running, and is not disabled
    pub fn is_healthy(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    /// Stop consuming after the task in hand; reported unhealthy immediately
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        info!("task processor disabled");
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            processed: self.stats.processed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

async fn process_task(
    task: &CreationTask,
    resolver: &dyn FeedResolver,
    creator: &dyn EntityCreator,
    importer: &dyn Importer,
    publisher: &dyn ResponsePublisher,
) -> Result<Vec<CreatedEntity>, TaskError> {
    // Resolved metadata doubles as the importer's fetch cache, so items are
    // fetched once per task.
    let metadata = resolver.resolve(&task.items).await?;
    let entities = creator
        .create(&task.username, task.queue_id, &task.items)
        .await?;
    importer.do_import(&entities, &metadata).await?;

    match task.destination.as_deref() {
        Some(destination) if !destination.is_empty() => {
            let body = ResponseBody::new(CREATED_RESPONSE_TYPE, json!(entities)).encode();
            publisher.publish(destination, &body).await?;
        }
        _ => debug!(queue_id = task.queue_id, "no completion destination for task"),
    }

    Ok(entities)
}

/// Background task processing failures
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("completion publish failed: {0}")]
    Publish(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueue;
    use crate::services::{FeedMetadata, SubscriptionRequest};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubResolver;

    #[async_trait]
    impl FeedResolver for StubResolver {
        async fn resolve(
            &self,
            items: &[SubscriptionRequest],
        ) -> Result<HashMap<String, FeedMetadata>, ServiceError> {
            Ok(items
                .iter()
                .map(|item| {
                    (
                        item.url.clone(),
                        FeedMetadata {
                            url: item.url.clone(),
                            title: format!("feed {}", item.url),
                            site_url: None,
                        },
                    )
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct StubCreator {
        fail: bool,
    }

    #[async_trait]
    impl EntityCreator for StubCreator {
        async fn create_parent(
            &self,
            _username: &str,
            title: &str,
        ) -> Result<crate::services::CreatedParent, ServiceError> {
            Ok(crate::services::CreatedParent {
                id: 1,
                title: title.to_string(),
            })
        }

        async fn create(
            &self,
            username: &str,
            parent_id: i64,
            items: &[SubscriptionRequest],
        ) -> Result<Vec<CreatedEntity>, ServiceError> {
            if self.fail {
                return Err(ServiceError::DataUpdate {
                    message: "duplicate url".to_string(),
                });
            }
            Ok(items
                .iter()
                .enumerate()
                .map(|(i, item)| CreatedEntity {
                    id: i as i64 + 100,
                    queue_id: parent_id,
                    username: username.to_string(),
                    url: item.url.clone(),
                    title: item.title.clone().unwrap_or_default(),
                })
                .collect())
        }
    }

    /// Asserts the metadata cache covers every imported entity
    #[derive(Default)]
    struct RecordingImporter {
        imported: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Importer for RecordingImporter {
        async fn do_import(
            &self,
            entities: &[CreatedEntity],
            metadata_cache: &HashMap<String, FeedMetadata>,
        ) -> Result<(), ServiceError> {
            for entity in entities {
                assert!(metadata_cache.contains_key(&entity.url));
            }
            self.imported
                .lock()
                .unwrap()
                .extend(entities.iter().map(|e| e.url.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ResponsePublisher for RecordingPublisher {
        async fn publish(&self, destination: &str, body: &str) -> Result<(), ConnectionError> {
            self.published
                .lock()
                .unwrap()
                .push((destination.to_string(), body.to_string()));
            Ok(())
        }

        async fn ack(&self, _message_id: &str) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn item(url: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            url: url.to_string(),
            title: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn completion_round_trip_carries_queue_id_and_username() {
        let (queue, rx) = TaskQueue::unbounded();
        let publisher = Arc::new(RecordingPublisher::default());
        let importer = Arc::new(RecordingImporter::default());
        let processor = TaskProcessor::spawn(
            rx,
            Arc::new(StubResolver),
            Arc::new(StubCreator::default()),
            importer.clone(),
            publisher.clone(),
        );

        queue
            .enqueue(CreationTask {
                items: vec![item("urlA"), item("urlB")],
                username: "u1".to_string(),
                queue_id: 42,
                destination: Some("/queue/responses-u1".to_string()),
            })
            .unwrap();

        wait_for(|| !publisher.published.lock().unwrap().is_empty()).await;

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/queue/responses-u1");

        let body: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body["responseType"], CREATED_RESPONSE_TYPE);
        let created = body["message"].as_array().unwrap();
        assert_eq!(created.len(), 2);
        for entry in created {
            assert_eq!(entry["queueId"], 42);
            assert_eq!(entry["username"], "u1");
        }

        // Both items were imported, after resolution
        assert_eq!(importer.imported.lock().unwrap().len(), 2);
        assert!(processor.is_healthy());
        assert_eq!(processor.stats().processed, 1);
    }

    #[tokio::test]
    async fn task_without_destination_publishes_nothing() {
        let (queue, rx) = TaskQueue::unbounded();
        let publisher = Arc::new(RecordingPublisher::default());
        let processor = TaskProcessor::spawn(
            rx,
            Arc::new(StubResolver),
            Arc::new(StubCreator::default()),
            Arc::new(RecordingImporter::default()),
            publisher.clone(),
        );

        queue
            .enqueue(CreationTask {
                items: vec![item("urlA")],
                username: "u1".to_string(),
                queue_id: 7,
                destination: None,
            })
            .unwrap();

        wait_for(|| processor.stats().processed == 1).await;
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_task_is_dropped_and_the_next_still_runs() {
        let (queue, rx) = TaskQueue::unbounded();
        let publisher = Arc::new(RecordingPublisher::default());

        // First creator call fails, so use a creator that fails on queue 1
        struct FlakyCreator;

        #[async_trait]
        impl EntityCreator for FlakyCreator {
            async fn create_parent(
                &self,
                _username: &str,
                _title: &str,
            ) -> Result<crate::services::CreatedParent, ServiceError> {
                unreachable!("processor never creates parents")
            }

            async fn create(
                &self,
                username: &str,
                parent_id: i64,
                items: &[SubscriptionRequest],
            ) -> Result<Vec<CreatedEntity>, ServiceError> {
                if parent_id == 1 {
                    return Err(ServiceError::Conflict {
                        message: "already subscribed".to_string(),
                    });
                }
                Ok(items
                    .iter()
                    .map(|item| CreatedEntity {
                        id: 1,
                        queue_id: parent_id,
                        username: username.to_string(),
                        url: item.url.clone(),
                        title: String::new(),
                    })
                    .collect())
            }
        }

        let processor = TaskProcessor::spawn(
            rx,
            Arc::new(StubResolver),
            Arc::new(FlakyCreator),
            Arc::new(RecordingImporter::default()),
            publisher.clone(),
        );

        for queue_id in [1, 2] {
            queue
                .enqueue(CreationTask {
                    items: vec![item("urlA")],
                    username: "u1".to_string(),
                    queue_id,
                    destination: Some("/queue/responses-u1".to_string()),
                })
                .unwrap();
        }

        wait_for(|| processor.stats().processed == 1).await;
        let stats = processor.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 1);

        // Only the surviving task reported completion
        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let body: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body["message"][0]["queueId"], 2);
    }

    #[tokio::test]
    async fn disable_reports_unhealthy() {
        let (_queue, rx) = TaskQueue::unbounded();
        let processor = TaskProcessor::spawn(
            rx,
            Arc::new(StubResolver),
            Arc::new(StubCreator::default()),
            Arc::new(RecordingImporter::default()),
            Arc::new(RecordingPublisher::default()),
        );

        assert!(processor.is_healthy());
        processor.disable();
        assert!(!processor.is_healthy());
    }

    #[tokio::test]
    async fn disable_finishes_the_task_in_hand() {
        let (queue, rx) = TaskQueue::unbounded();
        let publisher = Arc::new(RecordingPublisher::default());
        let processor = TaskProcessor::spawn(
            rx,
            Arc::new(StubResolver),
            Arc::new(StubCreator::default()),
            Arc::new(RecordingImporter::default()),
            publisher.clone(),
        );

        // Disable lands before the consumer first polls; the already queued
        // task must still run to completion, not be dropped.
        queue
            .enqueue(CreationTask {
                items: vec![item("urlA")],
                username: "u1".to_string(),
                queue_id: 9,
                destination: Some("/queue/responses-u1".to_string()),
            })
            .unwrap();
        processor.disable();

        wait_for(|| processor.handle.is_finished()).await;
        assert_eq!(processor.stats().processed, 1);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_queue_ends_the_processor() {
        let (queue, rx) = TaskQueue::unbounded();
        let processor = TaskProcessor::spawn(
            rx,
            Arc::new(StubResolver),
            Arc::new(StubCreator::default()),
            Arc::new(RecordingImporter::default()),
            Arc::new(RecordingPublisher::default()),
        );

        drop(queue);
        wait_for(|| processor.handle.is_finished()).await;
        assert!(!processor.is_healthy());
    }
}
