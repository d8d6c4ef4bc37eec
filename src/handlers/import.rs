//! Bulk subscription import
//!
//! Decodes a JSON array of import requests. Each parent feed queue is created
//! synchronously; the first partition of its subscriptions is resolved,
//! created, and imported inline so the requester gets immediate partial
//! feedback, and every remaining partition is deferred to the creation queue.
//! Deferred partitions report completion to the same response destination,
//! unordered relative to the inline result.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::queue::{partition, CreationTask, TaskQueue};
use crate::routing::{HandlerError, WorkHandler};
use crate::services::{CreatedEntity, EntityCreator, FeedResolver, Importer, SubscriptionRequest};

/// One entry of the import payload: a feed queue and its subscriptions
#[derive(Debug, Deserialize)]
struct ImportRequest {
    title: String,

    #[serde(default)]
    items: Vec<SubscriptionRequest>,
}

/// Handles `IMPORT_SUBSCRIPTIONS` requests
pub struct SubscriptionImportHandler {
    resolver: Arc<dyn FeedResolver>,
    creator: Arc<dyn EntityCreator>,
    importer: Arc<dyn Importer>,
    queue: TaskQueue,
    partition_size: usize,
}

impl SubscriptionImportHandler {
    pub fn new(
        resolver: Arc<dyn FeedResolver>,
        creator: Arc<dyn EntityCreator>,
        importer: Arc<dyn Importer>,
        queue: TaskQueue,
        partition_size: usize,
    ) -> Self {
        Self {
            resolver,
            creator,
            importer,
            queue,
            partition_size,
        }
    }

    async fn import_inline(
        &self,
        username: &str,
        parent_id: i64,
        items: &[SubscriptionRequest],
    ) -> Result<Vec<CreatedEntity>, HandlerError> {
        let metadata = self.resolver.resolve(items).await?;
        let entities = self.creator.create(username, parent_id, items).await?;
        self.importer.do_import(&entities, &metadata).await?;
        Ok(entities)
    }
}

#[async_trait]
impl WorkHandler for SubscriptionImportHandler {
    async fn handle(
        &self,
        payload: &Value,
        username: &str,
        destination: &str,
    ) -> Result<Value, HandlerError> {
        let requests: Vec<ImportRequest> = serde_json::from_value(payload.clone())?;
        let task_destination = (!destination.is_empty()).then(|| destination.to_string());

        let mut created = Vec::new();
        for request in requests {
            let parent = self.creator.create_parent(username, &request.title).await?;

            let (first, deferred) = partition(request.items, self.partition_size);
            let mut inline_count = 0;
            if !first.is_empty() {
                let entities = self.import_inline(username, parent.id, &first).await?;
                inline_count = entities.len();
                created.extend(entities);
            }

            let deferred_count = deferred.len();
            for items in deferred {
                self.queue.enqueue(CreationTask {
                    items,
                    username: username.to_string(),
                    queue_id: parent.id,
                    destination: task_destination.clone(),
                })?;
            }
            debug!(
                queue_id = parent.id,
                username,
                inline = inline_count,
                deferred = deferred_count,
                "import request partitioned"
            );
        }

        Ok(json!(created))
    }

    fn response_type(&self) -> &str {
        "IMPORTED_SUBSCRIPTIONS"
    }

    fn name(&self) -> &str {
        "subscription_import"
    }
}
