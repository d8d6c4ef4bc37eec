//! # Domain Collaborator Interfaces
//!
//! Narrow seams to the rest of the API server: feed resolution, entity
//! persistence, and post import. The work-intake core calls these but owns
//! none of their internals; production wiring supplies implementations backed
//! by the HTTP-facing domain services.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One subscription the control plane asked us to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub url: String,

    #[serde(default)]
    pub title: Option<String>,
}

/// Resolved feed metadata, keyed by the request URL in resolver output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub url: String,
    pub title: String,

    #[serde(default)]
    pub site_url: Option<String>,
}

/// Parent entity (a feed queue) under which subscriptions are created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedParent {
    pub id: i64,
    pub title: String,
}

/// A persisted subscription, as reported back to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub id: i64,

    #[serde(rename = "queueId")]
    pub queue_id: i64,

    pub username: String,
    pub url: String,
    pub title: String,
}

/// Resolves external feed metadata for a batch of subscription requests
///
/// The returned map is keyed by request URL and doubles as a fetch cache for
/// the importer, so items resolved here are not fetched a second time.
#[async_trait]
pub trait FeedResolver: Send + Sync {
    async fn resolve(
        &self,
        items: &[SubscriptionRequest],
    ) -> Result<HashMap<String, FeedMetadata>, ServiceError>;
}

/// Persists feed queues and their subscriptions
#[async_trait]
pub trait EntityCreator: Send + Sync {
    /// Create the parent feed queue for a bulk import
    async fn create_parent(
        &self,
        username: &str,
        title: &str,
    ) -> Result<CreatedParent, ServiceError>;

    /// Create subscriptions under an existing parent
    async fn create(
        &self,
        username: &str,
        parent_id: i64,
        items: &[SubscriptionRequest],
    ) -> Result<Vec<CreatedEntity>, ServiceError>;
}

/// Ingests posts for newly created subscriptions
#[async_trait]
pub trait Importer: Send + Sync {
    async fn do_import(
        &self,
        entities: &[CreatedEntity],
        metadata_cache: &HashMap<String, FeedMetadata>,
    ) -> Result<(), ServiceError>;
}

/// Domain-layer failures surfaced through the collaborator seams
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("data access error: {message}")]
    DataAccess { message: String },

    #[error("data update error: {message}")]
    DataUpdate { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("feed resolution failed: {message}")]
    Resolution { message: String },
}
