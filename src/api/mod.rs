pub mod http;

pub use http::{ApiResource, HttpApiClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::{DiffsByRepo, Entity};

/// Optional narrowing for bulk fetches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

/// Remote CRUD for one entity kind. Failures are transport errors and
/// propagate to callers unchanged.
#[async_trait]
pub trait EntityApi<T: Entity>: Send + Sync {
    async fn fetch_all(&self, filter: &FetchFilter) -> Result<Vec<T>>;

    /// `None` when the server has no such entity
    async fn fetch_by_id(&self, id: &str) -> Result<Option<T>>;

    async fn update(&self, id: &str, patch: Value) -> Result<T>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Stored review patches, keyed by repository id
#[async_trait]
pub trait ReviewDiffsApi: Send + Sync {
    async fn fetch_review_diffs(&self, review_id: &str) -> Result<DiffsByRepo>;
}
