pub mod cli;

pub use cli::GitCli;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A repository that is open locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepository {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub sha: String,
    pub author: String,
    pub message: String,
}

/// Read-only access to local git state
#[async_trait]
pub trait GitRevisionResolver: Send + Sync {
    /// Look up a locally open repository by its server id
    async fn repository_by_id(&self, id: &str) -> Result<Option<GitRepository>>;

    /// Contents of `path` (absolute) at `sha`; `None` when the file did not exist there
    async fn file_content_for_revision(&self, path: &std::path::Path, sha: &str)
        -> Result<Option<String>>;

    async fn commit(&self, repo_path: &std::path::Path, sha: &str) -> Result<Option<GitCommit>>;

    /// Fetch every remote; `true` on success
    async fn fetch_all_remotes(&self, repo_path: &std::path::Path) -> Result<bool>;
}
