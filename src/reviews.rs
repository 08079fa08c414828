use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::api::{EntityApi, ReviewDiffsApi};
use crate::cache::CachedEntityManager;
use crate::error::{Error, Result};
use crate::git::GitRevisionResolver;
use crate::models::{
    DeleteReviewRequest, DiffUri, DiffsByRepo, FetchReviewsRequest, FetchReviewsResponse,
    LifecycleResponse, PreconditionsResponse, Review, ReviewContents, ReviewContentsRequest,
    ReviewDiffs, ReviewRequest, ReviewResponse, UpdateReviewRequest,
};
use crate::patch::apply_patch;

/// Source name of a patch that creates its file
const DEV_NULL: &str = "/dev/null";

fn uri_regex() -> &'static Regex {
    static URI: OnceLock<Regex> = OnceLock::new();
    URI.get_or_init(|| {
        Regex::new(r"^codestream-diff://(\w+)/(\w+)/(\w+)/(.+)$").expect("valid URI pattern")
    })
}

/// Parse `codestream-diff://<reviewId>/<repoId>/<version>/<path>`
pub fn parse_uri(uri: &str) -> Result<DiffUri> {
    let captures = uri_regex()
        .captures(uri)
        .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;

    Ok(DiffUri {
        review_id: captures[1].to_string(),
        repo_id: captures[2].to_string(),
        version: captures[3].to_string(),
        path: captures[4].to_string(),
    })
}

/// Review cache plus the operations that combine reviews, stored diffs and git
pub struct ReviewsManager {
    reviews: CachedEntityManager<Review>,
    diffs_api: Arc<dyn ReviewDiffsApi>,
    git: Arc<dyn GitRevisionResolver>,
    /// Per-review diff sets, each fetched at most once
    diffs: Mutex<HashMap<String, Arc<OnceCell<DiffsByRepo>>>>,
}

impl ReviewsManager {
    pub fn new(
        api: Arc<dyn EntityApi<Review>>,
        diffs_api: Arc<dyn ReviewDiffsApi>,
        git: Arc<dyn GitRevisionResolver>,
    ) -> Self {
        Self {
            reviews: CachedEntityManager::new(api),
            diffs_api,
            git,
            diffs: Mutex::new(HashMap::new()),
        }
    }

    pub fn entities(&self) -> &CachedEntityManager<Review> {
        &self.reviews
    }

    /// All cached reviews, restricted to `review_ids` when given and non-empty
    pub async fn get(&self, request: Option<&FetchReviewsRequest>) -> Result<FetchReviewsResponse> {
        let mut reviews = self.reviews.get_all_cached().await?;

        if let Some(ids) = request
            .and_then(|r| r.review_ids.as_ref())
            .filter(|ids| !ids.is_empty())
        {
            reviews.retain(|r| ids.contains(&r.id));
        }

        Ok(FetchReviewsResponse { reviews })
    }

    pub async fn get_review(&self, request: &ReviewRequest) -> Result<ReviewResponse> {
        let review = self.reviews.get_by_id(&request.review_id).await?;
        Ok(ReviewResponse { review })
    }

    pub async fn get_diffs(&self, review_id: &str, repo_id: &str) -> Result<ReviewDiffs> {
        let by_repo = self.all_diffs(review_id).await?;
        by_repo
            .get(repo_id)
            .cloned()
            .ok_or_else(|| Error::not_found("ReviewDiffs", format!("{}/{}", review_id, repo_id)))
    }

    async fn all_diffs(&self, review_id: &str) -> Result<DiffsByRepo> {
        let cell = {
            let mut diffs = self.diffs.lock().await;
            diffs.entry(review_id.to_string()).or_default().clone()
        };

        let by_repo = cell
            .get_or_try_init(|| async {
                debug!(review_id, "Fetching review diffs");
                self.diffs_api.fetch_review_diffs(review_id).await
            })
            .await?;

        Ok(by_repo.clone())
    }

    /// Rebuild the base and head text of one reviewed file
    #[instrument(skip(self, request), fields(review = %request.review_id, repo = %request.repo_id, path = %request.path))]
    pub async fn get_contents(&self, request: &ReviewContentsRequest) -> Result<ReviewContents> {
        let review = self.reviews.get_by_id(&request.review_id).await?;
        let changeset = review
            .changeset(&request.repo_id)
            .ok_or_else(|| Error::ChangesetNotFound(request.repo_id.clone()))?;
        let file_info = changeset
            .modified_file(&request.path)
            .ok_or_else(|| Error::FileInfoNotFound(request.path.clone()))?;

        let diffs = self.get_diffs(&request.review_id, &request.repo_id).await?;

        let left_diff = diffs.left_diff(&file_info.old_file);
        let left_base_relative = left_diff.map_or(file_info.old_file.as_str(), |d| {
            d.old_file_name.as_str()
        });
        let right_diff = diffs.right_diff(&file_info.file);
        let right_base_relative =
            right_diff.map_or(file_info.file.as_str(), |d| d.old_file_name.as_str());

        let repo = self
            .git
            .repository_by_id(&request.repo_id)
            .await?
            .ok_or_else(|| Error::RepositoryNotFound(request.repo_id.clone()))?;

        let left_base_contents = self
            .base_contents(&repo.path, left_base_relative, &diffs.left_base_sha)
            .await?;
        let left_contents = match left_diff {
            Some(patch) => apply_patch(&left_base_contents, patch)?,
            None => left_base_contents.clone(),
        };

        let right_base_contents = if diffs.left_base_sha == diffs.right_base_sha {
            left_base_contents
        } else {
            self.base_contents(&repo.path, right_base_relative, &diffs.right_base_sha)
                .await?
        };
        let right_contents = match right_diff {
            Some(patch) => apply_patch(&right_base_contents, patch)?,
            None => right_base_contents,
        };

        Ok(ReviewContents {
            base: left_contents,
            head: right_contents,
        })
    }

    /// Raw file text at a base revision; a file absent there reads as empty
    async fn base_contents(&self, repo_root: &Path, relative: &str, sha: &str) -> Result<String> {
        if relative == DEV_NULL {
            return Ok(String::new());
        }

        let path = repo_root.join(relative);
        Ok(self
            .git
            .file_content_for_revision(&path, sha)
            .await?
            .unwrap_or_default())
    }

    pub async fn update(&self, request: UpdateReviewRequest) -> Result<ReviewResponse> {
        let review = self
            .reviews
            .update(&request.id, Value::Object(request.changes))
            .await?;
        Ok(ReviewResponse { review })
    }

    pub async fn delete(&self, request: &DeleteReviewRequest) -> Result<()> {
        self.reviews.delete(&request.id).await
    }

    /// Check every repository in the review is open locally and has its base commit.
    ///
    /// Stops at the first failure.
    #[instrument(skip(self, request), fields(review = %request.review_id))]
    pub async fn check_preconditions(
        &self,
        request: &ReviewRequest,
    ) -> Result<PreconditionsResponse> {
        let review = self.reviews.get_by_id(&request.review_id).await?;
        let diffs_by_repo = self.all_diffs(&review.id).await?;

        for (repo_id, diffs) in diffs_by_repo.iter() {
            let Some(repo) = self.git.repository_by_id(repo_id).await? else {
                info!(repo_id = %repo_id, "Review repository is not open");
                return Ok(PreconditionsResponse::failed(
                    "The git repository for this review is not currently open in the IDE",
                ));
            };

            let mut commit = self.git.commit(&repo.path, &diffs.left_base_sha).await?;
            if commit.is_none() {
                debug!(sha = %diffs.left_base_sha, "Base commit missing, fetching remotes");
                if self.git.fetch_all_remotes(&repo.path).await? {
                    commit = self.git.commit(&repo.path, &diffs.left_base_sha).await?;
                }
            }

            if commit.is_none() {
                warn!(sha = %diffs.left_base_sha, repo_id = %repo_id, "Base commit not found");
                return Ok(PreconditionsResponse::failed(format!(
                    "The base commit for this review ({}, authored by {})\n\
                     was not found in the local git repository. Fetch all remotes and try again.",
                    diffs.left_base_sha, diffs.left_base_author
                )));
            }
        }

        Ok(PreconditionsResponse::ok())
    }

    pub async fn start_review(&self, _request: &ReviewRequest) -> LifecycleResponse {
        LifecycleResponse { success: true }
    }

    pub async fn pause_review(&self, _request: &ReviewRequest) -> LifecycleResponse {
        LifecycleResponse { success: true }
    }

    pub async fn end_review(&self, _request: &ReviewRequest) -> LifecycleResponse {
        LifecycleResponse { success: true }
    }
}
