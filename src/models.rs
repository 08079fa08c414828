use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::patch::FilePatch;

/// A domain object with a stable server-assigned id.
///
/// Entities are immutable by replacement: caches swap whole values on update
/// rather than mutating fields in place.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Diagnostic label used in `NotFound` errors and log fields
    const ENTITY_NAME: &'static str;

    fn id(&self) -> &str;
}

/// Status of a review as tracked by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    Open,
    Approved,
    Rejected,
    Closed,
    /// A status this agent does not know yet
    #[serde(other)]
    Unknown,
}

/// One side of a file modification within a changeset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedFile {
    /// Right/head-side path, relative to the repository root
    pub file: String,
    /// Left/base-side path, relative to the repository root
    pub old_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
}

/// The file modifications one review makes in one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewChangeset {
    pub repo_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub commits: Vec<Value>,
    #[serde(default)]
    pub modified_files: Vec<ModifiedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub review_changesets: Vec<ReviewChangeset>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Review {
    /// Find the changeset for a repository
    pub fn changeset(&self, repo_id: &str) -> Option<&ReviewChangeset> {
        self.review_changesets.iter().find(|c| c.repo_id == repo_id)
    }
}

impl ReviewChangeset {
    /// Find the modification record whose head-side path is `path`
    pub fn modified_file(&self, path: &str) -> Option<&ModifiedFile> {
        self.modified_files.iter().find(|f| f.file == path)
    }
}

/// Stored patches and base revisions for one review in one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDiffs {
    #[serde(default)]
    pub left_base_author: String,
    pub left_base_sha: String,
    #[serde(default)]
    pub left_diffs: Vec<FilePatch>,
    #[serde(default)]
    pub right_base_author: String,
    pub right_base_sha: String,
    #[serde(default)]
    pub right_diffs: Vec<FilePatch>,
}

impl ReviewDiffs {
    /// Left-side patch whose target is `file`
    pub fn left_diff(&self, file: &str) -> Option<&FilePatch> {
        self.left_diffs.iter().find(|d| d.new_file_name == file)
    }

    /// Right-side patch whose target is `file`
    pub fn right_diff(&self, file: &str) -> Option<&FilePatch> {
        self.right_diffs.iter().find(|d| d.new_file_name == file)
    }
}

/// Review diffs keyed by repository id, kept in the order the server sent them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffsByRepo {
    entries: Vec<(String, ReviewDiffs)>,
}

impl DiffsByRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace in place when `repo_id` is already present, otherwise append
    pub fn insert(&mut self, repo_id: impl Into<String>, diffs: ReviewDiffs) {
        let repo_id = repo_id.into();
        match self.entries.iter_mut().find(|(id, _)| *id == repo_id) {
            Some((_, existing)) => *existing = diffs,
            None => self.entries.push((repo_id, diffs)),
        }
    }

    pub fn get(&self, repo_id: &str) -> Option<&ReviewDiffs> {
        self.entries
            .iter()
            .find(|(id, _)| id == repo_id)
            .map(|(_, diffs)| diffs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReviewDiffs)> {
        self.entries.iter().map(|(id, diffs)| (id.as_str(), diffs))
    }

    pub fn repo_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for DiffsByRepo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(id, diffs)| (id, diffs)))
    }
}

impl<'de> Deserialize<'de> for DiffsByRepo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = DiffsByRepo;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of repository id to review diffs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<DiffsByRepo, A::Error> {
                let mut by_repo = DiffsByRepo::new();
                while let Some((repo_id, diffs)) = map.next_entry::<String, ReviewDiffs>()? {
                    by_repo.insert(repo_id, diffs);
                }
                Ok(by_repo)
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub remotes: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Review {
    const ENTITY_NAME: &'static str = "Review";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Post {
    const ENTITY_NAME: &'static str = "Post";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Repository {
    const ENTITY_NAME: &'static str = "Repository";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Stream {
    const ENTITY_NAME: &'static str = "Stream";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Request to list reviews, optionally restricted to a set of ids
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReviewsRequest {
    #[serde(default)]
    pub review_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReviewsResponse {
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub review_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub review: Review,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewContentsRequest {
    pub review_id: String,
    pub repo_id: String,
    pub path: String,
}

/// Reconstructed left (base) and right (head) text of one reviewed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewContents {
    pub base: String,
    pub head: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReviewRequest {
    pub id: String,
    #[serde(flatten)]
    pub changes: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReviewRequest {
    pub id: String,
}

/// Outcome of a check that renders as a message rather than failing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionsResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreconditionsResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Reply to the start/pause/end review lifecycle requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub success: bool,
}

/// Components of a `codestream-diff://` document URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffUri {
    pub review_id: String,
    pub repo_id: String,
    pub version: String,
    pub path: String,
}
