use thiserror::Error;

use crate::patch::PatchError;

/// Errors surfaced by the agent core and its collaborator adapters
#[derive(Debug, Error)]
pub enum Error {
    /// An entity (or derived record such as a diff set) is absent
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("could not find changeset with repoId {0}")]
    ChangesetNotFound(String),

    #[error("could not find changeset file information for {0}")]
    FileInfoNotFound(String),

    #[error("could not load repo with ID {0}")]
    RepositoryNotFound(String),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("URI {0} doesn't match codestream-diff format")]
    InvalidUri(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no handler registered for request {0}")]
    UnknownRequest(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True for every "absent" flavour of lookup failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::ChangesetNotFound(_)
                | Error::FileInfoNotFound(_)
                | Error::RepositoryNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
