pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod git;
pub mod logging;
pub mod messages;
pub mod models;
pub mod patch;
pub mod realtime;
pub mod reviews;
pub mod router;
pub mod session;

pub use api::{ApiResource, EntityApi, FetchFilter, HttpApiClient, ReviewDiffsApi};
pub use cache::{CachedEntityManager, EntityCache};
pub use config::Config;
pub use error::{Error, Result};
pub use git::{GitCli, GitCommit, GitRepository, GitRevisionResolver};
pub use messages::{process_message, ChangeEvent, MessageType};
pub use models::*;
pub use patch::{apply_patch, parse_patch, FilePatch, Hunk, PatchError};
pub use realtime::{Credentials, ListenerHandle, LiveUpdateReceiver, PubSubTransport, TransportListener};
pub use reviews::{parse_uri, ReviewsManager};
pub use router::RequestRouter;
pub use session::{spawn_cache_sync, EntityManagers};
