use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{EntityApi, ReviewDiffsApi};
use crate::cache::CachedEntityManager;
use crate::git::GitRevisionResolver;
use crate::messages::ChangeEvent;
use crate::models::{Post, Repository, Review, Stream};
use crate::reviews::ReviewsManager;

/// One cache manager per entity kind, shared by the router and the live-update task
pub struct EntityManagers {
    pub posts: Arc<CachedEntityManager<Post>>,
    pub repos: Arc<CachedEntityManager<Repository>>,
    pub streams: Arc<CachedEntityManager<Stream>>,
    pub reviews: Arc<ReviewsManager>,
}

impl EntityManagers {
    /// Build every manager on top of one server client
    pub fn new<C>(client: Arc<C>, git: Arc<dyn GitRevisionResolver>) -> Self
    where
        C: EntityApi<Post>
            + EntityApi<Repository>
            + EntityApi<Stream>
            + EntityApi<Review>
            + ReviewDiffsApi
            + 'static,
    {
        let posts: Arc<dyn EntityApi<Post>> = client.clone();
        let repos: Arc<dyn EntityApi<Repository>> = client.clone();
        let streams: Arc<dyn EntityApi<Stream>> = client.clone();
        let reviews: Arc<dyn EntityApi<Review>> = client.clone();
        let diffs: Arc<dyn ReviewDiffsApi> = client;

        Self {
            posts: Arc::new(CachedEntityManager::new(posts)),
            repos: Arc::new(CachedEntityManager::new(repos)),
            streams: Arc::new(CachedEntityManager::new(streams)),
            reviews: Arc::new(ReviewsManager::new(reviews, diffs, git)),
        }
    }

    /// Merge a change event into the matching cache, returning how many entities it carried
    pub async fn apply(&self, event: ChangeEvent) -> usize {
        match event {
            ChangeEvent::Posts(items) => self.posts.resolve(items).await.len(),
            ChangeEvent::Repositories(items) => self.repos.resolve(items).await.len(),
            ChangeEvent::Streams(items) => self.streams.resolve(items).await.len(),
            ChangeEvent::Reviews(items) => self.reviews.entities().resolve(items).await.len(),
        }
    }

    pub async fn invalidate_all(&self) {
        self.posts.invalidate().await;
        self.repos.invalidate().await;
        self.streams.invalidate().await;
        self.reviews.entities().invalidate().await;
    }
}

/// Keep the caches current from the receiver's event stream until it closes.
///
/// Missed events leave the caches unreliable, so lagging drops them all.
pub fn spawn_cache_sync(
    mut events: broadcast::Receiver<ChangeEvent>,
    managers: Arc<EntityManagers>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let kind = event.kind();
                    let count = managers.apply(event).await;
                    debug!(kind = kind.as_str(), count, "Applied live update");
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Live updates lagged, invalidating caches");
                    managers.invalidate_all().await;
                }
                Err(RecvError::Closed) => {
                    info!("Live update stream closed");
                    break;
                }
            }
        }
    })
}
