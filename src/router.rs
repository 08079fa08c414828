//! Request-method dispatch for the agent's JSON request surface.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::models::{
    DeleteReviewRequest, FetchReviewsRequest, ReviewContentsRequest, ReviewRequest,
    UpdateReviewRequest,
};
use crate::reviews::ReviewsManager;

pub mod methods {
    pub const FETCH_REVIEWS: &str = "codestream/reviews";
    pub const GET_REVIEW: &str = "codestream/review";
    pub const REVIEW_CONTENTS: &str = "codestream/review/contents";
    pub const CHECK_PRECONDITIONS: &str = "codestream/review/preconditions";
    pub const UPDATE_REVIEW: &str = "codestream/review/update";
    pub const DELETE_REVIEW: &str = "codestream/review/delete";
    pub const START_REVIEW: &str = "codestream/review/start";
    pub const PAUSE_REVIEW: &str = "codestream/review/pause";
    pub const END_REVIEW: &str = "codestream/review/end";
}

type Handler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Default)]
pub struct RequestRouter {
    handlers: BTreeMap<&'static str, Handler>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler; params are decoded into `Req` and the
    /// response encoded back to JSON. A second registration replaces the first.
    pub fn register<Req, Resp, F, Fut>(&mut self, method: &'static str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |params: Value| -> BoxFuture<'static, Result<Value>> {
            let call = serde_json::from_value::<Req>(params).map(&handler);
            Box::pin(async move {
                let response = call?.await?;
                Ok(serde_json::to_value(response)?)
            })
        });
        self.handlers.insert(method, handler);
    }

    /// Table with every review request
    pub fn with_reviews(reviews: Arc<ReviewsManager>) -> Self {
        let mut router = Self::new();

        let r = reviews.clone();
        router.register(
            methods::FETCH_REVIEWS,
            move |request: Option<FetchReviewsRequest>| {
                let r = r.clone();
                async move { r.get(request.as_ref()).await }
            },
        );

        let r = reviews.clone();
        router.register(methods::GET_REVIEW, move |request: ReviewRequest| {
            let r = r.clone();
            async move { r.get_review(&request).await }
        });

        let r = reviews.clone();
        router.register(
            methods::REVIEW_CONTENTS,
            move |request: ReviewContentsRequest| {
                let r = r.clone();
                async move { r.get_contents(&request).await }
            },
        );

        let r = reviews.clone();
        router.register(methods::CHECK_PRECONDITIONS, move |request: ReviewRequest| {
            let r = r.clone();
            async move { r.check_preconditions(&request).await }
        });

        let r = reviews.clone();
        router.register(methods::UPDATE_REVIEW, move |request: UpdateReviewRequest| {
            let r = r.clone();
            async move { r.update(request).await }
        });

        let r = reviews.clone();
        router.register(methods::DELETE_REVIEW, move |request: DeleteReviewRequest| {
            let r = r.clone();
            async move { r.delete(&request).await }
        });

        let r = reviews.clone();
        router.register(methods::START_REVIEW, move |request: ReviewRequest| {
            let r = r.clone();
            async move { Ok::<_, Error>(r.start_review(&request).await) }
        });

        let r = reviews.clone();
        router.register(methods::PAUSE_REVIEW, move |request: ReviewRequest| {
            let r = r.clone();
            async move { Ok::<_, Error>(r.pause_review(&request).await) }
        });

        let r = reviews;
        router.register(methods::END_REVIEW, move |request: ReviewRequest| {
            let r = r.clone();
            async move { Ok::<_, Error>(r.end_review(&request).await) }
        });

        router
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    #[instrument(skip(self, params))]
    pub async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| Error::UnknownRequest(method.to_string()))?;

        debug!("Dispatching request");
        handler(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::reviews::tests::{fixture, review, GitStub};

    fn router() -> RequestRouter {
        let f = fixture(
            vec![review("a", json!([])), review("b", json!([]))],
            Default::default(),
            GitStub::default(),
        );
        RequestRouter::with_reviews(Arc::new(f.manager))
    }

    #[test]
    fn test_registers_every_review_method() {
        let router = router();
        let registered = router.methods();
        for method in [
            methods::FETCH_REVIEWS,
            methods::GET_REVIEW,
            methods::REVIEW_CONTENTS,
            methods::CHECK_PRECONDITIONS,
            methods::UPDATE_REVIEW,
            methods::DELETE_REVIEW,
            methods::START_REVIEW,
            methods::PAUSE_REVIEW,
            methods::END_REVIEW,
        ] {
            assert!(registered.contains(&method), "missing {}", method);
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = router()
            .handle("codestream/markers", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRequest(ref m) if m == "codestream/markers"));
    }

    #[tokio::test]
    async fn test_fetch_reviews_without_params() {
        let response = router()
            .handle(methods::FETCH_REVIEWS, Value::Null)
            .await
            .unwrap();

        let ids: Vec<&str> = response["reviews"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_get_review_round_trips_json() {
        let response = router()
            .handle(methods::GET_REVIEW, json!({ "reviewId": "b" }))
            .await
            .unwrap();
        assert_eq!(response["review"]["id"], "b");
    }

    #[tokio::test]
    async fn test_bad_params_are_json_errors() {
        let err = router()
            .handle(methods::GET_REVIEW, json!({ "wrong": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_requests_succeed() {
        let router = router();
        for method in [methods::START_REVIEW, methods::PAUSE_REVIEW, methods::END_REVIEW] {
            let response = router.handle(method, json!({ "reviewId": "a" })).await.unwrap();
            assert_eq!(response, json!({ "success": true }));
        }
    }
}
