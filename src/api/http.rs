use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{EntityApi, FetchFilter, ReviewDiffsApi};
use crate::error::{Error, Result};
use crate::models::{DiffsByRepo, Entity, Post, Repository, Review, Stream};

/// REST naming for an entity kind: `GET /{COLLECTION}` answers
/// `{ COLLECTION: [...] }`, item routes answer `{ SINGULAR: {...} }`.
pub trait ApiResource: Entity + DeserializeOwned {
    const COLLECTION: &'static str;
    const SINGULAR: &'static str;
}

impl ApiResource for Review {
    const COLLECTION: &'static str = "reviews";
    const SINGULAR: &'static str = "review";
}

impl ApiResource for Post {
    const COLLECTION: &'static str = "posts";
    const SINGULAR: &'static str = "post";
}

impl ApiResource for Repository {
    const COLLECTION: &'static str = "repos";
    const SINGULAR: &'static str = "repo";
}

impl ApiResource for Stream {
    const COLLECTION: &'static str = "streams";
    const SINGULAR: &'static str = "stream";
}

/// JSON/REST client for the collaboration server
pub struct HttpApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, "Initialized API client");

        Self {
            client: Client::new(),
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        Ok(response)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Transport(format!("server returned {}: {}", status, body)))
}

/// Pull `key` out of a JSON envelope and decode it
async fn take_field<R: DeserializeOwned>(response: Response, key: &str) -> Result<R> {
    let mut body: Value = response.json().await?;
    let value = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::Transport(format!("response is missing '{}'", key)))?;

    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<T: ApiResource> EntityApi<T> for HttpApiClient {
    #[instrument(skip(self), fields(entity = T::ENTITY_NAME))]
    async fn fetch_all(&self, filter: &FetchFilter) -> Result<Vec<T>> {
        let mut request = self.client.get(self.url(T::COLLECTION));
        if let Some(ids) = &filter.ids {
            request = request.query(&[("ids", ids.join(","))]);
        }
        if let Some(stream_id) = &filter.stream_id {
            request = request.query(&[("streamId", stream_id)]);
        }

        let response = ensure_success(self.send(request).await?).await?;
        let items: Vec<T> = take_field(response, T::COLLECTION).await?;

        debug!(count = items.len(), "Fetched entities");

        Ok(items)
    }

    #[instrument(skip(self), fields(entity = T::ENTITY_NAME))]
    async fn fetch_by_id(&self, id: &str) -> Result<Option<T>> {
        let request = self.client.get(self.url(&format!("{}/{}", T::COLLECTION, id)));
        let response = self.send(request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = ensure_success(response).await?;
        Ok(Some(take_field(response, T::SINGULAR).await?))
    }

    #[instrument(skip(self, patch), fields(entity = T::ENTITY_NAME))]
    async fn update(&self, id: &str, patch: Value) -> Result<T> {
        let request = self
            .client
            .put(self.url(&format!("{}/{}", T::COLLECTION, id)))
            .json(&patch);

        let response = ensure_success(self.send(request).await?).await?;
        take_field(response, T::SINGULAR).await
    }

    #[instrument(skip(self), fields(entity = T::ENTITY_NAME))]
    async fn delete(&self, id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&format!("{}/{}", T::COLLECTION, id)));

        ensure_success(self.send(request).await?).await?;
        Ok(())
    }
}

#[async_trait]
impl ReviewDiffsApi for HttpApiClient {
    #[instrument(skip(self))]
    async fn fetch_review_diffs(&self, review_id: &str) -> Result<DiffsByRepo> {
        let request = self
            .client
            .get(self.url(&format!("reviews/{}/diffs", review_id)));

        let response = ensure_success(self.send(request).await?).await?;
        let diffs: DiffsByRepo = response.json().await?;

        debug!(repos = diffs.len(), "Fetched review diffs");

        Ok(diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_all_reviews() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reviews"))
            .and(query_param("ids", "r1,r2"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reviews": [{ "id": "r1" }, { "id": "r2" }]
            })))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(server.uri(), Some("secret".to_string()));
        let filter = FetchFilter {
            ids: Some(vec!["r1".to_string(), "r2".to_string()]),
            ..Default::default()
        };

        let reviews = EntityApi::<Review>::fetch_all(&client, &filter).await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[1].id, "r2");
    }

    #[tokio::test]
    async fn test_fetch_by_id_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts/p9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(server.uri(), None);
        let post = EntityApi::<Post>::fetch_by_id(&client, "p9").await.unwrap();
        assert!(post.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/streams/s1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(server.uri(), None);
        let result = EntityApi::<Stream>::fetch_by_id(&client, "s1").await;
        match result {
            Err(Error::Transport(message)) => assert!(message.contains("boom")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_sends_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/reviews/r1"))
            .and(body_json(json!({ "title": "Renamed" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "review": { "id": "r1", "title": "Renamed" }
            })))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(format!("{}/", server.uri()), None);
        let review = EntityApi::<Review>::update(&client, "r1", json!({ "title": "Renamed" }))
            .await
            .unwrap();
        assert_eq!(review.title, "Renamed");
    }

    #[tokio::test]
    async fn test_fetch_review_diffs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reviews/r1/diffs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "repo1": {
                    "leftBaseSha": "aaa",
                    "leftBaseAuthor": "jane",
                    "rightBaseSha": "bbb",
                    "leftDiffs": [{
                        "oldFileName": "a.ts",
                        "newFileName": "a.ts",
                        "hunks": [{ "oldStart": 1, "oldLines": 1, "newStart": 1, "newLines": 1, "lines": ["-x", "+y"] }]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(server.uri(), None);
        let diffs = client.fetch_review_diffs("r1").await.unwrap();
        let repo = diffs.get("repo1").unwrap();
        assert_eq!(repo.left_base_sha, "aaa");
        assert_eq!(repo.left_diffs[0].hunks[0].lines, vec!["-x", "+y"]);
    }

    #[tokio::test]
    async fn test_fetch_review_diffs_keeps_server_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reviews/r1/diffs"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"zrepo":{"leftBaseSha":"z","rightBaseSha":"z"},"arepo":{"leftBaseSha":"a","rightBaseSha":"a"}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = HttpApiClient::new(server.uri(), None);
        let diffs = client.fetch_review_diffs("r1").await.unwrap();
        assert_eq!(diffs.repo_ids(), vec!["zrepo", "arepo"]);
        assert_eq!(diffs.get("arepo").unwrap().left_base_sha, "a");
    }
}
