//! Answers the two questions the share-gate needs: does a collection require
//! EULA acceptance, and is a collection guest-readable. Modeled on the
//! worker crate's HTTP provider wrappers — a thin `reqwest::Client` plus a
//! narrow, domain-shaped trait so the gate never sees wire format.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tessera_core::{CoreError, CoreResult};

#[async_trait]
pub trait PermissionClient: Send + Sync {
    /// For each collection, whether it carries an explicit `has-eula=false`
    /// tag. A collection absent from the response is treated as restricted.
    async fn has_eula(&self, collection_ids: &[String]) -> CoreResult<HashMap<String, bool>>;

    /// Whether every collection in the list is guest-readable, checked in
    /// one call.
    async fn all_guest_readable(&self, collection_ids: &[String]) -> CoreResult<bool>;
}

pub struct HttpPermissionClient {
    client: Client,
    base_url: String,
}

impl HttpPermissionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct EulaEntry {
    collection_id: String,
    #[serde(rename = "has-eula")]
    has_eula: bool,
}

#[derive(Deserialize)]
struct GuestReadResponse {
    all_readable: bool,
}

#[async_trait]
impl PermissionClient for HttpPermissionClient {
    async fn has_eula(&self, collection_ids: &[String]) -> CoreResult<HashMap<String, bool>> {
        if collection_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let response = self
            .client
            .get(format!("{}/tags/has-eula", self.base_url))
            .query(&[("collections", collection_ids.join(","))])
            .send()
            .await
            .map_err(|e| CoreError::service(format!("permission client request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::service(format!(
                "permission client returned {}",
                response.status()
            )));
        }

        let entries: Vec<EulaEntry> = response
            .json()
            .await
            .map_err(|e| CoreError::service(format!("permission client decode failed: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| (e.collection_id, e.has_eula))
            .collect())
    }

    async fn all_guest_readable(&self, collection_ids: &[String]) -> CoreResult<bool> {
        if collection_ids.is_empty() {
            return Ok(false);
        }
        let response = self
            .client
            .get(format!("{}/permissions/guest-read", self.base_url))
            .query(&[("collections", collection_ids.join(","))])
            .send()
            .await
            .map_err(|e| CoreError::service(format!("permission client request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::service(format!(
                "permission client returned {}",
                response.status()
            )));
        }

        let body: GuestReadResponse = response
            .json()
            .await
            .map_err(|e| CoreError::service(format!("permission client decode failed: {e}")))?;
        Ok(body.all_readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn has_eula_with_no_collections_skips_the_request() {
        let client = HttpPermissionClient::new("http://unreachable.invalid");
        let result = client.has_eula(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn has_eula_maps_entries_by_collection_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags/has-eula"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"collection_id": "C001", "has-eula": true},
                {"collection_id": "C002", "has-eula": false},
            ])))
            .mount(&server)
            .await;

        let client = HttpPermissionClient::new(server.uri());
        let result = client
            .has_eula(&["C001".to_string(), "C002".to_string()])
            .await
            .unwrap();

        assert_eq!(result.get("C001"), Some(&true));
        assert_eq!(result.get("C002"), Some(&false));
    }

    #[tokio::test]
    async fn has_eula_propagates_non_success_status_as_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags/has-eula"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpPermissionClient::new(server.uri());
        let err = client.has_eula(&["C001".to_string()]).await.unwrap_err();
        assert!(matches!(err, CoreError::Service(_)));
    }

    #[tokio::test]
    async fn all_guest_readable_with_no_collections_is_false() {
        let client = HttpPermissionClient::new("http://unreachable.invalid");
        assert!(!client.all_guest_readable(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn all_guest_readable_reflects_the_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/permissions/guest-read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "all_readable": true,
            })))
            .mount(&server)
            .await;

        let client = HttpPermissionClient::new(server.uri());
        assert!(client
            .all_guest_readable(&["C001".to_string()])
            .await
            .unwrap());
    }
}
