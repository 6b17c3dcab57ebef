//! Issues paged/scrolled queries against the external granule catalog.
//! Consumed only by the first-stage "query-index" worker; every other
//! component treats the STAC catalogs it returns as opaque.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tessera_core::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize)]
pub struct GranuleQuery {
    pub collection_ids: Vec<String>,
    pub bounding_box: Option<tessera_core::BoundingBox>,
    pub temporal: Option<tessera_core::TemporalInterval>,
    pub scroll_id: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GranuleQueryResult {
    /// Opaque STAC catalog location the orchestrator hands to the next step.
    pub stac_catalog_location: String,
    pub hits: u64,
    pub scroll_id: Option<String>,
}

#[async_trait]
pub trait GranuleIndexClient: Send + Sync {
    async fn query(&self, query: &GranuleQuery) -> CoreResult<GranuleQueryResult>;
}

pub struct HttpGranuleIndexClient {
    client: Client,
    base_url: String,
}

impl HttpGranuleIndexClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl GranuleIndexClient for HttpGranuleIndexClient {
    async fn query(&self, query: &GranuleQuery) -> CoreResult<GranuleQueryResult> {
        let response = self
            .client
            .post(format!("{}/granules.json", self.base_url))
            .json(query)
            .send()
            .await
            .map_err(|e| CoreError::service(format!("granule index request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::service(format!(
                "granule index returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CoreError::service(format!("granule index decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_query() -> GranuleQuery {
        GranuleQuery {
            collection_ids: vec!["C001".to_string()],
            bounding_box: None,
            temporal: None,
            scroll_id: None,
            page_size: 2000,
        }
    }

    #[tokio::test]
    async fn query_decodes_a_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/granules.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stac_catalog_location": "s3://bucket/catalog.json",
                "hits": 42,
                "scroll_id": "scroll-1",
            })))
            .mount(&server)
            .await;

        let client = HttpGranuleIndexClient::new(server.uri());
        let result = client.query(&sample_query()).await.unwrap();

        assert_eq!(result.stac_catalog_location, "s3://bucket/catalog.json");
        assert_eq!(result.hits, 42);
        assert_eq!(result.scroll_id.as_deref(), Some("scroll-1"));
    }

    #[tokio::test]
    async fn query_surfaces_non_success_status_as_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/granules.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpGranuleIndexClient::new(server.uri());
        let err = client.query(&sample_query()).await.unwrap_err();
        assert!(matches!(err, CoreError::Service(_)));
    }

    #[tokio::test]
    async fn query_surfaces_transport_failure_as_service_error() {
        let client = HttpGranuleIndexClient::new("http://127.0.0.1:1");
        let err = client.query(&sample_query()).await.unwrap_err();
        assert!(matches!(err, CoreError::Service(_)));
    }
}
