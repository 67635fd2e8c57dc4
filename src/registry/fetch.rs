//! Raw catalog fetching
//!
//! Two upstream calls feed the registry: the models catalog, and one
//! endpoints call per base model. Both come back as verbatim JSON that the
//! raw tables preserve.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::types::{RawBaseModel, RawEndpoint};
use crate::provider::{ProviderError, ProviderResult};

/// Source of raw catalog data.
///
/// Separate from [`crate::provider::ChatGateway`] so registry refreshes can
/// be driven from fixtures in tests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch all base models from the catalog endpoint.
    async fn fetch_base_models(&self) -> ProviderResult<Vec<RawBaseModel>>;

    /// Fetch the hosting endpoints for one base model.
    async fn fetch_endpoints(&self, base_model_id: &str) -> ProviderResult<Vec<RawEndpoint>>;
}

/// HTTP catalog source for an OpenRouter-compatible gateway.
pub struct OpenRouterCatalog {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenRouterCatalog {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn get_json(&self, url: &str) -> ProviderResult<Value> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(std::time::Duration::from_secs(60))
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl CatalogSource for OpenRouterCatalog {
    async fn fetch_base_models(&self) -> ProviderResult<Vec<RawBaseModel>> {
        let payload = self.get_json(&format!("{}/models", self.base_url)).await?;

        let entries = payload
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("catalog payload missing data array".to_string()))?;

        Ok(entries
            .iter()
            .cloned()
            .map(RawBaseModel::from_payload)
            .filter(|m| !m.id.is_empty())
            .collect())
    }

    async fn fetch_endpoints(&self, base_model_id: &str) -> ProviderResult<Vec<RawEndpoint>> {
        let payload = self
            .get_json(&format!("{}/models/{}/endpoints", self.base_url, base_model_id))
            .await?;

        Ok(extract_endpoint_payloads(&payload)
            .into_iter()
            .map(|p| RawEndpoint::from_payload(base_model_id, p))
            .collect())
    }
}

/// Unwrap the gateway's nested endpoint container.
///
/// Two shapes exist upstream: `data` as a plain list, and `data` as an
/// object holding an `endpoints` list. Anything else yields no endpoints.
pub fn extract_endpoint_payloads(payload: &Value) -> Vec<Value> {
    let data = payload.get("data");

    if let Some(list) = data.and_then(Value::as_array) {
        return list.to_vec();
    }

    if let Some(list) = data
        .and_then(|d| d.get("endpoints"))
        .and_then(Value::as_array)
    {
        return list.to_vec();
    }

    warn!("unrecognized endpoint container shape");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_endpoints_from_plain_list() {
        let payload = json!({"data": [{"provider_name": "A"}, {"provider_name": "B"}]});
        assert_eq!(extract_endpoint_payloads(&payload).len(), 2);
    }

    #[test]
    fn test_extract_endpoints_from_nested_object() {
        let payload = json!({"data": {"id": "x", "endpoints": [{"provider_name": "A"}]}});
        assert_eq!(extract_endpoint_payloads(&payload).len(), 1);
    }

    #[test]
    fn test_extract_endpoints_unknown_shape() {
        let payload = json!({"data": "garbage"});
        assert!(extract_endpoint_payloads(&payload).is_empty());
    }
}
