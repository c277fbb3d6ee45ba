use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited by clustering service")]
    RateLimited,
    #[error("clustering service error: {0}")]
    Server(StatusCode),
    #[error("address unknown to clustering service")]
    Unknown,
    #[error("unauthorized: check the API credential")]
    Unauthorized,
}

impl LookupError {
    /// Transient errors are retried with backoff; the rest are permanent
    /// for this address.
    pub fn is_retryable(&self) -> bool {
        match self {
            LookupError::RateLimited | LookupError::Server(_) => true,
            LookupError::Transport(e) => e.is_timeout() || e.is_connect(),
            LookupError::Unknown | LookupError::Unauthorized => false,
        }
    }
}

/// What the clustering service knows about one address.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub cluster: Option<String>,
    pub confidence: Option<f64>,
}

/// Consumed interface to the external entity-clustering service.
#[async_trait]
pub trait ClusteringService: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<ClusterInfo, LookupError>;
}

/// GraphSense-style entity API client.
pub struct GraphsenseClient {
    client: Client,
    base_url: String,
    currency: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct EntityResponse {
    entity: Option<u64>,
    best_address_tag: Option<AddressTag>,
}

#[derive(Debug, Deserialize)]
struct AddressTag {
    confidence_level: Option<f64>,
}

impl GraphsenseClient {
    pub fn new(
        scheme: &str,
        host: &str,
        currency: &str,
        api_key: String,
        timeout: std::time::Duration,
    ) -> Result<Self, LookupError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("{scheme}://{host}"),
            currency: currency.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ClusteringService for GraphsenseClient {
    async fn lookup(&self, address: &str) -> Result<ClusterInfo, LookupError> {
        let url = format!(
            "{}/{}/addresses/{}/entity",
            self.base_url, self.currency, address
        );
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("Authorization", &self.api_key)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let entity: EntityResponse = response.json().await?;
                Ok(ClusterInfo {
                    cluster: entity.entity.map(|id| id.to_string()),
                    confidence: entity
                        .best_address_tag
                        .and_then(|tag| tag.confidence_level),
                })
            }
            StatusCode::NOT_FOUND => Err(LookupError::Unknown),
            StatusCode::TOO_MANY_REQUESTS => Err(LookupError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LookupError::Unauthorized),
            status => Err(LookupError::Server(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LookupError::RateLimited.is_retryable());
        assert!(LookupError::Server(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!LookupError::Unknown.is_retryable());
        assert!(!LookupError::Unauthorized.is_retryable());
    }

    #[test]
    fn entity_response_decodes() {
        let body = r#"{"entity": 123456, "best_address_tag": {"confidence_level": 0.8}}"#;
        let parsed: EntityResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.entity, Some(123456));
        assert_eq!(
            parsed.best_address_tag.unwrap().confidence_level,
            Some(0.8)
        );

        let sparse = r#"{"entity": null}"#;
        let parsed: EntityResponse = serde_json::from_str(sparse).unwrap();
        assert!(parsed.entity.is_none());
        assert!(parsed.best_address_tag.is_none());
    }
}
