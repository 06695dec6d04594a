//! Client for the AI analysis service
//!
//! Generation is paid work, so callers consume `ai_analysis` quota before
//! invoking it. A failed generation does not refund the unit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis service is not configured")]
    NotConfigured,
    #[error("analysis request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("analysis service returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait AnalysisGenerator: Send + Sync {
    /// Produce an analysis report for `ticker` on behalf of `user_id`
    async fn generate(&self, user_id: Uuid, ticker: &str)
        -> Result<serde_json::Value, AnalysisError>;
}

pub type SharedAnalysisGenerator = Arc<dyn AnalysisGenerator>;

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    ticker: &'a str,
    user_id: Uuid,
}

/// Forwards generation requests over HTTP
pub struct HttpAnalysisGenerator {
    client: Client,
    endpoint: String,
}

impl HttpAnalysisGenerator {
    const TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/analyze", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl AnalysisGenerator for HttpAnalysisGenerator {
    async fn generate(
        &self,
        user_id: Uuid,
        ticker: &str,
    ) -> Result<serde_json::Value, AnalysisError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(Self::TIMEOUT)
            .json(&AnalysisRequest { ticker, user_id })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// Used when no analysis service URL is configured
pub struct UnavailableAnalysisGenerator;

#[async_trait]
impl AnalysisGenerator for UnavailableAnalysisGenerator {
    async fn generate(
        &self,
        _user_id: Uuid,
        _ticker: &str,
    ) -> Result<serde_json::Value, AnalysisError> {
        Err(AnalysisError::NotConfigured)
    }
}

/// Tokyo Stock Exchange codes: four characters, optionally with a `.T` suffix
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    let code = code.strip_suffix(".T").unwrap_or(&code);
    let valid = code.len() == 4
        && code.chars().all(|c| c.is_ascii_alphanumeric())
        && code.chars().next().is_some_and(|c| c.is_ascii_digit());
    valid.then(|| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ticker() {
        assert_eq!(normalize_ticker("7203").as_deref(), Some("7203"));
        assert_eq!(normalize_ticker("7203.t").as_deref(), Some("7203"));
        assert_eq!(normalize_ticker("130a").as_deref(), Some("130A"));
        assert_eq!(normalize_ticker("AAPL"), None);
        assert_eq!(normalize_ticker("72035"), None);
        assert_eq!(normalize_ticker("72/3"), None);
        assert_eq!(normalize_ticker(""), None);
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let generator = HttpAnalysisGenerator::new(Client::new(), "http://analysis:9000/");
        assert_eq!(generator.endpoint, "http://analysis:9000/analyze");
    }

    #[tokio::test]
    async fn test_unavailable_generator_errors() {
        let result = UnavailableAnalysisGenerator
            .generate(Uuid::new_v4(), "7203")
            .await;
        assert!(matches!(result, Err(AnalysisError::NotConfigured)));
    }
}
