use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use async_trait::async_trait;
use reqwest::Method;
use tracing::debug;

use crate::collab::CollaboratorError;

/// A fully rendered outbound webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponseSummary {
    pub status: u16,
    pub body: String,
}

impl HttpResponseSummary {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait IntegrationClient: Send + Sync + Debug {
    async fn call(&self, request: HttpRequestSpec) -> Result<HttpResponseSummary, CollaboratorError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestIntegration {
    client: reqwest::Client,
}

impl ReqwestIntegration {
    pub fn new(timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Default for ReqwestIntegration {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IntegrationClient for ReqwestIntegration {
    async fn call(&self, request: HttpRequestSpec) -> Result<HttpResponseSummary, CollaboratorError> {
        let method = Method::from_bytes(request.method.trim().to_uppercase().as_bytes())
            .map_err(|e| CollaboratorError::Failed(format!("bad method `{}`: {}", request.method, e)))?;

        let mut call = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            call = call.header(name, value);
        }
        if let Some(body) = request.body {
            if !request.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                call = call.header("content-type", "application/json");
            }
            call = call.body(body);
        }

        let response = call.send().await.map_err(CollaboratorError::from)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(CollaboratorError::from)?;
        debug!(url = %request.url, status, "integration call finished");

        let summary = HttpResponseSummary { status, body };
        if !summary.is_success() {
            return Err(CollaboratorError::Failed(format!(
                "{} answered {}",
                request.url, summary.status
            )));
        }
        Ok(summary)
    }
}
