//! HTTP stage invoker.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::StageInvoker;
use crate::domain::Stage;
use crate::{Error, Result};

/// HTTP invoker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Base URL of the compute platform's invocation API.
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_timeout() -> u64 {
    10
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            timeout_secs: default_timeout(),
            token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(rename = "RequestId")]
    request_id: Option<String>,
}

/// Invokes stages through a REST endpoint.
///
/// `POST {base}/stages/{stage}/invoke` with `{"TaskID": ...}` starts a
/// worker and answers `{"RequestId": ...}`;
/// `POST {base}/stages/{stage}/invocations/{id}/terminate` stops one.
pub struct HttpStageInvoker {
    base_url: Url,
    token: Option<String>,
    client: Client,
}

impl HttpStageInvoker {
    pub fn new(config: &InvokerConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config(format!("Invalid invoker base URL: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            token: config.token.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::invocation(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl StageInvoker for HttpStageInvoker {
    async fn invoke(&self, stage: Stage, job_id: &str) -> Result<String> {
        let url = self.endpoint(&format!("stages/{}/invoke", stage.as_str()))?;
        let response = self
            .post(url)
            .json(&json!({ "TaskID": job_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::invocation(format!(
                "{} invocation for {} returned {}: {}",
                stage, job_id, status, body
            )));
        }

        let body: InvokeResponse = response.json().await?;
        let invocation_id = body
            .request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::invocation("Invocation response is missing RequestId"))?;

        info!(job_id, %stage, invocation_id, "Stage invoked");
        Ok(invocation_id)
    }

    async fn terminate(&self, stage: Stage, invocation_id: &str) -> Result<()> {
        let url = self.endpoint(&format!(
            "stages/{}/invocations/{}/terminate",
            stage.as_str(),
            invocation_id
        ))?;
        let response = self.post(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::invocation(format!(
                "Terminating {} invocation {} returned {}",
                stage, invocation_id, status
            )));
        }
        debug!(%stage, invocation_id, "Stage invocation terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let invoker = HttpStageInvoker::new(&InvokerConfig {
            base_url: "http://platform.local/api".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            invoker.endpoint("stages/record/invoke").unwrap().as_str(),
            "http://platform.local/api/stages/record/invoke"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpStageInvoker::new(&InvokerConfig {
            base_url: "not a url".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
