//! Delivery of the final task view to the user's callback URL.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::Result;
use crate::domain::TaskView;

/// Callback delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Pause between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_attempts() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            timeout_ms: default_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Posts the public task view to a callback URL, at least once.
pub struct CallbackSender {
    config: CallbackConfig,
    client: Client,
}

impl CallbackSender {
    pub fn new(config: CallbackConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, client })
    }

    /// Deliver `view` to `url`. On failure returns the last error message
    /// once every attempt has been spent.
    pub async fn deliver(&self, url: &str, view: &TaskView) -> std::result::Result<(), String> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.client.post(url).json(view).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(job_id = %view.task_id, url, attempt, "Callback delivered");
                    return Ok(());
                }
                Ok(response) => last_error = format!("HTTP {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }
            warn!(job_id = %view.task_id, url, attempt, error = %last_error, "Callback attempt failed");
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }
        Err(last_error)
    }
}
