use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://wiki.facepunch.com";
const INDEX_PATH: &str = "/gmod/";
const RAW_SOURCE_SUFFIX: &str = "?format=text";

/// Retry behavior for a single GET. Passed in explicitly so call sites do not
/// bake their own ceilings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff, capped at `max_delay`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor as u32).min(self.max_delay)
    }
}

/// HTTP client for the wiki, retrying transient failures per its policy.
pub struct WikiClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl WikiClient {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gmod_scraper/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(WikiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Fetch the documentation index page (rendered HTML).
    pub async fn fetch_index(&self) -> Result<String> {
        self.get_text(&format!("{}{}", self.base_url, INDEX_PATH)).await
    }

    /// Fetch the raw-markup variant of one entity's page.
    pub async fn fetch_page_source(&self, link: &str) -> Result<String> {
        self.get_text(&format!("{}{}{}", self.base_url, link, RAW_SOURCE_SUFFIX))
            .await
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let mut last_err = anyhow!("no attempt made");

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt - 1);
                debug!(
                    "Retrying {} (attempt {}/{}) after {:.1}s",
                    url,
                    attempt + 1,
                    self.retry.max_attempts,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }

            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) => return Ok(body),
                            Err(e) => last_err = anyhow!(e).context("Failed reading body"),
                        }
                    } else if status.as_u16() == 429 || status.is_server_error() {
                        last_err = anyhow!("GET {} returned {}", url, status);
                    } else {
                        // Client errors other than rate limiting won't heal.
                        bail!("GET {} failed with {}", url, status);
                    }
                }
                Err(e) => last_err = anyhow!(e),
            }

            warn!("Fetch failed for {}: {}", url, last_err);
        }

        Err(last_err).with_context(|| {
            format!("Giving up on {} after {} attempts", url, self.retry.max_attempts)
        })
    }
}
