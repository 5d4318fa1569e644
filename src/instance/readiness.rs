//! HTTP readiness probing for freshly spawned servers.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Shared HTTP client for probes and API steps. Individual requests set their
/// own timeouts; the client-level one is only a fallback.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

pub fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .build()
            .expect("Failed to create shared HTTP client")
    })
}

/// A single readiness condition.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// True once the target accepts requests.
    async fn check(&self) -> bool;

    /// Human-readable target, used in timeout reports.
    fn target(&self) -> &str;
}

/// Ready when the URL answers with any status below 500. A 404 from a
/// server without a health route still proves the server is listening.
pub struct HttpProbe {
    url: String,
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let url = url.into();
        validate_url(&url)?;
        Ok(Self {
            url,
            request_timeout,
        })
    }
}

/// Reject anything that is not an absolute http(s) URL.
pub fn validate_url(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(Error::Config(format!(
            "Invalid URL '{}': scheme must be http or https, got '{}'",
            url,
            parsed.scheme()
        ))),
        Err(e) => Err(Error::Config(format!("Invalid URL '{}': {}", url, e))),
    }
}

#[async_trait]
impl ReadinessCheck for HttpProbe {
    async fn check(&self) -> bool {
        match shared_client()
            .get(&self.url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => {
                let ready = response.status().as_u16() < 500;
                tracing::debug!(url = %self.url, status = %response.status(), ready, "Readiness probe");
                ready
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Readiness probe failed");
                false
            }
        }
    }

    fn target(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    /// The deadline passed; lists the targets that never became ready.
    TimedOut { pending: Vec<String> },
    /// A supervised process died while we were waiting.
    Exited { name: String, status: String },
}

/// Poll every check until all pass, the timeout elapses, or `exited` reports
/// a dead process. Never blocks past `timeout` plus one probe.
pub async fn wait_until_ready<F>(
    checks: &[Box<dyn ReadinessCheck>],
    timeout: Duration,
    interval: Duration,
    mut exited: F,
) -> ReadinessOutcome
where
    F: FnMut() -> Option<(String, String)>,
{
    let deadline = Instant::now() + timeout;
    let mut ready = vec![false; checks.len()];

    loop {
        if let Some((name, status)) = exited() {
            return ReadinessOutcome::Exited { name, status };
        }

        for (check, done) in checks.iter().zip(ready.iter_mut()) {
            if !*done {
                *done = check.check().await;
            }
        }
        if ready.iter().all(|r| *r) {
            return ReadinessOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            let pending = checks
                .iter()
                .zip(&ready)
                .filter(|(_, done)| !**done)
                .map(|(c, _)| c.target().to_string())
                .collect();
            return ReadinessOutcome::TimedOut { pending };
        }
        sleep(interval.min(deadline - now)).await;
    }
}
