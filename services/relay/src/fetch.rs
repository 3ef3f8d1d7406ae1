//! Rotating fetch processor
//!
//! Runs one job by calling `POST {upstream}/{payload_ref}` with the bearer
//! token of a rotator-selected resource. Each attempt reports its outcome to
//! the rotator, so a rate-limited resource is quarantined and the next
//! attempt lands on another one.
//!
//! Rate-limit handling:
//! - another resource is usable: retry immediately on it
//! - none usable, wait <= max_wait: sleep out the wait, then retry
//! - none usable, longer wait: fail the attempt without sleeping
//!
//! The final attempt never sleeps; it fails with the last error instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use connector::FailureClass;
use dispatcher::{JobContext, ProcessError, ProcessResult, Processor};
use rotator::{Rotator, classify_status};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Upstream call settings.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub upstream_url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub max_wait: Duration,
}

/// Processor that fetches a job's payload through the resource rotator.
pub struct FetchProcessor {
    client: reqwest::Client,
    rotator: Arc<Rotator>,
    settings: FetchSettings,
}

impl FetchProcessor {
    pub fn new(client: reqwest::Client, rotator: Arc<Rotator>, settings: FetchSettings) -> Self {
        Self {
            client,
            rotator,
            settings,
        }
    }

    fn url(&self, payload_ref: &str) -> String {
        format!(
            "{}/{}",
            self.settings.upstream_url.trim_end_matches('/'),
            payload_ref.trim_start_matches('/')
        )
    }

    #[instrument(skip_all, fields(job_id = %ctx.job_id, owner = %ctx.owner, attempt = ctx.attempt))]
    async fn fetch(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let url = self.url(&ctx.payload_ref);
        let max_attempts = self.settings.max_attempts;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            if ctx.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let acquired = match self.rotator.acquire().await {
                Ok(acquired) => acquired,
                Err(e) => match e.retry_in() {
                    Some(wait) if wait <= self.settings.max_wait && attempt < max_attempts => {
                        info!(
                            attempt,
                            wait_secs = wait.as_secs(),
                            "all resources quarantined, waiting"
                        );
                        last_error = e.to_string();
                        self.pause(ctx, wait).await?;
                        continue;
                    }
                    _ => return Err(e.into()),
                },
            };
            let resource = acquired.name.clone();
            debug!(resource, attempt, max_attempts, "fetching payload");

            let sent = self
                .client
                .post(&url)
                .bearer_auth(acquired.session.token())
                .timeout(self.settings.timeout)
                .json(&serde_json::json!({
                    "job_id": ctx.job_id,
                    "owner": ctx.owner,
                    "attempt": ctx.attempt,
                }))
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    warn!(resource, attempt, error = %e, "upstream request failed");
                    metrics::record_fetch(FailureClass::Transient.label());
                    self.rotator
                        .report_failure(&resource, &FailureClass::Transient)
                        .await;
                    last_error = Error::Upstream {
                        resource,
                        message: e.to_string(),
                    }
                    .to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(resource, attempt, error = %e, "failed to read upstream body");
                    metrics::record_fetch(FailureClass::Transient.label());
                    self.rotator
                        .report_failure(&resource, &FailureClass::Transient)
                        .await;
                    last_error = Error::Upstream {
                        resource,
                        message: e.to_string(),
                    }
                    .to_string();
                    continue;
                }
            };

            if (200..300).contains(&status) {
                self.rotator.report(&resource, true, None).await;
                metrics::record_fetch("success");
                info!(resource, attempt, status, "payload fetched");
                let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
                return Ok(serde_json::json!({
                    "resource": resource,
                    "status": status,
                    "body": body,
                }));
            }

            let class = classify_status(status, retry_after.as_deref(), &body);
            metrics::record_fetch(class.label());
            self.rotator.report_failure(&resource, &class).await;

            if let FailureClass::RateLimited { retry_after: wait } = class {
                let available = self.rotator.get_available_count().await;
                if available > 0 {
                    let total = self.rotator.get_total_count().await;
                    info!(
                        resource,
                        available,
                        total,
                        "rate limited, rotating to another resource"
                    );
                } else if wait > self.settings.max_wait {
                    warn!(
                        resource,
                        wait_secs = wait.as_secs(),
                        "every resource rate limited beyond max wait"
                    );
                    return Err(Error::RateLimited {
                        wait_secs: wait.as_secs(),
                        max_wait_secs: self.settings.max_wait.as_secs(),
                    });
                } else if attempt < max_attempts {
                    info!(resource, wait_secs = wait.as_secs(), "rate limited, waiting");
                    self.pause(ctx, wait).await?;
                }
            } else {
                warn!(resource, attempt, status, class = class.label(), "upstream rejected fetch");
            }
            last_error = Error::Status { resource, status }.to_string();
        }

        Err(Error::AttemptsExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Sleep for `wait`, returning early if the job is cancelled.
    async fn pause(&self, ctx: &JobContext, wait: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = ctx.cancellation.cancelled() => Err(Error::Cancelled),
        }
    }
}

impl Processor for FetchProcessor {
    fn process(&self, ctx: JobContext) -> Pin<Box<dyn Future<Output = ProcessResult> + Send + '_>> {
        Box::pin(async move {
            self.fetch(&ctx)
                .await
                .map_err(|e| ProcessError::new(e.to_string()))
        })
    }
}
