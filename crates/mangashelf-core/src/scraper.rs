//! Resilient scraper client: breaker gate, per-attempt timeout, bounded
//! retries with backoff, and rate-limit cooperation around a [`SourceTransport`].

use std::future::Future;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use crate::error::ScrapeError;
use crate::models::SeriesMetadata;
use crate::traits::MetadataLookup;

/// Classified result of one HTTP attempt against a source.
#[derive(Debug, Clone, PartialEq)]
pub enum ScraperOutcome {
    /// 2xx with the raw response body.
    Success(serde_json::Value),
    /// 404.
    NotFound,
    /// 429, with the `Retry-After` hint in seconds when the source sent one.
    RateLimited(Option<u64>),
    /// Any other 4xx: the request itself was refused.
    ClientError(u16),
    /// 5xx.
    ServerFailure(u16),
    /// The request never produced a response.
    NetworkFailure(String),
}

impl ScraperOutcome {
    /// Whether this outcome counts against the source's circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            ScraperOutcome::ServerFailure(_) | ScraperOutcome::NetworkFailure(_)
        )
    }
}

/// Performs single HTTP attempts against one external source.
pub trait SourceTransport: Send + Sync + Clone {
    /// Name of the source, the unit of breaker isolation.
    fn source_name(&self) -> &str;

    /// Rejects ids the source can never accept, before any network I/O.
    fn validate_id(&self, external_id: &str) -> Result<(), String> {
        let _ = external_id;
        Ok(())
    }

    /// One attempt at fetching a series by the source's own id.
    fn fetch_series(&self, external_id: &str) -> impl Future<Output = ScraperOutcome> + Send;

    /// Turns a successful payload into series metadata.
    fn parse_series(
        &self,
        external_id: &str,
        payload: &serde_json::Value,
    ) -> Result<SeriesMetadata, String>;
}

/// Retry and timing configuration for one scraper client.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt after a counted failure; doubled each time.
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
    /// Wait used when a 429 carries no `Retry-After`.
    pub default_retry_after: Duration,
    /// Longer rate-limit hints are surfaced to the caller instead of waited out.
    pub max_retry_after: Duration,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(15),
            default_retry_after: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl ScraperConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    /// Exponential backoff after the given failed attempt (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Scraper for one source, sharing breakers through a registry.
#[derive(Clone)]
pub struct ScraperClient<T: SourceTransport> {
    transport: T,
    breakers: CircuitBreakerRegistry,
    config: ScraperConfig,
}

impl<T: SourceTransport> ScraperClient<T> {
    pub fn new(transport: T, breakers: CircuitBreakerRegistry, config: ScraperConfig) -> Self {
        Self {
            transport,
            breakers,
            config,
        }
    }

    pub fn source_name(&self) -> &str {
        self.transport.source_name()
    }

    /// The breaker currently registered for this client's source.
    pub fn breaker(&self) -> CircuitBreaker {
        self.breakers.breaker(self.transport.source_name())
    }

    /// Fetches series metadata, retrying within the configured budget.
    ///
    /// Every attempt first asks the breaker; a refusal fails fast with
    /// [`ScrapeError::CircuitOpen`] and no network I/O. After the budget is
    /// spent, the last classified outcome is surfaced.
    pub async fn scrape_series(&self, external_id: &str) -> Result<SeriesMetadata, ScrapeError> {
        let source = self.transport.source_name().to_string();
        if let Err(message) = self.transport.validate_id(external_id) {
            return Err(ScrapeError::Rejected {
                source_name: source,
                status: None,
                message,
            });
        }
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            let breaker = self.breaker();
            if !breaker.allow_attempt() {
                tracing::debug!(%source, external_id, "Circuit open, failing fast");
                return Err(ScrapeError::CircuitOpen {
                    source_name: source,
                    retry_after: breaker.retry_after(),
                });
            }

            let outcome = match tokio::time::timeout(
                self.config.attempt_timeout,
                self.transport.fetch_series(external_id),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ScraperOutcome::NetworkFailure(format!(
                    "timed out after {}ms",
                    self.config.attempt_timeout.as_millis()
                )),
            };

            let delay = match outcome {
                ScraperOutcome::Success(payload) => {
                    breaker.record_success();
                    return self
                        .transport
                        .parse_series(external_id, &payload)
                        .map_err(|message| ScrapeError::Malformed {
                            source_name: source,
                            message,
                        });
                }
                ScraperOutcome::NotFound => {
                    breaker.record_neutral();
                    return Err(ScrapeError::NotFound {
                        source_name: source,
                        external_id: external_id.to_string(),
                    });
                }
                ScraperOutcome::ClientError(status) => {
                    breaker.record_neutral();
                    tracing::warn!(%source, external_id, status, "Source rejected the request");
                    return Err(ScrapeError::Rejected {
                        source_name: source,
                        status: Some(status),
                        message: format!("source responded with HTTP {status}"),
                    });
                }
                ScraperOutcome::RateLimited(hint) => {
                    breaker.record_neutral();
                    let retry_after = hint
                        .map(Duration::from_secs)
                        .unwrap_or(self.config.default_retry_after);
                    tracing::info!(
                        %source,
                        external_id,
                        attempt,
                        retry_after_secs = retry_after.as_secs(),
                        "Rate limited by source"
                    );
                    let error = ScrapeError::RateLimited {
                        source_name: source.clone(),
                        retry_after,
                    };
                    if retry_after > self.config.max_retry_after {
                        return Err(error);
                    }
                    last_error = Some(error);
                    retry_after
                }
                ScraperOutcome::ServerFailure(status) => {
                    breaker.record_failure();
                    tracing::warn!(%source, external_id, attempt, status, "Source server failure");
                    last_error = Some(ScrapeError::Upstream {
                        source_name: source.clone(),
                        status: Some(status),
                        message: format!("server responded with HTTP {status}"),
                    });
                    self.config.backoff_for_attempt(attempt)
                }
                ScraperOutcome::NetworkFailure(cause) => {
                    breaker.record_failure();
                    tracing::warn!(%source, external_id, attempt, %cause, "Source network failure");
                    last_error = Some(ScrapeError::Upstream {
                        source_name: source.clone(),
                        status: None,
                        message: cause,
                    });
                    self.config.backoff_for_attempt(attempt)
                }
            };

            if attempt < self.config.max_attempts {
                if breaker.state() == CircuitState::Open {
                    tracing::debug!(%source, attempt, "Circuit opened during this call, not retrying");
                    break;
                }
                tracing::debug!(
                    %source,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or(ScrapeError::Upstream {
            source_name: source,
            status: None,
            message: "no attempt was made".to_string(),
        }))
    }
}

impl<T: SourceTransport> MetadataLookup for ScraperClient<T> {
    fn handles(&self, source_name: &str) -> bool {
        self.transport.source_name().eq_ignore_ascii_case(source_name)
    }

    async fn lookup(&self, external_id: &str) -> Result<SeriesMetadata, ScrapeError> {
        self.scrape_series(external_id).await
    }
}
