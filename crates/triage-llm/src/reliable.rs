use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use triage_core::errors::GatewayError;
use triage_core::provider::{Completion, CompletionRequest, ModelProvider};

/// Retry and circuit breaker settings for `ReliableProvider`.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    /// Per-attempt deadline. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Closed,
    Open(Instant),
    /// Cooldown elapsed; the next call is a probe.
    Probing,
}

#[derive(Debug)]
struct Breaker {
    phase: Phase,
    failures: u32,
}

/// Counts consecutive failures and short-circuits calls while open.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<Breaker>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(Breaker {
                phase: Phase::Closed,
                failures: 0,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// `Err(remaining)` while open.
    pub fn admit(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        if let Phase::Open(since) = state.phase {
            let waited = since.elapsed();
            if waited < self.cooldown {
                return Err(self.cooldown - waited);
            }
            state.phase = Phase::Probing;
        }
        Ok(())
    }

    /// True when this success closed a tripped breaker.
    pub fn on_success(&self) -> bool {
        let mut state = self.state.lock();
        state.failures = 0;
        let reopened = state.phase != Phase::Closed;
        state.phase = Phase::Closed;
        reopened
    }

    /// True when this failure tripped the breaker.
    pub fn on_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.failures = state.failures.saturating_add(1);
        let trip = match state.phase {
            Phase::Probing => true,
            Phase::Closed => state.failures >= self.threshold,
            Phase::Open(_) => false,
        };
        if trip {
            state.phase = Phase::Open(Instant::now());
        }
        trip
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.lock().phase {
            Phase::Closed => "closed",
            Phase::Open(_) => "open",
            Phase::Probing => "half_open",
        }
    }
}

/// Exponential backoff for retry `attempt` (0-based), capped, with jitter.
fn backoff(config: &ReliableConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let capped = config.base_delay.saturating_mul(factor).min(config.max_delay);
    let spread = capped.as_secs_f64() * config.jitter_factor;
    let unit = (uuid::Uuid::new_v4().as_u128() % 10_000) as f64 / 10_000.0;
    let secs = (capped.as_secs_f64() + (unit * 2.0 - 1.0) * spread).max(0.001);
    Duration::from_secs_f64(secs)
}

/// Wraps a model provider with per-attempt deadlines, retries on retryable
/// errors, and a circuit breaker. Timeouts are not retried.
pub struct ReliableProvider<P: ModelProvider> {
    inner: P,
    config: ReliableConfig,
    breaker: CircuitBreaker,
    retries: AtomicU64,
}

impl<P: ModelProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
        );
        Self {
            inner,
            config,
            breaker,
            retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    fn admit(&self) -> Result<(), GatewayError> {
        self.breaker.admit().map_err(|remaining| {
            GatewayError::CircuitOpen(format!(
                "{} unavailable, retry in {}s",
                self.inner.name(),
                remaining.as_secs().max(1)
            ))
        })
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let Some(limit) = self.config.request_timeout else {
            return self.inner.complete(request).await;
        };
        tokio::time::timeout(limit, self.inner.complete(request))
            .await
            .unwrap_or(Err(GatewayError::Timeout(limit)))
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        self.admit()?;
        let mut attempt = 0;
        loop {
            let error = match self.attempt(request).await {
                Ok(completion) => {
                    if self.breaker.on_success() {
                        info!(provider = self.inner.name(), "circuit breaker closed");
                    }
                    return Ok(completion);
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= self.config.max_retries {
                if self.breaker.on_failure() {
                    warn!(
                        provider = self.inner.name(),
                        cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                        "circuit breaker opened"
                    );
                }
                return Err(error);
            }

            let delay = error
                .suggested_delay()
                .unwrap_or_else(|| backoff(&self.config, attempt));
            attempt += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                kind = error.error_kind(),
                "retrying model call"
            );
            tokio::time::sleep(delay).await;
            self.admit()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};
    use triage_core::messages::Message;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "You are the impact assessor.".into(),
            messages: vec![Message::user_text("checkout fails")],
            tools: vec![],
        }
    }

    fn quick(max_retries: u32) -> ReliableConfig {
        ReliableConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn unavailable() -> MockResponse {
        MockResponse::Error(GatewayError::ServerError {
            status: 502,
            body: "bad gateway".into(),
        })
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let mock = MockProvider::new(vec![unavailable(), unavailable(), MockResponse::text("ok")]);
        let reliable = ReliableProvider::new(mock, quick(3));
        assert_eq!(reliable.complete(&request()).await.unwrap().text(), "ok");
        assert_eq!(reliable.total_retries(), 2);
        assert_eq!(reliable.inner().call_count(), 3);
        assert_eq!(reliable.breaker().state_name(), "closed");
    }

    #[tokio::test]
    async fn fatal_errors_fail_immediately() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::InvalidRequest("bad schema".into())),
            MockResponse::text("unreachable"),
        ]);
        let reliable = ReliableProvider::new(mock, quick(3));
        let err = reliable.complete(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(reliable.inner().call_count(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let mock = MockProvider::new(vec![unavailable(), unavailable(), unavailable()]);
        let reliable = ReliableProvider::new(mock, quick(2));
        assert!(reliable.complete(&request()).await.is_err());
        assert_eq!(reliable.total_retries(), 2);
    }

    #[tokio::test]
    async fn timed_out_attempt_is_not_retried() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(200),
            MockResponse::text("late"),
        )]);
        let config = ReliableConfig {
            request_timeout: Some(Duration::from_millis(20)),
            ..quick(2)
        };
        let reliable = ReliableProvider::new(mock, config);
        let err = reliable.complete(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_then_probes() {
        let mock = MockProvider::new(vec![
            unavailable(),
            unavailable(),
            MockResponse::text("back"),
        ]);
        let config = ReliableConfig {
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown: Duration::from_millis(50),
            ..quick(0)
        };
        let reliable = ReliableProvider::new(mock, config);
        for _ in 0..2 {
            assert!(reliable.complete(&request()).await.is_err());
        }
        assert_eq!(reliable.breaker().state_name(), "open");
        let err = reliable.complete(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(_)));
        assert_eq!(reliable.inner().call_count(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(reliable.complete(&request()).await.unwrap().text(), "back");
        assert_eq!(reliable.breaker().state_name(), "closed");
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(3, Duration::ZERO);
        for _ in 0..3 {
            breaker.on_failure();
        }
        assert!(breaker.admit().is_ok());
        assert_eq!(breaker.state_name(), "half_open");
        assert!(breaker.on_failure());
        assert_eq!(breaker.state_name(), "open");
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = ReliableConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff(&config, 6), Duration::from_millis(400));
    }
}
