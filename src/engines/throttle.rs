//! Rate limits for engines backed by metered APIs.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

use super::{EngineError, EngineOutput, OcrEngine};

/// A rate limit like `"10/s"` or `"600/m"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngineRateLimit {
    /// How many calls may start per period.
    pub calls: usize,

    /// The period, in seconds.
    pub period_secs: u64,
}

impl EngineRateLimit {
    /// Build a limiter for this rate limit.
    ///
    /// The bucket starts full, so a burst of up to `calls` requests goes
    /// through immediately.
    fn to_rate_limiter(&self) -> RateLimiter {
        let calls = self.calls.max(1);
        RateLimiter::builder()
            .initial(calls)
            .refill(calls)
            .max(calls)
            .interval(Duration::from_secs(self.period_secs.max(1)))
            .build()
    }
}

impl fmt::Display for EngineRateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = if self.period_secs == 60 { "m" } else { "s" };
        write!(f, "{}/{}", self.calls, unit)
    }
}

impl FromStr for EngineRateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (calls, unit) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("rate limit {s:?} should look like \"10/s\""))?;
        let calls = calls
            .trim()
            .parse::<usize>()
            .with_context(|| format!("bad call count in rate limit {s:?}"))?;
        let period_secs = match unit.trim() {
            "s" => 1,
            "m" => 60,
            other => return Err(anyhow!("unsupported rate limit period {other:?}")),
        };
        Ok(Self { calls, period_secs })
    }
}

impl TryFrom<String> for EngineRateLimit {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EngineRateLimit> for String {
    fn from(value: EngineRateLimit) -> Self {
        value.to_string()
    }
}

/// Wraps an engine so that calls wait for a rate limit token.
pub struct ThrottledEngine {
    inner: Arc<dyn OcrEngine>,
    limiter: RateLimiter,
}

impl ThrottledEngine {
    /// Throttle `inner` to `rate_limit`.
    pub fn new(inner: Arc<dyn OcrEngine>, rate_limit: &EngineRateLimit) -> Self {
        Self {
            inner,
            limiter: rate_limit.to_rate_limiter(),
        }
    }
}

#[async_trait]
impl OcrEngine for ThrottledEngine {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn process(
        &self,
        content: &[u8],
        mime_type: &str,
    ) -> Result<EngineOutput, EngineError> {
        self.limiter.acquire_one().await;
        self.inner.process(content, mime_type).await
    }
}
