use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tracing::{info, warn};

use cadre_core::config::{OracleConfig, RetryConfig};
use cadre_core::error::{CadreError, Result};
use cadre_core::traits::Oracle;
use cadre_core::types::{Message, END_LABEL};

/// An oracle that bounds each call with a timeout and retries transport
/// failures with exponential backoff.
pub struct RetryingOracle {
    inner: Arc<dyn Oracle>,
    retry_config: RetryConfig,
    timeout: Option<Duration>,
}

impl RetryingOracle {
    pub fn new(
        inner: Arc<dyn Oracle>,
        retry_config: RetryConfig,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            retry_config,
            timeout,
        }
    }

    /// Wrap `inner` according to the `[oracle]` config section.
    pub fn from_config(inner: Arc<dyn Oracle>, config: &OracleConfig) -> Self {
        Self::new(
            inner,
            config.retry.clone().unwrap_or_default(),
            config.timeout_secs.map(Duration::from_secs),
        )
    }

    async fn call<F, Fut>(&self, what: &str, mut call: F) -> Result<String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let max_retries = self.retry_config.max_retries;
        let mut attempt = 0;
        loop {
            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(CadreError::OracleTimeout {
                        timeout_secs: limit.as_secs(),
                    }),
                },
                None => call().await,
            };

            match result {
                Ok(reply) => {
                    if attempt > 0 {
                        info!(call = what, attempt, "Oracle call succeeded after retry");
                    }
                    return Ok(reply);
                }
                Err(e) if is_retryable(&e) && attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry_config);
                    warn!(
                        call = what,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying oracle call"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Markers of failures that tend to clear up on their own: rate limits,
/// server-side errors and dropped connections.
const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "500",
    "502",
    "503",
    "overloaded",
    "timeout",
    "timed out",
    "connection",
];

fn is_retryable(e: &CadreError) -> bool {
    match e {
        CadreError::OracleTimeout { .. } => true,
        CadreError::OracleFailure(msg) => {
            let msg = msg.to_lowercase();
            TRANSIENT_MARKERS.iter().any(|marker| msg.contains(marker))
        }
        _ => false,
    }
}

/// Doubling delay from `initial_backoff_ms`, capped at `max_backoff_ms`,
/// then scaled by a random factor in `[0.8, 1.2]`.
fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let base = 2u64
        .checked_pow(attempt)
        .and_then(|factor| config.initial_backoff_ms.checked_mul(factor))
        .unwrap_or(u64::MAX)
        .min(config.max_backoff_ms);
    let spread = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base as f64 * spread) as u64)
}

impl Oracle for RetryingOracle {
    fn decide(&self, prompt: String, allowed: Vec<String>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.call("decide", || self.inner.decide(prompt.clone(), allowed.clone()))
                .await
        })
    }

    fn generate(&self, prompt: String, history: Vec<Message>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.call("generate", || self.inner.generate(prompt.clone(), history.clone()))
                .await
        })
    }
}

/// Replays fixed replies in order; used for dry runs and deterministic replays.
///
/// When the decision script runs out the oracle answers `__end__`; when the
/// generation script runs out it echoes the last message of the history.
/// With [`ScriptedOracle::cycle`] both scripts repeat forever instead.
pub struct ScriptedOracle {
    decisions: Vec<String>,
    generations: Vec<String>,
    cycle: bool,
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    decided: usize,
    generated: usize,
    prompts: VecDeque<String>,
}

/// Prompts kept for inspection.
const PROMPT_HISTORY: usize = 64;

impl ScriptedOracle {
    pub fn new(decisions: Vec<String>, generations: Vec<String>) -> Self {
        Self {
            decisions,
            generations,
            cycle: false,
            state: Mutex::new(ScriptState::default()),
        }
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        Self::new(config.decisions.clone(), config.generations.clone())
    }

    /// Repeat both scripts instead of running out.
    pub fn cycle(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub fn decide_calls(&self) -> usize {
        self.state.lock().map(|s| s.decided).unwrap_or(0)
    }

    pub fn generate_calls(&self) -> usize {
        self.state.lock().map(|s| s.generated).unwrap_or(0)
    }

    /// The most recent routing prompts, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.prompts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn pick(script: &[String], index: usize, cycle: bool) -> Option<String> {
        if script.is_empty() {
            return None;
        }
        if cycle {
            return Some(script[index % script.len()].clone());
        }
        script.get(index).cloned()
    }
}

impl Oracle for ScriptedOracle {
    fn decide(&self, prompt: String, _allowed: Vec<String>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut state = self
                .state
                .lock()
                .map_err(|_| CadreError::OracleFailure("script state poisoned".into()))?;
            let reply = Self::pick(&self.decisions, state.decided, self.cycle).unwrap_or_else(|| {
                format!(
                    r#"{{"next": "{}", "reasoning": "script exhausted"}}"#,
                    END_LABEL
                )
            });
            state.decided += 1;
            if state.prompts.len() == PROMPT_HISTORY {
                state.prompts.pop_front();
            }
            state.prompts.push_back(prompt);
            Ok(reply)
        })
    }

    fn generate(&self, _prompt: String, history: Vec<Message>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut state = self
                .state
                .lock()
                .map_err(|_| CadreError::OracleFailure("script state poisoned".into()))?;
            let reply = Self::pick(&self.generations, state.generated, self.cycle)
                .or_else(|| history.last().map(|m| m.content.clone()))
                .unwrap_or_default();
            state.generated += 1;
            Ok(reply)
        })
    }
}
