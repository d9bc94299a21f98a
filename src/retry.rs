// retry.rs - External call executor
//
// Every model call (text generation, image description, embeddings) and every
// link fetch goes through Executor::invoke, which retries on a fixed list of
// delays. The number of attempts equals the number of configured delays; the
// wait after attempt i is delays[i - 1].

use crate::error::{DigestError, DigestResult};
use crate::observe::Observer;
use async_trait::async_trait;
use log::{error, info};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Ordered waits between attempts of one external call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPlan {
    delays: Vec<Duration>,
}

impl RetryPlan {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    /// At least one attempt is always made, even with an empty plan.
    pub fn attempts(&self) -> usize {
        self.delays.len().max(1)
    }

    /// Wait applied after a failed `attempt` (1-based), if another attempt follows.
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.attempts() {
            return None;
        }
        self.delays.get(attempt - 1).copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self::from_secs(&[2, 4, 8])
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Clone)]
pub struct Executor {
    plan: RetryPlan,
    sleeper: Arc<dyn Sleeper>,
    observer: Observer,
}

impl Executor {
    pub fn new(plan: RetryPlan, sleeper: Arc<dyn Sleeper>, observer: &Observer) -> Self {
        Self {
            plan,
            sleeper,
            observer: observer.scoped("retry"),
        }
    }

    pub fn plan(&self) -> &RetryPlan {
        &self.plan
    }

    /// Runs `operation` until it succeeds or the plan is exhausted.
    /// `label` identifies the call in logs (e.g. the attachment path).
    pub async fn invoke<T, F, Fut>(&self, label: &str, mut operation: F) -> DigestResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DigestResult<T>>,
    {
        let target = self.observer.target();
        let attempts = self.plan.attempts();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    error!(target: target, "❌ {} failed on attempt {}/{}: {}", label, attempt, attempts, e);

                    match self.plan.delay_after(attempt) {
                        Some(delay) => {
                            info!(target: target, "⏳ Retrying {} in {} seconds...", label, delay.as_secs_f64());
                            self.sleeper.sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            error!(target: target, "❌ All {} attempts failed for {}", attempts, label);
                            return Err(DigestError::RetriesExhausted {
                                label: label.to_string(),
                                attempts,
                                last: Box::new(e),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Like `invoke`, but an exhausted plan degrades to `fallback` instead of an error.
    pub async fn invoke_or<T, F, Fut>(&self, label: &str, fallback: T, operation: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DigestResult<T>>,
    {
        match self.invoke(label, operation).await {
            Ok(value) => value,
            Err(_) => {
                info!(target: self.observer.target(), "⚠️ Using fallback result for {}", label);
                fallback
            }
        }
    }
}
