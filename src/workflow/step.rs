use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{ConversationStore, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry behavior for one named step. The timeout bounds each individual
/// attempt; a timed-out attempt counts as a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: Backoff,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay to wait before the given attempt (1-based). The first attempt
    /// runs immediately; attempt 2 waits the initial delay, and under
    /// exponential backoff each later attempt doubles the previous wait.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let shift = (attempt - 2).min(16);
                self.initial_delay.saturating_mul(1u32 << shift)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step '{step}' failed after {attempts} attempt(s): {message}")]
    Exhausted {
        step: String,
        attempts: u32,
        message: String,
    },
    #[error("step bookkeeping failed: {0}")]
    Storage(#[from] anyhow::Error),
}

impl StepError {
    pub fn last_message(&self) -> String {
        match self {
            StepError::Exhausted { message, .. } => message.clone(),
            StepError::Storage(e) => format!("{:#}", e),
        }
    }
}

/// Executes named steps against a durable outcome log. A step that already
/// succeeded for this run id returns its recorded result without re-running
/// the action, which makes a resumed run idempotent past completed steps.
pub struct StepRunner {
    run_id: String,
    store: Arc<ConversationStore>,
}

impl StepRunner {
    pub fn new(run_id: impl Into<String>, store: Arc<ConversationStore>) -> Self {
        Self {
            run_id: run_id.into(),
            store,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn run_step<T, F, Fut>(
        &self,
        step_name: &str,
        policy: RetryPolicy,
        action: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(outcome) = self.store.get_step_outcome(&self.run_id, step_name)? {
            if outcome.status == StepStatus::Succeeded {
                let json = outcome.result_json.ok_or_else(|| {
                    anyhow::anyhow!("Succeeded step '{}' has no recorded result", step_name)
                })?;
                let value = serde_json::from_str(&json).map_err(|e| {
                    anyhow::anyhow!("Failed to decode recorded result for '{}': {}", step_name, e)
                })?;
                tracing::debug!(
                    run_id = %self.run_id,
                    step = step_name,
                    "step already completed, reusing recorded result"
                );
                return Ok(value);
            }
        }

        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(policy.timeout, action()).await {
                Ok(Ok(value)) => {
                    let json = serde_json::to_string(&value).map_err(|e| {
                        anyhow::anyhow!("Failed to encode result for '{}': {}", step_name, e)
                    })?;
                    self.store
                        .record_step_success(&self.run_id, step_name, attempt, &json)?;
                    tracing::debug!(
                        run_id = %self.run_id,
                        step = step_name,
                        attempt,
                        "step succeeded"
                    );
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    last_error = format!("{:#}", e);
                }
                Err(_) => {
                    last_error = format!("timed out after {:?}", policy.timeout);
                }
            }

            tracing::warn!(
                run_id = %self.run_id,
                step = step_name,
                attempt,
                max_attempts,
                error = %last_error,
                "step attempt failed"
            );
        }

        self.store
            .record_step_failure(&self.run_id, step_name, max_attempts, &last_error)?;
        Err(StepError::Exhausted {
            step: step_name.to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("recap_step_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn test_store(name: &str) -> Arc<ConversationStore> {
        Arc::new(ConversationStore::new(temp_db_path(name), 10).expect("store init"))
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff: Backoff::Fixed,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn exponential_backoff_doubles_each_wait() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before(4), Duration::from_secs(8));
    }

    #[test]
    fn fixed_backoff_keeps_initial_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            backoff: Backoff::Fixed,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_before(2), Duration::from_secs(5));
        assert_eq!(policy.delay_before(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn step_succeeds_on_first_attempt() {
        let store = test_store("first_try");
        store.create_run("run-1", "default").expect("create run");
        let runner = StepRunner::new("run-1", store.clone());

        let value: u32 = runner
            .run_step("fetch", quick_policy(3), || async { Ok(42u32) })
            .await
            .expect("step result");
        assert_eq!(value, 42);

        let outcome = store
            .get_step_outcome("run-1", "fetch")
            .unwrap()
            .expect("outcome recorded");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn step_retries_until_success() {
        let store = test_store("retry");
        store.create_run("run-1", "default").expect("create run");
        let runner = StepRunner::new("run-1", store.clone());

        let calls = AtomicU32::new(0);
        let value: String = runner
            .run_step("flaky", quick_policy(3), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("transient failure {}", n);
                    }
                    Ok("done".to_string())
                }
            })
            .await
            .expect("step result");
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let outcome = store
            .get_step_outcome("run-1", "flaky")
            .unwrap()
            .expect("outcome recorded");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_step_reports_last_error() {
        let store = test_store("exhausted");
        store.create_run("run-1", "default").expect("create run");
        let runner = StepRunner::new("run-1", store.clone());

        let calls = AtomicU32::new(0);
        let result: Result<u32, StepError> = runner
            .run_step("doomed", quick_policy(2), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::bail!("failure number {}", n) }
            })
            .await;

        match result {
            Err(StepError::Exhausted {
                step,
                attempts,
                message,
            }) => {
                assert_eq!(step, "doomed");
                assert_eq!(attempts, 2);
                assert!(message.contains("failure number 1"));
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }

        let outcome = store
            .get_step_outcome("run-1", "doomed")
            .unwrap()
            .expect("outcome recorded");
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome.error.unwrap().contains("failure number 1"));
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let store = test_store("timeout");
        store.create_run("run-1", "default").expect("create run");
        let runner = StepRunner::new("run-1", store.clone());

        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            backoff: Backoff::Fixed,
            timeout: Duration::from_millis(20),
        };

        let result: Result<u32, StepError> = runner
            .run_step("slow", policy, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1u32)
            })
            .await;

        match result {
            Err(StepError::Exhausted { message, .. }) => {
                assert!(message.contains("timed out"));
            }
            other => panic!("expected timeout exhaustion, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn completed_step_is_not_rerun() {
        let store = test_store("memoized");
        store.create_run("run-1", "default").expect("create run");

        {
            let runner = StepRunner::new("run-1", store.clone());
            let value: u32 = runner
                .run_step("fetch", quick_policy(3), || async { Ok(7u32) })
                .await
                .expect("first pass");
            assert_eq!(value, 7);
        }

        // Same run id again: the action must not execute.
        let runner = StepRunner::new("run-1", store.clone());
        let calls = AtomicU32::new(0);
        let value: u32 = runner
            .run_step("fetch", quick_policy(3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("should not run") }
            })
            .await
            .expect("replayed result");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_step_is_retried_on_resume() {
        let store = test_store("resume_failed");
        store.create_run("run-1", "default").expect("create run");

        {
            let runner = StepRunner::new("run-1", store.clone());
            let result: Result<u32, StepError> = runner
                .run_step("fetch", quick_policy(1), || async {
                    anyhow::bail!("down")
                })
                .await;
            assert!(result.is_err());
        }

        let runner = StepRunner::new("run-1", store.clone());
        let value: u32 = runner
            .run_step("fetch", quick_policy(1), || async { Ok(9u32) })
            .await
            .expect("resume succeeds");
        assert_eq!(value, 9);
    }
}
