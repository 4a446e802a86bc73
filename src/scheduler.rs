use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::store::ConversationStore;
use crate::workflow::SummaryWorkflow;

/// Outcome of a trigger request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started { run_id: String },
    Skipped { reason: String },
}

/// Kicks off summary runs on a fixed cadence and on demand. Runs are started
/// and not awaited; at most one run per agent is in flight at a time.
pub struct SummaryScheduler {
    workflow: Arc<SummaryWorkflow>,
    store: Arc<ConversationStore>,
    interval: Duration,
    agent_name: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SummaryScheduler {
    pub fn new(
        workflow: Arc<SummaryWorkflow>,
        store: Arc<ConversationStore>,
        interval: Duration,
        agent_name: String,
    ) -> Self {
        Self {
            workflow,
            store,
            interval,
            agent_name,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a summary run for the agent unless one is already in flight.
    pub async fn trigger(&self, agent_name: &str) -> anyhow::Result<TriggerOutcome> {
        let agent = agent_name.trim();
        let agent = if agent.is_empty() {
            crate::store::DEFAULT_AGENT_NAME
        } else {
            agent
        }
        .to_string();

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains(&agent) {
                tracing::debug!(agent = %agent, "summary run already in flight, skipping");
                return Ok(TriggerOutcome::Skipped {
                    reason: format!("a summary run is already in flight for '{}'", agent),
                });
            }
            in_flight.insert(agent.clone());
        }

        let run_id = format!("summary-{}", uuid::Uuid::new_v4());
        if let Err(e) = self.store.create_run(&run_id, &agent) {
            self.in_flight.lock().await.remove(&agent);
            return Err(e);
        }

        let workflow = self.workflow.clone();
        let in_flight = self.in_flight.clone();
        let spawn_run_id = run_id.clone();
        let spawn_agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = workflow.run(&spawn_run_id, Some(&spawn_agent)).await {
                tracing::error!(
                    run_id = %spawn_run_id,
                    agent = %spawn_agent,
                    error = %e,
                    "summary run failed"
                );
            }
            in_flight.lock().await.remove(&spawn_agent);
        });

        tracing::info!(run_id = %run_id, agent = %agent, "summary run started");
        Ok(TriggerOutcome::Started { run_id })
    }

    /// Periodic loop. Each tick fires a run without awaiting its completion.
    pub async fn run_loop(&self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            agent = %self.agent_name,
            "summary scheduler started"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            match self.trigger(&self.agent_name).await {
                Ok(TriggerOutcome::Started { run_id }) => {
                    tracing::debug!(run_id = %run_id, "scheduled summary run");
                }
                Ok(TriggerOutcome::Skipped { reason }) => {
                    tracing::debug!(reason = %reason, "scheduled summary skipped");
                }
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "failed to start scheduled summary");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::Summarizer;
    use crate::store::MessageRole;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::sync::Notify;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("recap_sched_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    /// Blocks inside summarize() until released, to hold a run in flight.
    struct BlockingSummarizer {
        release: Notify,
    }

    #[async_trait]
    impl Summarizer for BlockingSummarizer {
        async fn summarize(&self, _transcript: &str) -> Result<String> {
            self.release.notified().await;
            Ok("late summary".to_string())
        }
    }

    fn scheduler_with(
        store: Arc<ConversationStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> SummaryScheduler {
        let workflow = Arc::new(SummaryWorkflow::new(
            store.clone(),
            summarizer,
            store.clone(),
            20,
        ));
        SummaryScheduler::new(
            workflow,
            store,
            Duration::from_secs(60),
            "default".to_string(),
        )
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let store = Arc::new(ConversationStore::new(temp_db_path("overlap"), 10).unwrap());
        store
            .append_text_message("default", MessageRole::User, "hello")
            .unwrap();

        let summarizer = Arc::new(BlockingSummarizer {
            release: Notify::new(),
        });
        let scheduler = scheduler_with(store.clone(), summarizer.clone());

        let first = scheduler.trigger("default").await.unwrap();
        let run_id = match first {
            TriggerOutcome::Started { run_id } => run_id,
            other => panic!("expected a started run, got {:?}", other),
        };

        // Give the spawned run time to reach the blocked summarize call.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = scheduler.trigger("default").await.unwrap();
        assert!(matches!(second, TriggerOutcome::Skipped { .. }));

        summarizer.release.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, crate::store::RunStatus::Succeeded);

        // With the first run finished, a new trigger starts again.
        let third = scheduler.trigger("default").await.unwrap();
        assert!(matches!(third, TriggerOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn triggers_for_different_agents_run_independently() {
        let store = Arc::new(ConversationStore::new(temp_db_path("multi_agent"), 10).unwrap());
        store
            .append_text_message("alpha", MessageRole::User, "hi")
            .unwrap();
        store
            .append_text_message("beta", MessageRole::User, "hi")
            .unwrap();

        let summarizer = Arc::new(BlockingSummarizer {
            release: Notify::new(),
        });
        let scheduler = scheduler_with(store.clone(), summarizer.clone());

        let a = scheduler.trigger("alpha").await.unwrap();
        let b = scheduler.trigger("beta").await.unwrap();
        assert!(matches!(a, TriggerOutcome::Started { .. }));
        assert!(matches!(b, TriggerOutcome::Started { .. }));

        summarizer.release.notify_waiters();
    }

    #[tokio::test]
    async fn trigger_records_a_pending_run_before_returning() {
        let store = Arc::new(ConversationStore::new(temp_db_path("pending"), 10).unwrap());
        let summarizer = Arc::new(BlockingSummarizer {
            release: Notify::new(),
        });
        // Empty conversation: the run will short-circuit, but the run row
        // must exist as soon as trigger returns.
        let scheduler = scheduler_with(store.clone(), summarizer);

        let outcome = scheduler.trigger("default").await.unwrap();
        let run_id = match outcome {
            TriggerOutcome::Started { run_id } => run_id,
            other => panic!("expected a started run, got {:?}", other),
        };
        assert!(store.get_run(&run_id).unwrap().is_some());
    }
}
