use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::llm_client::Summarizer;
use crate::store::{ConversationSnapshot, ConversationStore, RunStatus};
use crate::workflow::step::{Backoff, RetryPolicy, StepError, StepRunner};

const FETCH_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    initial_delay: Duration::from_secs(2),
    backoff: Backoff::Exponential,
    timeout: Duration::from_secs(30),
};

const SUMMARIZE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 2,
    initial_delay: Duration::from_secs(5),
    backoff: Backoff::Fixed,
    timeout: Duration::from_secs(120),
};

const SAVE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 2,
    initial_delay: Duration::from_secs(1),
    backoff: Backoff::Fixed,
    timeout: Duration::from_secs(10),
};

const SUMMARY_PREVIEW_CHARS: usize = 200;

/// Storage operations the summary workflow needs from the conversation side.
pub trait ConversationGateway: Send + Sync {
    fn summary_view(&self, agent_name: &str) -> Result<ConversationSnapshot>;
    fn append_summary_record(&self, agent_name: &str, summary_text: &str) -> Result<()>;
    fn append_visible_summary(&self, agent_name: &str, summary_text: &str) -> Result<String>;
    fn last_summarized(&self, agent_name: &str) -> Result<Option<DateTime<Utc>>>;
}

impl ConversationGateway for ConversationStore {
    fn summary_view(&self, agent_name: &str) -> Result<ConversationSnapshot> {
        ConversationStore::summary_view(self, agent_name)
    }

    fn append_summary_record(&self, agent_name: &str, summary_text: &str) -> Result<()> {
        ConversationStore::append_summary_record(self, agent_name, summary_text)
    }

    fn append_visible_summary(&self, agent_name: &str, summary_text: &str) -> Result<String> {
        ConversationStore::append_visible_summary(self, agent_name, summary_text)
    }

    fn last_summarized(&self, agent_name: &str) -> Result<Option<DateTime<Utc>>> {
        ConversationStore::last_summarized(self, agent_name)
    }
}

/// Final record of one summary run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub message_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("workflow storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Fetches the recent conversation window, asks the model for a summary, and
/// persists it. Each phase is a durable step, so a crashed run can be resumed
/// under the same run id without repeating completed work.
pub struct SummaryWorkflow {
    gateway: Arc<dyn ConversationGateway>,
    summarizer: Arc<dyn Summarizer>,
    run_log: Arc<ConversationStore>,
    window: usize,
}

impl SummaryWorkflow {
    pub fn new(
        gateway: Arc<dyn ConversationGateway>,
        summarizer: Arc<dyn Summarizer>,
        run_log: Arc<ConversationStore>,
        window: usize,
    ) -> Self {
        Self {
            gateway,
            summarizer,
            run_log,
            window: window.max(1),
        }
    }

    pub async fn run(
        &self,
        run_id: &str,
        agent_name: Option<&str>,
    ) -> Result<RunReport, WorkflowError> {
        let agent = agent_name.unwrap_or(crate::store::DEFAULT_AGENT_NAME).to_string();
        let run_started_at = Utc::now();
        self.run_log.mark_run(run_id, RunStatus::Running, None)?;
        tracing::info!(run_id, agent = %agent, "summary workflow started");

        let runner = StepRunner::new(run_id, self.run_log.clone());

        let snapshot: ConversationSnapshot = {
            let gateway = self.gateway.clone();
            let agent = agent.clone();
            match runner
                .run_step("fetch-messages", FETCH_POLICY, move || {
                    let gateway = gateway.clone();
                    let agent = agent.clone();
                    async move { gateway.summary_view(&agent) }
                })
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => return self.fail(run_id, e.into()),
            }
        };

        if snapshot.messages.is_empty() {
            tracing::info!(run_id, agent = %agent, "no messages to summarize");
            self.run_log.mark_run(run_id, RunStatus::Succeeded, None)?;
            return Ok(RunReport {
                success: true,
                summary: None,
                message: Some("No messages found".to_string()),
                message_count: 0,
                timestamp: Utc::now(),
            });
        }

        let start = snapshot.messages.len().saturating_sub(self.window);
        let window = &snapshot.messages[start..];
        let transcript = window
            .iter()
            .map(|turn| format!("{}: {}", turn.role.display_label(), turn.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let window_len = window.len();

        let summary: String = {
            let summarizer = self.summarizer.clone();
            match runner
                .run_step("generate-summary", SUMMARIZE_POLICY, move || {
                    let summarizer = summarizer.clone();
                    let transcript = transcript.clone();
                    async move { summarizer.summarize(&transcript).await }
                })
                .await
            {
                Ok(summary) => summary,
                Err(e) => return self.fail(run_id, e.into()),
            }
        };

        let save_result = {
            let gateway = self.gateway.clone();
            let agent = agent.clone();
            let summary = summary.clone();
            runner
                .run_step::<bool, _, _>("save-and-display-summary", SAVE_POLICY, move || {
                    let gateway = gateway.clone();
                    let agent = agent.clone();
                    let summary = summary.clone();
                    async move {
                        gateway.append_summary_record(&agent, &summary)?;
                        // The visible chat copy is best-effort.
                        if let Err(e) = gateway.append_visible_summary(&agent, &summary) {
                            tracing::warn!(
                                agent = %agent,
                                error = %format!("{:#}", e),
                                "failed to post visible summary message"
                            );
                        }
                        Ok(true)
                    }
                })
                .await
        };

        if let Err(e) = save_result {
            // The record insert may have landed on an attempt whose later
            // bookkeeping failed. If the marker advanced during this run the
            // summary is durable, so the run still counts as a success. An
            // unreadable marker is treated as not-advanced.
            let advanced = match self.gateway.last_summarized(&agent) {
                Ok(ts) => ts.map(|ts| ts >= run_started_at).unwrap_or(false),
                Err(read_err) => {
                    tracing::warn!(
                        run_id,
                        agent = %agent,
                        error = %format!("{:#}", read_err),
                        "could not read last-summarized marker after save failure"
                    );
                    false
                }
            };
            if advanced {
                tracing::warn!(
                    run_id,
                    agent = %agent,
                    error = %e.last_message(),
                    "save step reported failure but the summary was persisted"
                );
            } else {
                return self.fail(run_id, e.into());
            }
        }

        let preview = truncate_chars(&summary, SUMMARY_PREVIEW_CHARS);
        self.run_log.mark_run(run_id, RunStatus::Succeeded, None)?;
        tracing::info!(
            run_id,
            agent = %agent,
            message_count = window_len,
            summary_preview = %preview,
            "summary workflow completed"
        );

        Ok(RunReport {
            success: true,
            summary: Some(preview),
            message: None,
            message_count: window_len,
            timestamp: Utc::now(),
        })
    }

    fn fail(&self, run_id: &str, error: WorkflowError) -> Result<RunReport, WorkflowError> {
        let message = error.to_string();
        if let Err(mark_err) = self.run_log.mark_run(run_id, RunStatus::Failed, Some(&message)) {
            tracing::error!(run_id, error = %format!("{:#}", mark_err), "failed to record run failure");
        }
        tracing::error!(run_id, error = %message, "summary workflow failed");
        Err(error)
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        let cut: String = s.chars().take(limit).collect();
        format!("{}...", cut)
    }
}
