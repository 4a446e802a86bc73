use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::ChatAgent;
use crate::config::AgentConfig;
use crate::llm_client::LlmClient;
use crate::scheduler::SummaryScheduler;
use crate::server::ServerState;
use crate::store::ConversationStore;
use crate::workflow::SummaryWorkflow;

/// Wires the store, model client, chat agent, workflow and scheduler together
/// from one config.
pub struct BackendRuntime {
    pub config: AgentConfig,
    pub store: Arc<ConversationStore>,
    pub llm: Arc<LlmClient>,
    pub agent: Arc<ChatAgent>,
    pub workflow: Arc<SummaryWorkflow>,
    pub scheduler: Arc<SummaryScheduler>,
}

impl BackendRuntime {
    pub fn bootstrap(config: AgentConfig) -> Result<Self> {
        let store = Arc::new(
            ConversationStore::new(&config.database_path, config.summary_history_cap)
                .with_context(|| format!("Failed to open database at {}", config.database_path))?,
        );

        let llm = Arc::new(LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        ));

        let agent = Arc::new(ChatAgent::new(
            store.clone(),
            llm.clone(),
            config.system_prompt.clone(),
            config.chat_context_limit,
        ));

        let workflow = Arc::new(SummaryWorkflow::new(
            store.clone(),
            llm.clone(),
            store.clone(),
            config.summary_window,
        ));

        let scheduler = Arc::new(SummaryScheduler::new(
            workflow.clone(),
            store.clone(),
            Duration::from_secs(config.summary_interval_secs),
            config.default_agent_name.clone(),
        ));

        tracing::info!(
            model = %config.llm_model,
            database = %config.database_path,
            interval_secs = config.summary_interval_secs,
            "backend runtime ready"
        );

        Ok(Self {
            config,
            store,
            llm,
            agent,
            workflow,
            scheduler,
        })
    }

    pub fn server_state(&self) -> Arc<ServerState> {
        Arc::new(ServerState::from_env(
            self.store.clone(),
            self.agent.clone(),
            self.scheduler.clone(),
        ))
    }
}
