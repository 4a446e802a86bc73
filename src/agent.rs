use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::llm_client::{LlmClient, LlmMessage};
use crate::store::{ConversationStore, MessageRole, StoredMessage, SummaryRecord};

/// Handles one user turn: record it, build context, ask the model, record the
/// reply.
pub struct ChatAgent {
    store: Arc<ConversationStore>,
    llm: Arc<LlmClient>,
    system_prompt: String,
    context_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub message_id: String,
    pub reply: String,
}

impl ChatAgent {
    pub fn new(
        store: Arc<ConversationStore>,
        llm: Arc<LlmClient>,
        system_prompt: String,
        context_limit: usize,
    ) -> Self {
        Self {
            store,
            llm,
            system_prompt,
            context_limit: context_limit.max(1),
        }
    }

    pub async fn handle_user_message(&self, agent_name: &str, content: &str) -> Result<ChatReply> {
        self.store
            .append_text_message(agent_name, MessageRole::User, content)?;

        let summaries = self.store.list_summaries(agent_name)?;
        let recent = self.store.get_messages(agent_name, self.context_limit)?;
        let messages = build_chat_messages(&self.system_prompt, &summaries, &recent);

        let reply = self.llm.generate(messages).await?;
        let message_id =
            self.store
                .append_text_message(agent_name, MessageRole::Assistant, &reply)?;

        tracing::debug!(agent = agent_name, message_id = %message_id, "chat reply recorded");
        Ok(ChatReply { message_id, reply })
    }
}

/// Assemble the model context: system prompt, prior summaries as background,
/// then the recent turns. Turns with no text (pure tool calls) are skipped.
pub fn build_chat_messages(
    system_prompt: &str,
    summaries: &[SummaryRecord],
    recent: &[StoredMessage],
) -> Vec<LlmMessage> {
    let mut messages = Vec::with_capacity(recent.len() + 2);

    let mut system = system_prompt.to_string();
    if !summaries.is_empty() {
        let background = summaries
            .iter()
            .map(|s| format!("- {}", s.text))
            .collect::<Vec<_>>()
            .join("\n");
        system.push_str("\n\nEarlier conversation summaries:\n");
        system.push_str(&background);
    }
    messages.push(LlmMessage::system(system));

    for msg in recent {
        let Some(text) = msg.text() else {
            continue;
        };
        match msg.role {
            MessageRole::User => messages.push(LlmMessage::user(text)),
            MessageRole::Assistant => messages.push(LlmMessage::assistant(text)),
        }
    }

    messages
}
