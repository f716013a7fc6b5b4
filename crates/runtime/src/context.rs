//! Hybrid sliding window + rolling summary for long conversations.
//!
//! Recent messages stay verbatim inside a token window; everything older is
//! folded into a short third-person summary generated by a small model.  The
//! summary rolls: each regeneration incorporates the previous one.

use tracing::{debug, info, warn};

use engram_llm::{ChatClient, ChatMessage, ChatRole, MessageContent};

/// Marker prefixing the injected summary message.
const SUMMARY_HEADER: &str = "[CONVERSATION SUMMARY - Earlier messages have been summarized]";

// ── Token estimation ─────────────────────────────────────────────────────────

/// Fast chars/4 token estimate; every non-empty span costs at least one.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Total estimated tokens across messages.  Multi-part content sums its text
/// parts; images contribute nothing.
pub fn count_message_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|message| match &message.content {
            None => 0,
            Some(MessageContent::Text(text)) => estimate_tokens(text),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .map(|part| match part {
                    engram_llm::ContentPart::Text { text } => estimate_tokens(text),
                    engram_llm::ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        })
        .sum()
}

// ── Context manager ──────────────────────────────────────────────────────────

/// Emitted when compression ran.
#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    pub summary: String,
    pub messages_summarized: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[derive(Debug, Clone)]
pub struct ContextManager {
    pub enabled: bool,
    pub max_context_tokens: usize,
    pub window_tokens: usize,
    pub summary_model: String,
}

impl ContextManager {
    pub fn new(enabled: bool, max_context_tokens: usize, window_tokens: usize, summary_model: &str) -> Self {
        Self {
            enabled,
            max_context_tokens,
            window_tokens,
            summary_model: summary_model.to_string(),
        }
    }

    /// Compress `messages` when they exceed the budget.
    ///
    /// Returns the (possibly rebuilt) message list and a summary outcome when
    /// a new summary was generated.  The disabled path and short histories
    /// pass through untouched.
    pub async fn process(
        &self,
        llm: &dyn ChatClient,
        messages: Vec<ChatMessage>,
        existing_summary: &str,
    ) -> (Vec<ChatMessage>, Option<SummaryOutcome>) {
        if !self.enabled {
            debug!("context compression disabled");
            return (messages, None);
        }
        if messages.len() < 3 {
            return (messages, None);
        }

        let tokens_before = count_message_tokens(&messages);
        info!(tokens = tokens_before, threshold = self.max_context_tokens, "context size check");

        if tokens_before <= self.max_context_tokens {
            if !existing_summary.is_empty() {
                return (inject_summary(messages, existing_summary), None);
            }
            return (messages, None);
        }

        // Split: system stays, then walk backwards filling the window.
        let has_system = messages.first().map(|m| m.role == ChatRole::System).unwrap_or(false);
        let (system_msg, conversation) = if has_system {
            (Some(messages[0].clone()), &messages[1..])
        } else {
            (None, &messages[..])
        };

        let mut window_len = 0usize;
        let mut window_tokens = 0usize;
        for message in conversation.iter().rev() {
            let message_tokens = count_message_tokens(std::slice::from_ref(message));
            if window_tokens + message_tokens > self.window_tokens {
                break;
            }
            window_len += 1;
            window_tokens += message_tokens;
        }

        let to_summarize = &conversation[..conversation.len() - window_len];
        if to_summarize.is_empty() {
            // The window already covers everything; reuse the old summary.
            if !existing_summary.is_empty() {
                return (inject_summary(messages, existing_summary), None);
            }
            return (messages, None);
        }

        info!(
            summarizing = to_summarize.len(),
            keeping = window_len,
            "compressing conversation history"
        );
        let summary = self.generate_summary(llm, to_summarize, existing_summary).await;

        let mut kept: Vec<ChatMessage> = Vec::with_capacity(window_len + 1);
        if let Some(system) = system_msg {
            kept.push(system);
        }
        kept.extend(conversation[conversation.len() - window_len..].iter().cloned());
        let compressed = inject_summary(kept, &summary);

        let tokens_after = count_message_tokens(&compressed);
        info!(tokens_before, tokens_after, "compression complete");

        let outcome = SummaryOutcome {
            summary,
            messages_summarized: to_summarize.len(),
            tokens_before,
            tokens_after,
        };
        (compressed, Some(outcome))
    }

    async fn generate_summary(
        &self,
        llm: &dyn ChatClient,
        messages: &[ChatMessage],
        existing_summary: &str,
    ) -> String {
        let formatted = messages
            .iter()
            .filter(|m| matches!(m.role, ChatRole::User | ChatRole::Assistant))
            .filter_map(|m| {
                let text = m.text();
                if text.is_empty() {
                    return None;
                }
                let role = if m.role == ChatRole::User { "User" } else { "Assistant" };
                let text: String = text.chars().take(500).collect();
                Some(format!("{role}: {text}"))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = if existing_summary.is_empty() {
            format!(
                "Summarize this conversation excerpt concisely. Focus on:\n\
                 - Main topics discussed\n\
                 - Key decisions or conclusions\n\
                 - Important context for continuing the conversation\n\n\
                 MESSAGES:\n{formatted}\n\n\
                 Keep the summary concise (max 200 words). Write in third person \
                 (\"The user discussed...\", \"The assistant explained...\").\n\nSUMMARY:"
            )
        } else {
            format!(
                "You are summarizing a conversation. There is an existing summary of earlier \
                 messages, and new messages to incorporate.\n\n\
                 EXISTING SUMMARY:\n{existing_summary}\n\n\
                 NEW MESSAGES TO INCORPORATE:\n{formatted}\n\n\
                 Create a unified, coherent summary that combines the existing summary with the \
                 key points from the new messages. Focus on:\n\
                 - Main topics discussed\n\
                 - Key decisions or conclusions\n\
                 - Important context for continuing the conversation\n\n\
                 Keep the summary concise (max 300 words). Write in third person \
                 (\"The user discussed...\", \"The assistant explained...\").\n\nUNIFIED SUMMARY:"
            )
        };

        match llm.chat(&self.summary_model, &[ChatMessage::user(prompt)]).await {
            Ok(reply) => reply.content.trim().to_string(),
            Err(err) => {
                warn!(%err, "summary generation failed, reusing previous summary");
                if existing_summary.is_empty() {
                    "Previous conversation context not available.".to_string()
                } else {
                    existing_summary.to_string()
                }
            }
        }
    }
}

/// Insert the summary as a system message right after the leading system
/// message (or at the front when there is none).
fn inject_summary(messages: Vec<ChatMessage>, summary: &str) -> Vec<ChatMessage> {
    if summary.is_empty() || messages.is_empty() {
        return messages;
    }
    let summary_msg = ChatMessage::system(format!("{SUMMARY_HEADER}\n{summary}"));
    let mut result = Vec::with_capacity(messages.len() + 1);
    let mut iter = messages.into_iter();
    let first = iter.next().expect("non-empty");
    if first.role == ChatRole::System {
        result.push(first);
        result.push(summary_msg);
    } else {
        result.push(summary_msg);
        result.push(first);
    }
    result.extend(iter);
    result
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_floors_at_one() {
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn message_tokens_sum_text_parts_only() {
        use engram_llm::ContentPart;
        let messages = vec![
            ChatMessage::user("a".repeat(40)),
            ChatMessage::user_parts(vec![
                ContentPart::Text { text: "b".repeat(80) },
                ContentPart::ImageUrl { url: "data:image/png;base64,####".into() },
            ]),
            ChatMessage::assistant_tool_calls(None, vec![]),
        ];
        assert_eq!(count_message_tokens(&messages), 10 + 20);
    }

    #[test]
    fn summary_injects_after_system() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let injected = inject_summary(messages, "they talked");
        assert_eq!(injected.len(), 4);
        assert_eq!(injected[0].text(), "sys");
        assert!(injected[1].text().starts_with(SUMMARY_HEADER));
        assert_eq!(injected[2].text(), "hi");
    }

    #[test]
    fn summary_prepends_without_system() {
        let messages = vec![ChatMessage::user("hi")];
        let injected = inject_summary(messages, "earlier context");
        assert!(injected[0].text().starts_with(SUMMARY_HEADER));
        assert_eq!(injected[1].text(), "hi");
    }
}
