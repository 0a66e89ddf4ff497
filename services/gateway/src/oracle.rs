//! The generative-AI backend seam.
//!
//! The backend is an opaque request/response oracle: bounded history in,
//! text out.  `HttpOracle` speaks the OpenAI-compatible chat-completions
//! JSON shape; endpoint, model, and key are config-driven.

use crate::store::conversation::{MessageRecord, Turn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("request: {0}")]
    Request(String),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

pub trait Oracle: Send + Sync + 'static {
    fn generate(
        &self,
        turns: &[ChatTurn],
    ) -> impl Future<Output = Result<String, OracleError>> + Send;
}

/// Build the oracle input: system prompt, then the last `max_turns` of
/// history, then the new user message.
pub fn assemble_turns(
    system_prompt: &str,
    history: &[MessageRecord],
    user_text: &str,
    max_turns: usize,
) -> Vec<ChatTurn> {
    let skip = history.len().saturating_sub(max_turns);
    let mut turns = Vec::with_capacity(history.len() - skip + 2);
    turns.push(ChatTurn {
        role: ChatRole::System,
        content: system_prompt.to_owned(),
    });
    for record in &history[skip..] {
        turns.push(ChatTurn {
            role: match record.turn {
                Turn::User => ChatRole::User,
                Turn::Bot | Turn::System => ChatRole::Assistant,
            },
            content: record.text.clone(),
        });
    }
    turns.push(ChatTurn {
        role: ChatRole::User,
        content: user_text.to_owned(),
    });
    turns
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

pub struct HttpOracle {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpOracle {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Request(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model,
        })
    }
}

impl Oracle for HttpOracle {
    async fn generate(&self, turns: &[ChatTurn]) -> Result<String, OracleError> {
        let body = ChatRequest {
            model: &self.model,
            messages: turns,
        };
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| OracleError::Malformed("no choices in response".to_owned()))?;
        if text.trim().is_empty() {
            return Err(OracleError::Malformed("empty completion".to_owned()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(turn: Turn, text: &str, ts: u64) -> MessageRecord {
        MessageRecord {
            user_key: "u1".to_owned(),
            session_id: "s1".to_owned(),
            timestamp_ms: ts,
            message_id: format!("m{ts}"),
            text: text.to_owned(),
            turn,
            reply_to: None,
            source_event_id: None,
            source_event_kind: None,
        }
    }

    #[test]
    fn turns_carry_system_history_and_new_message() {
        let history = vec![record(Turn::User, "q1", 1), record(Turn::Bot, "a1", 2)];
        let turns = assemble_turns("persona", &history, "q2", 40);
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, ChatRole::System);
        assert_eq!(turns[1].role, ChatRole::User);
        assert_eq!(turns[2].role, ChatRole::Assistant);
        assert_eq!(turns[3].role, ChatRole::User);
        assert_eq!(turns[3].content, "q2");
    }

    #[test]
    fn history_is_bounded_to_the_most_recent_turns() {
        let history: Vec<MessageRecord> = (0..100)
            .map(|i| record(Turn::User, &format!("m{i}"), i))
            .collect();
        let turns = assemble_turns("persona", &history, "new", 40);
        // system + 40 history + new message
        assert_eq!(turns.len(), 42);
        assert_eq!(turns[1].content, "m60");
        assert_eq!(turns[41].content, "new");
    }

    #[test]
    fn system_notices_map_to_assistant_role() {
        let history = vec![record(Turn::System, "insufficient balance", 1)];
        let turns = assemble_turns("persona", &history, "q", 40);
        assert_eq!(turns[1].role, ChatRole::Assistant);
    }

    #[test]
    fn request_body_matches_chat_completions_shape() {
        let body = ChatRequest {
            model: "test-model",
            messages: &[ChatTurn {
                role: ChatRole::User,
                content: "hi".to_owned(),
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hi");
    }

    #[test]
    fn response_parsing_takes_first_choice() {
        let raw = r#"{"choices":[{"message":{"content":"hello"}},{"message":{"content":"other"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
    }
}
