use serde::{Deserialize, Serialize};

pub const OBJECT_CHAT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";
pub const FINISH_REASON_STOP: &str = "stop";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl ChatCompletionsRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ChatCompletionsResponse {
    pub fn assistant(id: String, created: i64, model: String, content: String, usage: Usage) -> Self {
        Self {
            id,
            object: OBJECT_CHAT_COMPLETION,
            created,
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(MessageRole::Assistant, content),
                finish_reason: Some(FINISH_REASON_STOP.to_owned()),
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionsChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: DeltaMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeltaMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionsChunk {
    pub fn delta(id: &str, created: i64, model: &str, content: String, first: bool) -> Self {
        Self {
            id: id.to_owned(),
            object: OBJECT_CHAT_COMPLETION_CHUNK,
            created,
            model: model.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: DeltaMessage {
                    role: first.then_some(MessageRole::Assistant),
                    content: Some(content),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn terminal(id: &str, created: i64, model: &str, usage: Usage) -> Self {
        Self {
            id: id.to_owned(),
            object: OBJECT_CHAT_COMPLETION_CHUNK,
            created,
            model: model.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: DeltaMessage::default(),
                finish_reason: Some(FINISH_REASON_STOP.to_owned()),
            }],
            usage: Some(usage),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.choices
            .first()
            .is_some_and(|choice| choice.finish_reason.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_empty_message_list() {
        let request = ChatCompletionsRequest {
            model: "gpt-4o".to_owned(),
            messages: vec![],
            stream: false,
            temperature: None,
            top_p: None,
        };

        let error = request.validate().expect_err("empty message list should fail");
        assert_eq!(error, "messages must not be empty");
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let body = r#"{"model":"gpt-4o","messages":[{"role":"tool","content":"x"}]}"#;
        assert!(serde_json::from_str::<ChatCompletionsRequest>(body).is_err());
    }

    #[test]
    fn usage_total_is_computed() {
        let usage = Usage::new(11, 7);
        assert_eq!(usage.total_tokens, 18);
    }

    #[test]
    fn terminal_chunk_serializes_empty_delta() {
        let chunk = ChatCompletionsChunk::terminal("chatcmpl-1", 1, "gpt-4o", Usage::new(1, 2));
        let json = serde_json::to_value(&chunk).expect("chunk serializes");
        assert_eq!(json["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 3);
        assert!(chunk.is_terminal());
    }

    #[test]
    fn first_delta_carries_role() {
        let first = ChatCompletionsChunk::delta("id", 1, "m", "he".to_owned(), true);
        let second = ChatCompletionsChunk::delta("id", 1, "m", "llo".to_owned(), false);
        assert_eq!(first.choices[0].delta.role, Some(MessageRole::Assistant));
        assert_eq!(second.choices[0].delta.role, None);
        assert!(!first.is_terminal());
    }
}
