//! Conversion between the OpenAI-style chat schema and the two backend protocols.
//!
//! Everything in here is synchronous and transport-free: callers feed decoded backend
//! messages in and get gateway responses or deltas back.

pub mod gpt;
pub mod vertex;

use chrono::Utc;
use uuid::Uuid;

use crate::backend::BackendError;
use crate::catalog;
use crate::errors::AppError;
use crate::models::{
    ChatCompletionsChunk, ChatCompletionsRequest, ChatCompletionsResponse, ChatMessage, Usage,
};
use crate::tokenizer::TokenCounter;

pub use gpt::Gpt;
pub use vertex::Vertex;

/// Backend code that marks the end of a GPT-family stream.
pub const STREAM_DONE_CODE: i64 = 204;

pub const DEFAULT_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_TOP_P: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    Gpt,
    Vertex,
}

impl BackendFamily {
    /// `gpt-` models go to the GPT service; everything else is served by Vertex.
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("gpt-") {
            Self::Gpt
        } else {
            Self::Vertex
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Vertex => "vertex",
        }
    }
}

/// A validated request bound to one backend family.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedRequest {
    /// Name echoed back to the client.
    pub original_model: String,
    /// Name sent to the backend.
    pub model: String,
    pub family: BackendFamily,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
}

/// Normalizes the model name, falls back to the configured default when the requested
/// model is not in the catalog, and picks the backend family.
pub fn resolve(
    request: ChatCompletionsRequest,
    default_model: Option<&str>,
) -> Result<RoutedRequest, AppError> {
    request.validate().map_err(AppError::BadRequest)?;

    let original_model = request.model;
    let mut model = catalog::normalize_model_name(&original_model);
    if !catalog::is_supported(&model) {
        match default_model.filter(|default| !default.is_empty()) {
            Some(default) => model = catalog::normalize_model_name(default),
            None => return Err(AppError::ModelNotFound(original_model)),
        }
    }

    Ok(RoutedRequest {
        family: BackendFamily::for_model(&model),
        original_model,
        model,
        messages: request.messages,
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        top_p: request.top_p.unwrap_or(DEFAULT_TOP_P),
    })
}

/// One event from an upstream stream, as seen by a family decoder.
#[derive(Debug)]
pub enum StreamEvent<T> {
    Message(T),
    Eof,
    Failed(tonic::Status),
}

#[derive(Debug, Default)]
pub struct StreamStep {
    pub deltas: Vec<ChatCompletionsChunk>,
    pub done: bool,
}

impl StreamStep {
    fn more(deltas: Vec<ChatCompletionsChunk>) -> Self {
        Self {
            deltas,
            done: false,
        }
    }

    fn done(deltas: Vec<ChatCompletionsChunk>) -> Self {
        Self { deltas, done: true }
    }
}

/// Per-stream accumulator. Guarantees the role is attached to the first content delta
/// only and that at most one terminal delta is produced.
#[derive(Debug)]
pub struct StreamState {
    id: String,
    model: String,
    backend_model: String,
    created: i64,
    prompt_tokens: u32,
    full_text: String,
    role_sent: bool,
    finished: bool,
}

impl StreamState {
    pub fn new(model: impl Into<String>, prompt_tokens: u32) -> Self {
        let model = model.into();
        Self {
            id: generate_chat_id(),
            backend_model: model.clone(),
            model,
            created: unix_timestamp(),
            prompt_tokens,
            full_text: String::new(),
            role_sent: false,
            finished: false,
        }
    }

    /// State for a routed request: deltas echo the client's model name while token
    /// counting uses the backend name.
    pub fn for_request(request: &RoutedRequest, prompt_tokens: u32) -> Self {
        let mut state = Self::new(request.original_model.clone(), prompt_tokens);
        state.backend_model = request.model.clone();
        state
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_model(&self) -> &str {
        &self.backend_model
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_created(&mut self, created: i64) {
        if created > 0 {
            self.created = created;
        }
    }

    pub fn push_fragment(&mut self, text: &str) -> ChatCompletionsChunk {
        self.full_text.push_str(text);
        let first = !self.role_sent;
        self.role_sent = true;
        ChatCompletionsChunk::delta(&self.id, self.created, &self.model, text.to_owned(), first)
    }

    pub fn finish(&mut self, completion_tokens: u32) -> ChatCompletionsChunk {
        self.finished = true;
        ChatCompletionsChunk::terminal(
            &self.id,
            self.created,
            &self.model,
            Usage::new(self.prompt_tokens, completion_tokens),
        )
    }
}

/// Encode/decode capability shared by both backend families.
pub trait FamilyCodec {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn encode(request: &RoutedRequest) -> Self::Request;

    fn decode_unary(
        response: Self::Response,
        request: &RoutedRequest,
        tokens: &dyn TokenCounter,
    ) -> Result<ChatCompletionsResponse, BackendError>;

    fn open_stream(request: &RoutedRequest, tokens: &dyn TokenCounter) -> StreamState;

    fn decode_stream_event(
        event: StreamEvent<Self::Response>,
        state: &mut StreamState,
        tokens: &dyn TokenCounter,
    ) -> Result<StreamStep, BackendError>;
}

pub fn check_response_code(code: i64) -> Result<(), BackendError> {
    if code == 0 || code == 200 {
        Ok(())
    } else {
        Err(BackendError::ServiceError(code))
    }
}

/// `chatcmpl-` followed by 28 lowercase hex characters.
pub fn generate_chat_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..28])
}

pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    fn request(model: &str) -> ChatCompletionsRequest {
        ChatCompletionsRequest {
            model: model.to_owned(),
            messages: vec![ChatMessage::new(MessageRole::User, "hi")],
            stream: false,
            temperature: None,
            top_p: Some(0.5),
        }
    }

    #[test]
    fn resolve_routes_by_prefix_and_fills_defaults() {
        let routed = resolve(request("gpt-4o"), None).expect("supported");
        assert_eq!(routed.family, BackendFamily::Gpt);
        assert_eq!(routed.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(routed.top_p, 0.5);

        let routed = resolve(request("claude-3-5-sonnet-20240620"), None).expect("supported");
        assert_eq!(routed.family, BackendFamily::Vertex);
        assert_eq!(routed.model, "claude-3-5-sonnet@20240620");
        assert_eq!(routed.original_model, "claude-3-5-sonnet-20240620");
    }

    #[test]
    fn unsupported_models_fall_back_to_default() {
        let routed = resolve(request("gpt-5"), Some("gemini-pro")).expect("falls back");
        assert_eq!(routed.original_model, "gpt-5");
        assert_eq!(routed.model, "gemini-pro");
        assert_eq!(routed.family, BackendFamily::Vertex);

        let routed = resolve(request("gpt-4o"), Some("gemini-pro")).expect("supported");
        assert_eq!(routed.model, "gpt-4o");
    }

    #[test]
    fn unknown_models_are_rejected() {
        let error = resolve(request("gpt-5"), None).expect_err("unsupported");
        assert!(matches!(error, AppError::ModelNotFound(model) if model == "gpt-5"));
    }

    #[test]
    fn chat_ids_have_fixed_shape() {
        let id = generate_chat_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 28);
        assert!(id["chatcmpl-".len()..].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn stream_state_marks_only_first_delta_with_role() {
        let mut state = StreamState::new("gpt-4o", 5);
        let first = state.push_fragment("Hel");
        let second = state.push_fragment("lo");
        assert!(first.choices[0].delta.role.is_some());
        assert!(second.choices[0].delta.role.is_none());
        assert_eq!(state.full_text(), "Hello");

        let terminal = state.finish(2);
        assert!(state.is_finished());
        assert_eq!(terminal.usage, Some(Usage::new(5, 2)));
        assert_eq!(terminal.id, first.id);
    }
}
