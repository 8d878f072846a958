use std::fmt::Write as _;

use tracing::debug;

use super::{
    check_response_code, generate_chat_id, unix_timestamp, FamilyCodec, RoutedRequest,
    StreamEvent, StreamState, StreamStep, STREAM_DONE_CODE,
};
use crate::backend::proto::gpt;
use crate::backend::BackendError;
use crate::models::{
    ChatCompletionsChunk, ChatCompletionsResponse, ChatMessage, MessageRole, Usage,
};
use crate::tokenizer::TokenCounter;

const SYSTEM_ROLE: i64 = 0;
const DIALOG_ROLE: i64 = 1;

/// Codec for the GPT inference service.
pub struct Gpt;

impl FamilyCodec for Gpt {
    type Request = gpt::Request;
    type Response = gpt::Response;

    fn encode(request: &RoutedRequest) -> gpt::Request {
        let mut system = String::new();
        let mut dialog = String::new();
        for message in &request.messages {
            let block = match message.role {
                MessageRole::System => &mut system,
                MessageRole::User | MessageRole::Assistant => &mut dialog,
            };
            let _ = write!(block, "{}:{};\r\n", message.role.as_str(), message.content);
        }

        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(gpt::Message {
                role: SYSTEM_ROLE,
                message: system,
            });
        }
        if !dialog.is_empty() {
            messages.push(gpt::Message {
                role: DIALOG_ROLE,
                message: dialog,
            });
        }

        gpt::Request {
            models: request.model.clone(),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
        }
    }

    fn decode_unary(
        response: gpt::Response,
        request: &RoutedRequest,
        tokens: &dyn TokenCounter,
    ) -> Result<ChatCompletionsResponse, BackendError> {
        check_response_code(response.response_code)?;
        let content = response
            .text()
            .ok_or_else(|| BackendError::InvalidResponse("invalid response structure".to_owned()))?;
        if content.is_empty() {
            return Err(BackendError::InvalidResponse(
                "empty response content".to_owned(),
            ));
        }

        let prompt_tokens = tokens.count_messages(&request.messages, &request.model);
        let completion_tokens = tokens.count_message(
            &ChatMessage::new(MessageRole::Assistant, content),
            &request.model,
        );

        let (id, created) = response
            .body
            .as_ref()
            .map(|body| (body.id.clone(), body.time))
            .unwrap_or_default();
        Ok(ChatCompletionsResponse::assistant(
            if id.is_empty() { generate_chat_id() } else { id },
            if created > 0 { created } else { unix_timestamp() },
            request.original_model.clone(),
            content.to_owned(),
            Usage::new(prompt_tokens, completion_tokens),
        ))
    }

    fn open_stream(request: &RoutedRequest, tokens: &dyn TokenCounter) -> StreamState {
        StreamState::for_request(
            request,
            tokens.count_messages(&request.messages, &request.model),
        )
    }

    fn decode_stream_event(
        event: StreamEvent<gpt::Response>,
        state: &mut StreamState,
        tokens: &dyn TokenCounter,
    ) -> Result<StreamStep, BackendError> {
        if state.is_finished() {
            return Ok(StreamStep::done(Vec::new()));
        }

        let response = match event {
            StreamEvent::Message(response) => response,
            StreamEvent::Eof => return Ok(StreamStep::done(vec![finish(state, tokens)])),
            StreamEvent::Failed(status) => return Err(BackendError::Status(status)),
        };

        if let Some(body) = response.body.as_ref() {
            state.set_created(body.time);
        }

        let mut deltas = Vec::new();
        match response.text() {
            Some(text) if !text.is_empty() => deltas.push(state.push_fragment(text)),
            _ if response.response_code != STREAM_DONE_CODE => {
                debug!("received incomplete message structure");
            }
            _ => {}
        }

        if response.response_code == STREAM_DONE_CODE {
            deltas.push(finish(state, tokens));
            return Ok(StreamStep::done(deltas));
        }
        Ok(StreamStep::more(deltas))
    }
}

fn finish(state: &mut StreamState, tokens: &dyn TokenCounter) -> ChatCompletionsChunk {
    let completion_tokens = tokens.count_text(state.full_text(), state.backend_model());
    state.finish(completion_tokens)
}
