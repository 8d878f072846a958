use tonic::Code;
use tracing::{info, warn};

use super::{
    check_response_code, generate_chat_id, unix_timestamp, FamilyCodec, RoutedRequest,
    StreamEvent, StreamState, StreamStep, STREAM_DONE_CODE,
};
use crate::backend::proto::vertex;
use crate::backend::BackendError;
use crate::models::{ChatCompletionsChunk, ChatCompletionsResponse, ChatMessage, MessageRole, Usage};
use crate::tokenizer::TokenCounter;

/// Added to every Claude completion count, matching the backend's own accounting.
const COMPLETION_OVERHEAD: u32 = 3;

/// Codec for the Vertex inference service (Claude and Gemini models).
pub struct Vertex;

/// Conversation split into the joined system text and merged non-system turns.
#[derive(Debug, Default, PartialEq)]
pub struct Conversation {
    pub system: String,
    pub turns: Vec<ChatMessage>,
}

/// Extracts system messages and merges consecutive turns that share a role, joining
/// their content with a blank line.
pub fn merge_turns(messages: &[ChatMessage]) -> Conversation {
    let mut system = Vec::new();
    let mut turns: Vec<ChatMessage> = Vec::new();
    for message in messages {
        if message.role == MessageRole::System {
            system.push(message.content.as_str());
            continue;
        }
        match turns.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => turns.push(ChatMessage::new(message.role, message.content.clone())),
        }
    }
    Conversation {
        system: system.join("\n"),
        turns,
    }
}

fn prompt_tokens(conversation: &Conversation, tokens: &dyn TokenCounter) -> u32 {
    tokens
        .count_claude_prompt(&conversation.system, &conversation.turns)
        .unwrap_or_else(|error| {
            warn!(error = %error, "failed to count prompt tokens");
            0
        })
}

fn completion_tokens(text: &str, tokens: &dyn TokenCounter) -> u32 {
    match tokens.count_claude_text(text) {
        Ok(count) => count + COMPLETION_OVERHEAD,
        Err(error) => {
            warn!(error = %error, "failed to count completion tokens");
            0
        }
    }
}

fn finish(state: &mut StreamState, tokens: &dyn TokenCounter) -> ChatCompletionsChunk {
    state.set_created(unix_timestamp());
    let completion = completion_tokens(state.full_text(), tokens);
    state.finish(completion)
}

impl FamilyCodec for Vertex {
    type Request = vertex::Requests;
    type Response = vertex::Response;

    fn encode(request: &RoutedRequest) -> vertex::Requests {
        let conversation = merge_turns(&request.messages);
        let message = if conversation.turns.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = conversation
                .turns
                .iter()
                .map(|turn| format!("{}:{}", turn.role.as_str(), turn.content))
                .collect();
            format!("{};\r\n", lines.join(";\r\n"))
        };
        let rules = if conversation.system.is_empty() {
            String::new()
        } else {
            format!("system:{};\r\n", conversation.system)
        };

        vertex::Requests {
            models: request.model.clone(),
            args: Some(vertex::Args {
                messages: Some(vertex::Messages {
                    unknown: 1,
                    message,
                }),
                rules,
            }),
        }
    }

    fn decode_unary(
        response: vertex::Response,
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

        let prompt = prompt_tokens(&merge_turns(&request.messages), tokens);
        let completion = completion_tokens(content, tokens);
        Ok(ChatCompletionsResponse::assistant(
            generate_chat_id(),
            unix_timestamp(),
            request.original_model.clone(),
            content.to_owned(),
            Usage::new(prompt, completion),
        ))
    }

    fn open_stream(request: &RoutedRequest, tokens: &dyn TokenCounter) -> StreamState {
        StreamState::for_request(request, prompt_tokens(&merge_turns(&request.messages), tokens))
    }

    /// Any receive failure ends the stream normally; Vertex closes streams with
    /// `RST_STREAM` rather than a clean EOF.
    fn decode_stream_event(
        event: StreamEvent<vertex::Response>,
        state: &mut StreamState,
        tokens: &dyn TokenCounter,
    ) -> Result<StreamStep, BackendError> {
        if state.is_finished() {
            return Ok(StreamStep::done(Vec::new()));
        }

        let response = match event {
            StreamEvent::Message(response) => response,
            StreamEvent::Eof => return Ok(StreamStep::done(vec![finish(state, tokens)])),
            StreamEvent::Failed(status) => {
                if status.code() == Code::Internal && status.message().contains("RST_STREAM") {
                    info!("vertex stream terminated by RST_STREAM");
                } else {
                    warn!(code = ?status.code(), detail = status.message(), "vertex stream error");
                }
                return Ok(StreamStep::done(vec![finish(state, tokens)]));
            }
        };

        state.set_created(unix_timestamp());
        let mut deltas = Vec::new();
        if let Some(text) = response.text().filter(|text| !text.is_empty()) {
            deltas.push(state.push_fragment(text));
        }

        if response.response_code == STREAM_DONE_CODE {
            deltas.push(finish(state, tokens));
            return Ok(StreamStep::done(deltas));
        }
        Ok(StreamStep::more(deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::RoughCounter;
    use crate::translate::BackendFamily;

    fn routed(messages: Vec<ChatMessage>) -> RoutedRequest {
        RoutedRequest {
            original_model: "claude-3-5-sonnet-20240620".to_owned(),
            model: "claude-3-5-sonnet@20240620".to_owned(),
            family: BackendFamily::Vertex,
            messages,
            temperature: 0.1,
            top_p: 1.0,
        }
    }

    fn text_response(code: i64, text: Option<&str>) -> vertex::Response {
        vertex::Response {
            response_code: code,
            args: text.map(|text| vertex::ResponseArgs {
                args: Some(vertex::NestedArgs {
                    args: Some(vertex::ResponseMessage {
                        message: text.to_owned(),
                    }),
                }),
            }),
        }
    }

    #[test]
    fn consecutive_same_role_turns_merge() {
        let conversation = merge_turns(&[
            ChatMessage::new(MessageRole::System, "rule one"),
            ChatMessage::new(MessageRole::User, "a"),
            ChatMessage::new(MessageRole::User, "b"),
            ChatMessage::new(MessageRole::System, "rule two"),
            ChatMessage::new(MessageRole::Assistant, "c"),
        ]);
        assert_eq!(conversation.system, "rule one\nrule two");
        assert_eq!(
            conversation.turns,
            vec![
                ChatMessage::new(MessageRole::User, "a\n\nb"),
                ChatMessage::new(MessageRole::Assistant, "c"),
            ]
        );
    }

    #[test]
    fn encode_builds_rules_and_message_block() {
        let encoded = Vertex::encode(&routed(vec![
            ChatMessage::new(MessageRole::System, "be brief"),
            ChatMessage::new(MessageRole::User, "hi"),
            ChatMessage::new(MessageRole::Assistant, "hello"),
            ChatMessage::new(MessageRole::User, "bye"),
        ]));
        assert_eq!(encoded.models, "claude-3-5-sonnet@20240620");
        let args = encoded.args.expect("args");
        assert_eq!(args.rules, "system:be brief;\r\n");
        let messages = args.messages.expect("messages");
        assert_eq!(messages.unknown, 1);
        assert_eq!(
            messages.message,
            "user:hi;\r\nassistant:hello;\r\nuser:bye;\r\n"
        );
    }

    #[test]
    fn encode_without_system_has_empty_rules() {
        let encoded = Vertex::encode(&routed(vec![ChatMessage::new(MessageRole::User, "hi")]));
        assert_eq!(encoded.args.expect("args").rules, "");
    }

    #[test]
    fn unary_completion_adds_fixed_overhead() {
        let response = Vertex::decode_unary(
            text_response(0, Some("two words")),
            &routed(vec![ChatMessage::new(MessageRole::User, "hi")]),
            &RoughCounter,
        )
        .expect("decodes");
        assert_eq!(response.usage.completion_tokens, 2 + COMPLETION_OVERHEAD);
        assert_eq!(response.model, "claude-3-5-sonnet-20240620");
        assert!(response.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn unary_rejects_missing_payload() {
        let request = routed(vec![ChatMessage::new(MessageRole::User, "hi")]);
        assert!(matches!(
            Vertex::decode_unary(text_response(0, None), &request, &RoughCounter),
            Err(BackendError::InvalidResponse(_))
        ));
        assert!(matches!(
            Vertex::decode_unary(text_response(3, Some("x")), &request, &RoughCounter),
            Err(BackendError::ServiceError(3))
        ));
    }

    #[test]
    fn receive_error_ends_stream_with_terminal() {
        let request = routed(vec![ChatMessage::new(MessageRole::User, "hi")]);
        let mut state = Vertex::open_stream(&request, &RoughCounter);

        let step = Vertex::decode_stream_event(
            StreamEvent::Message(text_response(200, Some("partial answer"))),
            &mut state,
            &RoughCounter,
        )
        .expect("fragment");
        assert_eq!(step.deltas.len(), 1);

        let step = Vertex::decode_stream_event(
            StreamEvent::Failed(tonic::Status::internal("stream reset: RST_STREAM")),
            &mut state,
            &RoughCounter,
        )
        .expect("reset ends stream");
        assert!(step.done);
        let terminal = &step.deltas[0];
        assert!(terminal.is_terminal());
        assert_eq!(
            terminal.usage.map(|usage| usage.completion_tokens),
            Some(2 + COMPLETION_OVERHEAD)
        );
        assert_eq!(terminal.model, "claude-3-5-sonnet-20240620");
    }

    #[test]
    fn done_code_flushes_trailing_text() {
        let request = routed(vec![ChatMessage::new(MessageRole::User, "hi")]);
        let mut state = Vertex::open_stream(&request, &RoughCounter);
        let step = Vertex::decode_stream_event(
            StreamEvent::Message(text_response(STREAM_DONE_CODE, Some("last"))),
            &mut state,
            &RoughCounter,
        )
        .expect("done");
        assert!(step.done);
        assert_eq!(step.deltas.len(), 2);
        assert!(step.deltas[0].choices[0].delta.role.is_some());
        assert!(step.deltas[1].is_terminal());
    }
}
