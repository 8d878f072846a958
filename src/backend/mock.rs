use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::Mutex, time::sleep};
use tracing::debug;

use crate::backend::{BackendError, DeltaStream, InferenceBackend};
use crate::models::{ChatCompletionsResponse, MessageRole, Usage};
use crate::tokenizer::{RoughCounter, TokenCounter};
use crate::translate::{generate_chat_id, unix_timestamp, RoutedRequest, StreamState};

/// Offline backend that echoes the last user message.
///
/// Failures can be queued with [`MockBackend::fail_next`]; each call pops one before
/// answering normally.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    token_delay: Duration,
    failures: Mutex<VecDeque<BackendError>>,
    calls: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            name: "mock-backend".to_owned(),
            token_delay: Duration::from_millis(35),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockBackend {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_token_delay(mut self, token_delay: Duration) -> Self {
        self.token_delay = token_delay;
        self
    }

    pub async fn fail_next(&self, error: BackendError) {
        self.failures.lock().await.push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_failure(&self) -> Option<BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures.lock().await.pop_front()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_chat(
        &self,
        request: &RoutedRequest,
    ) -> Result<ChatCompletionsResponse, BackendError> {
        if let Some(error) = self.next_failure().await {
            return Err(error);
        }

        let content = render_response(request);
        let counter = RoughCounter;
        let usage = Usage::new(
            counter.count_messages(&request.messages, &request.model),
            counter.count_text(&content, &request.model),
        );
        Ok(ChatCompletionsResponse::assistant(
            generate_chat_id(),
            unix_timestamp(),
            request.original_model.clone(),
            content,
            usage,
        ))
    }

    async fn stream_chat(&self, request: RoutedRequest) -> Result<DeltaStream, BackendError> {
        if let Some(error) = self.next_failure().await {
            return Err(error);
        }

        let content = render_response(&request);
        let counter = RoughCounter;
        let mut state = StreamState::for_request(
            &request,
            counter.count_messages(&request.messages, &request.model),
        );
        let delay = self.token_delay;

        debug!(backend = %self.name, "stream prepared");
        let stream = async_stream::stream! {
            for token in split_for_stream(&content) {
                yield Ok(state.push_fragment(&token));
                sleep(delay).await;
            }
            let completion = counter.count_text(state.full_text(), state.backend_model());
            yield Ok(state.finish(completion));
        };
        Ok(stream.boxed())
    }
}

fn render_response(request: &RoutedRequest) -> String {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User)
        .map(|message| message.content.as_str())
        .unwrap_or("hello");

    format!("Mock response for model {}: {}", request.model, prompt)
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;
    use crate::translate::BackendFamily;

    fn routed() -> RoutedRequest {
        RoutedRequest {
            original_model: "claude-3-haiku-20240307".to_owned(),
            model: "claude-3-haiku@20240307".to_owned(),
            family: BackendFamily::Vertex,
            messages: vec![ChatMessage::new(MessageRole::User, "ping")],
            temperature: 0.1,
            top_p: 1.0,
        }
    }

    #[tokio::test]
    async fn queued_failures_are_returned_first() {
        let backend = MockBackend::default();
        backend.fail_next(BackendError::PoolTimeout).await;

        assert!(matches!(
            backend.execute_chat(&routed()).await,
            Err(BackendError::PoolTimeout)
        ));
        let response = backend.execute_chat(&routed()).await.expect("second call");
        assert_eq!(response.model, "claude-3-haiku-20240307");
        assert!(response.choices[0]
            .message
            .content
            .contains("claude-3-haiku@20240307"));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn stream_ends_with_single_terminal() {
        let backend = MockBackend::default().with_token_delay(Duration::ZERO);
        let deltas: Vec<_> = backend
            .stream_chat(routed())
            .await
            .expect("stream")
            .collect()
            .await;

        let deltas: Vec<_> = deltas.into_iter().map(|delta| delta.expect("ok")).collect();
        let terminals = deltas.iter().filter(|delta| delta.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(deltas.last().expect("non-empty").is_terminal());
        assert!(deltas[0].choices[0].delta.role.is_some());
        assert!(deltas[1..]
            .iter()
            .all(|delta| delta.choices[0].delta.role.is_none()));
    }
}
