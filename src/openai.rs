//! OpenAI-compatible chat-completion client (ModelScope by default).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::{self, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ApiKey, InterpreterConfig};
use crate::error::InterpretError;
use crate::fragments::FragmentStream;
use crate::interpreter::{InterpretRequest, Interpreter, SYSTEM_PROMPT};

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

// Appended to the body so a final frame without its blank line still parses.
const SSE_TERMINATOR: &[u8] = b"\n\n";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// What one SSE `data:` payload amounts to.
#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    Text(String),
    /// Role-only deltas, usage frames and keep-alives.
    Empty,
    Done,
}

pub struct ModelScopeClient {
    config: InterpreterConfig,
    http: Client,
}

impl ModelScopeClient {
    pub fn new(config: InterpreterConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.config.base_url, CHAT_COMPLETIONS_PATH)
    }

    fn payload<'a>(&'a self, request: &InterpretRequest, stream: bool) -> ChatCompletionRequest<'a> {
        let prompt = request.user_prompt();
        debug!(?prompt, "Constructed interpretation prompt");
        ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        }
    }

    async fn send(
        &self,
        key: &ApiKey,
        payload: &ChatCompletionRequest<'_>,
    ) -> Result<reqwest::Response, InterpretError> {
        let url = self.endpoint();
        let mut builder = self.http.post(&url).bearer_auth(key.expose()).json(payload);
        if payload.stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        } else {
            builder = builder.timeout(self.config.timeout);
        }

        // Bounds the wait for headers; streamed frames are bounded in `stream`.
        let response = tokio::time::timeout(self.config.timeout, builder.send())
            .await
            .map_err(|_| timed_out(self.config.timeout))?
            .map_err(InterpretError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, "Chat completion request failed");
            return Err(InterpretError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Interpreter for ModelScopeClient {
    #[instrument(skip(self, key, request), fields(model = %self.config.model, method = %request.method))]
    async fn complete(&self, key: &ApiKey, request: &InterpretRequest) -> Result<String, InterpretError> {
        let payload = self.payload(request, false);
        let response = self.send(key, &payload).await?;

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| InterpretError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InterpretError::Malformed("response carried no message content".to_string()))?;

        info!(chars = content.chars().count(), "Received complete interpretation");
        Ok(content)
    }

    #[instrument(skip(self, key, request), fields(model = %self.config.model, method = %request.method))]
    async fn stream(
        &self,
        key: &ApiKey,
        request: &InterpretRequest,
    ) -> Result<FragmentStream, InterpretError> {
        let payload = self.payload(request, true);
        let response = self.send(key, &payload).await?;
        info!("Interpretation stream opened");

        let idle = self.config.timeout;
        let events = response
            .bytes_stream()
            .chain(stream::once(async {
                Ok::<_, reqwest::Error>(Bytes::from_static(SSE_TERMINATOR))
            }))
            .eventsource()
            .boxed();

        Ok(FragmentStream::new(stream::unfold(Some(events), move |state| async move {
            let mut events = state?;
            loop {
                let next = match tokio::time::timeout(idle, events.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(timeout = ?idle, "Interpretation stream stalled");
                        let error = InterpretError::Stream(format!("no data received for {:?}", idle));
                        return Some((Err(error), None));
                    }
                };
                match next {
                    None => return None,
                    Some(Err(e)) => {
                        return Some((Err(InterpretError::Stream(e.to_string())), None));
                    }
                    Some(Ok(event)) => match parse_chunk(&event.data) {
                        Ok(Chunk::Text(text)) => return Some((Ok(text), Some(events))),
                        Ok(Chunk::Empty) => continue,
                        Ok(Chunk::Done) => {
                            debug!("Interpretation stream finished");
                            return None;
                        }
                        Err(e) => return Some((Err(e), None)),
                    },
                }
            }
        })))
    }
}

fn timed_out(timeout: Duration) -> InterpretError {
    InterpretError::Connect(format!("request timed out after {:?}", timeout))
}

fn parse_chunk(data: &str) -> Result<Chunk, InterpretError> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Ok(Chunk::Empty);
    }
    if trimmed == "[DONE]" {
        return Ok(Chunk::Done);
    }

    let value = serde_json::from_str::<Value>(trimmed)
        .map_err(|e| InterpretError::Malformed(format!("failed to parse SSE JSON: {}", e)))?;

    // Providers report quota and moderation failures inline.
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown provider error");
        return Err(InterpretError::Stream(message.to_string()));
    }

    let text = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    if text.is_empty() {
        Ok(Chunk::Empty)
    } else {
        Ok(Chunk::Text(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(chunks: &[&str]) -> String {
        let mut body = String::new();
        for text in chunks {
            let frame = json!({"choices": [{"index": 0, "delta": {"content": text}}]});
            body.push_str(&format!("data: {}\n\n", frame));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn client_for(server: &MockServer) -> ModelScopeClient {
        let config = InterpreterConfig::from_env()
            .with_base_url(format!("{}/v1", server.uri()))
            .with_model("test-model");
        ModelScopeClient::new(config).unwrap()
    }

    fn request() -> InterpretRequest {
        InterpretRequest::new("事业运如何", Reading::PlumBlossom { numbers: [2, 5, 8] })
    }

    fn key() -> ApiKey {
        ApiKey::parse("ms-test").unwrap()
    }

    #[test]
    fn test_parse_chunk_variants() {
        assert_eq!(parse_chunk("[DONE]").unwrap(), Chunk::Done);
        assert_eq!(parse_chunk("  ").unwrap(), Chunk::Empty);
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            Chunk::Empty
        );
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"content":"大吉"}}]}"#).unwrap(),
            Chunk::Text("大吉".to_string())
        );
        assert!(matches!(parse_chunk("not json"), Err(InterpretError::Malformed(_))));
        assert_eq!(
            parse_chunk(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err(),
            InterpretError::Stream("quota exceeded".to_string())
        );
    }

    #[tokio::test]
    async fn test_stream_yields_delta_content_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer ms-test"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "stream": true,
                "temperature": 0.7,
                "max_tokens": 1500
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse(&["卦象", "解读：", "大吉"]), "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let fragments: Vec<_> = client
            .stream(&key(), &request())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            fragments,
            vec![
                Ok("卦象".to_string()),
                Ok("解读：".to_string()),
                Ok("大吉".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_sends_system_and_user_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": request().user_prompt()}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&[]), "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let fragments: Vec<_> = client.stream(&key(), &request()).await.unwrap().collect().await;
        assert!(fragments.is_empty());
    }

    #[tokio::test]
    async fn test_stream_surfaces_inline_error_and_stops() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\n",
            json!({"choices": [{"delta": {"content": "卦"}}]}),
            json!({"error": {"message": "quota exceeded"}}),
            json!({"choices": [{"delta": {"content": "never"}}]}),
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let fragments: Vec<_> = client.stream(&key(), &request()).await.unwrap().collect().await;
        assert_eq!(
            fragments,
            vec![
                Ok("卦".to_string()),
                Err(InterpretError::Stream("quota exceeded".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_reports_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.stream(&key(), &request()).await.unwrap_err();
        assert_eq!(
            err,
            InterpretError::Status {
                status: 401,
                body: "invalid api key".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_complete_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "卦象解读：大吉"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let text = client.complete(&key(), &request()).await.unwrap();
        assert_eq!(text, "卦象解读：大吉");
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.complete(&key(), &request()).await.unwrap_err();
        assert!(matches!(err, InterpretError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_stream_keeps_final_frame_without_blank_line() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}",
            json!({"choices": [{"delta": {"content": "卦象"}}]}),
            json!({"choices": [{"delta": {"content": "大吉"}}]}),
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let fragments: Vec<_> = client.stream(&key(), &request()).await.unwrap().collect().await;
        assert_eq!(fragments, vec![Ok("卦象".to_string()), Ok("大吉".to_string())]);
    }

    #[tokio::test]
    async fn test_stalled_stream_request_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&["大吉"]), "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let config = InterpreterConfig::from_env()
            .with_base_url(format!("{}/v1", server.uri()))
            .with_timeout(Duration::from_millis(300));
        let client = ModelScopeClient::new(config).unwrap();

        let started = std::time::Instant::now();
        let err = client.stream(&key(), &request()).await.unwrap_err();
        assert!(matches!(err, InterpretError::Connect(ref msg) if msg.contains("timed out")), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let config = InterpreterConfig::from_env().with_base_url("http://127.0.0.1:9/v1");
        let client = ModelScopeClient::new(config).unwrap();
        let err = client.stream(&key(), &request()).await.unwrap_err();
        assert!(matches!(err, InterpretError::Connect(_)));
    }
}
