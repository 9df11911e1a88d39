use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::config::ApiKey;
use crate::error::InterpretError;
use crate::fragments::FragmentStream;
use crate::reading::{Method, Reading};

pub const SYSTEM_PROMPT: &str = "你是一个专业的占卜师，精通各种占卜方法，能够为用户提供深入的占卜解读和实用建议。请确保回答完整，不要截断内容。";

pub const INTERPRETATION_HEADER: &str = "AI解读：\n";

/// Everything the provider needs to interpret one reading.
#[derive(Debug, Clone)]
pub struct InterpretRequest {
    pub method: Method,
    pub question: String,
    pub reading: Reading,
}

impl InterpretRequest {
    pub fn new(question: impl Into<String>, reading: Reading) -> Self {
        Self {
            method: reading.method(),
            question: question.into(),
            reading,
        }
    }

    /// The user message sent to the model. Deterministic for a given request.
    pub fn user_prompt(&self) -> String {
        format!(
            "你是一个专业的占卜师，精通各种占卜方法。请根据以下占卜结果，为用户的问题提供专业解读。\n\n\
             占卜方式: {}\n\
             用户问题: {}\n\
             占卜结果: {}\n\n\
             请提供：\n\
             1. 详细的卦象/结果解析\n\
             2. 对用户问题的具体回答\n\
             3. 实用的建议和指导\n\n\
             请用中文回答，语言要通俗易懂，富有智慧。请确保回答完整，不要截断内容。",
            self.method.name(),
            self.question,
            self.reading
        )
    }
}

/// A remote chat-completion service that can interpret readings.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// One request, one complete answer.
    async fn complete(&self, key: &ApiKey, request: &InterpretRequest) -> Result<String, InterpretError>;

    /// One request delivered incrementally. The outer error covers failures
    /// before any fragment arrives; later failures show up as stream items.
    async fn stream(
        &self,
        key: &ApiKey,
        request: &InterpretRequest,
    ) -> Result<FragmentStream, InterpretError>;
}

/// Text that stands in for an interpretation when the provider is unreachable.
pub fn fallback_text(reading: &Reading) -> String {
    format!("AI解读暂时不可用，使用默认解释：{}", reading)
}

pub fn stream_error_notice(error: &InterpretError) -> String {
    format!("\n流式输出过程中出现错误：{}", error)
}

/// Blocking mode that never fails: provider errors become the fallback text.
pub async fn interpret_or_fallback(
    interpreter: &dyn Interpreter,
    key: &ApiKey,
    request: &InterpretRequest,
) -> String {
    match interpreter.complete(key, request).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, method = %request.method, "Interpretation unavailable, using fallback");
            fallback_text(&request.reading)
        }
    }
}

/// Streaming mode that never fails.
///
/// The reading summary and a header lead the sequence. A failed call yields
/// the fallback text; a mid-stream failure ends the sequence with an
/// explanatory fragment.
pub async fn stream_or_fallback(
    interpreter: &dyn Interpreter,
    key: &ApiKey,
    request: &InterpretRequest,
) -> FragmentStream {
    let preamble = stream::iter(vec![
        Ok(format!("{}\n\n", request.reading.summary())),
        Ok(INTERPRETATION_HEADER.to_string()),
    ]);

    let body = match interpreter.stream(key, request).await {
        Ok(fragments) => with_trailing_notice(fragments),
        Err(e) => {
            warn!(error = %e, method = %request.method, "Interpretation stream unavailable, using fallback");
            FragmentStream::from_fragments([fallback_text(&request.reading)])
        }
    };

    FragmentStream::new(preamble.chain(body))
}

/// Turn the first error item into a final notice fragment and stop there.
pub fn with_trailing_notice(fragments: FragmentStream) -> FragmentStream {
    FragmentStream::new(stream::unfold(Some(fragments), |state| async move {
        let mut fragments = state?;
        match fragments.next().await {
            Some(Ok(text)) => Some((Ok(text), Some(fragments))),
            Some(Err(e)) => {
                warn!(error = %e, "Interpretation stream broke off");
                fragments.close();
                Some((Ok(stream_error_notice(&e)), None))
            }
            None => None,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        complete: Result<String, InterpretError>,
        fragments: Option<Vec<Result<String, InterpretError>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Interpreter for Scripted {
        async fn complete(&self, _key: &ApiKey, _request: &InterpretRequest) -> Result<String, InterpretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.complete.clone()
        }

        async fn stream(
            &self,
            _key: &ApiKey,
            _request: &InterpretRequest,
        ) -> Result<FragmentStream, InterpretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fragments {
                Some(items) => Ok(FragmentStream::new(stream::iter(items.clone()))),
                None => Err(InterpretError::Connect("refused".to_string())),
            }
        }
    }

    fn request() -> InterpretRequest {
        InterpretRequest::new("事业运如何", Reading::PlumBlossom { numbers: [2, 5, 8] })
    }

    fn key() -> ApiKey {
        ApiKey::parse("ms-test").unwrap()
    }

    async fn collect(stream: FragmentStream) -> String {
        stream
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    #[test]
    fn test_user_prompt_embeds_method_question_and_reading() {
        let prompt = request().user_prompt();
        assert!(prompt.contains("占卜方式: 梅花易数"));
        assert!(prompt.contains("用户问题: 事业运如何"));
        assert!(prompt.contains("数字：2, 5, 8"));
        assert_eq!(prompt, request().user_prompt());
    }

    #[tokio::test]
    async fn test_blocking_fallback_embeds_reading() {
        let interpreter = Scripted {
            complete: Err(InterpretError::Status {
                status: 401,
                body: "bad key".to_string(),
            }),
            fragments: None,
            calls: AtomicUsize::new(0),
        };
        let text = interpret_or_fallback(&interpreter, &key(), &request()).await;
        assert!(text.starts_with("AI解读暂时不可用，使用默认解释："));
        assert!(text.contains("卦象：大畜卦"));
        assert_eq!(interpreter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_passes_answer_through() {
        let interpreter = Scripted {
            complete: Ok("大吉".to_string()),
            fragments: None,
            calls: AtomicUsize::new(0),
        };
        assert_eq!(interpret_or_fallback(&interpreter, &key(), &request()).await, "大吉");
    }

    #[tokio::test]
    async fn test_stream_leads_with_reading_summary() {
        let interpreter = Scripted {
            complete: Ok(String::new()),
            fragments: Some(vec![Ok("卦象".to_string()), Ok("大吉".to_string())]),
            calls: AtomicUsize::new(0),
        };
        let text = collect(stream_or_fallback(&interpreter, &key(), &request()).await).await;
        assert_eq!(text, "卦象：大畜卦\n数字：2, 5, 8\n\nAI解读：\n卦象大吉");
    }

    #[tokio::test]
    async fn test_stream_connect_failure_yields_fallback() {
        let interpreter = Scripted {
            complete: Ok(String::new()),
            fragments: None,
            calls: AtomicUsize::new(0),
        };
        let text = collect(stream_or_fallback(&interpreter, &key(), &request()).await).await;
        assert!(text.ends_with(&fallback_text(&request().reading)));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_adds_trailing_notice() {
        let fragments = FragmentStream::new(stream::iter(vec![
            Ok("卦象".to_string()),
            Err(InterpretError::Stream("connection reset".to_string())),
            Ok("never delivered".to_string()),
        ]));
        let text = collect(with_trailing_notice(fragments)).await;
        assert_eq!(
            text,
            "卦象\n流式输出过程中出现错误：stream interrupted: connection reset"
        );
    }

    #[tokio::test]
    async fn test_lenient_stream_never_yields_errors() {
        let interpreter = Scripted {
            complete: Ok(String::new()),
            fragments: Some(vec![
                Ok("卦象".to_string()),
                Err(InterpretError::Stream("connection reset".to_string())),
            ]),
            calls: AtomicUsize::new(0),
        };
        let items: Vec<_> = stream_or_fallback(&interpreter, &key(), &request())
            .await
            .collect()
            .await;
        assert!(items.iter().all(|item| item.is_ok()));
        assert_eq!(
            items.last(),
            Some(&Ok("\n流式输出过程中出现错误：stream interrupted: connection reset".to_string()))
        );
    }
}
