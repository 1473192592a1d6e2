//! Model server client.
//!
//! Speaks the OpenAI-compatible surface of the model server: health,
//! model listing, chat and plain completions, embeddings, and streamed chat
//! generation. Non-streaming calls are retried under the model policy;
//! streaming retries only the opening of the stream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::transport::{HttpTransport, RetryPolicy, TransportError};

use super::errors::InferenceError;
use super::streaming::{parse_completion_body, parse_sse_stream, GenerationStream};
use super::types::{
    ChatCompletionRequest, ChatMessage, CompletionRequest, EmbeddingRequest, ModelInfo,
    SamplingParams,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the diagnostic health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ─── LanguageModel ───────────────────────────────────────────────────────────

/// The generation surface the orchestrator depends on. Tests substitute an
/// in-memory fake.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Whole-answer chat completion, used for classification and extraction.
    async fn complete_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        sampling: SamplingParams,
    ) -> Result<String, InferenceError>;

    /// Open a streamed chat completion.
    async fn stream_generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        sampling: SamplingParams,
    ) -> Result<GenerationStream, InferenceError>;

    async fn health(&self) -> bool;
}

// ─── ModelClient ─────────────────────────────────────────────────────────────

/// Client for the model server over the shared transport.
#[derive(Debug, Clone)]
pub struct ModelClient {
    transport: HttpTransport,
    base_url: String,
    policy: RetryPolicy,
    /// Longest gap tolerated between two reads of a generation stream.
    stream_idle_timeout: Duration,
}

impl ModelClient {
    pub fn new(
        transport: HttpTransport,
        base_url: impl Into<String>,
        policy: RetryPolicy,
        stream_idle_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transport,
            base_url,
            policy,
            stream_idle_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value, InferenceError> {
        let outcome = self
            .transport
            .send_with_retry(Method::POST, url, Some(&body), &self.policy)
            .await;
        tracing::debug!(
            url = %url,
            attempts = outcome.attempts,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            ok = outcome.result.is_ok(),
            "model request finished"
        );
        Ok(outcome.result?)
    }

    /// `GET /models`.
    ///
    /// Accepts `{"models": [...]}`, OpenAI's `{"data": [{"id": ..}]}` or a
    /// bare array; entries may be objects or plain names.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = self.url("/models");
        let body = self
            .transport
            .send_with_retry(Method::GET, &url, None, &self.policy)
            .await
            .result?;
        parse_model_list(body)
    }

    /// `POST /chat/completions` without streaming.
    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        sampling: SamplingParams,
    ) -> Result<String, InferenceError> {
        let url = self.url("/chat/completions");
        let request = ChatCompletionRequest {
            model,
            messages,
            sampling,
            stream: false,
        };
        let body = serde_json::to_value(&request).map_err(|e| InferenceError::Parse {
            what: "chat request",
            reason: e.to_string(),
        })?;

        tracing::info!(
            url = %url,
            model = %model,
            message_count = messages.len(),
            max_tokens = sampling.max_tokens,
            "chat completion request"
        );

        let response = self.post_json(&url, body).await?;
        parse_completion_body(&url, &response)
    }

    /// `POST /completions`.
    pub async fn completion(
        &self,
        model: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, InferenceError> {
        let url = self.url("/completions");
        let request = CompletionRequest {
            model,
            prompt,
            temperature,
            max_tokens,
        };
        let body = serde_json::to_value(&request).map_err(|e| InferenceError::Parse {
            what: "completion request",
            reason: e.to_string(),
        })?;
        let response = self.post_json(&url, body).await?;
        parse_completion_body(&url, &response)
    }

    /// `POST /embeddings`, one vector per input in input order.
    ///
    /// Per-token (2D) embeddings are mean-pooled into a single vector.
    pub async fn embeddings(&self, model: &str, input: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.url("/embeddings");
        let request = EmbeddingRequest { model, input };
        let body = serde_json::to_value(&request).map_err(|e| InferenceError::Parse {
            what: "embedding request",
            reason: e.to_string(),
        })?;
        let response = self.post_json(&url, body).await?;
        let vectors = parse_embeddings(&response)?;

        if vectors.len() != input.len() {
            return Err(InferenceError::Parse {
                what: "embedding response",
                reason: format!("expected {} vectors, got {}", input.len(), vectors.len()),
            });
        }
        Ok(vectors)
    }
}

#[async_trait]
impl LanguageModel for ModelClient {
    async fn complete_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        sampling: SamplingParams,
    ) -> Result<String, InferenceError> {
        self.chat_completion(model, messages, sampling).await
    }

    async fn stream_generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        sampling: SamplingParams,
    ) -> Result<GenerationStream, InferenceError> {
        let url = self.url("/chat/completions");
        let request = ChatCompletionRequest {
            model,
            messages,
            sampling,
            stream: true,
        };
        let body = serde_json::to_value(&request).map_err(|e| InferenceError::Parse {
            what: "chat request",
            reason: e.to_string(),
        })?;

        tracing::info!(
            url = %url,
            model = %model,
            message_count = messages.len(),
            max_tokens = sampling.max_tokens,
            "opening generation stream"
        );

        let outcome = self.transport.open_stream(&url, &body, &self.policy).await;
        let response = outcome.result?;

        tracing::debug!(url = %url, attempts = outcome.attempts, "generation stream open");
        Ok(parse_sse_stream(response, self.stream_idle_timeout))
    }

    async fn health(&self) -> bool {
        self.transport.probe(&self.url("/health"), HEALTH_TIMEOUT).await
    }
}

// ─── Response parsing ────────────────────────────────────────────────────────

fn parse_model_list(body: serde_json::Value) -> Result<Vec<ModelInfo>, InferenceError> {
    let list = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("models").or_else(|| map.remove("data")) {
            Some(serde_json::Value::Array(items)) => items,
            _ => {
                return Err(InferenceError::Parse {
                    what: "model list",
                    reason: "expected `models` or `data` array".to_string(),
                })
            }
        },
        other => {
            return Err(InferenceError::Parse {
                what: "model list",
                reason: format!("unexpected body: {other}"),
            })
        }
    };

    Ok(list
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::String(name) => Some(ModelInfo {
                name,
                description: String::new(),
            }),
            serde_json::Value::Object(map) => {
                let name = map
                    .get("name")
                    .or_else(|| map.get("id"))
                    .or_else(|| map.get("model"))
                    .and_then(|v| v.as_str())?
                    .to_string();
                let description = map
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(ModelInfo { name, description })
            }
            _ => None,
        })
        .collect())
}

/// Accepts `{"data": [{"index", "embedding"}]}` or `{"embeddings": [..]}`.
fn parse_embeddings(body: &serde_json::Value) -> Result<Vec<Vec<f32>>, InferenceError> {
    if let Some(data) = body.get("data").and_then(|d| d.as_array()) {
        let mut items: Vec<(u64, &serde_json::Value)> = data
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| {
                let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
                item.get("embedding").map(|e| (index, e))
            })
            .collect();
        // Order must match the input
        items.sort_by_key(|(index, _)| *index);
        return items.into_iter().map(|(_, e)| mean_pool_embedding(e)).collect();
    }

    if let Some(list) = body.get("embeddings").and_then(|d| d.as_array()) {
        return list.iter().map(mean_pool_embedding).collect();
    }

    Err(InferenceError::Parse {
        what: "embedding response",
        reason: "expected `data` or `embeddings` array".to_string(),
    })
}

/// Mean-pool per-token embeddings into a single vector.
///
/// A 1D array is returned as-is; a 2D array is averaged over its rows.
fn mean_pool_embedding(embedding: &serde_json::Value) -> Result<Vec<f32>, InferenceError> {
    let Some(rows) = embedding.as_array() else {
        return Err(InferenceError::Parse {
            what: "embedding",
            reason: "expected number[] or number[][]".to_string(),
        });
    };

    match rows.first() {
        None => Ok(Vec::new()),
        Some(first) if first.is_number() => Ok(rows
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect()),
        Some(first) if first.is_array() => {
            let tokens: Vec<Vec<f32>> = rows
                .iter()
                .filter_map(|row| {
                    row.as_array()
                        .map(|r| r.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
                })
                .collect();

            let n_dim = tokens.first().map(Vec::len).unwrap_or(0);
            let mut pooled = vec![0.0_f32; n_dim];
            for token in &tokens {
                for (d, val) in token.iter().take(n_dim).enumerate() {
                    pooled[d] += val;
                }
            }
            let n_tokens = tokens.len().max(1) as f32;
            for val in &mut pooled {
                *val /= n_tokens;
            }
            Ok(pooled)
        }
        Some(_) => Err(InferenceError::Parse {
            what: "embedding",
            reason: "expected number[] or number[][]".to_string(),
        }),
    }
}

/// Surface a transport error for logs without the response body.
pub fn describe_failure(err: &InferenceError) -> String {
    match err {
        InferenceError::Transport(TransportError::NonRetryable { status, endpoint, .. })
        | InferenceError::Transport(TransportError::Server { status, endpoint, .. }) => {
            format!("HTTP {status} from {endpoint}")
        }
        other => other.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::streaming::GenerationEvent;
    use crate::test_support::{Reply, ScriptedServer};
    use futures::StreamExt;

    fn client(base: &str) -> ModelClient {
        ModelClient::new(
            HttpTransport::new().unwrap(),
            base,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                backoff_multiplier: 2.0,
                per_attempt_timeout: Duration::from_millis(500),
            },
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_parse_model_list_shapes() {
        let ours = serde_json::json!({"models": [{"name": "gemma3:12b-it-qat", "description": "default"}]});
        assert_eq!(parse_model_list(ours).unwrap()[0].name, "gemma3:12b-it-qat");

        let openai = serde_json::json!({"object": "list", "data": [{"id": "qwen2.5"}]});
        assert_eq!(parse_model_list(openai).unwrap()[0].name, "qwen2.5");

        let bare = serde_json::json!(["a", {"name": "b"}]);
        let names: Vec<String> = parse_model_list(bare).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(parse_model_list(serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_mean_pool_1d_passthrough() {
        let v = mean_pool_embedding(&serde_json::json!([0.5, 1.0])).unwrap();
        assert_eq!(v, vec![0.5, 1.0]);
    }

    #[test]
    fn test_mean_pool_2d_averaging() {
        let v = mean_pool_embedding(&serde_json::json!([[1.0, 2.0], [3.0, 4.0]])).unwrap();
        assert_eq!(v, vec![2.0, 3.0]);
    }

    #[test]
    fn test_mean_pool_rejects_objects() {
        assert!(mean_pool_embedding(&serde_json::json!({"x": 1})).is_err());
    }

    #[test]
    fn test_parse_embeddings_sorts_by_index() {
        let body = serde_json::json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]}
        ]});
        assert_eq!(parse_embeddings(&body).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[tokio::test]
    async fn test_chat_completion_round_trip() {
        let server = ScriptedServer::start(vec![Reply::json(
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"Paris."},"finish_reason":"stop"}]}"#,
        )])
        .await;
        let answer = client(&server.base_url())
            .chat_completion("m", &[ChatMessage::user("capital of France?")], SamplingParams::default())
            .await
            .unwrap();
        assert_eq!(answer, "Paris.");

        let seen = server.captured();
        assert_eq!(seen[0].path, "/chat/completions");
        let body = seen[0].json();
        assert_eq!(body["stream"], false);
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["messages"][0]["content"], "capital of France?");
    }

    #[tokio::test]
    async fn test_completion_posts_prompt() {
        let server = ScriptedServer::start(vec![Reply::json(200, r#"{"choices":[{"text":"YES"}]}"#)]).await;
        let answer = client(&server.base_url()).completion("m", "weather?", 0.1, 8).await.unwrap();
        assert_eq!(answer, "YES");
        assert_eq!(server.captured()[0].json()["prompt"], "weather?");
    }

    #[tokio::test]
    async fn test_embeddings_length_mismatch_is_error() {
        let server =
            ScriptedServer::start(vec![Reply::json(200, r#"{"data":[{"index":0,"embedding":[1.0]}]}"#)]).await;
        let err = client(&server.base_url())
            .embeddings("m", &["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_stream_generate_relays_chunks() {
        let server = ScriptedServer::start(vec![Reply::sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"맑음\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\", 21°C\"}}]}\n\n",
            "data: [DONE]\n\n",
        ])])
        .await;
        let stream = client(&server.base_url())
            .stream_generate("m", &[ChatMessage::user("날씨")], SamplingParams::default())
            .await
            .unwrap();
        let events: Vec<GenerationEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                GenerationEvent::Chunk("맑음".into()),
                GenerationEvent::Chunk(", 21°C".into())
            ]
        );
        assert_eq!(server.captured()[0].json()["stream"], true);
    }

    #[tokio::test]
    async fn test_stream_dropped_mid_way_ends_interrupted() {
        let server = ScriptedServer::start(vec![Reply::sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n\n",
        ])])
        .await;
        let stream = client(&server.base_url())
            .stream_generate("m", &[ChatMessage::user("hi")], SamplingParams::default())
            .await
            .unwrap();
        let events: Vec<GenerationEvent> = stream.collect().await;
        assert_eq!(events[0], GenerationEvent::Chunk("part".into()));
        assert!(matches!(events.last(), Some(GenerationEvent::Interrupted { .. })));
    }

    #[tokio::test]
    async fn test_stream_open_retries_then_fails() {
        let server = ScriptedServer::start(vec![Reply::json(503, r#"{"error":"loading"}"#)]).await;
        let result = client(&server.base_url())
            .stream_generate("m", &[ChatMessage::user("hi")], SamplingParams::default())
            .await;
        assert!(matches!(
            result,
            Err(InferenceError::Transport(TransportError::Server { status: 503, .. }))
        ));
        assert_eq!(server.requests(), 2);
    }

    #[test]
    fn test_describe_failure_hides_body() {
        let err = InferenceError::Transport(TransportError::Server {
            endpoint: "http://m/chat/completions".into(),
            status: 500,
            body: "Traceback (most recent call last)".into(),
        });
        assert_eq!(describe_failure(&err), "HTTP 500 from http://m/chat/completions");
    }
}
