//! Response assembler: one ordered output stream per request.
//!
//! Relays generation chunks to the caller's sink in arrival order. An
//! interrupted stream gets one trailing notice; a sink that closes drops the
//! generation stream, which releases its connection.

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::inference::{GenerationEvent, GenerationStream};

use super::merge::INCOMPLETE_NOTICE;

// ─── OutputSink ──────────────────────────────────────────────────────────────

/// The caller went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("output sink closed")]
pub struct SinkClosed;

/// Where the answer is streamed. The surrounding web layer adapts its
/// response body to this; a `tokio::sync::mpsc::Sender<String>` works as is.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send(&self, chunk: String) -> Result<(), SinkClosed>;

    /// Resolves once the receiving side is gone.
    async fn closed(&self);
}

#[async_trait]
impl OutputSink for mpsc::Sender<String> {
    async fn send(&self, chunk: String) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, chunk).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

// ─── Relay ───────────────────────────────────────────────────────────────────

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    /// The stream ended abnormally; the incomplete notice was sent.
    Interrupted { reason: String },
    /// The sink closed first; the stream was dropped.
    Cancelled,
}

/// Stream `preamble` (if any) and then every chunk of `stream` into `sink`.
pub async fn relay<S>(preamble: Option<&str>, mut stream: GenerationStream, sink: &S) -> RelayOutcome
where
    S: OutputSink + ?Sized,
{
    if let Some(text) = preamble {
        if sink.send(format!("{text}\n\n")).await.is_err() {
            return RelayOutcome::Cancelled;
        }
    }

    let mut chunks = 0usize;
    loop {
        let event = tokio::select! {
            biased;
            _ = sink.closed() => {
                tracing::info!(chunks, "caller disconnected, dropping generation stream");
                return RelayOutcome::Cancelled;
            }
            event = stream.next() => event,
        };

        match event {
            None => {
                tracing::debug!(chunks, "generation stream complete");
                return RelayOutcome::Completed;
            }
            Some(GenerationEvent::Chunk(text)) => {
                if text.is_empty() {
                    continue;
                }
                chunks += 1;
                if sink.send(text).await.is_err() {
                    tracing::info!(chunks, "caller disconnected mid-answer");
                    return RelayOutcome::Cancelled;
                }
            }
            Some(GenerationEvent::Interrupted { reason }) => {
                tracing::warn!(chunks, reason = %reason, "generation stream interrupted");
                if sink.send(format!("\n\n{INCOMPLETE_NOTICE}")).await.is_err() {
                    return RelayOutcome::Cancelled;
                }
                return RelayOutcome::Interrupted { reason };
            }
        }
    }
}

/// Send a whole answer that did not come from the model.
pub async fn deliver<S>(text: &str, sink: &S) -> Result<(), SinkClosed>
where
    S: OutputSink + ?Sized,
{
    sink.send(text.to_string()).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::inference::{ChatMessage, LanguageModel, SamplingParams};
    use crate::test_support::FakeModel;

    fn events(items: Vec<GenerationEvent>) -> GenerationStream {
        Box::pin(futures::stream::iter(items))
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (tx, rx) = mpsc::channel(16);
        let stream = events(vec![
            GenerationEvent::Chunk("Hello".into()),
            GenerationEvent::Chunk(String::new()),
            GenerationEvent::Chunk(", world".into()),
        ]);
        let outcome = relay(None, stream, &tx).await;
        drop(tx);
        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(drain(rx).await, vec!["Hello", ", world"]);
    }

    #[tokio::test]
    async fn test_preamble_comes_first() {
        let (tx, rx) = mpsc::channel(16);
        let stream = events(vec![GenerationEvent::Chunk("answer".into())]);
        relay(Some("Note: x"), stream, &tx).await;
        drop(tx);
        assert_eq!(drain(rx).await, vec!["Note: x\n\n", "answer"]);
    }

    #[tokio::test]
    async fn test_interruption_appends_one_notice() {
        let (tx, rx) = mpsc::channel(16);
        let stream = events(vec![
            GenerationEvent::Chunk("partial".into()),
            GenerationEvent::Interrupted {
                reason: "connection reset".into(),
            },
        ]);
        let outcome = relay(None, stream, &tx).await;
        drop(tx);
        assert_eq!(
            outcome,
            RelayOutcome::Interrupted {
                reason: "connection reset".into()
            }
        );
        let out = drain(rx).await;
        assert_eq!(out.len(), 2);
        assert!(out[1].contains(INCOMPLETE_NOTICE));
    }

    #[tokio::test]
    async fn test_closed_sink_drops_stream() {
        let model = FakeModel::new().endless();
        let stream = model
            .stream_generate("m", &[ChatMessage::user("hi")], SamplingParams::default())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let reader = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), relay(None, stream, &tx))
            .await
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Cancelled);
        assert_eq!(reader.await.unwrap().as_deref(), Some("tick "));
        assert!(model.stream_dropped());
    }

    #[tokio::test]
    async fn test_deliver_to_closed_sink_fails() {
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(rx);
        assert_eq!(deliver("hi", &tx).await, Err(SinkClosed));
    }
}
