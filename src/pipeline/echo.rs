//! Echo pipeline — streams the input back word by word.
//!
//! Stands in for a model-backed crew so the service runs without a provider.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ExecutionPipeline, JobInput, PipelineItem, ProgressStream};
use crate::error::PipelineError;

/// Replies with the input text, one `token` progress item per word.
#[derive(Debug, Clone)]
pub struct EchoPipeline {
    token_delay: Duration,
}

impl EchoPipeline {
    pub fn new(token_delay: Duration) -> Self {
        Self { token_delay }
    }
}

impl Default for EchoPipeline {
    fn default() -> Self {
        Self::new(Duration::from_millis(25))
    }
}

struct EchoRun {
    pending: VecDeque<PipelineItem>,
    words: VecDeque<String>,
    reply: String,
    cancel: CancellationToken,
    delay: Duration,
    done: bool,
}

#[async_trait]
impl ExecutionPipeline for EchoPipeline {
    fn name(&self) -> &str {
        "echo"
    }

    fn validate(&self, input: &JobInput) -> Result<(), PipelineError> {
        if input.text().trim().is_empty() {
            return Err(PipelineError::InvalidInput("input must not be empty".to_string()));
        }
        Ok(())
    }

    async fn run(
        &self,
        input: JobInput,
        cancel: CancellationToken,
    ) -> Result<ProgressStream, PipelineError> {
        let mut pending = VecDeque::new();
        if let JobInput::Chat { history, .. } = &input {
            pending.push_back(PipelineItem::Progress(json!({
                "type": "context",
                "messages": history.len(),
            })));
        }

        let reply = input.text().trim().to_string();
        let run = EchoRun {
            pending,
            words: reply.split_whitespace().map(str::to_string).collect(),
            reply,
            cancel,
            delay: self.token_delay,
            done: false,
        };

        let items = stream::unfold(run, |mut run| async move {
            if run.done {
                return None;
            }
            if let Some(item) = run.pending.pop_front() {
                return Some((item, run));
            }
            if run.cancel.is_cancelled() {
                run.done = true;
                return Some((PipelineItem::Cancelled, run));
            }

            let Some(word) = run.words.pop_front() else {
                run.done = true;
                let reply = serde_json::Value::String(run.reply.clone());
                return Some((PipelineItem::Result(reply), run));
            };

            let cancel = run.cancel.clone();
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(run.delay) => false,
            };
            if cancelled {
                run.done = true;
                return Some((PipelineItem::Cancelled, run));
            }

            let item = PipelineItem::Progress(json!({
                "type": "token",
                "content": word,
            }));
            Some((item, run))
        });

        Ok(Box::pin(items))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn crew(input: &str) -> JobInput {
        JobInput::Crew {
            crew_id: "1".to_string(),
            input: input.to_string(),
        }
    }

    #[tokio::test]
    async fn echoes_tokens_then_result() {
        let pipeline = EchoPipeline::new(Duration::ZERO);
        let items: Vec<PipelineItem> = pipeline
            .run(crew("hello  brave world"), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 4);
        assert_eq!(
            items[0],
            PipelineItem::Progress(json!({"type": "token", "content": "hello"}))
        );
        assert_eq!(
            items[3],
            PipelineItem::Result(json!("hello  brave world"))
        );
    }

    #[tokio::test]
    async fn chat_input_reports_context_size() {
        let pipeline = EchoPipeline::new(Duration::ZERO);
        let input = JobInput::Chat {
            thread_id: uuid::Uuid::new_v4(),
            message: "hi".to_string(),
            history: vec![crate::threads::Message::user("hi")],
        };
        let items: Vec<PipelineItem> = pipeline
            .run(input, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            items[0],
            PipelineItem::Progress(json!({"type": "context", "messages": 1}))
        );
        assert!(matches!(items.last(), Some(PipelineItem::Result(_))));
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let pipeline = EchoPipeline::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let mut items = pipeline
            .run(crew("one two three"), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();
        assert_eq!(items.next().await, Some(PipelineItem::Cancelled));
        assert_eq!(items.next().await, None);
    }

    #[test]
    fn rejects_blank_input() {
        let pipeline = EchoPipeline::default();
        assert!(matches!(
            pipeline.validate(&crew("   ")),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(pipeline.validate(&crew("go")).is_ok());
    }
}
