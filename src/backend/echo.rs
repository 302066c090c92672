//! Echo Provider（用于测试与本地联调，无需模型 API）
//!
//! 把用户消息回显为逐词的流式分块，可选每块之间的延迟。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use super::{ChunkStream, Provider};
use crate::protocol::ContextBundle;

#[derive(Debug, Default, Clone)]
pub struct EchoProvider {
    delay: Option<Duration>,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个分块之前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn reply(prompt: &str, context: Option<&ContextBundle>) -> String {
        let prompt = if prompt.trim().is_empty() { "(no input)" } else { prompt };
        match context.and_then(|c| c.current_buffer.as_ref()) {
            Some(buffer) => format!("Echo: {} [{}]", prompt, buffer.path),
            None => format!("Echo: {}", prompt),
        }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        context: Option<&ContextBundle>,
    ) -> Result<ChunkStream, String> {
        let reply = Self::reply(prompt, context);
        let words: Vec<String> = reply
            .split_inclusive(' ')
            .map(|w| w.to_string())
            .collect();
        let delay = self.delay;
        let chunks = stream::iter(words).then(move |word| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, String>(word)
        });
        Ok(Box::pin(chunks))
    }
}
