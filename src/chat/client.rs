use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::endpoint::Endpoint;
use super::message::Message;
use super::stream::{Chunk, LineSplitter, StreamError, decode_line};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    id: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    option: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Finished,
    Cancelled,
}

/// Streams a turn from the upstream chat API.
#[derive(Clone)]
pub struct ChatClient {
    pub base_url: String,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: reqwest::Client::new() }
    }

    /// Decoded chunks go to `tx` in arrival order. Cancellation, or the
    /// receiver going away, ends the call with [`StreamEnd::Cancelled`].
    pub async fn stream(
        &self,
        endpoint: Endpoint,
        chat_id: &str,
        messages: &[Message],
        option: Option<&str>,
        cancel: &CancellationToken,
        tx: mpsc::Sender<Chunk>,
    ) -> Result<StreamEnd, StreamError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), endpoint.path());
        let body = ChatRequest { id: chat_id, messages, option };
        tracing::debug!(%url, chat = chat_id, messages = messages.len(), "opening upstream stream");

        let resp = tokio::select! {
            r = self.client.post(&url).json(&body).send() => r?,
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        };
        if !resp.status().is_success() {
            return Err(StreamError::Status(resp.status()));
        }

        let mut bytes = resp.bytes_stream();
        let mut lines = LineSplitter::default();
        loop {
            let next = tokio::select! {
                n = bytes.next() => n,
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            };
            let Some(chunk) = next else { break };
            for line in lines.push(&chunk?) {
                if tx.send(decode_line(&line)?).await.is_err() {
                    return Ok(StreamEnd::Cancelled);
                }
            }
        }
        if let Some(line) = lines.finish() {
            if tx.send(decode_line(&line)?).await.is_err() {
                return Ok(StreamEnd::Cancelled);
            }
        }
        Ok(StreamEnd::Finished)
    }
}
