//! Upstream data-stream decoding and the append-only conversation it feeds.
//!
//! The upstream chat API frames its response as newline-separated
//! `<code>:<json>` records. [`decode_line`] turns one record into a [`Chunk`];
//! [`Conversation::apply`] folds chunks into the assistant message of the
//! current turn without ever dropping or reordering parts already applied.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::message::{Message, Part, Source, ToolInvocation, ToolState};
use crate::ui::Toast;

#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    MessageStart { message_id: String },
    Text(String),
    Reasoning(String),
    Source(Source),
    ToolCall { tool_call_id: String, tool_name: String, args: Value },
    ToolResult { tool_call_id: String, result: Value },
    StepFinish,
    Finish,
    Error(String),
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed stream line: {0}")]
    Malformed(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    tool_call_id: String,
    tool_name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultPayload {
    tool_call_id: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    message_id: String,
}

fn payload<T: for<'de> Deserialize<'de>>(line: &str, json: &str) -> Result<T, StreamError> {
    serde_json::from_str(json).map_err(|_| StreamError::Malformed(line.to_string()))
}

pub fn decode_line(line: &str) -> Result<Chunk, StreamError> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return Ok(Chunk::Ignored);
    }
    let (code, json) = line
        .split_once(':')
        .ok_or_else(|| StreamError::Malformed(line.to_string()))?;
    let chunk = match code {
        "0" => Chunk::Text(payload(line, json)?),
        "g" => Chunk::Reasoning(payload(line, json)?),
        "h" => Chunk::Source(payload(line, json)?),
        "9" => {
            let p: ToolCallPayload = payload(line, json)?;
            Chunk::ToolCall {
                tool_call_id: p.tool_call_id,
                tool_name: p.tool_name,
                args: p.args,
            }
        }
        "a" => {
            let p: ToolResultPayload = payload(line, json)?;
            Chunk::ToolResult {
                tool_call_id: p.tool_call_id,
                result: p.result,
            }
        }
        "f" => Chunk::MessageStart {
            message_id: payload::<StartPayload>(line, json)?.message_id,
        },
        "e" => Chunk::StepFinish,
        "d" => Chunk::Finish,
        "3" => Chunk::Error(payload(line, json)?),
        other => {
            tracing::debug!(code = other, "ignoring stream record");
            Chunk::Ignored
        }
    };
    Ok(chunk)
}

/// Splits a byte stream into lines, holding partial lines (and partial UTF-8
/// sequences) until their newline arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let line = std::mem::replace(&mut self.buf, rest);
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Streaming,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Streaming => "streaming",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
    pub status: Status,
    current: Option<usize>,
}

impl Conversation {
    pub fn with_history(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages,
            status: Status::Idle,
            current: None,
        }
    }

    pub fn push_user(&mut self, text: &str) -> &Message {
        self.messages.push(Message::user(text));
        self.begin();
        &self.messages[self.messages.len() - 1]
    }

    pub fn begin(&mut self) {
        self.status = Status::Streaming;
        self.current = None;
    }

    /// Removes the assistant message of an unfinished turn and returns its id.
    pub fn abandon(&mut self) -> Option<String> {
        let i = self.current.take()?;
        self.status = Status::Idle;
        Some(self.messages.remove(i).id)
    }

    fn assistant(&mut self, id: Option<&str>) -> usize {
        if let Some(i) = self.current {
            return i;
        }
        let id = id
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.messages.push(Message::assistant(id));
        let i = self.messages.len() - 1;
        self.current = Some(i);
        i
    }

    /// Returns the index of the message that changed, if any.
    pub fn apply(&mut self, chunk: Chunk) -> Result<Option<usize>, StreamError> {
        if self.status != Status::Streaming {
            tracing::debug!(chat = %self.id, "chunk arrived while idle, dropping");
            return Ok(None);
        }
        let idx = match chunk {
            Chunk::MessageStart { message_id } => self.assistant(Some(&message_id)),
            Chunk::Text(delta) => {
                let i = self.assistant(None);
                let parts = &mut self.messages[i].parts;
                match parts.last_mut() {
                    Some(Part::Text { text }) => text.push_str(&delta),
                    _ => parts.push(Part::Text { text: delta }),
                }
                i
            }
            Chunk::Reasoning(delta) => {
                let i = self.assistant(None);
                let parts = &mut self.messages[i].parts;
                match parts.last_mut() {
                    Some(Part::Reasoning { reasoning, .. }) => reasoning.push_str(&delta),
                    _ => parts.push(Part::Reasoning {
                        reasoning: delta,
                        details: Vec::new(),
                    }),
                }
                i
            }
            Chunk::Source(source) => {
                let i = self.assistant(None);
                self.messages[i].parts.push(Part::Source { source });
                i
            }
            Chunk::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                let i = self.assistant(None);
                self.messages[i].parts.push(Part::ToolInvocation {
                    tool_invocation: ToolInvocation {
                        tool_name,
                        tool_call_id,
                        state: ToolState::Call,
                        args,
                        result: None,
                    },
                });
                i
            }
            Chunk::ToolResult {
                tool_call_id,
                result,
            } => {
                let Some(i) = self.current else {
                    tracing::warn!(
                        chat = %self.id,
                        call = %tool_call_id,
                        "tool result before any assistant output"
                    );
                    return Ok(None);
                };
                let target = self.messages[i].parts.iter_mut().find_map(|p| match p {
                    Part::ToolInvocation { tool_invocation }
                        if tool_invocation.tool_call_id == tool_call_id =>
                    {
                        Some(tool_invocation)
                    }
                    _ => None,
                });
                match target {
                    Some(inv) => {
                        inv.state = ToolState::Result;
                        inv.result = Some(result);
                    }
                    None => {
                        tracing::warn!(
                            chat = %self.id,
                            call = %tool_call_id,
                            "tool result without matching call"
                        );
                        return Ok(None);
                    }
                }
                i
            }
            Chunk::Error(msg) => return Err(StreamError::Upstream(msg)),
            Chunk::StepFinish | Chunk::Finish | Chunk::Ignored => return Ok(None),
        };
        Ok(Some(idx))
    }

    /// Ends the turn and returns the finalized assistant message, if one was produced.
    pub fn finish(&mut self) -> Option<Message> {
        self.status = Status::Idle;
        self.current.take().map(|i| self.messages[i].clone())
    }

    /// Ends the turn after a stream failure. Messages are left as they are.
    pub fn fail(&mut self, err: &StreamError) -> Toast {
        tracing::error!(chat = %self.id, error = %err, "chat stream failed");
        self.status = Status::Idle;
        self.current = None;
        Toast::error(format!("The assistant could not finish its answer: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::Role;
    use serde_json::json;

    #[test]
    fn decodes_known_records() {
        assert_eq!(decode_line(r#"0:"Hel""#).unwrap(), Chunk::Text("Hel".into()));
        assert_eq!(decode_line(r#"g:"hmm""#).unwrap(), Chunk::Reasoning("hmm".into()));
        assert_eq!(
            decode_line(r#"f:{"messageId":"m-1"}"#).unwrap(),
            Chunk::MessageStart {
                message_id: "m-1".into()
            }
        );
        let call = r#"9:{"toolCallId":"c1","toolName":"getInformation","args":{"question":"q"}}"#;
        assert_eq!(
            decode_line(call).unwrap(),
            Chunk::ToolCall {
                tool_call_id: "c1".into(),
                tool_name: "getInformation".into(),
                args: json!({"question": "q"}),
            }
        );
        let source = decode_line(r#"h:{"sourceType":"url","id":"s","url":"https://x"}"#).unwrap();
        assert!(matches!(source, Chunk::Source(s) if s.url == "https://x"));
        assert_eq!(decode_line(r#"d:{"finishReason":"stop"}"#).unwrap(), Chunk::Finish);
        assert_eq!(decode_line(r#"8:[{"k":1}]"#).unwrap(), Chunk::Ignored);
        assert_eq!(decode_line("").unwrap(), Chunk::Ignored);
    }

    #[test]
    fn rejects_malformed_records() {
        assert!(matches!(decode_line("no-colon"), Err(StreamError::Malformed(_))));
        assert!(matches!(decode_line("0:not-json"), Err(StreamError::Malformed(_))));
    }

    #[test]
    fn splitter_handles_chunk_boundaries() {
        let mut s = LineSplitter::default();
        assert!(s.push(b"0:\"a").is_empty());
        assert_eq!(s.push(b"b\"\n0:\"\xC3"), vec!["0:\"ab\"".to_string()]);
        assert_eq!(s.push(b"\xA9\"\nd:{}"), vec!["0:\"\u{e9}\"".to_string()]);
        assert_eq!(s.finish().as_deref(), Some("d:{}"));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn chunks_append_to_the_current_assistant_message() {
        let mut c = Conversation::with_history("chat", Vec::new());
        c.push_user("hi");
        c.apply(Chunk::MessageStart {
            message_id: "a1".into(),
        })
        .unwrap();
        c.apply(Chunk::Text("Hel".into())).unwrap();
        c.apply(Chunk::Text("lo".into())).unwrap();
        c.apply(Chunk::ToolCall {
            tool_call_id: "c1".into(),
            tool_name: "getInformation".into(),
            args: json!({}),
        })
        .unwrap();
        let before: Vec<Part> = c.messages[1].parts.clone();
        c.apply(Chunk::Text(" again".into())).unwrap();
        c.apply(Chunk::ToolResult {
            tool_call_id: "c1".into(),
            result: json!([]),
        })
        .unwrap();

        let parts = &c.messages[1].parts;
        assert_eq!(c.messages[1].id, "a1");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], before[0]);
        assert_eq!(parts[2], Part::Text { text: " again".into() });
        assert!(matches!(
            &parts[1],
            Part::ToolInvocation { tool_invocation } if tool_invocation.state == ToolState::Result
        ));

        let done = c.finish().unwrap();
        assert_eq!(done.text(), "Hello\n\n again");
        assert_eq!(c.status, Status::Idle);
    }

    #[test]
    fn upstream_error_leaves_messages_intact() {
        let mut c = Conversation::with_history("chat", Vec::new());
        c.push_user("hi");
        c.apply(Chunk::Text("partial".into())).unwrap();
        let err = c.apply(Chunk::Error("rate limited".into())).unwrap_err();
        let toast = c.fail(&err);
        assert!(toast.text.contains("rate limited"));
        assert_eq!(c.messages.len(), 2);
        assert_eq!(c.messages[1].text(), "partial");
        assert_eq!(c.status, Status::Idle);
    }

    #[test]
    fn idle_conversation_ignores_chunks() {
        let mut c = Conversation::with_history("chat", Vec::new());
        assert_eq!(c.apply(Chunk::Text("x".into())).unwrap(), None);
        assert!(c.messages.is_empty());
    }

    #[test]
    fn orphan_tool_result_is_dropped() {
        let mut c = Conversation::with_history("chat", Vec::new());
        c.push_user("hi");
        let orphan = Chunk::ToolResult {
            tool_call_id: "nope".into(),
            result: json!(1),
        };
        assert_eq!(c.apply(orphan).unwrap(), None);
        assert_eq!(c.messages.len(), 1);
    }

    #[test]
    fn superseded_turn_leaves_no_partial_answer_behind() {
        let mut c = Conversation::with_history("chat", Vec::new());
        c.push_user("first");
        c.apply(Chunk::Text("half an ans".into())).unwrap();
        let partial = c.messages[1].id.clone();

        assert_eq!(c.abandon(), Some(partial));
        assert_eq!(c.abandon(), None);
        c.push_user("second");

        let history: Vec<_> = c.messages.iter().map(|m| (m.role, m.text())).collect();
        assert_eq!(
            history,
            vec![
                (Role::User, "first".to_string()),
                (Role::User, "second".to_string())
            ]
        );
        c.apply(Chunk::Text("fresh".into())).unwrap();
        assert_eq!(c.messages[2].text(), "fresh");
    }
}
