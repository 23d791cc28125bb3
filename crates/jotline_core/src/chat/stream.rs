//! Streaming chat-completions client.
//!
//! # Responsibility
//! - Send role-tagged messages to an OpenAI-compatible endpoint with
//!   `stream: true`.
//! - Decode server-sent `data:` frames into text and reasoning deltas.
//!
//! # Invariants
//! - Frames may be split across network chunks at any byte, including
//!   inside a UTF-8 sequence; only complete lines are decoded.
//! - `data: [DONE]` ends the stream; nothing after it is emitted.

use crate::api::client::join_api_path;
use crate::config::ChatSettings;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, info};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{Display, Formatter};

const DONE_SENTINEL: &str = "[DONE]";
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Chat operation errors.
#[derive(Debug)]
pub enum ChatError {
    MissingApiKey,
    InvalidUrl(String),
    Transport(reqwest::Error),
    Status { status: u16, body: String },
    Decode(serde_json::Error),
    /// Error object reported inside the stream.
    Remote(String),
    /// A generation could not be applied to the editor.
    Editor(crate::editor::entry_editor::EditorError),
}

impl Display for ChatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "chat api key is not configured"),
            Self::InvalidUrl(details) => write!(f, "invalid chat url: {details}"),
            Self::Transport(err) => write!(f, "chat transport error: {err}"),
            Self::Status { status, body } => write!(f, "chat endpoint returned {status}: {body}"),
            Self::Decode(err) => write!(f, "invalid chat frame: {err}"),
            Self::Remote(message) => write!(f, "chat endpoint error: {message}"),
            Self::Editor(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ChatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Decode(err) => Some(err),
            Self::Editor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value)
    }
}

impl From<crate::editor::entry_editor::EditorError> for ChatError {
    fn from(value: crate::editor::entry_editor::EditorError) -> Self {
        Self::Editor(value)
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message as sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireMessage {
    pub role: ChatRole,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Incremental output of one streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelta {
    Text(String),
    Reasoning(String),
}

pub type DeltaStream = BoxStream<'static, ChatResult<ChatDelta>>;

/// Seam over the chat endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Starts one streamed completion over `messages`.
    async fn stream_chat(&self, messages: Vec<WireMessage>) -> ChatResult<DeltaStream>;
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    choices: Vec<FrameChoice>,
    #[serde(default)]
    error: Option<FrameError>,
}

#[derive(Debug, Deserialize)]
struct FrameChoice {
    #[serde(default)]
    delta: Option<FrameDelta>,
}

#[derive(Debug, Deserialize)]
struct FrameDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameError {
    #[serde(default)]
    message: String,
}

/// Incremental decoder for `text/event-stream` completion bodies.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one network chunk and returns the deltas it completed.
    pub fn push(&mut self, chunk: &[u8]) -> ChatResult<Vec<ChatDelta>> {
        if self.done {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.decode_line(&line, &mut deltas)?;
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        Ok(deltas)
    }

    /// Decodes a trailing line left without a newline at end of body.
    pub fn finish(&mut self) -> ChatResult<Vec<ChatDelta>> {
        let mut deltas = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut deltas)?;
        }
        self.done = true;
        Ok(deltas)
    }

    fn decode_line(&mut self, raw: &[u8], deltas: &mut Vec<ChatDelta>) -> ChatResult<()> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(());
        }
        if payload == DONE_SENTINEL {
            self.done = true;
            return Ok(());
        }

        let frame: Frame = serde_json::from_str(payload)?;
        if let Some(error) = frame.error {
            return Err(ChatError::Remote(error.message));
        }
        for delta in frame.choices.into_iter().filter_map(|choice| choice.delta) {
            if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
                deltas.push(ChatDelta::Reasoning(reasoning));
            }
            if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
                deltas.push(ChatDelta::Text(content));
            }
        }
        Ok(())
    }
}

/// HTTP implementation of [`ChatBackend`].
pub struct ChatClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(settings: &ChatSettings) -> ChatResult<Self> {
        Self::with_client(Client::new(), settings)
    }

    pub fn with_client(http: Client, settings: &ChatSettings) -> ChatResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(ChatError::MissingApiKey)?;
        let endpoint = join_api_path(&settings.base_url, "chat/completions")
            .map_err(|err| ChatError::InvalidUrl(err.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model: settings.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn stream_chat(&self, messages: Vec<WireMessage>) -> ChatResult<DeltaStream> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
            });
        }
        info!(
            "event=chat_stream module=chat status=start model={} messages={}",
            self.model,
            messages.len()
        );

        let state = (
            response.bytes_stream().boxed(),
            SseDecoder::default(),
            VecDeque::new(),
        );
        let deltas = stream::unfold(state, |(mut bytes, mut decoder, mut queue)| async move {
            loop {
                if let Some(delta) = queue.pop_front() {
                    return Some((Ok(delta), (bytes, decoder, queue)));
                }
                if decoder.is_done() {
                    debug!("event=chat_stream module=chat status=done");
                    return None;
                }
                let decoded = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(err)) => Err(ChatError::Transport(err)),
                    None => decoder.finish(),
                };
                match decoded {
                    Ok(batch) => queue.extend(batch),
                    Err(err) => {
                        let _ = decoder.finish();
                        queue.clear();
                        return Some((Err(err), (bytes, decoder, queue)));
                    }
                }
            }
        });
        Ok(deltas.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatDelta, ChatError, SseDecoder};

    fn frame(delta: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{delta}}}]}}\n\n")
    }

    #[test]
    fn decodes_text_and_reasoning_channels() {
        let mut decoder = SseDecoder::default();
        let body = format!(
            "{}{}data: [DONE]\n\n",
            frame(r#"{"reasoning_content":"thinking"}"#),
            frame(r#"{"content":"Hello"}"#)
        );
        let deltas = decoder.push(body.as_bytes()).unwrap();
        assert_eq!(
            deltas,
            vec![
                ChatDelta::Reasoning("thinking".to_string()),
                ChatDelta::Text("Hello".to_string()),
            ]
        );
        assert!(decoder.is_done());
    }

    #[test]
    fn joins_frames_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let body = frame(r#"{"content":"héllo"}"#);
        let bytes = body.as_bytes();
        // Split inside the two-byte 'é'.
        let split = body.find('é').unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).unwrap().is_empty());
        assert_eq!(
            decoder.push(&bytes[split..]).unwrap(),
            vec![ChatDelta::Text("héllo".to_string())]
        );
    }

    #[test]
    fn ignores_comments_and_events_after_done() {
        let mut decoder = SseDecoder::default();
        let body = format!(
            ": keep-alive\ndata: [DONE]\n{}",
            frame(r#"{"content":"late"}"#)
        );
        assert!(decoder.push(body.as_bytes()).unwrap().is_empty());
        assert!(decoder.push(b"data: {}\n").unwrap().is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder
            .push(br#"data: {"choices":[{"delta":{"content":"tail"}}]}"#)
            .unwrap()
            .is_empty());
        assert_eq!(
            decoder.finish().unwrap(),
            vec![ChatDelta::Text("tail".to_string())]
        );
    }

    #[test]
    fn surfaces_remote_error_frames() {
        let mut decoder = SseDecoder::default();
        let result = decoder.push(b"data: {\"error\":{\"message\":\"quota\"}}\n");
        assert!(matches!(result, Err(ChatError::Remote(message)) if message == "quota"));
    }
}
