//! Assistant chat session.
//!
//! Keeps the role-tagged transcript of one conversation. Assistant replies
//! are ordered parts so the reasoning channel can be shown apart from the
//! answer text.

use crate::chat::stream::{ChatBackend, ChatDelta, ChatError, ChatResult, ChatRole, WireMessage};
use crate::editor::markdown::markdown_to_html;
use futures::StreamExt;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One part of a transcript message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u64,
    pub role: ChatRole,
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    /// Concatenated text parts (reasoning excluded).
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text(text) => Some(text.as_str()),
                MessagePart::Reasoning(_) => None,
            })
            .collect()
    }

    /// Text parts rendered as editor HTML.
    pub fn text_html(&self) -> String {
        markdown_to_html(&self.text())
    }

    fn push_delta(&mut self, delta: ChatDelta) {
        match (self.parts.last_mut(), delta) {
            (Some(MessagePart::Text(text)), ChatDelta::Text(more)) => text.push_str(&more),
            (Some(MessagePart::Reasoning(text)), ChatDelta::Reasoning(more)) => {
                text.push_str(&more)
            }
            (_, ChatDelta::Text(more)) => self.parts.push(MessagePart::Text(more)),
            (_, ChatDelta::Reasoning(more)) => self.parts.push(MessagePart::Reasoning(more)),
        }
    }
}

/// How a `send` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input; nothing was sent.
    Ignored,
    Completed,
    /// Stopped through the cancellation token; the partial reply is kept.
    Stopped,
}

pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    system_prompt: Option<String>,
    messages: Vec<ChatMessage>,
    next_id: u64,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            system_prompt: None,
            messages: Vec::new(),
            next_id: 0,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_reply(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == ChatRole::Assistant)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Sends `text` and streams the reply into the transcript.
    ///
    /// `on_delta` observes every delta as it arrives. A failed stream keeps
    /// whatever part of the reply was received.
    pub async fn send<F>(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
        mut on_delta: F,
    ) -> ChatResult<SendOutcome>
    where
        F: FnMut(&ChatDelta) + Send,
    {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        self.push_message(ChatRole::User, vec![MessagePart::Text(text.to_string())]);
        let request = self.wire_history();
        let reply_index = self.push_message(ChatRole::Assistant, Vec::new());
        let backend = Arc::clone(&self.backend);

        let mut deltas = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.stopped(reply_index)),
            started = backend.stream_chat(request) => match started {
                Ok(deltas) => deltas,
                Err(err) => return Err(self.failed(reply_index, err)),
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.stopped(reply_index)),
                next = deltas.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    on_delta(&delta);
                    self.messages[reply_index].push_delta(delta);
                }
                Some(Err(err)) => return Err(self.failed(reply_index, err)),
                None => break,
            }
        }
        info!(
            "event=chat_send module=chat status=ok parts={}",
            self.messages[reply_index].parts.len()
        );
        Ok(SendOutcome::Completed)
    }

    fn push_message(&mut self, role: ChatRole, parts: Vec<MessagePart>) -> usize {
        self.next_id += 1;
        self.messages.push(ChatMessage {
            id: self.next_id,
            role,
            parts,
        });
        self.messages.len() - 1
    }

    fn wire_history(&self) -> Vec<WireMessage> {
        let system = self
            .system_prompt
            .iter()
            .map(|prompt| WireMessage::new(ChatRole::System, prompt.clone()));
        let history = self
            .messages
            .iter()
            .map(|message| WireMessage::new(message.role, message.text()))
            .filter(|message| !message.content.is_empty());
        system.chain(history).collect()
    }

    fn drop_if_empty(&mut self, index: usize) {
        if self.messages[index].parts.is_empty() {
            self.messages.remove(index);
        }
    }

    fn stopped(&mut self, reply_index: usize) -> SendOutcome {
        self.drop_if_empty(reply_index);
        info!("event=chat_send module=chat status=stopped");
        SendOutcome::Stopped
    }

    fn failed(&mut self, reply_index: usize, err: ChatError) -> ChatError {
        self.drop_if_empty(reply_index);
        warn!("event=chat_send module=chat status=error error={err}");
        err
    }
}
