//! Assistant generation into journal entry content.

use crate::chat::stream::{ChatBackend, ChatDelta, ChatResult, ChatRole, WireMessage};
use crate::editor::entry_editor::EntryEditor;
use futures::StreamExt;
use log::info;
use tokio_util::sync::CancellationToken;

const COMPOSE_SYSTEM_PROMPT: &str = "You help write personal journal entries. \
Reply with the text to add to the entry, formatted as Markdown, without preamble.";

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeOutcome {
    /// Generated content was kept and scheduled for saving.
    Finished,
    /// Generation was cancelled and the snapshot restored.
    Cancelled,
}

/// Streams the assistant's answer to `prompt` into `editor`.
///
/// The editor snapshot is taken before the request is sent. Cancellation or
/// a stream failure restores it; only a finished stream is saved.
pub async fn compose_into_entry(
    editor: &EntryEditor,
    backend: &dyn ChatBackend,
    prompt: &str,
    cancel: &CancellationToken,
) -> ChatResult<ComposeOutcome> {
    let snapshot = editor.begin_generation()?;
    let mut request = vec![WireMessage::new(ChatRole::System, COMPOSE_SYSTEM_PROMPT)];
    if !snapshot.title.trim().is_empty() {
        request.push(WireMessage::new(
            ChatRole::User,
            format!("Entry title: {}", snapshot.title.trim()),
        ));
    }
    request.push(WireMessage::new(ChatRole::User, prompt.trim()));

    let mut deltas = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            editor.cancel_generation()?;
            return Ok(ComposeOutcome::Cancelled);
        }
        started = backend.stream_chat(request) => match started {
            Ok(deltas) => deltas,
            Err(err) => {
                editor.fail_generation(&err)?;
                return Err(err);
            }
        },
    };

    let mut chunks = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                editor.cancel_generation()?;
                return Ok(ComposeOutcome::Cancelled);
            }
            next = deltas.next() => next,
        };
        match next {
            Some(Ok(ChatDelta::Text(text))) => {
                chunks += 1;
                editor.append_generated(&text)?;
            }
            Some(Ok(ChatDelta::Reasoning(_))) => {}
            Some(Err(err)) => {
                editor.fail_generation(&err)?;
                return Err(err);
            }
            None => break,
        }
    }

    editor.finish_generation()?;
    info!("event=compose_entry module=chat status=ok chunks={chunks}");
    Ok(ComposeOutcome::Finished)
}
