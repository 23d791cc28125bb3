//! Markdown to editor HTML conversion.

use crate::model::journal::EMPTY_HTML;
use pulldown_cmark::{html, Options, Parser};

/// Renders markdown (as produced by the assistant) into editor HTML.
///
/// Blank input renders as the empty document.
pub fn markdown_to_html(markdown: &str) -> String {
    if markdown.trim().is_empty() {
        return EMPTY_HTML.to_string();
    }
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_TABLES);

    let mut rendered = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut rendered, Parser::new_ext(markdown, options));
    rendered.trim_end().to_string()
}

/// Appends rendered HTML to existing editor content.
///
/// An empty document is replaced rather than extended.
pub fn append_html(base: &str, addition: &str) -> String {
    let base = base.trim_end();
    if base.is_empty() || base == EMPTY_HTML {
        return addition.to_string();
    }
    if addition == EMPTY_HTML {
        return base.to_string();
    }
    format!("{base}{addition}")
}
