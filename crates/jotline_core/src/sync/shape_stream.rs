//! Shape subscription over HTTP.
//!
//! A subscription starts with `offset=-1` (full snapshot), follows the
//! `electric-handle`/`electric-offset` cursor returned by each response, and
//! switches to `live=true` long-polling once the server reports the client is
//! up to date. `409 Conflict` resets the cursor and yields `MustRefetch`.

use crate::sync::shape::{
    decode_messages, ShapeBatch, ShapeError, ShapeMessage, ShapeResult, ShapeSchema, ValueParser,
};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

const INITIAL_OFFSET: &str = "-1";
const HEADER_HANDLE: &str = "electric-handle";
const HEADER_OFFSET: &str = "electric-offset";
const HEADER_SCHEMA: &str = "electric-schema";
const HEADER_UP_TO_DATE: &str = "electric-up-to-date";
/// Upper bound for one live long-poll request.
pub const LIVE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Source of change-feed batches consumed by a collection.
#[async_trait]
pub trait ShapeSource: Send {
    /// Waits for the next batch of messages.
    async fn next_batch(&mut self) -> ShapeResult<ShapeBatch>;
}

/// Cursor state of one shape subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeCursor {
    pub handle: Option<String>,
    pub offset: String,
    pub live: bool,
}

impl Default for ShapeCursor {
    fn default() -> Self {
        Self {
            handle: None,
            offset: INITIAL_OFFSET.to_string(),
            live: false,
        }
    }
}

impl ShapeCursor {
    /// Query parameters for the next request.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("offset", self.offset.clone())];
        if let Some(handle) = self.handle.as_ref() {
            query.push(("handle", handle.clone()));
        }
        if self.live {
            query.push(("live", "true".to_string()));
        }
        query
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// HTTP implementation of [`ShapeSource`].
pub struct HttpShapeStream {
    http: Client,
    url: Url,
    cursor: ShapeCursor,
    schema: ShapeSchema,
    parser: ValueParser,
}

impl HttpShapeStream {
    /// Subscribes to the shape served at `url` (for example `/api/todos`).
    pub fn new(url: Url, parser: ValueParser) -> ShapeResult<Self> {
        let http = Client::builder().timeout(LIVE_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(http, url, parser))
    }

    pub fn with_client(http: Client, url: Url, parser: ValueParser) -> Self {
        Self {
            http,
            url,
            cursor: ShapeCursor::default(),
            schema: ShapeSchema::default(),
            parser,
        }
    }

    pub fn cursor(&self) -> &ShapeCursor {
        &self.cursor
    }
}

#[async_trait]
impl ShapeSource for HttpShapeStream {
    async fn next_batch(&mut self) -> ShapeResult<ShapeBatch> {
        let response = self
            .http
            .get(self.url.clone())
            .query(&self.cursor.query())
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            info!(
                "event=shape_refetch module=sync status=reset url_path={}",
                self.url.path()
            );
            self.cursor.reset();
            self.schema = ShapeSchema::default();
            return Ok(ShapeBatch::new(vec![ShapeMessage::MustRefetch]));
        }
        if status == StatusCode::NO_CONTENT {
            self.cursor.live = true;
            return Ok(ShapeBatch::new(vec![ShapeMessage::UpToDate]));
        }
        if !status.is_success() {
            return Err(ShapeError::Status(status.as_u16()));
        }

        let headers = response.headers().clone();
        self.absorb_headers(&headers)?;
        let body = response.bytes().await?;
        let mut messages = if body.is_empty() {
            Vec::new()
        } else {
            decode_messages(&body, &self.schema, &self.parser)?
        };
        if headers.contains_key(HEADER_UP_TO_DATE)
            && !messages
                .iter()
                .any(|message| matches!(message, ShapeMessage::UpToDate))
        {
            messages.push(ShapeMessage::UpToDate);
        }

        let batch = ShapeBatch::new(messages);
        if batch.is_up_to_date() {
            self.cursor.live = true;
        }
        debug!(
            "event=shape_batch module=sync status=ok messages={} live={}",
            batch.messages.len(),
            self.cursor.live
        );
        Ok(batch)
    }
}

impl HttpShapeStream {
    fn absorb_headers(&mut self, headers: &HeaderMap) -> ShapeResult<()> {
        let handle =
            header_str(headers, HEADER_HANDLE).ok_or(ShapeError::MissingHeader(HEADER_HANDLE))?;
        let offset =
            header_str(headers, HEADER_OFFSET).ok_or(ShapeError::MissingHeader(HEADER_OFFSET))?;
        self.cursor.handle = Some(handle.to_string());
        self.cursor.offset = offset.to_string();
        if let Some(raw_schema) = header_str(headers, HEADER_SCHEMA) {
            self.schema = ShapeSchema::from_header(raw_schema)?;
        }
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{HttpShapeStream, ShapeCursor};
    use crate::sync::shape::{ColumnType, ValueParser};
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::{Client, Url};

    #[test]
    fn initial_cursor_requests_full_snapshot() {
        let cursor = ShapeCursor::default();
        assert_eq!(cursor.query(), vec![("offset", "-1".to_string())]);
    }

    #[test]
    fn live_cursor_carries_handle_and_live_flag() {
        let cursor = ShapeCursor {
            handle: Some("3833821-1721812114261".to_string()),
            offset: "26800584_4".to_string(),
            live: true,
        };
        assert_eq!(
            cursor.query(),
            vec![
                ("offset", "26800584_4".to_string()),
                ("handle", "3833821-1721812114261".to_string()),
                ("live", "true".to_string()),
            ]
        );
    }

    #[test]
    fn absorb_headers_updates_cursor_and_schema() {
        let mut stream = HttpShapeStream::with_client(
            Client::new(),
            Url::parse("http://localhost:3001/api/todos").unwrap(),
            ValueParser::default(),
        );
        let mut headers = HeaderMap::new();
        headers.insert("electric-handle", HeaderValue::from_static("h-1"));
        headers.insert("electric-offset", HeaderValue::from_static("0_0"));
        headers.insert(
            "electric-schema",
            HeaderValue::from_static(r#"{"id":{"type":"int4"}}"#),
        );
        stream.absorb_headers(&headers).unwrap();

        assert_eq!(stream.cursor().handle.as_deref(), Some("h-1"));
        assert_eq!(stream.cursor().offset, "0_0");
        assert_eq!(stream.schema.column_type("id"), Some(&ColumnType::Int));
    }

    #[test]
    fn absorb_headers_requires_handle() {
        let mut stream = HttpShapeStream::with_client(
            Client::new(),
            Url::parse("http://localhost:3001/api/todos").unwrap(),
            ValueParser::default(),
        );
        assert!(stream.absorb_headers(&HeaderMap::new()).is_err());
    }
}
