//! Write API client.
//!
//! Endpoints (per record kind, `todos` or `diaries`):
//! - `POST /api/{table}` with the mutable fields, `201 {<row key>, txid}`.
//! - `PUT /api/{table}/{id}` with changed fields only, `{<row key>, txid}`.
//! - `DELETE /api/{table}/{id}`, `{success, txid}`.

use crate::model::journal::JournalEntry;
use crate::model::record::{RecordKind, ServerId, SyncRecord, TxId};
use crate::model::task::Task;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

const MAX_ERROR_BODY_CHARS: usize = 200;

pub type ApiResult<T> = Result<T, ApiError>;

/// Acknowledgement of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReceipt {
    /// Identifier assigned by the remote store.
    pub id: ServerId,
    pub txid: TxId,
}

/// Remote write failures.
#[derive(Debug)]
pub enum ApiError {
    /// Connection, TLS or body transfer failure.
    Transport(reqwest::Error),
    /// The target row does not exist remotely.
    NotFound(ServerId),
    /// Non-success response other than 404.
    Status { status: u16, body: String },
    /// Success response whose body could not be interpreted.
    InvalidResponse(String),
    /// Base URL could not be joined with an endpoint path.
    InvalidUrl(String),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "request failed: {err}"),
            Self::NotFound(id) => write!(f, "remote record not found: {id}"),
            Self::Status { status, body } => {
                write!(f, "remote write rejected with status {status}: {body}")
            }
            Self::InvalidResponse(message) => write!(f, "invalid write response: {message}"),
            Self::InvalidUrl(message) => write!(f, "invalid api url: {message}"),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

/// Confirmation handlers used by a collection for one record kind.
#[async_trait]
pub trait WriteApi<T: SyncRecord>: Send + Sync {
    async fn create(&self, value: &T) -> ApiResult<CreateReceipt>;
    async fn update(&self, id: ServerId, patch: &T::Patch) -> ApiResult<TxId>;
    async fn delete(&self, id: ServerId) -> ApiResult<TxId>;
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    txid: Value,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct CreateTaskBody<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateEntryBody<'a> {
    title: &'a str,
    content: Option<&'a str>,
}

/// Table and response key for one record kind.
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    table: &'static str,
    row_key: &'static str,
}

fn endpoint(kind: RecordKind) -> Endpoint {
    match kind {
        RecordKind::Task => Endpoint {
            table: "todos",
            row_key: "todo",
        },
        RecordKind::JournalEntry => Endpoint {
            table: "diaries",
            row_key: "diary",
        },
    }
}

/// HTTP client for the write endpoints of both record kinds.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    http: Client,
    base_url: Url,
}

impl HttpApiClient {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds the collection URL for one record kind (`/api/todos`).
    ///
    /// The same URL serves the change feed on `GET`.
    pub fn collection_url(&self, kind: RecordKind) -> ApiResult<Url> {
        join_api_path(&self.base_url, &format!("api/{}", endpoint(kind).table))
    }

    fn row_url(&self, kind: RecordKind, id: ServerId) -> ApiResult<Url> {
        join_api_path(
            &self.base_url,
            &format!("api/{}/{}", endpoint(kind).table, id),
        )
    }

    async fn send_create<B: Serialize + Sync>(
        &self,
        kind: RecordKind,
        body: &B,
    ) -> ApiResult<CreateReceipt> {
        let started_at = Instant::now();
        let url = self.collection_url(kind)?;
        let response = self.http.post(url).json(body).send().await?;
        let parsed = read_write_response(response, None).await?;
        let receipt = CreateReceipt {
            id: created_row_id(&parsed, endpoint(kind).row_key)?,
            txid: parse_txid(&parsed.txid)?,
        };
        debug!(
            "event=api_write module=api status=ok op=create kind={} txid={} duration_ms={}",
            kind.as_str(),
            receipt.txid,
            started_at.elapsed().as_millis()
        );
        Ok(receipt)
    }

    async fn send_update<B: Serialize + Sync>(
        &self,
        kind: RecordKind,
        id: ServerId,
        body: &B,
    ) -> ApiResult<TxId> {
        let started_at = Instant::now();
        let url = self.row_url(kind, id)?;
        let response = self.http.put(url).json(body).send().await?;
        let parsed = read_write_response(response, Some(id)).await?;
        let txid = parse_txid(&parsed.txid)?;
        debug!(
            "event=api_write module=api status=ok op=update kind={} txid={} duration_ms={}",
            kind.as_str(),
            txid,
            started_at.elapsed().as_millis()
        );
        Ok(txid)
    }

    async fn send_delete(&self, kind: RecordKind, id: ServerId) -> ApiResult<TxId> {
        let started_at = Instant::now();
        let url = self.row_url(kind, id)?;
        let response = self.http.delete(url).send().await?;
        let parsed = read_write_response(response, Some(id)).await?;
        let txid = parse_txid(&parsed.txid)?;
        debug!(
            "event=api_write module=api status=ok op=delete kind={} txid={} duration_ms={}",
            kind.as_str(),
            txid,
            started_at.elapsed().as_millis()
        );
        Ok(txid)
    }
}

#[async_trait]
impl WriteApi<Task> for HttpApiClient {
    async fn create(&self, value: &Task) -> ApiResult<CreateReceipt> {
        self.send_create(
            RecordKind::Task,
            &CreateTaskBody {
                text: value.text.as_str(),
            },
        )
        .await
    }

    async fn update(&self, id: ServerId, patch: &<Task as SyncRecord>::Patch) -> ApiResult<TxId> {
        self.send_update(RecordKind::Task, id, patch).await
    }

    async fn delete(&self, id: ServerId) -> ApiResult<TxId> {
        self.send_delete(RecordKind::Task, id).await
    }
}

#[async_trait]
impl WriteApi<JournalEntry> for HttpApiClient {
    async fn create(&self, value: &JournalEntry) -> ApiResult<CreateReceipt> {
        self.send_create(
            RecordKind::JournalEntry,
            &CreateEntryBody {
                title: value.title.as_str(),
                content: value.content.as_deref(),
            },
        )
        .await
    }

    async fn update(
        &self,
        id: ServerId,
        patch: &<JournalEntry as SyncRecord>::Patch,
    ) -> ApiResult<TxId> {
        self.send_update(RecordKind::JournalEntry, id, patch).await
    }

    async fn delete(&self, id: ServerId) -> ApiResult<TxId> {
        self.send_delete(RecordKind::JournalEntry, id).await
    }
}

/// Joins a relative API path onto the configured base URL.
///
/// A base without a trailing slash is treated as a directory, so
/// `http://host/prefix` + `api/todos` yields `http://host/prefix/api/todos`.
pub fn join_api_path(base: &Url, path: &str) -> ApiResult<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|err| ApiError::InvalidUrl(format!("{path}: {err}")))
}

async fn read_write_response(
    response: reqwest::Response,
    target: Option<ServerId>,
) -> ApiResult<WriteResponse> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = target {
            return Err(ApiError::NotFound(id));
        }
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body = truncate_chars(&body, MAX_ERROR_BODY_CHARS);
        warn!(
            "event=api_write module=api status=error http_status={}",
            status.as_u16()
        );
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    decode_json(response).await
}

async fn decode_json<D: DeserializeOwned>(response: reqwest::Response) -> ApiResult<D> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::InvalidResponse(err.to_string()))
}

/// Accepts `txid` as a JSON number or a numeric string.
fn parse_txid(value: &Value) -> ApiResult<TxId> {
    match value {
        Value::Number(number) => number.as_u64().map(TxId).ok_or_else(|| {
            ApiError::InvalidResponse(format!("txid is not an unsigned integer: {number}"))
        }),
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map(TxId)
            .map_err(|_| ApiError::InvalidResponse(format!("txid is not numeric: `{text}`"))),
        other => Err(ApiError::InvalidResponse(format!(
            "txid has unexpected type: {other}"
        ))),
    }
}

fn created_row_id(response: &WriteResponse, row_key: &str) -> ApiResult<ServerId> {
    let raw = response
        .rest
        .get(row_key)
        .and_then(|row| row.get("id"))
        .ok_or_else(|| ApiError::InvalidResponse(format!("missing `{row_key}.id`")))?;
    let id = match raw {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::InvalidResponse(format!("`{row_key}.id` is not an integer")))?;
    ServerId::new(id).map_err(|err| ApiError::InvalidResponse(err.to_string()))
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    let mut truncated = value.chars().take(max_chars).collect::<String>();
    if value.chars().count() > max_chars {
        truncated.push_str("...");
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::{created_row_id, join_api_path, parse_txid, HttpApiClient, WriteResponse};
    use crate::model::record::{RecordKind, ServerId, TxId};
    use reqwest::Url;
    use serde_json::json;

    #[test]
    fn collection_url_keeps_base_path_prefix() {
        let client = HttpApiClient::new(Url::parse("http://10.0.2.2:3001/backend").unwrap());
        assert_eq!(
            client.collection_url(RecordKind::Task).unwrap().as_str(),
            "http://10.0.2.2:3001/backend/api/todos"
        );
        let root = Url::parse("http://localhost:3001/").unwrap();
        assert_eq!(
            join_api_path(&root, "/api/diaries/7").unwrap().as_str(),
            "http://localhost:3001/api/diaries/7"
        );
    }

    #[test]
    fn txid_accepts_number_and_numeric_string() {
        assert_eq!(parse_txid(&json!(751)).unwrap(), TxId(751));
        assert_eq!(parse_txid(&json!(" 752 ")).unwrap(), TxId(752));
        assert!(parse_txid(&json!(-3)).is_err());
        assert!(parse_txid(&json!(null)).is_err());
    }

    #[test]
    fn create_response_yields_row_id() {
        let response: WriteResponse = serde_json::from_value(json!({
            "todo": { "id": 12, "text": "Buy milk", "completed": false },
            "txid": 900
        }))
        .unwrap();
        assert_eq!(
            created_row_id(&response, "todo").unwrap(),
            ServerId::new(12).unwrap()
        );
        assert!(created_row_id(&response, "diary").is_err());
    }
}
