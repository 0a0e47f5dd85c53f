//! PostgREST store (Supabase and compatible REST front-ends)
//!
//! Upserts are `POST /rest/v1/{table}?on_conflict={key}` with
//! `Prefer: resolution=merge-duplicates`. Deletes use PostgREST filter
//! syntax and read the deleted count back from `Content-Range`.

use async_trait::async_trait;
use feedsync_common::{FeedSyncError, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::debug;

use super::{DeleteCondition, RecordStore};
use crate::error::StoreError;
use crate::models::StoreRow;

/// Longest response body quoted in an error message
const MAX_ERROR_BODY: usize = 512;

pub struct RestStore {
    client: reqwest::Client,
    base_url: Url,
}

impl RestStore {
    /// `timeout` applies to each request
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| FeedSyncError::Config(format!("invalid REST URL '{}': {}", base_url, e)))?;

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| FeedSyncError::Config("REST API key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| FeedSyncError::Config("REST API key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| FeedSyncError::Store(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn table_url(&self, table: &str) -> std::result::Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::rejected("REST URL cannot be a base"))?
            .pop_if_empty()
            .extend(["rest", "v1", table]);
        Ok(url)
    }
}

/// 408, 429 and 5xx may succeed on resubmission
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn send_error(err: reqwest::Error) -> StoreError {
    if err.is_builder() {
        StoreError::rejected(err.to_string())
    } else {
        // timeouts, refused connections, resets
        StoreError::transient(err.to_string())
    }
}

async fn status_error(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    let message = format!("HTTP {}: {}", status, body.trim());
    if is_transient_status(status) {
        StoreError::transient(message)
    } else {
        StoreError::rejected(message)
    }
}

/// Filter expression for a delete; null watermarks always count as stale
pub fn delete_filter(field: &str, condition: &DeleteCondition) -> String {
    let literal = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        other => other.to_string(),
    };
    match condition {
        DeleteCondition::LessThan(v) => format!("({field}.lt.{},{field}.is.null)", literal(v)),
        DeleteCondition::NotEqual(v) => format!("({field}.neq.{},{field}.is.null)", literal(v)),
        DeleteCondition::Any => format!("({field}.is.null,{field}.not.is.null)"),
    }
}

/// Parse the total from a `Content-Range` value such as `0-24/25` or `*/0`
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl RecordStore for RestStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &[StoreRow],
        conflict_key: &str,
    ) -> std::result::Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let url = self.table_url(table)?;
        let response = self
            .client
            .post(url)
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(send_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        debug!(table, rows = rows.len(), "REST upsert accepted");
        Ok(rows.len() as u64)
    }

    async fn delete_where(
        &self,
        table: &str,
        field: &str,
        condition: &DeleteCondition,
    ) -> std::result::Result<u64, StoreError> {
        let url = self.table_url(table)?;
        let response = self
            .client
            .delete(url)
            .query(&[("or", delete_filter(field, condition))])
            .header("Prefer", "count=exact,return=minimal")
            .send()
            .await
            .map_err(send_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let deleted = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
            .unwrap_or(0);

        Ok(deleted)
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}
