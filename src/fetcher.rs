//! An HTTP client that issues conditional GETs for datafiles.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{
    header::{IF_MODIFIED_SINCE, LAST_MODIFIED},
    StatusCode,
};

use crate::{retry::RetryExecutor, storage::KeyValueStore, Error, Result};

/// What the server said about a datafile URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 2xx: the current datafile body.
    Fresh(String),
    /// 304: the datafile has not changed since the last successful fetch.
    NotModified,
}

/// Fetches datafiles with `If-Modified-Since`, retrying failed attempts.
///
/// Last-modified timestamps are persisted per URL in [`KeyValueStore`], under the URL itself.
pub struct ConditionalFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    storage: Arc<KeyValueStore>,
    retry: RetryExecutor,
}

impl ConditionalFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] if the HTTP client cannot be initialized (e.g., TLS backend
    /// failure).
    pub fn new(
        storage: Arc<KeyValueStore>,
        retry: RetryExecutor,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<ConditionalFetcher> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;

        Ok(ConditionalFetcher {
            client,
            storage,
            retry,
        })
    }

    /// Fetch `url`, retrying failures according to the retry schedule.
    ///
    /// Returns `None` if no attempt got a 2xx or 304 answer.
    pub fn fetch(&self, url: &str) -> Option<FetchOutcome> {
        self.retry.execute(|| self.fetch_once(url))
    }

    /// Last-modified timestamp (epoch millis) stored for `url`, or 0.
    pub fn last_modified(&self, url: &str) -> i64 {
        self.storage.get_long(url, 0)
    }

    /// Forget the last-modified timestamp of `url` so the next fetch is unconditional.
    pub fn reset_last_modified(&self, url: &str) {
        self.storage.save_long(url, 0);
    }

    /// Handle to the retry executor, e.g. to interrupt pending retries.
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    fn fetch_once(&self, url: &str) -> Result<FetchOutcome> {
        let mut request = self.client.get(url);

        let last_modified = self.last_modified(url);
        if let Some(since) = format_http_date(last_modified) {
            request = request.header(IF_MODIFIED_SINCE, since);
        }

        log::debug!(target: "datafile_sync", "fetching datafile from {}", url);
        let response = request.send()?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            log::debug!(target: "datafile_sync", "datafile at {} not modified", url);
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            log::warn!(target: "datafile_sync", "unexpected response {} while fetching {}", status, url);
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        let server_last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);

        let body = response.text()?;

        // Only move forward; a fetch never rolls the timestamp back.
        if let Some(timestamp) = server_last_modified {
            if timestamp > last_modified {
                self.storage.save_long(url, timestamp);
            }
        }

        log::debug!(target: "datafile_sync", "successfully fetched datafile from {}", url);
        Ok(FetchOutcome::Fresh(body))
    }
}

fn format_http_date(epoch_millis: i64) -> Option<String> {
    if epoch_millis <= 0 {
        return None;
    }
    let date = DateTime::<Utc>::from_timestamp_millis(epoch_millis)?;
    Some(date.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp_millis())
}
