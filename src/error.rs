// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use crate::http::paapi::UpstreamError;
use std::fmt::{Display, Formatter};

pub type ApwResult<T> = Result<T, ApwError>;

pub const DAILY_LIMIT_MESSAGE: &str = "Maximum number of requests per day to Amazon API reached.";
pub const LOCK_BLOCKED_MESSAGE: &str = "Amazon API currently blocked by another process.";

#[derive(Debug)]
#[allow(unused)] // these are debug printed frequently
pub enum ApwError {
    Message(String),
    /// Daily quota exhausted, fetch lock unavailable, or upstream throttling
    RequestLimitReached(String),
    /// Upstream calls are switched off in the settings
    ApiDisabled,
    /// The deal feed is switched off in the settings
    DealApiDisabled,
    /// A remote service did not behave as expected
    ServiceUnavailable(String),
    Upstream(UpstreamError),
    Sqlite(sqlx::Error),
    Json(serde_json::Error),
    Io(std::io::Error),
    Csv(csv::Error),
}

impl Display for ApwError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ApwError::Message(message) => f.write_str(message.as_str()),
            ApwError::RequestLimitReached(message) => f.write_str(message.as_str()),
            ApwError::ApiDisabled => f.write_str("Amazon API is disabled."),
            ApwError::DealApiDisabled => f.write_str("Amazon deal feed is disabled."),
            ApwError::ServiceUnavailable(message) => f.write_str(message.as_str()),
            ApwError::Upstream(e) => write!(f, "{e}"),
            ApwError::Sqlite(e) => write!(f, "DB error: {e}"),
            ApwError::Json(e) => write!(f, "JSON error: {e}"),
            ApwError::Io(e) => write!(f, "I/O error: {e}"),
            ApwError::Csv(e) => write!(f, "CSV error: {e}"),
        }
    }
}

impl std::error::Error for ApwError {}

impl From<UpstreamError> for ApwError {
    fn from(e: UpstreamError) -> Self {
        if e.is_request_limit() {
            Self::RequestLimitReached(e.to_string())
        } else {
            Self::Upstream(e)
        }
    }
}

impl From<sqlx::Error> for ApwError {
    fn from(e: sqlx::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for ApwError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<std::io::Error> for ApwError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<csv::Error> for ApwError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e)
    }
}

impl From<tokio::task::JoinError> for ApwError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Message(format!("background task failed: {e}"))
    }
}

impl ApwError {
    pub fn new<T: Into<String>>(message: T) -> Self {
        Self::Message(message.into())
    }

    pub fn daily_limit() -> Self {
        Self::RequestLimitReached(DAILY_LIMIT_MESSAGE.to_string())
    }

    pub fn lock_blocked() -> Self {
        Self::RequestLimitReached(LOCK_BLOCKED_MESSAGE.to_string())
    }

    /// Quota, lock, and throttling failures. These abort a fetch instead of triggering per-item retries.
    pub fn is_request_limit(&self) -> bool {
        matches!(self, Self::RequestLimitReached(_))
    }
}
