// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use bytes::Bytes;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::fmt::{Display, Formatter};

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Error codes the product API uses when a caller exceeds its request allowance
const THROTTLE_CODES: &[&str] = &["TooManyRequests", "RequestThrottled"];

#[derive(Debug)]
#[allow(dead_code)] // these are debug printed frequently
pub enum UpstreamError {
    /// Any error for which we got a non-2xx HTTP response
    HttpResponse(HttpResponse),
    /// Any error for which we did not get an HTTP response. Happens if we fail while during the initial request `.send()`.
    HttpRequest(ReqwestError),
    /// An error occurred reading response body. We did not expect an error, so headers were not captured.
    HttpRead(ReqwestError),
    /// We received a successful response which we could not deserialize
    JsonDeserialize(serde_json::Error),
    /// A 2xx response that carried only request-level errors
    Api(Vec<ApiErrorData>),
}

impl std::error::Error for UpstreamError {}

impl Display for UpstreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::HttpResponse(e) => write!(f, "product API error: {} from {}", e.status_code, e.endpoint),
            UpstreamError::HttpRequest(e) => write!(f, "HTTP general failure for {}: {}", e.endpoint, e.error),
            UpstreamError::HttpRead(e) => write!(f, "HTTP body read failed for {}: {}", e.endpoint, e.error),
            UpstreamError::JsonDeserialize(e) => write!(f, "JSON deserialization failed: {e}"),
            UpstreamError::Api(errors) => {
                f.write_str("product API error:")?;
                for error in errors {
                    write!(f, " [{}] {}", error.code, error.message)?;
                }
                Ok(())
            }
        }
    }
}

impl UpstreamError {
    /// Create an UpstreamError from a non-2xx response
    pub async fn from_response(endpoint: &'static str, response: Response) -> Self {
        let status_code = response.status();
        let headers = format!("{:?}", response.headers());
        let bytes = response.bytes().await;
        let body = match bytes {
            Ok(bytes) => match serde_json::from_slice::<ErrorResponse>(&bytes) {
                Ok(json) => HttpBody::JsonErrorResponse(json),
                Err(_json_error) => HttpBody::UnknownErrorResponse(bytes),
            },
            Err(read_error) => HttpBody::ReadError(read_error),
        };
        Self::HttpResponse(HttpResponse {
            endpoint,
            status_code,
            headers,
            body,
        })
    }

    /// Create an UpstreamError from a reqwest error (use this after `.send()`)
    pub fn from_request(endpoint: &'static str, error: reqwest::Error) -> Self {
        Self::HttpRequest(ReqwestError { endpoint, error })
    }

    /// Create an UpstreamError from a reqwest error attempting to read response body (use this after `.bytes()`)
    pub fn from_read(endpoint: &'static str, error: reqwest::Error) -> Self {
        Self::HttpRead(ReqwestError { endpoint, error })
    }

    pub fn from_json(json_error: serde_json::Error) -> Self {
        Self::JsonDeserialize(json_error)
    }

    /// A request-level API error
    pub fn api<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self::Api(vec![ApiErrorData {
            code: code.into(),
            message: message.into(),
        }])
    }

    /// Check if this error means we are being throttled, either via HTTP 429 or a throttling error code
    pub fn is_request_limit(&self) -> bool {
        match self {
            Self::HttpResponse(response) => {
                response.status_code == StatusCode::TOO_MANY_REQUESTS
                    || matches!(&response.body, HttpBody::JsonErrorResponse(body) if body.errors.iter().any(ApiErrorData::is_throttle))
            }
            Self::Api(errors) => errors.iter().any(ApiErrorData::is_throttle),
            _ => false,
        }
    }
}

/// Generic wrapper for a reqwest error.
#[derive(Debug)]
#[allow(dead_code)] // these are debug printed frequently
pub struct ReqwestError {
    endpoint: &'static str,
    error: reqwest::Error,
}

#[derive(Debug)]
#[allow(dead_code)] // these are debug printed frequently
pub struct HttpResponse {
    endpoint: &'static str,
    status_code: StatusCode,
    headers: String,
    body: HttpBody,
}

#[derive(Debug)]
#[allow(dead_code)] // these are debug printed frequently
pub enum HttpBody {
    /// We received an error response which was successfully deserialized
    JsonErrorResponse(ErrorResponse),
    /// We received an error response which could not be deserialized
    UnknownErrorResponse(Bytes),
    /// We failed to read the body of the error response
    ReadError(reqwest::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    #[serde(default)]
    pub errors: Vec<ApiErrorData>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiErrorData {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ApiErrorData {
    fn is_throttle(&self) -> bool {
        THROTTLE_CODES.contains(&self.code.as_str())
    }
}
