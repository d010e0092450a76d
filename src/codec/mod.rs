//! Request/response encodings.
//!
//! A predict body arrives either as JSON or as a bincode-serialized message.
//! Both carry a [`RecordBatch`] in records or split layout plus an optional
//! output filter, and the response is always written in the encoding and
//! layout of the request.

pub mod binary;
pub mod json;

use crate::error::{Result, ServingError};
use crate::types::RecordBatch;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIME_JSON: &str = "application/json";
pub const MIME_BINCODE: &str = "application/x-bincode";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Declared encoding of a predict request or response body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Structured text
    Json,
    /// Binary-serialized message
    Binary,
}

impl ContentType {
    /// Parse a MIME string; parameters such as `charset` are ignored
    pub fn from_mime(mime: &str) -> Result<Self> {
        match essence(mime).as_str() {
            MIME_JSON => Ok(ContentType::Json),
            MIME_BINCODE | MIME_OCTET_STREAM => Ok(ContentType::Binary),
            _ => Err(ServingError::UnsupportedContentType(mime.to_string())),
        }
    }

    /// Resolve an optional header value; an absent header means JSON
    pub fn from_header(mime: Option<&str>) -> Result<Self> {
        match mime {
            Some(m) if !m.trim().is_empty() => Self::from_mime(m),
            _ => Ok(ContentType::Json),
        }
    }

    /// MIME string written on responses
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => MIME_JSON,
            ContentType::Binary => MIME_BINCODE,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// Lowercased MIME type without parameters
pub fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// Decoded predict request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Input table
    pub x: RecordBatch,
    /// Output columns to keep, all when absent
    pub filter: Option<Vec<String>>,
}

impl PredictRequest {
    pub fn new(x: RecordBatch) -> Self {
        Self { x, filter: None }
    }

    pub fn with_filter(mut self, filter: Vec<String>) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Decode a predict request body
pub fn decode_request(content_type: ContentType, body: &[u8]) -> Result<PredictRequest> {
    let request = match content_type {
        ContentType::Json => json::decode_request(body)?,
        ContentType::Binary => binary::decode_request(body)?,
    };
    request.x.validate()?;
    Ok(request)
}

/// Encode a predict request body (used by clients and tests)
pub fn encode_request(content_type: ContentType, request: &PredictRequest) -> Result<Vec<u8>> {
    match content_type {
        ContentType::Json => json::encode_request(request),
        ContentType::Binary => binary::encode_request(request),
    }
}

/// Encode a predict response body
pub fn encode_response(content_type: ContentType, result: &RecordBatch) -> Result<Vec<u8>> {
    match content_type {
        ContentType::Json => json::encode_response(result),
        ContentType::Binary => binary::encode_response(result),
    }
}

/// Decode a predict response body
pub fn decode_response(content_type: ContentType, body: &[u8]) -> Result<RecordBatch> {
    match content_type {
        ContentType::Json => json::decode_response(body),
        ContentType::Binary => binary::decode_response(body),
    }
}
