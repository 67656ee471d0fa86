//! Request and response envelopes exchanged over the request/response
//! queue pair.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::RngExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::fetcher::HttpResponse;
use crate::error::RequestError;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Generates a request id of the form `req_<unix-millis>_<9 base36 chars>`.
pub fn new_request_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("req_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// HTTP options carried with a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestOptions {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

impl RequestOptions {
    /// A GET accepting JSON.
    pub fn json_get() -> Self {
        Self::default().with_header("Accept", "application/json")
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Outbound HTTP request pushed onto `request_queue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub options: RequestOptions,
    /// Class name of the component that wants the data.
    pub source: String,
    /// List the processor pushes the response onto.
    pub response_queue: String,
}

impl RequestEnvelope {
    /// Builds an envelope with a fresh id.
    pub fn new(
        url: impl Into<String>,
        options: RequestOptions,
        source: impl Into<String>,
        response_queue: impl Into<String>,
    ) -> Self {
        Self {
            id: new_request_id(),
            url: url.into(),
            options,
            source: source.into(),
            response_queue: response_queue.into(),
        }
    }
}

/// Result of a request, pushed onto the requester's response queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw body of non-2xx responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ResponseEnvelope {
    /// Wraps a completed round trip, whatever its status.
    ///
    /// JSON bodies are parsed into `data`; anything else is kept as a string.
    pub fn from_http(request_id: impl Into<String>, response: HttpResponse) -> Self {
        let data = serde_json::from_str(&response.body)
            .unwrap_or_else(|_| serde_json::Value::String(response.body.clone()));
        let body = if (200..300).contains(&response.status) {
            None
        } else {
            Some(response.body)
        };

        Self {
            request_id: request_id.into(),
            status: response.status,
            data: Some(data),
            error: None,
            body,
        }
    }

    /// Wraps a request that never produced an HTTP response.
    pub fn failure(request_id: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            data: None,
            error: Some(message.into()),
            body: None,
        }
    }

    /// Settles the envelope: `error` present rejects, anything else resolves.
    pub fn into_result(self) -> Result<FetchedResponse, RequestError> {
        match self.error {
            Some(message) => Err(RequestError::Remote {
                status: self.status,
                message,
            }),
            None => Ok(FetchedResponse {
                status: self.status,
                data: self.data.unwrap_or(serde_json::Value::Null),
                body: self.body,
            }),
        }
    }
}

/// Data delivered to the requester of a completed round trip.
///
/// Non-2xx statuses arrive here too; interpreting them is up to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedResponse {
    pub status: u16,
    pub data: serde_json::Value,
    pub body: Option<String>,
}

impl FetchedResponse {
    /// Returns whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserializes `data` into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}
