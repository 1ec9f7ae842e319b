//! Wire format spoken with the Luxbox server.
//!
//! Every message in both directions is one compact JSON object followed by a
//! single `\n`. The only exception is the bare signal word the server sends
//! before it accepts a raw byte stream. Framing relies on the fact that no
//! encoded message contains a newline; `serde_json` escapes newlines inside
//! strings and its compact writer never emits one between tokens.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: &str = "8068";

/// Signal sent by the server once it is prepared to receive an upload stream.
pub const SIGNAL_READY: &str = "ready";

pub mod action {
    pub const REGISTER: &str = "register";
    pub const UPLOAD: &str = "upload";
}

pub mod code {
    /// Simple request handled successfully.
    pub const OK: i64 = 0;
    /// Upload stream received and stored.
    pub const TRANSFER_COMPLETE: i64 = 3;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("could not connect to server {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not connected to server")]
    NotConnected,
    #[error("cannot {operation} while the connection is in state {phase:?}")]
    OutOfSequence {
        operation: &'static str,
        phase: crate::connector::Phase,
    },
    #[error("malformed response from server: {raw:?}")]
    MalformedResponse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from server is not valid UTF-8: {}", String::from_utf8_lossy(raw))]
    InvalidUtf8 { raw: Vec<u8> },
    #[error("unexpected message received from server, expected '{expected}', got '{actual}'")]
    UnexpectedSignal { expected: String, actual: String },
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("timed out waiting for the server")]
    TimedOut,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Request {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
}

impl Response {
    /// Returns a string field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Serializes a request into a single newline-terminated frame.
pub fn encode(request: &Request) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(request)?;
    debug_assert!(!frame.contains(&b'\n'));
    frame.push(b'\n');
    Ok(frame)
}

/// Parses one received line into a response. Trailing whitespace, including
/// the delimiter, is ignored.
pub fn decode(line: &str) -> Result<Response> {
    let trimmed = line.trim_end();
    serde_json::from_str(trimmed).map_err(|source| ProtocolError::MalformedResponse {
        raw: trimmed.to_string(),
        source,
    })
}

/// One-way digest of a stored token as it is sent on the wire:
/// URL-safe base64 of its SHA-256.
pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_produces_single_terminated_line() {
        let req = Request::new(action::UPLOAD)
            .with_meta("resourceName", "line\nbreak.txt")
            .with_meta("resourceSize", 2048)
            .with_meta("overwrite", false);

        let frame = encode(&req).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn encoded_request_decodes_back_to_same_fields() {
        let req = Request::new(action::UPLOAD)
            .with_meta("resourceName", "a.txt")
            .with_meta("resourceSize", 2048)
            .with_meta("overwrite", true);

        let frame = encode(&req).unwrap();
        let echoed: Request = serde_json::from_slice(&frame).unwrap();
        assert_eq!(echoed, req);
    }

    #[test]
    fn register_request_has_empty_meta_object() {
        let frame = encode(&Request::new(action::REGISTER)).unwrap();
        assert_eq!(frame, b"{\"action\":\"register\",\"meta\":{}}\n");
    }

    #[test]
    fn decode_trims_delimiter() {
        let resp = decode("{\"code\":3,\"data\":{}}\r\n").unwrap();
        assert_eq!(resp.code, code::TRANSFER_COMPLETE);
        assert!(resp.data.is_empty());
    }

    #[test]
    fn decode_reads_data_payload() {
        let resp = decode(r#"{"code":0,"data":{"user":"bob","token":"secret"}}"#).unwrap();
        assert_eq!(resp.data_str("user"), Some("bob"));
        assert_eq!(resp.data_str("token"), Some("secret"));
        assert_eq!(resp.data_str("missing"), None);
    }

    #[test]
    fn decode_tolerates_missing_or_null_data() {
        assert!(decode(r#"{"code":1}"#).unwrap().data.is_empty());
        assert!(decode(r#"{"code":1,"data":null}"#).unwrap().data.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_line_with_raw_text() {
        let err = decode("{\"code\":3,\"da").unwrap_err();
        match err {
            ProtocolError::MalformedResponse { raw, .. } => assert_eq!(raw, "{\"code\":3,\"da"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(
            decode("ready\n"),
            Err(ProtocolError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn token_digest_is_url_safe_sha256() {
        let digest = token_digest("abc");
        assert_eq!(digest, "ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0=");
        assert_ne!(digest, "abc");
    }

    #[test]
    fn meta_values_keep_their_json_types() {
        let req = Request::new(action::UPLOAD)
            .with_meta("resourceSize", 10u64)
            .with_meta("overwrite", true);
        assert_eq!(req.meta["resourceSize"], json!(10));
        assert_eq!(req.meta["overwrite"], json!(true));
    }
}
