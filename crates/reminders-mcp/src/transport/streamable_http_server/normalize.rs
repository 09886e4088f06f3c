//! Inbound request normalization for the HTTP boundary.
//!
//! A raw POST body becomes a well-formed request envelope: the
//! protocol-version tag is injected when absent, and a correlation id is
//! synthesized when absent, so the protocol engine only ever sees id-bearing
//! requests. The method name and id are handed back to the boundary for its
//! pre-dispatch decisions (`initialize`/`ping` special-casing).

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;

use crate::model::{ErrorData, JsonRpcMessage, RequestId};

// Shared across every session for the process lifetime; never reset, so
// synthesized ids cannot collide.
static NEXT_SYNTHETIC_ID: AtomicI64 = AtomicI64::new(0);

/// A canonicalized request body plus the fields the boundary dispatches on.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub message: JsonRpcMessage,
    pub method: Option<String>,
    pub id: RequestId,
}

/// Validate and canonicalize a raw request body.
pub fn normalize(body: &[u8]) -> Result<NormalizedRequest, ErrorData> {
    if body.is_empty() {
        return Err(ErrorData::parse_error("empty request body"));
    }
    let mut value: Value =
        serde_json::from_slice(body).map_err(|e| ErrorData::parse_error(e.to_string()))?;
    let Some(object) = value.as_object_mut() else {
        return Err(ErrorData::parse_error("request body must be a JSON object"));
    };

    if !object.contains_key("jsonrpc") {
        object.insert("jsonrpc".to_string(), Value::from("2.0"));
    }

    let id = match object.get("id") {
        Some(Value::Number(number)) => match number.as_i64() {
            Some(n) => RequestId::Number(n),
            None => {
                return Err(ErrorData::parse_error(
                    "request id must be an integer or a string",
                ));
            }
        },
        Some(Value::String(s)) => RequestId::String(s.as_str().into()),
        Some(Value::Null) | None => {
            let n = NEXT_SYNTHETIC_ID.fetch_add(1, Ordering::Relaxed);
            object.insert("id".to_string(), Value::from(n));
            RequestId::Number(n)
        }
        Some(_) => {
            return Err(ErrorData::parse_error(
                "request id must be an integer or a string",
            ));
        }
    };

    let method = object.get("method").and_then(Value::as_str).map(str::to_owned);

    let message =
        serde_json::from_value(value).map_err(|e| ErrorData::parse_error(e.to_string()))?;

    Ok(NormalizedRequest {
        message,
        method,
        id,
    })
}
