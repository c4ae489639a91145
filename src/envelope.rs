//! Message Envelope Types for Peer Communication
//!
//! Envelopes are the JSON wire format exchanged with a connected peer
//! (a device or an application client). Every envelope is one of three kinds:
//!
//! ```text
//! Desktop → Peer:  Request  (method invocation with a correlation id)
//! Peer → Desktop:  Response (success or error, same correlation id)
//! Peer → Desktop:  Event    (plugin push message, no correlation id)
//! ```
//!
//! Decoding is strict about the discriminant fields and lenient about
//! everything else: unknown fields are ignored so newer peers stay
//! compatible, and unknown method names decode fine (routing decides what
//! to do with them, not the codec).

use serde_json::Value as JsonValue;

/// Success or failure payload of a response envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// The peer completed the request; carries the result payload.
    Success(JsonValue),
    /// The peer failed the request; carries the error payload.
    Failure(JsonValue),
}

/// One wire-level unit of communication with a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Method invocation. Correlation ids are unique for the lifetime of a
    /// connection (monotonic counter, never reused on reconnect since a
    /// reconnect creates a new connection).
    Request {
        id: u64,
        method: String,
        params: JsonValue,
    },
    /// Reply to a request, correlated by id.
    Response { id: u64, outcome: ResponseOutcome },
    /// Unsolicited push from a plugin on the peer side.
    Event {
        plugin: String,
        method: String,
        payload: JsonValue,
    },
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(id: u64, method: &str, params: JsonValue) -> Self {
        Envelope::Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Create a success response.
    pub fn success(id: u64, result: JsonValue) -> Self {
        Envelope::Response {
            id,
            outcome: ResponseOutcome::Success(result),
        }
    }

    /// Create an error response.
    pub fn failure(id: u64, error: JsonValue) -> Self {
        Envelope::Response {
            id,
            outcome: ResponseOutcome::Failure(error),
        }
    }

    /// Create an event envelope.
    pub fn event(plugin: &str, method: &str, payload: JsonValue) -> Self {
        Envelope::Event {
            plugin: plugin.to_string(),
            method: method.to_string(),
            payload,
        }
    }

    /// Serialize to JSON bytes. Total for well-formed in-memory envelopes.
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Envelope::Request { id, method, params } => serde_json::json!({
                "id": id,
                "method": method,
                "params": params,
            }),
            Envelope::Response { id, outcome } => match outcome {
                ResponseOutcome::Success(result) => serde_json::json!({
                    "id": id,
                    "success": result,
                }),
                ResponseOutcome::Failure(error) => serde_json::json!({
                    "id": id,
                    "error": error,
                }),
            },
            Envelope::Event {
                plugin,
                method,
                payload,
            } => serde_json::json!({
                "plugin": plugin,
                "method": method,
                "payload": payload,
            }),
        };
        serde_json::to_vec(&value).expect("envelope serialization should never fail")
    }

    /// Deserialize from JSON bytes.
    ///
    /// Fails with [`EnvelopeError::Malformed`] when the discriminant fields
    /// are absent or of the wrong type. Extra fields are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        let object = value
            .as_object()
            .ok_or_else(|| EnvelopeError::Malformed("envelope is not a JSON object".into()))?;

        if let Some(id_value) = object.get("id") {
            let id = id_value
                .as_u64()
                .ok_or_else(|| EnvelopeError::Malformed("'id' is not an unsigned integer".into()))?;

            if let Some(method_value) = object.get("method") {
                let method = method_value
                    .as_str()
                    .ok_or_else(|| EnvelopeError::Malformed("'method' is not a string".into()))?;
                let params = object.get("params").cloned().unwrap_or(JsonValue::Null);
                return Ok(Envelope::request(id, method, params));
            }
            if let Some(result) = object.get("success") {
                return Ok(Envelope::success(id, result.clone()));
            }
            if let Some(error) = object.get("error") {
                return Ok(Envelope::failure(id, error.clone()));
            }
            return Err(EnvelopeError::Malformed(
                "correlated envelope has neither 'method', 'success' nor 'error'".into(),
            ));
        }

        let plugin = object
            .get("plugin")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EnvelopeError::Malformed("event is missing 'plugin'".into()))?;
        let method = object
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EnvelopeError::Malformed("event is missing 'method'".into()))?;
        let payload = object.get("payload").cloned().unwrap_or(JsonValue::Null);
        Ok(Envelope::event(plugin, method, payload))
    }

    /// Check if this is a request envelope.
    pub fn is_request(&self) -> bool {
        matches!(self, Envelope::Request { .. })
    }

    /// Check if this is a response envelope.
    pub fn is_response(&self) -> bool {
        matches!(self, Envelope::Response { .. })
    }

    /// Check if this is an event envelope.
    pub fn is_event(&self) -> bool {
        matches!(self, Envelope::Event { .. })
    }

    /// Correlation id, if this envelope carries one.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } => Some(*id),
            Envelope::Event { .. } => None,
        }
    }
}

/// Errors that can occur while decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(e: serde_json::Error) -> Self {
        EnvelopeError::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let envelope = Envelope::request(7, "getPlugins", json!({"verbose": true}));
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.is_request());
        assert_eq!(decoded.correlation_id(), Some(7));
    }

    #[test]
    fn test_success_and_failure_roundtrip() {
        let ok = Envelope::success(1, json!({"plugins": ["Network"]}));
        assert_eq!(Envelope::decode(&ok.encode()).unwrap(), ok);

        let err = Envelope::failure(2, json!({"message": "boom"}));
        let decoded = Envelope::decode(&err.encode()).unwrap();
        assert_eq!(decoded, err);
        assert!(decoded.is_response());
    }

    #[test]
    fn test_event_roundtrip() {
        let envelope = Envelope::event("Network", "newRequest", json!({"url": "/health"}));
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.is_event());
        assert_eq!(decoded.correlation_id(), None);
    }

    #[test]
    fn test_unknown_method_still_decodes() {
        // Unknown method names are a routing concern, not a codec concern.
        let bytes = serde_json::to_vec(&json!({"id": 3, "method": "noSuchMethod"})).unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert!(matches!(decoded, Envelope::Request { ref method, .. } if method == "noSuchMethod"));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let bytes = serde_json::to_vec(&json!({
            "id": 4,
            "success": {"ok": true},
            "futureField": [1, 2, 3],
        }))
        .unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, Envelope::success(4, json!({"ok": true})));
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        // Not an object.
        assert!(Envelope::decode(b"[1,2,3]").is_err());
        // Wrong id type.
        let bytes = serde_json::to_vec(&json!({"id": "seven", "method": "x"})).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
        // Correlated but no discriminant payload.
        let bytes = serde_json::to_vec(&json!({"id": 1})).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
        // Event missing plugin.
        let bytes = serde_json::to_vec(&json!({"method": "newRequest"})).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
        // Not JSON at all.
        assert!(Envelope::decode(b"not json").is_err());
    }
}
