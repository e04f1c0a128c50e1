//! Self-describing message envelope and its JSON codec
//!
//! Wire shape (compact JSON object):
//!
//! ```json
//! {"id":"…","type":"stt.transcript.final","ts":1718000000.123,"source":"stt","data":{…},"correlate":"…","seq":3}
//! ```
//!
//! `correlate` and `seq` are optional. Decoding is strict: missing required
//! keys, unknown keys, or a non-object `data` are all [`EnvelopeError`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Envelope encode/decode errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Envelope field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("Envelope data must serialize to a JSON object, got {0}")]
    DataNotObject(&'static str),
    #[error("Envelope data could not be serialized: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Message wrapper carried on every business topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Globally unique identifier, fixed at creation
    pub id: String,
    /// Dotted event name, e.g. `tts.request`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Creation time as epoch seconds
    pub ts: f64,
    /// Publisher identity
    pub source: String,
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            event_type: event_type.into(),
            ts: now_epoch_secs(),
            source: source.into(),
            data,
            correlate: None,
            seq: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlate = Some(correlation_id.into());
        self
    }

    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// Current time as fractional epoch seconds (microsecond resolution)
pub fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Wraps domain payloads into envelopes and (de)serializes them
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    source: String,
}

impl EnvelopeCodec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap any serializable payload; it must serialize to a JSON object
    pub fn wrap<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        data: &T,
        correlation_id: Option<&str>,
        seq: Option<i64>,
    ) -> Result<Envelope, EnvelopeError> {
        if event_type.is_empty() {
            return Err(EnvelopeError::EmptyField("type"));
        }

        let data = match serde_json::to_value(data).map_err(EnvelopeError::Serialize)? {
            Value::Object(map) => map,
            other => return Err(EnvelopeError::DataNotObject(json_kind(&other))),
        };

        let mut envelope = Envelope::new(event_type, self.source.clone(), data);
        envelope.correlate = correlation_id.map(str::to_string);
        envelope.seq = seq;
        Ok(envelope)
    }

    /// Compact JSON encoding
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(envelope).map_err(EnvelopeError::Serialize)
    }

    /// Strict decoding; never panics on arbitrary input
    pub fn decode(payload: &[u8]) -> Result<Envelope, EnvelopeError> {
        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(EnvelopeError::Malformed)?;

        if envelope.id.is_empty() {
            return Err(EnvelopeError::EmptyField("id"));
        }
        if envelope.event_type.is_empty() {
            return Err(EnvelopeError::EmptyField("type"));
        }
        if envelope.source.is_empty() {
            return Err(EnvelopeError::EmptyField("source"));
        }

        Ok(envelope)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new("stt")
    }

    #[test]
    fn test_wrap_populates_identity_and_time() {
        let before = now_epoch_secs();
        let envelope = codec()
            .wrap("stt.transcript.final", &json!({"text": "hello"}), None, None)
            .unwrap();

        assert_eq!(envelope.id.len(), 32);
        assert_eq!(envelope.event_type, "stt.transcript.final");
        assert_eq!(envelope.source, "stt");
        assert!(envelope.ts >= before);
        assert_eq!(envelope.data["text"], "hello");
        assert!(envelope.correlate.is_none());
        assert!(envelope.seq.is_none());
    }

    #[test]
    fn test_wrap_generates_unique_ids() {
        let a = codec().wrap("a.b", &json!({}), None, None).unwrap();
        let b = codec().wrap("a.b", &json!({}), None, None).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_wrap_rejects_non_object_data() {
        let result = codec().wrap("a.b", &json!([1, 2, 3]), None, None);
        assert!(matches!(result, Err(EnvelopeError::DataNotObject("array"))));

        let result = codec().wrap("a.b", &42, None, None);
        assert!(matches!(result, Err(EnvelopeError::DataNotObject("number"))));
    }

    #[test]
    fn test_wrap_accepts_structs() {
        #[derive(Serialize)]
        struct Transcript<'a> {
            text: &'a str,
            confidence: f32,
        }

        let envelope = codec()
            .wrap(
                "stt.transcript.final",
                &Transcript {
                    text: "lights on",
                    confidence: 0.5,
                },
                Some("utt-1"),
                Some(7),
            )
            .unwrap();
        assert_eq!(envelope.data["text"], "lights on");
        assert_eq!(envelope.correlate.as_deref(), Some("utt-1"));
        assert_eq!(envelope.seq, Some(7));
    }

    #[test]
    fn test_encode_is_compact_and_skips_absent_optionals() {
        let envelope = codec().wrap("a.b", &json!({"x": 1}), None, None).unwrap();
        let encoded = String::from_utf8(EnvelopeCodec::encode(&envelope).unwrap()).unwrap();

        assert!(!encoded.contains(' '));
        assert!(encoded.contains("\"type\":\"a.b\""));
        assert!(!encoded.contains("correlate"));
        assert!(!encoded.contains("seq"));
    }

    #[test]
    fn test_decode_round_trip_with_optionals() {
        let envelope = codec()
            .wrap("llm.reply", &json!({"tokens": [1, 2]}), Some("req-9"), Some(3))
            .unwrap();
        let decoded = EnvelopeCodec::decode(&EnvelopeCodec::encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let payload = br#"{"id":"1","type":"a","ts":1.0,"source":"s","data":{},"extra":true}"#;
        assert!(matches!(
            EnvelopeCodec::decode(payload),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_required_fields() {
        let cases: [&[u8]; 5] = [
            br#"{"type":"a","ts":1.0,"source":"s","data":{}}"#,
            br#"{"id":"1","ts":1.0,"source":"s","data":{}}"#,
            br#"{"id":"1","type":"a","source":"s","data":{}}"#,
            br#"{"id":"1","type":"a","ts":1.0,"data":{}}"#,
            br#"{"id":"1","type":"a","ts":1.0,"source":"s"}"#,
        ];
        for payload in cases {
            assert!(EnvelopeCodec::decode(payload).is_err());
        }
    }

    #[test]
    fn test_decode_rejects_non_object_data_and_garbage() {
        assert!(EnvelopeCodec::decode(br#"{"id":"1","type":"a","ts":1.0,"source":"s","data":[1]}"#).is_err());
        assert!(EnvelopeCodec::decode(b"not json").is_err());
        assert!(EnvelopeCodec::decode(b"").is_err());
        assert!(EnvelopeCodec::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_decode_rejects_empty_identity() {
        let payload = br#"{"id":"","type":"a","ts":1.0,"source":"s","data":{}}"#;
        assert!(matches!(
            EnvelopeCodec::decode(payload),
            Err(EnvelopeError::EmptyField("id"))
        ));
    }

    #[test]
    fn test_decode_accepts_null_optionals() {
        let payload =
            br#"{"id":"1","type":"a","ts":1.5,"source":"s","data":{},"correlate":null,"seq":null}"#;
        let envelope = EnvelopeCodec::decode(payload).unwrap();
        assert!(envelope.correlate.is_none());
        assert!(envelope.seq.is_none());
    }

    #[test]
    fn test_negative_seq_round_trips() {
        let payload = br#"{"id":"n","type":"a.b","ts":2.0,"source":"s","data":{},"seq":-1}"#;
        let envelope = EnvelopeCodec::decode(payload).unwrap();
        assert_eq!(envelope.seq, Some(-1));

        let decoded = EnvelopeCodec::decode(&EnvelopeCodec::encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = EnvelopeCodec::decode(&bytes);
        }

        #[test]
        fn decode_inverts_encode(
            event_type in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}",
            key in "[a-z]{1,10}",
            value in any::<i64>(),
            correlate in proptest::option::of("[a-z0-9-]{1,16}"),
            seq in proptest::option::of(any::<i64>()),
        ) {
            let mut data = Map::new();
            data.insert(key, json!(value));
            let mut envelope = Envelope::new(event_type, "prop", data);
            envelope.correlate = correlate;
            envelope.seq = seq;

            let decoded = EnvelopeCodec::decode(&EnvelopeCodec::encode(&envelope).unwrap()).unwrap();
            prop_assert_eq!(decoded, envelope);
        }
    }
}
