//! JSON codec for encoding and decoding [`Envelope`]s.
//!
//! Wire format: one JSON object per logical message.
//! ```text
//! { "id": string, "type": MessageType, "deviceId": string, "ts": int64, "payload": object }
//! ```
//!
//! Decoding happens in two phases:
//!
//! 1. Parse the outer object into a loosely typed [`RawEnvelope`] whose
//!    payload is still an untyped `serde_json::Value`.
//! 2. Look at `type` and convert the payload into exactly one typed schema.
//!
//! A failure in either phase rejects the whole message with
//! [`ProtocolError::MalformedMessage`]; nothing is partially decoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::messages::{
    AckPayload, Envelope, ErrorPayload, GsrDataPayload, HelloPayload, MessageType, Payload,
    RegisterPayload, StartPayload, SyncMarkPayload, TimeSyncRequestPayload,
    TimeSyncResponsePayload, UploadBeginPayload, UploadChunkPayload, UploadEndPayload,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The text is not a well-formed envelope, or its payload does not match
    /// the schema implied by its `type`.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A payload could not be serialised.
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

impl ProtocolError {
    fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage(reason.into())
    }
}

/// Phase-one view of an inbound message.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    ts: i64,
    #[serde(default)]
    payload: Value,
}

/// Borrowed outbound view, so encoding never clones sample batches.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    ts: i64,
    payload: WirePayload<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePayload<'a> {
    Hello(&'a HelloPayload),
    Register(&'a RegisterPayload),
    Start(&'a StartPayload),
    SyncMark(&'a SyncMarkPayload),
    GsrData(&'a GsrDataPayload),
    Ack(&'a AckPayload),
    Error(&'a ErrorPayload),
    TimeSyncRequest(&'a TimeSyncRequestPayload),
    TimeSyncResponse(&'a TimeSyncResponsePayload),
    UploadBegin(&'a UploadBeginPayload),
    UploadChunk(&'a UploadChunkPayload),
    UploadEnd(&'a UploadEndPayload),
    Empty(EmptyPayload),
}

/// `{}`: the payload of `STOP`, `EMPTY`, `PING` and `PONG`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EmptyPayload {}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes an [`Envelope`] as a JSON string.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if a payload value cannot be
/// represented in JSON (e.g. a non-finite float in a sample).
///
/// # Examples
///
/// ```rust
/// use gsr_core::protocol::{decode_envelope, encode_envelope, Envelope, Payload};
///
/// let env = Envelope::new("phone-1", Payload::Ping);
/// let text = encode_envelope(&env).unwrap();
/// assert_eq!(decode_envelope(&text).unwrap(), env);
/// ```
pub fn encode_envelope(envelope: &Envelope) -> Result<String, ProtocolError> {
    let wire = WireEnvelope {
        id: envelope.id(),
        kind: envelope.message_type(),
        device_id: envelope.device_id(),
        ts: envelope.ts(),
        payload: wire_payload(envelope.payload()),
    };
    serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialize(e.to_string()))
}

/// Decodes one [`Envelope`] from JSON text.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] when the outer object is
/// invalid, the type is unknown, or the payload does not fit the type.
pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text)
        .map_err(|e| ProtocolError::malformed(format!("invalid envelope: {e}")))?;

    if raw.id.is_empty() {
        return Err(ProtocolError::malformed("envelope id must not be empty"));
    }
    if raw.device_id.is_empty() {
        return Err(ProtocolError::malformed("deviceId must not be empty"));
    }

    let kind = MessageType::try_from(raw.kind.as_str())
        .map_err(|_| ProtocolError::malformed(format!("unknown message type '{}'", raw.kind)))?;
    let payload = decode_payload(kind, raw.payload)?;

    Ok(Envelope::from_parts(raw.id, raw.device_id, raw.ts, payload))
}

/// Converts an untyped payload into the schema selected by `kind`.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] naming the type whose schema
/// was violated.
pub fn decode_payload(kind: MessageType, value: Value) -> Result<Payload, ProtocolError> {
    match kind {
        MessageType::Hello => typed(kind, value).map(Payload::Hello),
        MessageType::Register => typed(kind, value).map(Payload::Register),
        MessageType::Start => typed(kind, value).map(Payload::Start),
        MessageType::Stop => empty(kind, value).map(|_| Payload::Stop),
        MessageType::SyncMark => typed(kind, value).map(Payload::SyncMark),
        MessageType::GsrData => typed(kind, value).map(Payload::GsrData),
        MessageType::Ack => typed(kind, value).map(Payload::Ack),
        MessageType::Empty => empty(kind, value).map(|_| Payload::Empty),
        MessageType::Ping => empty(kind, value).map(|_| Payload::Ping),
        MessageType::Pong => empty(kind, value).map(|_| Payload::Pong),
        MessageType::Error => typed(kind, value).map(Payload::Error),
        MessageType::TimeSyncRequest => typed(kind, value).map(Payload::TimeSyncRequest),
        MessageType::TimeSyncResponse => typed(kind, value).map(Payload::TimeSyncResponse),
        MessageType::UploadBegin => typed(kind, value).map(Payload::UploadBegin),
        MessageType::UploadChunk => typed(kind, value).map(Payload::UploadChunk),
        MessageType::UploadEnd => typed(kind, value).map(Payload::UploadEnd),
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn typed<T: serde::de::DeserializeOwned>(
    kind: MessageType,
    value: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::malformed(format!("invalid {kind} payload: {e}")))
}

/// Empty payloads may be omitted, `null`, or an object.
fn empty(kind: MessageType, value: Value) -> Result<(), ProtocolError> {
    match value {
        Value::Null => Ok(()),
        other => typed::<EmptyPayload>(kind, other).map(|_| ()),
    }
}

fn wire_payload(payload: &Payload) -> WirePayload<'_> {
    match payload {
        Payload::Hello(p) => WirePayload::Hello(p),
        Payload::Register(p) => WirePayload::Register(p),
        Payload::Start(p) => WirePayload::Start(p),
        Payload::SyncMark(p) => WirePayload::SyncMark(p),
        Payload::GsrData(p) => WirePayload::GsrData(p),
        Payload::Ack(p) => WirePayload::Ack(p),
        Payload::Error(p) => WirePayload::Error(p),
        Payload::TimeSyncRequest(p) => WirePayload::TimeSyncRequest(p),
        Payload::TimeSyncResponse(p) => WirePayload::TimeSyncResponse(p),
        Payload::UploadBegin(p) => WirePayload::UploadBegin(p),
        Payload::UploadChunk(p) => WirePayload::UploadChunk(p),
        Payload::UploadEnd(p) => WirePayload::UploadEnd(p),
        Payload::Stop | Payload::Empty | Payload::Ping | Payload::Pong => {
            WirePayload::Empty(EmptyPayload::default())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::Sample;

    fn sample(seq: u64) -> Sample {
        Sample {
            t_mono_ns: 1_000 + seq as i64,
            t_utc_ns: 1_700_000_000_000_000_000 + seq as i64,
            seq,
            gsr_raw: 2.5,
            gsr_filt: 2.25,
            temp: 33.125,
            flag_spike: false,
            flag_sat: seq % 2 == 0,
            flag_dropout: false,
        }
    }

    #[test]
    fn test_decode_hello_from_device_json() {
        // Arrange
        let text = r#"{"id":"m1","type":"HELLO","deviceId":"D1","ts":1700000000000,
            "payload":{"deviceName":"D1","capabilities":["GSR"],"batteryLevel":80,
            "version":"1.0"}}"#;

        // Act
        let env = decode_envelope(text).unwrap();

        // Assert
        assert_eq!(env.id(), "m1");
        assert_eq!(env.device_id(), "D1");
        match env.payload() {
            Payload::Hello(h) => {
                assert_eq!(h.device_name, "D1");
                assert_eq!(h.capabilities, vec!["GSR".to_string()]);
                assert_eq!(h.battery_level, 80);
            }
            other => panic!("expected HELLO, got {other:?}"),
        }
    }

    #[test]
    fn test_gsr_data_round_trip_preserves_sample_order() {
        let env = Envelope::new(
            "D1",
            Payload::GsrData(GsrDataPayload {
                samples: (0..5).map(sample).collect(),
            }),
        );
        let decoded = decode_envelope(&encode_envelope(&env).unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_stop_accepts_missing_or_null_payload() {
        let missing = r#"{"id":"a","type":"STOP","deviceId":"D1","ts":1}"#;
        let null = r#"{"id":"b","type":"STOP","deviceId":"D1","ts":1,"payload":null}"#;
        assert_eq!(decode_envelope(missing).unwrap().payload(), &Payload::Stop);
        assert_eq!(decode_envelope(null).unwrap().payload(), &Payload::Stop);
    }

    #[test]
    fn test_empty_payload_encodes_as_empty_object() {
        let env = Envelope::from_parts("x", "D1", 5, Payload::Empty);
        let text = encode_envelope(&env).unwrap();
        assert!(text.contains("\"payload\":{}"), "got {text}");
        assert!(text.contains("\"type\":\"EMPTY\""));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let text = r#"{"id":"a","type":"FIRMWARE","deviceId":"D1","ts":1,"payload":{}}"#;
        let err = decode_envelope(text).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(ref m) if m.contains("FIRMWARE")));
    }

    #[test]
    fn test_payload_not_matching_type_is_malformed() {
        // START payload sent with the SYNC_MARK type.
        let text = r#"{"id":"a","type":"SYNC_MARK","deviceId":"D1","ts":1,
            "payload":{"sessionName":"T1"}}"#;
        assert!(matches!(
            decode_envelope(text),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_one_bad_sample_rejects_the_whole_batch() {
        let text = r#"{"id":"a","type":"GSR_DATA","deviceId":"D1","ts":1,"payload":{"samples":[
            {"t_mono_ns":1,"t_utc_ns":1,"seq":1,"gsr_raw":1.0,"gsr_filt":1.0,"temp":30.0,
             "flag_spike":false,"flag_sat":false,"flag_dropout":false},
            {"t_mono_ns":2,"t_utc_ns":2,"seq":"two"}]}}"#;
        assert!(matches!(
            decode_envelope(text),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_missing_envelope_field_is_malformed() {
        let text = r#"{"id":"a","type":"PING","ts":1}"#;
        assert!(matches!(
            decode_envelope(text),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_empty_device_id_is_malformed() {
        let text = r#"{"id":"a","type":"PING","deviceId":"","ts":1}"#;
        assert!(decode_envelope(text).is_err());
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(matches!(
            decode_envelope("HELLO D1"),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_register_omits_absent_optional_fields() {
        let env = Envelope::new(
            "D1",
            Payload::Register(RegisterPayload {
                accepted: true,
                reason: None,
                sync_port: Some(9123),
                sync_config: None,
            }),
        );
        let text = encode_envelope(&env).unwrap();
        assert!(text.contains("\"syncPort\":9123"));
        assert!(!text.contains("reason"));
        assert!(!text.contains("syncConfig"));
    }

    #[test]
    fn test_decode_upload_chunk_defaults_is_last_to_false() {
        // Arrange
        let text = r#"{"id":"u1","type":"UPLOAD_CHUNK","deviceId":"D1","ts":1,
            "payload":{"fileName":"video.mp4","chunkIndex":3,"data":"AAEC"}}"#;

        // Act
        let env = decode_envelope(text).unwrap();

        // Assert
        match env.payload() {
            Payload::UploadChunk(chunk) => {
                assert_eq!(chunk.file_name, "video.mp4");
                assert_eq!(chunk.chunk_index, 3);
                assert_eq!(chunk.data, "AAEC");
                assert!(!chunk.is_last);
            }
            other => panic!("expected UPLOAD_CHUNK, got {other:?}"),
        }
    }

    #[test]
    fn test_upload_end_request_omits_result_fields() {
        let env = Envelope::new(
            "D1",
            Payload::UploadEnd(UploadEndPayload {
                file_name: "notes.txt".to_string(),
                success: None,
                total_chunks: None,
                message: None,
            }),
        );
        let text = encode_envelope(&env).unwrap();
        assert!(text.contains("\"payload\":{\"fileName\":\"notes.txt\"}"), "got {text}");
        assert_eq!(decode_envelope(&text).unwrap(), env);
    }

    #[test]
    fn test_upload_begin_without_checksum_is_malformed() {
        let text = r#"{"id":"a","type":"UPLOAD_BEGIN","deviceId":"D1","ts":1,
            "payload":{"fileName":"a.bin","fileSize":10,"chunkSize":4}}"#;
        assert!(matches!(
            decode_envelope(text),
            Err(ProtocolError::MalformedMessage(ref m)) if m.contains("UPLOAD_BEGIN")
        ));
    }

    #[test]
    fn test_non_finite_sample_fails_to_encode() {
        let mut bad = sample(1);
        bad.gsr_raw = f64::NAN;
        let env = Envelope::new("D1", Payload::GsrData(GsrDataPayload { samples: vec![bad] }));
        // serde_json writes NaN as null, which then fails to decode as f64.
        match encode_envelope(&env) {
            Ok(text) => assert!(decode_envelope(&text).is_err()),
            Err(e) => assert!(matches!(e, ProtocolError::Serialize(_))),
        }
    }
}
