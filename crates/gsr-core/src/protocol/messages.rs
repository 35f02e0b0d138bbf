//! All GSR orchestrator protocol message types.
//!
//! Every exchange between the controller and a sensing device is wrapped in an
//! [`Envelope`]:
//!
//! ```text
//! { "id": "…", "type": "GSR_DATA", "deviceId": "phone-1", "ts": 1700000000000,
//!   "payload": { "samples": [ … ] } }
//! ```
//!
//! The `type` field selects exactly one payload schema.  In Rust that mapping
//! is a closed enum ([`Payload`]): an envelope cannot be built with a payload
//! that disagrees with its type, because the type is *derived from* the
//! payload variant.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version string announced by the controller.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Status strings carried by [`AckPayload::status`].
pub mod ack_status {
    pub const SESSION_STARTED: &str = "SESSION_STARTED";
    pub const SESSION_STOPPED: &str = "SESSION_STOPPED";
    pub const SYNC_MARK_RECEIVED: &str = "SYNC_MARK_RECEIVED";
    pub const UPLOAD_READY: &str = "UPLOAD_READY";
}

/// Error codes carried by [`ErrorPayload::code`].
pub mod error_code {
    pub const MALFORMED_MESSAGE: &str = "MALFORMED_MESSAGE";
    pub const SESSION_CONFLICT: &str = "SESSION_CONFLICT";
    pub const NO_ACTIVE_SESSION: &str = "NO_ACTIVE_SESSION";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CONNECTIVITY_ERROR: &str = "CONNECTIVITY_ERROR";
    pub const UPLOAD_NOT_FOUND: &str = "UPLOAD_NOT_FOUND";
    pub const UPLOAD_FAILED: &str = "UPLOAD_FAILED";
    pub const SIZE_MISMATCH: &str = "SIZE_MISMATCH";
    pub const CHECKSUM_MISMATCH: &str = "CHECKSUM_MISMATCH";
}

/// Longest device id or upload file name accepted.
pub const MAX_NAME_LEN: usize = 128;

/// Whether `name` can be used as a single file-system path component.
///
/// Device ids and upload file names end up as directory and file names
/// under the export root, so they must not contain separators, control
/// characters or a `..` sequence, and must not be `.` alone.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && !name.contains("..")
        && !name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
}

// ── Message type codes ────────────────────────────────────────────────────────

/// The closed set of message types understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hello,
    Register,
    Start,
    Stop,
    SyncMark,
    GsrData,
    Ack,
    Empty,
    Ping,
    Pong,
    Error,
    TimeSyncRequest,
    TimeSyncResponse,
    UploadBegin,
    UploadChunk,
    UploadEnd,
}

impl MessageType {
    /// Wire spelling of this type (`"GSR_DATA"`, `"SYNC_MARK"`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Register => "REGISTER",
            MessageType::Start => "START",
            MessageType::Stop => "STOP",
            MessageType::SyncMark => "SYNC_MARK",
            MessageType::GsrData => "GSR_DATA",
            MessageType::Ack => "ACK",
            MessageType::Empty => "EMPTY",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
            MessageType::TimeSyncRequest => "TIME_SYNC_REQUEST",
            MessageType::TimeSyncResponse => "TIME_SYNC_RESPONSE",
            MessageType::UploadBegin => "UPLOAD_BEGIN",
            MessageType::UploadChunk => "UPLOAD_CHUNK",
            MessageType::UploadEnd => "UPLOAD_END",
        }
    }
}

impl TryFrom<&str> for MessageType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, ()> {
        match value {
            "HELLO" => Ok(MessageType::Hello),
            "REGISTER" => Ok(MessageType::Register),
            "START" => Ok(MessageType::Start),
            "STOP" => Ok(MessageType::Stop),
            "SYNC_MARK" => Ok(MessageType::SyncMark),
            "GSR_DATA" => Ok(MessageType::GsrData),
            "ACK" => Ok(MessageType::Ack),
            "EMPTY" => Ok(MessageType::Empty),
            "PING" => Ok(MessageType::Ping),
            "PONG" => Ok(MessageType::Pong),
            "ERROR" => Ok(MessageType::Error),
            "TIME_SYNC_REQUEST" => Ok(MessageType::TimeSyncRequest),
            "TIME_SYNC_RESPONSE" => Ok(MessageType::TimeSyncResponse),
            "UPLOAD_BEGIN" => Ok(MessageType::UploadBegin),
            "UPLOAD_CHUNK" => Ok(MessageType::UploadChunk),
            "UPLOAD_END" => Ok(MessageType::UploadEnd),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// HELLO: device announces its identity and capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_name: String,
    pub capabilities: Vec<String>,
    /// Battery charge in percent.
    pub battery_level: i32,
    /// Protocol version spoken by the device.
    pub version: String,
}

/// Clock-sync parameters handed to a device on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub sync_interval_ms: u64,
    pub offset_threshold_ms: u64,
}

/// REGISTER: controller accepts or rejects a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Secondary port devices may use for clock synchronisation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_config: Option<SyncConfig>,
}

/// START: begin a recording session on the sending device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub session_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// SYNC_MARK: an event marker inside the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMarkPayload {
    pub mark_id: String,
    pub description: String,
}

/// One physiological reading.
///
/// Field names are the wire names; they are snake_case on the wire too.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device-local monotonic clock, nanoseconds.
    pub t_mono_ns: i64,
    /// Device UTC clock, nanoseconds since the Unix epoch.
    pub t_utc_ns: i64,
    /// Strictly increasing per device stream.
    pub seq: u64,
    /// Raw skin conductance, microsiemens.
    pub gsr_raw: f64,
    /// Filtered skin conductance, microsiemens.
    pub gsr_filt: f64,
    /// Auxiliary temperature channel, °C.
    pub temp: f64,
    pub flag_spike: bool,
    pub flag_sat: bool,
    pub flag_dropout: bool,
}

/// GSR_DATA: a batch of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GsrDataPayload {
    pub samples: Vec<Sample>,
}

/// ACK: generic acknowledgement of a previously received envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Id of the envelope being acknowledged.
    pub message_id: String,
    /// One of the [`ack_status`] constants.
    pub status: String,
}

/// ERROR: rejection of a previously received envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// One of the [`error_code`] constants.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// TIME_SYNC_REQUEST: controller probe carrying its reference timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSyncRequestPayload {
    pub probe_id: u64,
    /// Controller reference clock at send time, ns since the Unix epoch.
    pub reference_ns: i64,
}

/// TIME_SYNC_RESPONSE: device echo of a probe plus its own clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSyncResponsePayload {
    pub probe_id: u64,
    /// Echo of [`TimeSyncRequestPayload::reference_ns`].
    pub reference_ns: i64,
    /// Device monotonic clock when the probe was handled.
    pub device_ns: i64,
}

/// UPLOAD_BEGIN: device announces a file it is about to send in chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBeginPayload {
    pub file_name: String,
    /// Total size in bytes after reassembly.
    pub file_size: u64,
    /// Decoded size of every chunk except possibly the last.
    pub chunk_size: u32,
    /// Lowercase hex SHA-256 of the whole file.
    pub sha256: String,
}

/// UPLOAD_CHUNK: one base64-encoded slice of an announced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkPayload {
    pub file_name: String,
    /// 0-based; chunk `i` starts at byte `i * chunk_size`.
    pub chunk_index: u32,
    pub data: String,
    /// Finalizes the upload once this chunk is written.
    #[serde(default)]
    pub is_last: bool,
}

/// UPLOAD_END: sent by the device to finalize, and by the controller to
/// report the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEndPayload {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Typed payload union ───────────────────────────────────────────────────────

/// Typed payload; the variant determines the envelope's [`MessageType`].
///
/// `STOP`, `EMPTY`, `PING` and `PONG` carry the empty payload `{}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Hello(HelloPayload),
    Register(RegisterPayload),
    Start(StartPayload),
    Stop,
    SyncMark(SyncMarkPayload),
    GsrData(GsrDataPayload),
    Ack(AckPayload),
    Empty,
    Ping,
    Pong,
    Error(ErrorPayload),
    TimeSyncRequest(TimeSyncRequestPayload),
    TimeSyncResponse(TimeSyncResponsePayload),
    UploadBegin(UploadBeginPayload),
    UploadChunk(UploadChunkPayload),
    UploadEnd(UploadEndPayload),
}

impl Payload {
    /// Returns the [`MessageType`] discriminant for this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Hello(_) => MessageType::Hello,
            Payload::Register(_) => MessageType::Register,
            Payload::Start(_) => MessageType::Start,
            Payload::Stop => MessageType::Stop,
            Payload::SyncMark(_) => MessageType::SyncMark,
            Payload::GsrData(_) => MessageType::GsrData,
            Payload::Ack(_) => MessageType::Ack,
            Payload::Empty => MessageType::Empty,
            Payload::Ping => MessageType::Ping,
            Payload::Pong => MessageType::Pong,
            Payload::Error(_) => MessageType::Error,
            Payload::TimeSyncRequest(_) => MessageType::TimeSyncRequest,
            Payload::TimeSyncResponse(_) => MessageType::TimeSyncResponse,
            Payload::UploadBegin(_) => MessageType::UploadBegin,
            Payload::UploadChunk(_) => MessageType::UploadChunk,
            Payload::UploadEnd(_) => MessageType::UploadEnd,
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Outer wire message.  Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: String,
    device_id: String,
    ts: i64,
    payload: Payload,
}

impl Envelope {
    /// Builds an envelope with a fresh v4 id stamped with the current time.
    pub fn new(device_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            ts: now_epoch_ms(),
            payload,
        }
    }

    /// Builds an envelope from already-known parts (used by the decoder).
    pub fn from_parts(
        id: impl Into<String>,
        device_id: impl Into<String>,
        ts: i64,
        payload: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            ts,
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Controller- or device-observed issuance time, epoch milliseconds.
    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the envelope, yielding its payload without copying samples.
    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_epoch_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
