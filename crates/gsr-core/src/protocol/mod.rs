//! Protocol module containing message types, the JSON codec and sequence
//! tracking.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_envelope, decode_payload, encode_envelope, ProtocolError};
pub use messages::*;
pub use sequence::{SequenceCounter, SequenceObservation, SequenceTracker};
