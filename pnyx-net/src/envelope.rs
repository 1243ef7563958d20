//! Wire envelope for consensus messages.
//!
//! Packet format:
//! - 1 byte type tag
//! - body length as an unsigned varint
//! - borsh-serialized body
//!
//! Type tags are stable wire constants; gaps are reserved.

use pnyx_model::{Choice, Endorsement, Message, Query, RecoveryRequest, RecoveryResponse, StartCheckpoint};

/// Hard ceiling on the announced body length.
pub const MAX_BODY_LEN: u64 = 1 << 30;

pub const TAG_QUERY: u8 = 1;
pub const TAG_ENDORSEMENT: u8 = 2;
pub const TAG_START_CHECKPOINT: u8 = 3;
pub const TAG_RECOVERY_REQUEST: u8 = 7;
pub const TAG_RECOVERY_RESPONSE: u8 = 8;
pub const TAG_CHOICE: u8 = 10;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("empty packet")]
    Empty,

    #[error("unknown type tag {0}")]
    UnknownTag(u8),

    #[error("malformed length prefix")]
    BadLength,

    #[error("announced body length {0} exceeds limit")]
    TooLarge(u64),

    #[error("truncated body: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("body decode failed: {0}")]
    Decode(#[from] borsh::io::Error),
}

/// Serialize a message into a tagged, length-prefixed packet.
pub fn pack(message: &Message) -> Result<Vec<u8>, EnvelopeError> {
    let body = match message {
        Message::Query(m) => borsh::to_vec(m),
        Message::Endorsement(m) => borsh::to_vec(m),
        Message::StartCheckpoint(m) => borsh::to_vec(m),
        Message::RecoveryRequest(m) => borsh::to_vec(m),
        Message::RecoveryResponse(m) => borsh::to_vec(m),
        Message::Choice(m) => borsh::to_vec(m),
    }?;

    let mut len_buf = unsigned_varint::encode::u64_buffer();
    let len_bytes = unsigned_varint::encode::u64(body.len() as u64, &mut len_buf);

    let mut packet = Vec::with_capacity(1 + len_bytes.len() + body.len());
    packet.push(message.wire_tag());
    packet.extend_from_slice(len_bytes);
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Deserialize one message from a packet. Trailing bytes are ignored
/// (the envelope may be read out of a longer stream).
pub fn unpack(packet: &[u8]) -> Result<Message, EnvelopeError> {
    let (&tag, rest) = packet.split_first().ok_or(EnvelopeError::Empty)?;

    let (len, rest) = unsigned_varint::decode::u64(rest).map_err(|_| EnvelopeError::BadLength)?;
    if len > MAX_BODY_LEN {
        return Err(EnvelopeError::TooLarge(len));
    }

    let len = len as usize;
    if rest.len() < len {
        return Err(EnvelopeError::Truncated {
            expected: len,
            got: rest.len(),
        });
    }
    let body = &rest[..len];

    let message = match tag {
        TAG_QUERY => Message::Query(borsh::from_slice::<Query>(body)?),
        TAG_ENDORSEMENT => Message::Endorsement(borsh::from_slice::<Endorsement>(body)?),
        TAG_START_CHECKPOINT => {
            Message::StartCheckpoint(borsh::from_slice::<StartCheckpoint>(body)?)
        }
        TAG_RECOVERY_REQUEST => {
            Message::RecoveryRequest(borsh::from_slice::<RecoveryRequest>(body)?)
        }
        TAG_RECOVERY_RESPONSE => {
            Message::RecoveryResponse(borsh::from_slice::<RecoveryResponse>(body)?)
        }
        TAG_CHOICE => Message::Choice(borsh::from_slice::<Choice>(body)?),
        unknown => return Err(EnvelopeError::UnknownTag(unknown)),
    };

    Ok(message)
}
