//! Control-channel messages: JSON envelopes framed as length-prefixed `warp`
//! atoms. Every field is optional; exactly the fields present take effect.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{NagareError, NagareResult};

pub const ATOM_TYPE: &[u8; 4] = b"warp";
pub const ATOM_HEADER_SIZE: usize = 8;
/// Arbitrary limit shared with the player.
pub const ATOM_MAX_SIZE: u32 = 42069;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<MessageInit>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<MessageSegment>,

    #[serde(rename = "x-ping", skip_serializing_if = "Option::is_none")]
    pub ping: Option<MessagePing>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong: Option<MessagePong>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<MessageDebug>,

    #[serde(rename = "x-pref", skip_serializing_if = "Option::is_none")]
    pub pref: Option<MessagePref>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageInit {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageSegment {
    /// Id of the init segment this stream depends on.
    pub init: String,
    /// Media timestamp of the segment in milliseconds.
    pub timestamp: u64,
    /// Estimated throughput in KiB/s.
    pub etp: u64,
    /// Applied shaper rate in kbps; 0 while a reset is pending.
    pub tc_rate: f64,
    /// Wall clock at segment availability, Unix milliseconds.
    pub at: u64,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct MessagePing {}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct MessagePong {}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct MessageDebug {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_streaming: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tc_reset: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessagePref {
    pub name: String,
    pub value: String,
}

impl Message {
    /// Frame the message as `[u32 size]["warp"][json]`.
    pub fn encode(&self) -> NagareResult<Bytes> {
        let payload = serde_json::to_vec(self)?;
        let size = ATOM_HEADER_SIZE + payload.len();
        if size > ATOM_MAX_SIZE as usize {
            return Err(NagareError::AtomTooLarge);
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(size as u32);
        buf.put_slice(ATOM_TYPE);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> NagareResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Validate an atom header and return the payload length that follows it.
pub fn parse_atom_header(header: &[u8; 8]) -> NagareResult<usize> {
    let size = u32::from_be_bytes(header[0..4].try_into().unwrap());

    if size < ATOM_HEADER_SIZE as u32 {
        return Err(NagareError::AtomTooSmall);
    }
    if size > ATOM_MAX_SIZE {
        return Err(NagareError::AtomTooLarge);
    }
    if &header[4..8] != ATOM_TYPE {
        return Err(NagareError::UnknownAtom);
    }

    Ok(size as usize - ATOM_HEADER_SIZE)
}
