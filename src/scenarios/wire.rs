//! Shared SignalR Core wire-format helpers: the `0x1e`-terminated JSON framing,
//! the 7-bit variable-length-prefixed MsgPack framing, and the message shapes
//! both encodings carry. Used by every `signalrcore*` scenario.

use serde::{Deserialize, Serialize};

pub const TERMINATOR: u8 = 0x1e;

/// Splits a buffer of one or more `0x1e`-terminated JSON text frames into
/// the individual frame bodies (terminator stripped, empty frames dropped).
pub fn tokenize_text_frames(buf: &[u8]) -> Vec<&[u8]> {
    buf.split(|&b| b == TERMINATOR).filter(|frame| !frame.is_empty()).collect()
}

/// Encodes `body` with a 7-bit-per-byte variable-length prefix (continuation
/// bit in the MSB), the framing SignalR Core uses for MsgPack messages.
pub fn encode_length_prefixed(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    let mut len = body.len();
    if len == 0 {
        out.push(0);
    } else {
        while len > 0 {
            let mut byte = (len & 0x7f) as u8;
            len >>= 7;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
        }
    }
    out.extend_from_slice(body);
    out
}

const SHIFTS: [u32; 5] = [0, 7, 14, 21, 28];

/// Decodes one length-prefixed frame from the front of `buf`, returning the
/// frame body and the number of bytes of `buf` it consumed (prefix + body).
/// Returns `None` if `buf` does not yet contain a complete frame.
pub fn decode_length_prefixed(buf: &[u8]) -> Option<(&[u8], usize)> {
    let mut msg_len: usize = 0;
    let mut num_prefix_bytes = 0usize;
    let mut more = true;
    while more && num_prefix_bytes < buf.len() && num_prefix_bytes < SHIFTS.len() {
        let byte = buf[num_prefix_bytes];
        msg_len |= ((byte & 0x7f) as usize) << SHIFTS[num_prefix_bytes];
        num_prefix_bytes += 1;
        more = byte & 0x80 != 0;
    }
    if more {
        return None;
    }
    let total = num_prefix_bytes + msg_len;
    if total > buf.len() {
        return None;
    }
    Some((&buf[num_prefix_bytes..total], total))
}

#[derive(Debug, Deserialize)]
pub struct HandshakeResponse {
    #[serde(rename = "connectionId", default)]
    pub connection_id: String,
}

/// Just enough of an incoming message to discriminate its `type` before
/// attempting a full decode — mirrors peeking `SignalRCommon` in the source.
#[derive(Debug, Deserialize)]
pub struct CommonMessage {
    #[serde(rename = "type")]
    pub message_type: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(rename = "invocationId", default)]
    pub invocation_id: String,
    #[serde(rename = "type")]
    pub message_type: i32,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl Invocation {
    pub fn echo(user_id: &str, sent_at_nanos: i64) -> Self {
        Self {
            invocation_id: String::new(),
            message_type: 1,
            target: "echo".to_string(),
            arguments: vec![user_id.to_string(), sent_at_nanos.to_string()],
        }
    }

    /// Serializes as a `0x1e`-terminated JSON text frame.
    pub fn to_json_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec(self)?;
        out.push(TERMINATOR);
        Ok(out)
    }

    /// Serializes as a length-prefixed MsgPack frame. The wire array shape
    /// is `[type, invocationId, target, arguments]`, matching the source's
    /// `MsgpackInvocation` tuple encoding.
    pub fn to_msgpack_frame(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let tuple = (
            self.message_type,
            self.invocation_id.as_str(),
            self.target.as_str(),
            &self.arguments,
        );
        let body = rmp_serde::to_vec(&tuple)?;
        Ok(encode_length_prefixed(&body))
    }

    pub fn from_msgpack(body: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        let (message_type, invocation_id, target, arguments): (i32, String, String, Vec<String>) =
            rmp_serde::from_slice(body)?;
        Ok(Self {
            invocation_id,
            message_type,
            target,
            arguments,
        })
    }
}

pub fn protocol_handshake_frame(use_msgpack: bool) -> Vec<u8> {
    let protocol = if use_msgpack { "messagepack" } else { "json" };
    let mut frame = format!("{{\"protocol\":\"{protocol}\"}}").into_bytes();
    frame.push(TERMINATOR);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_multiple_text_frames() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"{\"a\":1}");
        buf.push(TERMINATOR);
        buf.extend_from_slice(b"{\"a\":2}");
        buf.push(TERMINATOR);

        let frames = tokenize_text_frames(&buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"{\"a\":1}");
        assert_eq!(frames[1], b"{\"a\":2}");
    }

    #[test]
    fn length_prefix_round_trips_small_and_large_bodies() {
        for len in [0usize, 1, 127, 128, 16384] {
            let body = vec![7u8; len];
            let encoded = encode_length_prefixed(&body);
            let (decoded, consumed) = decode_length_prefixed(&encoded).expect("complete frame");
            assert_eq!(decoded, body.as_slice());
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn decode_length_prefixed_reports_incomplete_frame() {
        let body = vec![1u8; 200];
        let encoded = encode_length_prefixed(&body);
        assert!(decode_length_prefixed(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn invocation_msgpack_round_trips() {
        let inv = Invocation::echo("user1", 123456789);
        let frame = inv.to_msgpack_frame().unwrap();
        let (body, consumed) = decode_length_prefixed(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        let back = Invocation::from_msgpack(body).unwrap();
        assert_eq!(back.target, "echo");
        assert_eq!(back.arguments, vec!["user1".to_string(), "123456789".to_string()]);
    }

    #[test]
    fn invocation_json_frame_is_terminated() {
        let inv = Invocation::echo("user1", 42);
        let frame = inv.to_json_frame().unwrap();
        assert_eq!(*frame.last().unwrap(), TERMINATOR);
    }
}
