//! Best-effort MQTT 3.1.1 control packet codec.
//!
//! The relay hands each TCP read chunk to [`CapturedPacket::decode`] as-is.
//! MQTT clients almost always write one control packet per send, so the
//! common case decodes cleanly; when a chunk carries a partial or coalesced
//! packet, classification degrades gracefully and the chunk is still
//! forwarded verbatim. Nothing here performs I/O.

use bytes::Bytes;

use super::PacketType;

/// Maximum value encodable in the variable-length Remaining Length scheme
/// (four bytes of seven payload bits each).
///
/// https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718023
pub const REMAINING_LENGTH_MAX: usize = 268_435_455;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// The continuation bit was still set after the fourth length byte.
    #[error("malformed Remaining Length: more than four length bytes")]
    MalformedRemainingLength,
    /// The buffer ended while the continuation bit was still set.
    #[error("truncated Remaining Length: buffer ended mid-sequence")]
    TruncatedRemainingLength,
}

/// One observed control packet, decoded as far as the chunk allowed.
///
/// `raw` always holds the full original byte sequence so the packet can be
/// replayed faithfully regardless of how much of it was understood.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    /// `None` when the buffer was empty or the type nibble was reserved.
    pub packet_type: Option<PacketType>,
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    /// Topic name; populated only for a fully-parsed PUBLISH.
    pub topic: Option<String>,
    /// Application payload; populated only for a fully-parsed PUBLISH.
    pub payload: Bytes,
    pub raw: Bytes,
}

impl CapturedPacket {
    /// Decode a chunk of bytes into a capture record.
    ///
    /// Never fails: an empty buffer yields an empty record, and a PUBLISH
    /// whose variable header is truncated yields whatever was parsed up to
    /// that point with `topic`/`payload` left empty.
    pub fn decode(raw: Bytes) -> Self {
        let mut packet = CapturedPacket {
            packet_type: None,
            dup: false,
            qos: 0,
            retain: false,
            topic: None,
            payload: Bytes::new(),
            raw,
        };

        let Some(&first) = packet.raw.first() else {
            return packet;
        };

        packet.packet_type = PacketType::from_fixed_header(first);
        packet.dup = first & 0x08 != 0;
        packet.qos = (first >> 1) & 0x03;
        packet.retain = first & 0x01 != 0;

        if packet.packet_type == Some(PacketType::Publish) {
            packet.parse_publish_body();
        }

        packet
    }

    /// Parse the PUBLISH variable header and payload out of `raw`,
    /// leaving `topic`/`payload` untouched if the chunk is truncated.
    fn parse_publish_body(&mut self) {
        let Ok((remaining_len, len_bytes)) = decode_remaining_length(&self.raw[1..]) else {
            return;
        };

        let mut offset = 1 + len_bytes;
        // The chunk may be short of the advertised length; parse within
        // whichever bound is tighter.
        let end = usize::min(self.raw.len(), offset + remaining_len);

        let Some(topic_len) = read_u16(&self.raw, offset, end) else {
            return;
        };
        offset += 2;

        let topic_end = offset + topic_len as usize;
        if topic_end > end {
            return;
        }
        let topic = String::from_utf8_lossy(&self.raw[offset..topic_end]).into_owned();
        offset = topic_end;

        // QoS 1 and 2 carry a 2-byte packet identifier before the payload.
        if self.qos > 0 {
            if offset + 2 > end {
                return;
            }
            offset += 2;
        }

        self.topic = Some(topic);
        self.payload = self.raw.slice(offset..end);
    }

    /// Human-readable packet type, `"RESERVED"` when classification failed.
    pub fn type_label(&self) -> &'static str {
        self.packet_type.map_or("RESERVED", PacketType::label)
    }

    /// One-line description for capture listings: topic and payload for a
    /// PUBLISH, empty for everything else.
    pub fn summary(&self) -> String {
        match (self.packet_type, &self.topic) {
            (Some(PacketType::Publish), Some(topic)) => {
                format!(
                    "Topic: {topic}, Payload: {}",
                    String::from_utf8_lossy(&self.payload)
                )
            }
            _ => String::new(),
        }
    }
}

/// Encode a synthetic QoS 0 PUBLISH (no DUP, no RETAIN, no packet id).
///
/// `topic` must fit the wire format's 2-byte length prefix; callers
/// validate before encoding.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Bytes {
    let remaining = 2 + topic.len() + payload.len();

    let mut buf = Vec::with_capacity(5 + remaining);
    buf.push(0x30);
    encode_remaining_length(remaining, &mut buf);
    buf.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(payload);

    buf.into()
}

/// Append the minimal variable-length encoding of `len` to `buf`.
pub fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) {
    debug_assert!(len <= REMAINING_LENGTH_MAX);

    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode a variable-length Remaining Length from the front of `buf`.
///
/// Returns `(value, bytes consumed)`.
pub fn decode_remaining_length(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut len = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(CodecError::MalformedRemainingLength);
        }

        len += (byte & 0x7F) as usize * multiplier;
        multiplier *= 128;

        if byte & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }

    Err(CodecError::TruncatedRemainingLength)
}

/// Read a big-endian `u16` at `offset`, bounded by `end`.
fn read_u16(buf: &[u8], offset: usize, end: usize) -> Option<u16> {
    if offset + 2 > end {
        return None;
    }
    Some(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}
