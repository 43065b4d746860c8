//! MQTT 3.1.1 packet codec.
//!
//! Covers the subset a device-gateway client needs: CONNECT/CONNACK,
//! SUBSCRIBE/SUBACK, PUBLISH/PUBACK, PINGREQ/PINGRESP and DISCONNECT.
//! Encoding and decoding are synchronous and allocation-light; the
//! streaming `FrameBuffer` stitches packets back together from transport
//! frames of arbitrary size.

use std::fmt;

use thiserror::Error;

/// Largest value the four-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

const PUBLISH_DUP: u8 = 0x08;
const PUBLISH_RETAIN: u8 = 0x01;

const SUBACK_FAILURE: u8 = 0x80;

// ── Errors ────────────────────────────────────────────────────

/// Malformed or unsupported wire data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("remaining length exceeds four bytes")]
    RemainingLengthOverflow,

    #[error("payload of {0} bytes exceeds the maximum packet size")]
    PayloadTooLarge(usize),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("unsupported packet type {0:?}")]
    Unsupported(PacketType),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("malformed {packet}: {reason}")]
    Malformed { packet: &'static str, reason: String },
}

fn malformed(packet: &'static str, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        packet,
        reason: reason.into(),
    }
}

// ── Enumerations ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(malformed("qos", format!("invalid level {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            1 => Self::Connect,
            2 => Self::Connack,
            3 => Self::Publish,
            4 => Self::Puback,
            5 => Self::Pubrec,
            6 => Self::Pubrel,
            7 => Self::Pubcomp,
            8 => Self::Subscribe,
            9 => Self::Suback,
            10 => Self::Unsubscribe,
            11 => Self::Unsuback,
            12 => Self::Pingreq,
            13 => Self::Pingresp,
            14 => Self::Disconnect,
            other => return Err(CodecError::UnknownPacketType(other)),
        })
    }
}

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUsernameOrPassword,
            5 => Self::NotAuthorized,
            other => return Err(malformed("connack", format!("return code {other}"))),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Refusals that mean the presented credentials are no longer good.
    pub fn is_auth_failure(self) -> bool {
        matches!(self, Self::BadUsernameOrPassword | Self::NotAuthorized)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Accepted => "accepted",
            Self::UnacceptableProtocolVersion => "unacceptable protocol version",
            Self::IdentifierRejected => "identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadUsernameOrPassword => "bad username or password",
            Self::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Per-filter SUBACK result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubackCode {
    Granted(QoS),
    Failure,
}

// ── Packets ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present iff `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub codes: Vec<SubackCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(u16),
    Subscribe(Subscribe),
    Suback(Suback),
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::Connack(_) => PacketType::Connack,
            Self::Publish(_) => PacketType::Publish,
            Self::Puback(_) => PacketType::Puback,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::Suback(_) => PacketType::Suback,
            Self::Pingreq => PacketType::Pingreq,
            Self::Pingresp => PacketType::Pingresp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// Serialize into a complete frame (fixed header included).
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::new();
        let header = match self {
            Self::Connect(c) => {
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                if c.username.is_some() {
                    flags |= FLAG_USERNAME;
                }
                if c.password.is_some() {
                    flags |= FLAG_PASSWORD;
                }
                write_string(&mut body, PROTOCOL_NAME)?;
                body.push(PROTOCOL_LEVEL);
                body.push(flags);
                body.extend_from_slice(&c.keep_alive.to_be_bytes());
                write_string(&mut body, &c.client_id)?;
                if let Some(username) = &c.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &c.password {
                    write_bytes(&mut body, password)?;
                }
                0x10
            }
            Self::Connack(c) => {
                body.push(u8::from(c.session_present));
                body.push(c.code.as_u8());
                0x20
            }
            Self::Publish(p) => {
                write_string(&mut body, &p.topic)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (_, Some(id)) => body.extend_from_slice(&id.to_be_bytes()),
                    (_, None) => return Err(malformed("publish", "missing packet id for QoS > 0")),
                }
                body.extend_from_slice(&p.payload);
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= PUBLISH_DUP;
                }
                if p.retain {
                    flags |= PUBLISH_RETAIN;
                }
                0x30 | flags
            }
            Self::Puback(id) => {
                body.extend_from_slice(&id.to_be_bytes());
                0x40
            }
            Self::Subscribe(s) => {
                if s.filters.is_empty() {
                    return Err(malformed("subscribe", "no topic filters"));
                }
                body.extend_from_slice(&s.packet_id.to_be_bytes());
                for (filter, qos) in &s.filters {
                    write_string(&mut body, filter)?;
                    body.push(*qos as u8);
                }
                0x82
            }
            Self::Suback(s) => {
                body.extend_from_slice(&s.packet_id.to_be_bytes());
                for code in &s.codes {
                    body.push(match code {
                        SubackCode::Granted(qos) => *qos as u8,
                        SubackCode::Failure => SUBACK_FAILURE,
                    });
                }
                0x90
            }
            Self::Pingreq => 0xC0,
            Self::Pingresp => 0xD0,
            Self::Disconnect => 0xE0,
        };

        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.push(header);
        frame.extend(encode_remaining_length(body.len())?);
        frame.extend(body);
        Ok(frame)
    }

    /// Parse exactly one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&first, rest) = frame
            .split_first()
            .ok_or(CodecError::Truncated("fixed header"))?;
        let packet_type = PacketType::from_u8(first >> 4)?;
        let flags = first & 0x0F;
        let (len, used) = decode_remaining_length(rest)?;
        let body = &rest[used..];
        if body.len() < len {
            return Err(CodecError::Truncated("packet body"));
        }
        if body.len() > len {
            return Err(malformed("frame", "trailing bytes after packet"));
        }

        let mut r = Reader::new(body);
        let packet = match packet_type {
            PacketType::Connect => Self::Connect(parse_connect(&mut r)?),
            PacketType::Connack => {
                let ack_flags = r.u8("connack")?;
                let code = ConnectReturnCode::from_u8(r.u8("connack")?)?;
                Self::Connack(Connack {
                    session_present: ack_flags & 0x01 == 0x01,
                    code,
                })
            }
            PacketType::Publish => Self::Publish(parse_publish(flags, &mut r)?),
            PacketType::Puback => Self::Puback(r.u16("puback")?),
            PacketType::Subscribe => {
                if flags != 0x02 {
                    return Err(malformed("subscribe", "reserved flags must be 0b0010"));
                }
                Self::Subscribe(parse_subscribe(&mut r)?)
            }
            PacketType::Suback => Self::Suback(parse_suback(&mut r)?),
            PacketType::Pingreq => Self::Pingreq,
            PacketType::Pingresp => Self::Pingresp,
            PacketType::Disconnect => Self::Disconnect,
            other => return Err(CodecError::Unsupported(other)),
        };

        if !r.is_empty() {
            return Err(malformed("packet", "unexpected trailing bytes"));
        }
        Ok(packet)
    }
}

fn parse_connect(r: &mut Reader<'_>) -> Result<Connect, CodecError> {
    let name = r.string("protocol name")?;
    if name != PROTOCOL_NAME {
        return Err(malformed("connect", format!("protocol name {name:?}")));
    }
    let level = r.u8("protocol level")?;
    if level != PROTOCOL_LEVEL {
        return Err(malformed("connect", format!("protocol level {level}")));
    }
    let flags = r.u8("connect flags")?;
    let keep_alive = r.u16("keep alive")?;
    let client_id = r.string("client id")?;
    if flags & FLAG_WILL != 0 {
        r.string("will topic")?;
        r.binary("will message")?;
    }
    let username = if flags & FLAG_USERNAME != 0 {
        Some(r.string("username")?)
    } else {
        None
    };
    let password = if flags & FLAG_PASSWORD != 0 {
        Some(r.binary("password")?.to_vec())
    } else {
        None
    };
    Ok(Connect {
        client_id,
        clean_session: flags & FLAG_CLEAN_SESSION != 0,
        keep_alive,
        username,
        password,
    })
}

fn parse_publish(flags: u8, r: &mut Reader<'_>) -> Result<Publish, CodecError> {
    let qos = QoS::from_u8((flags >> 1) & 0x03)?;
    let topic = r.string("topic")?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(r.u16("packet id")?),
    };
    Ok(Publish {
        topic,
        qos,
        retain: flags & PUBLISH_RETAIN != 0,
        dup: flags & PUBLISH_DUP != 0,
        packet_id,
        payload: r.rest().to_vec(),
    })
}

fn parse_subscribe(r: &mut Reader<'_>) -> Result<Subscribe, CodecError> {
    let packet_id = r.u16("packet id")?;
    let mut filters = Vec::new();
    while !r.is_empty() {
        let filter = r.string("topic filter")?;
        let qos = QoS::from_u8(r.u8("requested qos")?)?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(malformed("subscribe", "no topic filters"));
    }
    Ok(Subscribe { packet_id, filters })
}

fn parse_suback(r: &mut Reader<'_>) -> Result<Suback, CodecError> {
    let packet_id = r.u16("packet id")?;
    let mut codes = Vec::new();
    while !r.is_empty() {
        let code = match r.u8("suback code")? {
            SUBACK_FAILURE => SubackCode::Failure,
            granted => SubackCode::Granted(QoS::from_u8(granted)?),
        };
        codes.push(code);
    }
    Ok(Suback { packet_id, codes })
}

// ── Remaining length ──────────────────────────────────────────

pub fn encode_remaining_length(len: usize) -> Result<Vec<u8>, CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PayloadTooLarge(len));
    }
    let mut out = Vec::with_capacity(4);
    let mut rest = len;
    loop {
        let mut byte = (rest % 128) as u8;
        rest /= 128;
        if rest > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if rest == 0 {
            return Ok(out);
        }
    }
}

/// Decode a remaining-length field from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`. Running out of input is an error.
pub fn decode_remaining_length(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for (i, byte) in buf.iter().enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        multiplier *= 128;
        if multiplier > 128 * 128 * 128 {
            return Err(CodecError::RemainingLengthOverflow);
        }
    }
    Err(CodecError::Truncated("remaining length"))
}

// ── Strings ───────────────────────────────────────────────────

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    write_bytes(buf, value.as_bytes())
}

fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::PayloadTooLarge(value.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn binary(&mut self, what: &'static str) -> Result<&'a [u8], CodecError> {
        let len = self.u16(what)?;
        self.take(usize::from(len), what)
    }

    fn string(&mut self, what: &'static str) -> Result<String, CodecError> {
        let bytes = self.binary(what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(what))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }
}

// ── Streaming ─────────────────────────────────────────────────

/// Reassembles packets from transport frames.
///
/// WebSocket frames may carry part of a packet or several packets at
/// once; bytes are buffered until a full packet is available.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete packet.
    ///
    /// `Ok(None)` means more bytes are needed. A malformed packet is
    /// consumed before its error is returned so the stream stays aligned.
    /// An oversized length field leaves no way to resync; the caller
    /// should drop the link.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let (len, used) = match decode_remaining_length(&self.buf[1..]) {
            Ok(v) => v,
            Err(CodecError::Truncated(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let total = 1 + used + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Packet::decode(&frame).map(Some)
    }
}

// ── Packet identifiers ────────────────────────────────────────

/// Packet identifier sequence: 1, 2, ..., 65535, 1, ... (never 0).
#[derive(Debug, Default)]
pub struct PacketIdAllocator {
    last: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u16 {
        self.last = (self.last % u16::MAX) + 1;
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_boundaries_roundtrip() {
        let cases = [
            (0usize, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ];
        for (len, width) in cases {
            let encoded = encode_remaining_length(len).unwrap();
            assert_eq!(encoded.len(), width, "width of {len}");
            assert_eq!(decode_remaining_length(&encoded).unwrap(), (len, width));
        }
    }

    #[test]
    fn remaining_length_too_large() {
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1),
            Err(CodecError::PayloadTooLarge(MAX_REMAINING_LENGTH + 1))
        );
    }

    #[test]
    fn truncated_remaining_length_is_error() {
        assert_eq!(
            decode_remaining_length(&[0x80]),
            Err(CodecError::Truncated("remaining length"))
        );
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF]),
            Err(CodecError::Truncated("remaining length"))
        );
        assert!(decode_remaining_length(&[]).is_err());
    }

    #[test]
    fn five_byte_remaining_length_overflows() {
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
            Err(CodecError::RemainingLengthOverflow)
        );
    }

    #[test]
    fn connect_roundtrip() {
        let connect = Connect::new("abc", 300, true);
        let frame = Packet::Connect(connect.clone()).encode().unwrap();
        assert_eq!(frame[0], 0x10);
        let decoded = Packet::decode(&frame).unwrap();
        assert_eq!(decoded, Packet::Connect(connect));
        if let Packet::Connect(c) = decoded {
            assert_eq!(c.client_id, "abc");
            assert!(c.clean_session);
            assert_eq!(c.keep_alive, 300);
        }
    }

    #[test]
    fn connect_flags_follow_credentials() {
        let mut connect = Connect::new("dev", 30, false);
        connect.username = Some("user".into());
        connect.password = Some(b"secret".to_vec());
        let frame = Packet::Connect(connect.clone()).encode().unwrap();
        // 2 + "MQTT" + level byte, then flags
        assert_eq!(frame[2 + 6 + 1], FLAG_USERNAME | FLAG_PASSWORD);
        assert_eq!(Packet::decode(&frame).unwrap(), Packet::Connect(connect));
    }

    #[test]
    fn connack_decodes_session_present_and_code() {
        let frame = [0x20, 0x02, 0x01, 0x05];
        let packet = Packet::decode(&frame).unwrap();
        assert_eq!(
            packet,
            Packet::Connack(Connack {
                session_present: true,
                code: ConnectReturnCode::NotAuthorized,
            })
        );
        assert!(ConnectReturnCode::NotAuthorized.is_auth_failure());
        assert!(!ConnectReturnCode::ServerUnavailable.is_auth_failure());
    }

    #[test]
    fn connack_bad_code_is_error() {
        assert!(Packet::decode(&[0x20, 0x02, 0x00, 0x09]).is_err());
    }

    #[test]
    fn qos0_publish_has_no_packet_id() {
        let publish = Publish::new("a/b", QoS::AtMostOnce, b"hi".to_vec());
        let frame = Packet::Publish(publish.clone()).encode().unwrap();
        assert_eq!(frame, vec![0x30, 7, 0, 3, b'a', b'/', b'b', b'h', b'i']);
        assert_eq!(Packet::decode(&frame).unwrap(), Packet::Publish(publish));
    }

    #[test]
    fn qos1_publish_carries_packet_id_and_flags() {
        let mut publish = Publish::new("t", QoS::AtLeastOnce, b"{}".to_vec());
        publish.packet_id = Some(0x0102);
        publish.retain = true;
        publish.dup = true;
        let frame = Packet::Publish(publish.clone()).encode().unwrap();
        assert_eq!(frame[0], 0x30 | PUBLISH_DUP | 0x02 | PUBLISH_RETAIN);
        assert_eq!(&frame[5..7], &[0x01, 0x02]);
        assert_eq!(Packet::decode(&frame).unwrap(), Packet::Publish(publish));
    }

    #[test]
    fn qos1_publish_without_id_rejected() {
        let publish = Publish::new("t", QoS::AtLeastOnce, Vec::new());
        assert!(Packet::Publish(publish).encode().is_err());
    }

    #[test]
    fn subscribe_header_and_roundtrip() {
        let subscribe = Subscribe {
            packet_id: 7,
            filters: vec![("cmd/52/+/res/#".into(), QoS::AtLeastOnce)],
        };
        let frame = Packet::Subscribe(subscribe.clone()).encode().unwrap();
        assert_eq!(frame[0], 0x82);
        assert_eq!(Packet::decode(&frame).unwrap(), Packet::Subscribe(subscribe));
    }

    #[test]
    fn suback_failure_code() {
        let frame = [0x90, 0x04, 0x00, 0x07, 0x01, 0x80];
        let Packet::Suback(suback) = Packet::decode(&frame).unwrap() else {
            panic!("expected suback");
        };
        assert_eq!(suback.packet_id, 7);
        assert_eq!(
            suback.codes,
            vec![SubackCode::Granted(QoS::AtLeastOnce), SubackCode::Failure]
        );
    }

    #[test]
    fn fixed_size_packets() {
        assert_eq!(Packet::Pingreq.encode().unwrap(), vec![0xC0, 0x00]);
        assert_eq!(Packet::Disconnect.encode().unwrap(), vec![0xE0, 0x00]);
        assert_eq!(Packet::Puback(9).encode().unwrap(), vec![0x40, 0x02, 0x00, 0x09]);
        assert_eq!(Packet::decode(&[0xD0, 0x00]).unwrap(), Packet::Pingresp);
    }

    #[test]
    fn unknown_packet_types() {
        assert_eq!(
            Packet::decode(&[0x00, 0x00]),
            Err(CodecError::UnknownPacketType(0))
        );
        assert_eq!(
            Packet::decode(&[0xF0, 0x00]),
            Err(CodecError::UnknownPacketType(15))
        );
    }

    #[test]
    fn truncated_string_is_error() {
        // PUBLISH claiming a 10-byte topic with only 2 bytes present.
        let frame = [0x30, 0x04, 0x00, 0x0A, b'a', b'b'];
        assert_eq!(Packet::decode(&frame), Err(CodecError::Truncated("topic")));
    }

    #[test]
    fn truncated_body_is_error() {
        assert_eq!(
            Packet::decode(&[0x40, 0x02, 0x00]),
            Err(CodecError::Truncated("packet body"))
        );
    }

    #[test]
    fn invalid_utf8_topic() {
        let frame = [0x30, 0x04, 0x00, 0x02, 0xFF, 0xFE];
        assert_eq!(Packet::decode(&frame), Err(CodecError::InvalidUtf8("topic")));
    }

    #[test]
    fn frame_buffer_reassembles_split_packets() {
        let mut publish = Publish::new("split/topic", QoS::AtLeastOnce, vec![b'x'; 300]);
        publish.packet_id = Some(1);
        let frame = Packet::Publish(publish.clone()).encode().unwrap();

        let mut buf = FrameBuffer::new();
        buf.extend(&frame[..1]);
        assert_eq!(buf.next_packet().unwrap(), None);
        buf.extend(&frame[1..2]);
        assert_eq!(buf.next_packet().unwrap(), None);
        buf.extend(&frame[2..100]);
        assert_eq!(buf.next_packet().unwrap(), None);
        buf.extend(&frame[100..]);
        assert_eq!(buf.next_packet().unwrap(), Some(Packet::Publish(publish)));
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn frame_buffer_splits_coalesced_packets() {
        let mut bytes = Packet::Pingresp.encode().unwrap();
        bytes.extend(Packet::Puback(3).encode().unwrap());
        let mut buf = FrameBuffer::new();
        buf.extend(&bytes);
        assert_eq!(buf.next_packet().unwrap(), Some(Packet::Pingresp));
        assert_eq!(buf.next_packet().unwrap(), Some(Packet::Puback(3)));
        assert_eq!(buf.next_packet().unwrap(), None);
    }

    #[test]
    fn frame_buffer_skips_malformed_packet() {
        let mut buf = FrameBuffer::new();
        buf.extend(&[0x00, 0x00]);
        buf.extend(&Packet::Pingresp.encode().unwrap());
        assert!(buf.next_packet().is_err());
        assert_eq!(buf.next_packet().unwrap(), Some(Packet::Pingresp));
    }

    #[test]
    fn packet_ids_wrap_and_skip_zero() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        ids.last = u16::MAX - 1;
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 1);
    }
}
