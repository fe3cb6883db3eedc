use bytes::{Buf, Bytes, BytesMut};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Marker every control frame starts with
pub const MARKER: &[u8] = b"!msgpack:";

/// Protocol version stamped on outbound messages. Zero is reserved for
/// foreign payloads.
pub const PROTOCOL_VERSION: i64 = 1;

/// Sender tag used for every message the relay emits
pub const SERVER_SENDER: &str = "server";

/// Default upper bound on a single buffered control frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// RPC method names carried in the envelope
pub mod method {
    pub const REGISTER: &str = "net/register";
    pub const NOTIFY: &str = "net/notify";
    pub const AUTH_REJECT: &str = "net/auth-reject";
    pub const HTTP_REQUEST: &str = "http/request";
    pub const HTTP_RESPONSE: &str = "http/response";
    pub const TCP_REQUEST: &str = "tcp/request";
    pub const TCP_RESPONSE: &str = "tcp/response";
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("reserved msgpack marker at offset {offset}")]
    ReservedMarker { offset: usize },
}

/// Envelope exchanged over the control connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Sender", default)]
    pub sender: String,

    #[serde(rename = "Version", default)]
    pub version: i64,

    #[serde(rename = "Method", default)]
    pub method: String,

    #[serde(rename = "Args", default)]
    pub args: Vec<Arg>,
}

impl Message {
    /// Build a message originating from the relay
    pub fn server<I, A>(method: &str, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        Self {
            sender: SERVER_SENDER.to_string(),
            version: PROTOCOL_VERSION,
            method: method.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }
}

/// A positional RPC argument.
///
/// Arguments travel as msgpack strings but carry raw HTTP or TCP bytes,
/// which are not guaranteed to be UTF-8. Valid UTF-8 is written as a str,
/// anything else as bin; both forms are accepted on decode.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Arg(Vec<u8>);

impl Arg {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => fmt::Debug::fmt(s, f),
            None => write!(f, "<{} bytes>", self.0.len()),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Self(value.to_vec())
    }
}

impl Serialize for Arg {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.as_str() {
            Some(s) => serializer.serialize_str(s),
            None => serializer.serialize_bytes(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Arg {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArgVisitor;

        impl<'de> Visitor<'de> for ArgVisitor {
            type Value = Arg;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or byte array")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Arg, E> {
                Ok(Arg::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Arg, E> {
                Ok(Arg::from(v))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Arg, E> {
                Ok(Arg(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Arg, E> {
                Ok(Arg(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Arg, E> {
                Ok(Arg::default())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Arg, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(Arg(out))
            }
        }

        deserializer.deserialize_any(ArgVisitor)
    }
}

/// Transport that originated a proxied exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Tcp,
}

impl ProxyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Tcp => "tcp",
        }
    }

    pub fn request_method(self) -> &'static str {
        match self {
            ProxyKind::Http => method::HTTP_REQUEST,
            ProxyKind::Tcp => method::TCP_REQUEST,
        }
    }

    /// Kind of a `<kind>/response` method, if it is one
    pub fn from_response_method(name: &str) -> Option<Self> {
        match name {
            method::HTTP_RESPONSE => Some(ProxyKind::Http),
            method::TCP_RESPONSE => Some(ProxyKind::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request handed from the dispatcher to a tunnel client's writer
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub kind: ProxyKind,
    pub payload: Bytes,
}

impl ProxiedRequest {
    pub fn into_message(self) -> Message {
        Message::server(self.kind.request_method(), [Arg::from(self.payload)])
    }
}

/// Response handed from a tunnel client's reader to the dispatcher
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub kind: ProxyKind,
    pub payload: Bytes,
}

/// Encode a message as `MARKER || msgpack(envelope)`
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body = rmp_serde::to_vec_named(message)?;
    let mut out = Vec::with_capacity(MARKER.len() + body.len());
    out.extend_from_slice(MARKER);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one complete frame.
///
/// Returns `Ok(None)` when the bytes are not ours: no marker, or an
/// envelope with version 0.
pub fn decode(bytes: &[u8]) -> Result<Option<Message>, CodecError> {
    let Some(body) = bytes.strip_prefix(MARKER) else {
        return Ok(None);
    };
    let message: Message = rmp_serde::from_slice(body)?;
    Ok(recognized(message))
}

fn recognized(message: Message) -> Option<Message> {
    (message.version != 0).then_some(message)
}

enum Scan {
    Incomplete,
    Complete(usize),
    TooLarge,
    Reserved(usize),
}

fn read_len(body: &[u8], pos: &mut usize, width: usize) -> Option<usize> {
    let bytes = body.get(*pos..*pos + width)?;
    *pos += width;
    Some(bytes.iter().fold(0, |acc, &b| (acc << 8) | usize::from(b)))
}

/// Length of the msgpack value at the start of `body`, without decoding it.
///
/// Declared lengths and element counts are checked against `limit` as soon
/// as they are read, so a corrupt header fails fast instead of waiting for
/// bytes that will never arrive.
fn scan_value(body: &[u8], limit: usize) -> Scan {
    let mut pos = 0;
    let mut pending: usize = 1;

    while pending > 0 {
        pending -= 1;
        let Some(&marker) = body.get(pos) else {
            return Scan::Incomplete;
        };
        pos += 1;

        let header = match marker {
            0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => Some((0, 0)),
            0x80..=0x8f => Some((0, 2 * usize::from(marker & 0x0f))),
            0x90..=0x9f => Some((0, usize::from(marker & 0x0f))),
            0xa0..=0xbf => Some((usize::from(marker & 0x1f), 0)),
            0xc1 => return Scan::Reserved(pos - 1),
            0xc4 | 0xd9 => read_len(body, &mut pos, 1).map(|n| (n, 0)),
            0xc5 | 0xda => read_len(body, &mut pos, 2).map(|n| (n, 0)),
            0xc6 | 0xdb => read_len(body, &mut pos, 4).map(|n| (n, 0)),
            // ext: payload plus one type byte
            0xc7 => read_len(body, &mut pos, 1).map(|n| (n + 1, 0)),
            0xc8 => read_len(body, &mut pos, 2).map(|n| (n + 1, 0)),
            0xc9 => read_len(body, &mut pos, 4).map(|n| (n.saturating_add(1), 0)),
            0xcc | 0xd0 => Some((1, 0)),
            0xcd | 0xd1 => Some((2, 0)),
            0xca | 0xce | 0xd2 => Some((4, 0)),
            0xcb | 0xcf | 0xd3 => Some((8, 0)),
            0xd4 => Some((2, 0)),
            0xd5 => Some((3, 0)),
            0xd6 => Some((5, 0)),
            0xd7 => Some((9, 0)),
            0xd8 => Some((17, 0)),
            0xdc => read_len(body, &mut pos, 2).map(|n| (0, n)),
            0xdd => read_len(body, &mut pos, 4).map(|n| (0, n)),
            0xde => read_len(body, &mut pos, 2).map(|n| (0, 2 * n)),
            0xdf => read_len(body, &mut pos, 4).map(|n| (0, n.saturating_mul(2))),
        };
        let Some((data, children)) = header else {
            return Scan::Incomplete;
        };

        // every pending element takes at least one byte
        pending = pending.saturating_add(children);
        pos = pos.saturating_add(data);
        if pos.saturating_add(pending) > limit {
            return Scan::TooLarge;
        }
    }

    if pos > body.len() {
        Scan::Incomplete
    } else {
        Scan::Complete(pos)
    }
}

fn find_marker(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(MARKER.len())
        .position(|window| window == MARKER)
}

/// Streaming decoder for the control connection.
///
/// Bytes may arrive split or coalesced arbitrarily; frames are located by
/// their marker and delimited by the msgpack encoding itself.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next recognized message, or `None` when more bytes are needed.
    ///
    /// Unrecognized frames are skipped silently. A malformed frame yields
    /// an error once and the decoder resumes at the following marker.
    pub fn next_frame(&mut self) -> Option<Result<Message, CodecError>> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }

            match find_marker(&self.buffer) {
                Some(0) => {}
                Some(pos) => self.buffer.advance(pos),
                None => {
                    // keep a possible partial marker at the tail
                    let keep = self.buffer.len().min(MARKER.len() - 1);
                    let stray = self.buffer.len() - keep;
                    self.buffer.advance(stray);
                    return None;
                }
            }

            let body = &self.buffer[MARKER.len()..];
            match scan_value(body, self.max_frame_size) {
                Scan::Incomplete => return None,
                Scan::TooLarge => {
                    self.buffer.advance(MARKER.len());
                    return Some(Err(CodecError::FrameTooLarge {
                        limit: self.max_frame_size,
                    }));
                }
                Scan::Reserved(offset) => {
                    self.buffer.advance(MARKER.len());
                    return Some(Err(CodecError::ReservedMarker { offset }));
                }
                Scan::Complete(len) => {
                    let decoded = rmp_serde::from_slice::<Message>(&body[..len]);
                    self.buffer.advance(MARKER.len() + len);
                    match decoded {
                        Ok(message) => {
                            if let Some(message) = recognized(message) {
                                return Some(Ok(message));
                            }
                        }
                        Err(e) => return Some(Err(e.into())),
                    }
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
