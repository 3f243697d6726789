// CQL native protocol v3 codec - wire-level framing shared by both directions
//
// This module owns the 9-byte frame header, the opcode set, the primitive
// value notations (string, long string, string map, ...) and the incremental
// frame decoder. Typed frame bodies live in `frame`; this layer never
// interprets a body beyond its length.

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::error::{DriverError, DriverResult};
use crate::frame::Frame;

/// Fixed size of the frame header:
/// version, flags, stream id, opcode, 4-byte big-endian body length.
pub const HEADER_SIZE: usize = 9;

/// Version byte carried by outbound (request) frames.
pub const REQUEST_VERSION: u8 = 0x03;

/// Version byte carried by inbound (response) frames. Bit 7 marks the
/// direction; the low bits are the protocol version.
pub const RESPONSE_VERSION: u8 = 0x83;

/// Header flag: the frame body went through the negotiated compression
/// codec.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// CQL native protocol opcodes consumed by the core.
///
/// The set is closed: an inbound frame with any other opcode byte fails
/// decoding with a parse error rather than being carried as opaque data.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
}

impl Opcode {
    /// Whether a request frame with this opcode expects no response and
    /// therefore no stream-id reservation.
    pub fn is_fire_and_forget(&self) -> bool {
        // Every opcode in the v3 core set is request/response; the hook
        // exists so REGISTER-style additions can mark themselves at
        // encode time.
        false
    }
}

/// Decoded frame header. The body length is validated against the
/// configured maximum before any body byte is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
    pub opcode: Opcode,
}

impl FrameHeader {
    pub fn request(stream: i8, opcode: Opcode) -> Self {
        Self {
            version: REQUEST_VERSION,
            flags: 0,
            stream,
            opcode,
        }
    }

    /// Parse the fixed header from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(raw: &[u8; HEADER_SIZE], max_body_len: usize) -> DriverResult<(Self, usize)> {
        let opcode = Opcode::try_from(raw[3])
            .map_err(|_| DriverError::FrameParse(format!("unknown opcode {:#04x}", raw[3])))?;
        let body_len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        if body_len > max_body_len {
            return Err(DriverError::FrameParse(format!(
                "body length {body_len} exceeds maximum {max_body_len}"
            )));
        }
        let header = Self {
            version: raw[0],
            flags: raw[1],
            stream: raw[2] as i8,
            opcode,
        };
        Ok((header, body_len))
    }

    /// Append the header with the given body length to `buf`.
    pub fn encode(&self, body_len: usize, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u8(self.stream as u8);
        buf.put_u8(self.opcode as u8);
        buf.put_u32(body_len as u32);
    }
}

enum DecodeState {
    Header { raw: [u8; HEADER_SIZE], have: usize },
    Body { header: FrameHeader, remaining: usize, body: BytesMut },
}

impl DecodeState {
    fn header() -> Self {
        DecodeState::Header {
            raw: [0u8; HEADER_SIZE],
            have: 0,
        }
    }
}

/// Incremental frame parser.
///
/// Feed arbitrary chunks through [`consume`](FrameDecoder::consume); the
/// decoder advances through header then body and reports via
/// [`frame_ready`](FrameDecoder::frame_ready) once a complete frame has
/// been assembled. A header may span multiple calls, and one call may end
/// in the middle of the next frame's header - parsing is invariant under
/// the choice of chunk boundaries.
///
/// `consume` stops at the end of a frame even if more input remains, so
/// the caller drains input like this:
///
/// ```rust
/// # use cqlink::codec::FrameDecoder;
/// # fn dispatch(_f: cqlink::frame::Frame) {}
/// # fn example(decoder: &mut FrameDecoder, input: &[u8]) -> Result<(), cqlink::error::DriverError> {
/// let mut offset = 0;
/// while offset < input.len() {
///     offset += decoder.consume(&input[offset..])?;
///     if decoder.frame_ready() {
///         dispatch(decoder.take_frame().unwrap());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct FrameDecoder {
    state: DecodeState,
    ready: Option<Frame>,
    max_body_len: usize,
}

impl FrameDecoder {
    pub fn new(max_body_len: usize) -> Self {
        Self {
            state: DecodeState::header(),
            ready: None,
            max_body_len,
        }
    }

    /// Consume bytes from `input`, returning how many were used. Returns
    /// `Ok(0)` when a completed frame is waiting to be taken.
    pub fn consume(&mut self, input: &[u8]) -> DriverResult<usize> {
        if self.ready.is_some() {
            return Ok(0);
        }
        let mut consumed = 0;
        while consumed < input.len() && self.ready.is_none() {
            match &mut self.state {
                DecodeState::Header { raw, have } => {
                    let n = (HEADER_SIZE - *have).min(input.len() - consumed);
                    raw[*have..*have + n].copy_from_slice(&input[consumed..consumed + n]);
                    *have += n;
                    consumed += n;
                    if *have == HEADER_SIZE {
                        let (header, body_len) = FrameHeader::decode(raw, self.max_body_len)?;
                        if body_len == 0 {
                            self.ready = Some(Frame::new(header, Bytes::new()));
                            self.state = DecodeState::header();
                        } else {
                            self.state = DecodeState::Body {
                                header,
                                remaining: body_len,
                                body: BytesMut::with_capacity(body_len),
                            };
                        }
                    }
                }
                DecodeState::Body {
                    header,
                    remaining,
                    body,
                } => {
                    let n = (*remaining).min(input.len() - consumed);
                    body.extend_from_slice(&input[consumed..consumed + n]);
                    *remaining -= n;
                    consumed += n;
                    if *remaining == 0 {
                        let frame = Frame::new(*header, body.split().freeze());
                        self.ready = Some(frame);
                        self.state = DecodeState::header();
                    }
                }
            }
        }
        Ok(consumed)
    }

    /// A complete frame is waiting in the decoder.
    pub fn frame_ready(&self) -> bool {
        self.ready.is_some()
    }

    /// Take the completed frame and reset the parser for the next one.
    pub fn take_frame(&mut self) -> Option<Frame> {
        self.ready.take()
    }

    /// Bytes of a partially assembled frame held by the decoder. Non-zero
    /// at EOF means the peer closed mid-frame.
    pub fn partial_bytes(&self) -> usize {
        match &self.state {
            DecodeState::Header { have, .. } => *have,
            DecodeState::Body { body, .. } => HEADER_SIZE + body.len(),
        }
    }
}

// Primitive [notation] codecs shared by the typed bodies in `frame`.

fn need(buf: &Cursor<&[u8]>, n: usize, what: &str) -> DriverResult<()> {
    if buf.remaining() < n {
        return Err(DriverError::FrameParse(format!(
            "truncated body: need {n} bytes for {what}"
        )));
    }
    Ok(())
}

/// `[string]`: u16 length followed by UTF-8 bytes.
pub fn get_string(buf: &mut Cursor<&[u8]>) -> DriverResult<String> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "string")?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| DriverError::FrameParse(format!("invalid utf-8 in string: {e}")))
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

/// `[long string]`: u32 length followed by UTF-8 bytes.
pub fn put_long_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// `[string map]`: u16 pair count, then key/value `[string]`s.
pub fn put_string_map<'a, I>(buf: &mut BytesMut, pairs: I)
where
    I: ExactSizeIterator<Item = (&'a str, &'a str)>,
{
    buf.put_u16(pairs.len() as u16);
    for (key, value) in pairs {
        put_string(buf, key);
        put_string(buf, value);
    }
}

/// `[string list]`: u16 count followed by `[string]`s.
pub fn get_string_list(buf: &mut Cursor<&[u8]>) -> DriverResult<Vec<String>> {
    need(buf, 2, "string list count")?;
    let count = buf.get_u16() as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(get_string(buf)?);
    }
    Ok(values)
}

/// `[string multimap]`: u16 count of key -> `[string list]` entries.
pub fn get_string_multimap(
    buf: &mut Cursor<&[u8]>,
) -> DriverResult<std::collections::HashMap<String, Vec<String>>> {
    need(buf, 2, "multimap count")?;
    let count = buf.get_u16() as usize;
    let mut map = std::collections::HashMap::with_capacity(count);
    for _ in 0..count {
        let key = get_string(buf)?;
        let values = get_string_list(buf)?;
        map.insert(key, values);
    }
    Ok(map)
}

/// `[short bytes]`: u16 length followed by raw bytes.
pub fn get_short_bytes(buf: &mut Cursor<&[u8]>) -> DriverResult<Bytes> {
    need(buf, 2, "short bytes length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "short bytes")?;
    Ok(buf.copy_to_bytes(len))
}

/// 32-bit big-endian signed integer.
pub fn get_i32(buf: &mut Cursor<&[u8]>) -> DriverResult<i32> {
    need(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

/// 32-bit big-endian unsigned integer.
pub fn get_u32(buf: &mut Cursor<&[u8]>) -> DriverResult<u32> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(stream: i8, opcode: Opcode, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameHeader::request(stream, opcode).encode(body.len(), &mut buf);
        buf.extend_from_slice(body);
        buf.to_vec()
    }

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader::request(42, Opcode::Query);
        let mut buf = BytesMut::new();
        header.encode(17, &mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let raw: [u8; HEADER_SIZE] = buf.as_ref().try_into().unwrap();
        let (decoded, body_len) = FrameHeader::decode(&raw, 1024).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body_len, 17);
    }

    #[test]
    fn negative_stream_survives_roundtrip() {
        let mut header = FrameHeader::request(0, Opcode::Error);
        header.stream = -1;
        let mut buf = BytesMut::new();
        header.encode(0, &mut buf);
        let raw: [u8; HEADER_SIZE] = buf.as_ref().try_into().unwrap();
        let (decoded, _) = FrameHeader::decode(&raw, 1024).unwrap();
        assert_eq!(decoded.stream, -1);
    }

    #[test]
    fn opcode_is_fire_and_forget() {
        // Every opcode in the v3 core set expects a response and keeps
        // its stream reservation.
        for opcode in [
            Opcode::Error,
            Opcode::Startup,
            Opcode::Ready,
            Opcode::Options,
            Opcode::Supported,
            Opcode::Query,
            Opcode::Result,
        ] {
            assert!(!opcode.is_fire_and_forget());
        }
    }

    #[test]
    fn unknown_opcode_is_parse_error() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[3] = 0x7f;
        let result = FrameHeader::decode(&raw, 1024);
        assert!(matches!(result, Err(DriverError::FrameParse(_))));
    }

    #[test]
    fn oversized_body_is_parse_error() {
        let data = encoded(0, Opcode::Query, &[0u8; 32]);
        let mut decoder = FrameDecoder::new(16);
        let result = decoder.consume(&data);
        assert!(matches!(result, Err(DriverError::FrameParse(_))));
    }

    #[test]
    fn whole_buffer_decode() {
        let data = encoded(7, Opcode::Result, b"abcd");
        let mut decoder = FrameDecoder::new(1024);
        let used = decoder.consume(&data).unwrap();
        assert_eq!(used, data.len());
        assert!(decoder.frame_ready());

        let frame = decoder.take_frame().unwrap();
        assert_eq!(frame.header.stream, 7);
        assert_eq!(frame.header.opcode, Opcode::Result);
        assert_eq!(frame.body.as_ref(), b"abcd");
    }

    #[test]
    fn empty_body_completes_at_header() {
        let data = encoded(1, Opcode::Ready, &[]);
        let mut decoder = FrameDecoder::new(1024);
        decoder.consume(&data).unwrap();
        let frame = decoder.take_frame().unwrap();
        assert!(frame.body.is_empty());
    }

    #[test]
    fn one_byte_chunks_yield_identical_frames() {
        let mut stream = encoded(3, Opcode::Query, b"select");
        stream.extend_from_slice(&encoded(4, Opcode::Query, b"from"));

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for &byte in &stream {
            let chunk = [byte];
            let mut offset = 0;
            while offset < chunk.len() {
                offset += decoder.consume(&chunk[offset..]).unwrap();
                if decoder.frame_ready() {
                    frames.push(decoder.take_frame().unwrap());
                }
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.stream, 3);
        assert_eq!(frames[0].body.as_ref(), b"select");
        assert_eq!(frames[1].header.stream, 4);
        assert_eq!(frames[1].body.as_ref(), b"from");
    }

    #[test]
    fn consume_stops_at_frame_boundary() {
        let mut stream = encoded(1, Opcode::Ready, &[]);
        stream.extend_from_slice(&encoded(2, Opcode::Ready, &[]));

        let mut decoder = FrameDecoder::new(1024);
        let used = decoder.consume(&stream).unwrap();
        assert_eq!(used, HEADER_SIZE);
        assert!(decoder.frame_ready());
        assert_eq!(decoder.consume(&stream[used..]).unwrap(), 0);

        decoder.take_frame().unwrap();
        let used2 = decoder.consume(&stream[used..]).unwrap();
        assert_eq!(used2, HEADER_SIZE);
        assert_eq!(decoder.take_frame().unwrap().header.stream, 2);
    }

    #[test]
    fn partial_bytes_tracks_mid_frame_eof() {
        let data = encoded(0, Opcode::Query, b"abcdef");
        let mut decoder = FrameDecoder::new(1024);
        decoder.consume(&data[..HEADER_SIZE + 2]).unwrap();
        assert!(!decoder.frame_ready());
        assert_eq!(decoder.partial_bytes(), HEADER_SIZE + 2);
    }

    #[test]
    fn string_map_parses_as_multimap_of_singletons() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        put_string(&mut buf, "CQL_VERSION");
        buf.put_u16(1);
        put_string(&mut buf, "3.0.0");
        put_string(&mut buf, "COMPRESSION");
        buf.put_u16(2);
        put_string(&mut buf, "snappy");
        put_string(&mut buf, "lz4");

        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        let map = get_string_multimap(&mut cursor).unwrap();
        assert_eq!(map["CQL_VERSION"], vec!["3.0.0"]);
        assert_eq!(map["COMPRESSION"], vec!["snappy", "lz4"]);
    }

    #[test]
    fn truncated_string_is_parse_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(10);
        buf.put_slice(b"abc");
        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        assert!(matches!(
            get_string(&mut cursor),
            Err(DriverError::FrameParse(_))
        ));
    }
}
