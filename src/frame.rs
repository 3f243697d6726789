//! Provides a type representing a CQL native protocol frame as well as the
//! typed request bodies the core sends and the response views it reads.

use std::collections::HashMap;
use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::codec::{
    self, FrameHeader, HEADER_SIZE, Opcode,
};
use crate::config::{Compression, ConnectionConfig};
use crate::error::{DriverError, DriverResult};

/// A single protocol message: fixed header plus raw body bytes.
///
/// The body stays opaque at this level; the handful of bodies the state
/// machine must understand are parsed on demand by the view functions
/// below. Everything else (notably ROWS payloads) is handed to the caller
/// untouched.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    /// An OPTIONS request (empty body).
    pub fn options(stream: i8) -> Self {
        Self::new(FrameHeader::request(stream, Opcode::Options), Bytes::new())
    }

    /// A STARTUP request carrying `CQL_VERSION` and, when negotiated, the
    /// `COMPRESSION` option.
    pub fn startup(stream: i8, config: &ConnectionConfig) -> Self {
        let mut pairs = vec![("CQL_VERSION", config.protocol_version.as_str())];
        if let Some(algorithm) = config.compression.option_value() {
            pairs.push(("COMPRESSION", algorithm));
        }
        let mut body = BytesMut::new();
        codec::put_string_map(&mut body, pairs.into_iter());
        Self::new(FrameHeader::request(stream, Opcode::Startup), body.freeze())
    }

    /// A QUERY request: long-string query text, consistency, empty flags.
    pub fn query(stream: i8, text: &str, consistency: Consistency) -> Self {
        Self::new(
            FrameHeader::request(stream, Opcode::Query),
            query_body(text, consistency),
        )
    }

    /// Serialize header and body into a single buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        self.header.encode(self.body.len(), &mut buf);
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn stream(&self) -> i8 {
        self.header.stream
    }

    /// Negative stream ids mark server-initiated event frames.
    pub fn is_server_event(&self) -> bool {
        self.header.stream < 0
    }
}

/// Encode a QUERY body: long-string query text, consistency, empty flags.
pub fn query_body(text: &str, consistency: Consistency) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + text.len() + 3);
    codec::put_long_string(&mut body, text);
    body.extend_from_slice(&(consistency as u16).to_be_bytes());
    body.extend_from_slice(&[0u8]);
    body.freeze()
}

/// Consistency level carried by QUERY requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,
}

/// RESULT body kind discriminant (first four body bytes).
#[derive(TryFromPrimitive)]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultKind {
    Void = 1,
    Rows = 2,
    SetKeyspace = 3,
    Prepared = 4,
    SchemaChange = 5,
}

/// Decoded RESULT body. Only the discriminant and the fields the
/// dispatcher routes on are parsed; payloads stay raw.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Void,
    Rows(Bytes),
    SetKeyspace(String),
    Prepared { id: Bytes, metadata: Bytes },
    SchemaChange(Bytes),
}

/// Parse a RESULT frame body.
pub fn parse_result(body: &Bytes) -> DriverResult<QueryResult> {
    let mut cursor = Cursor::new(body.as_ref());
    let raw_kind = codec::get_u32(&mut cursor)?;
    let kind = ResultKind::try_from(raw_kind)
        .map_err(|_| DriverError::FrameParse(format!("unknown result kind {raw_kind}")))?;
    let result = match kind {
        ResultKind::Void => QueryResult::Void,
        ResultKind::Rows => QueryResult::Rows(body.slice(4..)),
        ResultKind::SetKeyspace => QueryResult::SetKeyspace(codec::get_string(&mut cursor)?),
        ResultKind::Prepared => {
            let id = codec::get_short_bytes(&mut cursor)?;
            let offset = cursor.position() as usize;
            QueryResult::Prepared {
                id,
                metadata: body.slice(offset..),
            }
        }
        ResultKind::SchemaChange => QueryResult::SchemaChange(body.slice(4..)),
    };
    Ok(result)
}

/// Parse an ERROR frame body into the server-error variant.
pub fn parse_error(body: &Bytes) -> DriverError {
    let mut cursor = Cursor::new(body.as_ref());
    match (codec::get_i32(&mut cursor), codec::get_string(&mut cursor)) {
        (Ok(code), Ok(message)) => DriverError::Server { code, message },
        _ => DriverError::FrameParse("malformed ERROR body".to_string()),
    }
}

/// Parse a SUPPORTED frame body (string multimap of server options).
pub fn parse_supported(body: &Bytes) -> DriverResult<HashMap<String, Vec<String>>> {
    let mut cursor = Cursor::new(body.as_ref());
    codec::get_string_multimap(&mut cursor)
}

/// Whether the server's SUPPORTED options include the given compression
/// algorithm.
pub fn supports_compression(options: &HashMap<String, Vec<String>>, mode: Compression) -> bool {
    match mode.option_value() {
        None => true,
        Some(algorithm) => options
            .get("COMPRESSION")
            .is_some_and(|algorithms| algorithms.iter().any(|a| a == algorithm)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use crate::codec::put_string;

    #[test]
    fn startup_body_carries_version_and_compression() {
        let config = ConnectionConfig::new().with_compression(Compression::Lz4);
        let frame = Frame::startup(0, &config);
        assert_eq!(frame.opcode(), Opcode::Startup);

        let mut cursor = Cursor::new(frame.body.as_ref());
        let count = u16::from_be_bytes([frame.body[0], frame.body[1]]);
        assert_eq!(count, 2);
        cursor.set_position(2);
        assert_eq!(codec::get_string(&mut cursor).unwrap(), "CQL_VERSION");
        assert_eq!(codec::get_string(&mut cursor).unwrap(), "3.0.0");
        assert_eq!(codec::get_string(&mut cursor).unwrap(), "COMPRESSION");
        assert_eq!(codec::get_string(&mut cursor).unwrap(), "lz4");
    }

    #[test]
    fn startup_without_compression_has_single_pair() {
        let frame = Frame::startup(0, &ConnectionConfig::default());
        let count = u16::from_be_bytes([frame.body[0], frame.body[1]]);
        assert_eq!(count, 1);
    }

    #[test]
    fn query_body_layout() {
        let frame = Frame::query(5, "SELECT 1", Consistency::Quorum);
        let body = frame.body.as_ref();
        assert_eq!(&body[..4], &8u32.to_be_bytes());
        assert_eq!(&body[4..12], b"SELECT 1");
        assert_eq!(&body[12..14], &(Consistency::Quorum as u16).to_be_bytes());
        assert_eq!(body[14], 0);
    }

    #[test]
    fn encode_produces_header_plus_body() {
        let frame = Frame::query(1, "x", Consistency::One);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + frame.body.len());
        assert_eq!(
            u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]) as usize,
            frame.body.len()
        );
    }

    #[test]
    fn result_kind_dispatch() {
        let mut body = BytesMut::new();
        body.put_u32(3);
        put_string(&mut body, "ks1");
        match parse_result(&body.freeze()).unwrap() {
            QueryResult::SetKeyspace(keyspace) => assert_eq!(keyspace, "ks1"),
            other => panic!("expected SetKeyspace, got {other:?}"),
        }

        let mut body = BytesMut::new();
        body.put_u32(1);
        assert!(matches!(
            parse_result(&body.freeze()).unwrap(),
            QueryResult::Void
        ));

        let mut body = BytesMut::new();
        body.put_u32(4);
        body.put_u16(3);
        body.put_slice(b"abc");
        body.put_slice(b"metadata");
        match parse_result(&body.freeze()).unwrap() {
            QueryResult::Prepared { id, metadata } => {
                assert_eq!(id.as_ref(), b"abc");
                assert_eq!(metadata.as_ref(), b"metadata");
            }
            other => panic!("expected Prepared, got {other:?}"),
        }
    }

    #[test]
    fn unknown_result_kind_is_parse_error() {
        let mut body = BytesMut::new();
        body.put_u32(99);
        assert!(matches!(
            parse_result(&body.freeze()),
            Err(DriverError::FrameParse(_))
        ));
    }

    #[test]
    fn error_body_parses_code_and_message() {
        let mut body = BytesMut::new();
        body.put_i32(0x2200);
        put_string(&mut body, "Invalid query");
        match parse_error(&body.freeze()) {
            DriverError::Server { code, message } => {
                assert_eq!(code, 0x2200);
                assert_eq!(message, "Invalid query");
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[test]
    fn supported_compression_check() {
        let mut options = HashMap::new();
        options.insert(
            "COMPRESSION".to_string(),
            vec!["snappy".to_string(), "lz4".to_string()],
        );
        assert!(supports_compression(&options, Compression::Snappy));
        assert!(supports_compression(&options, Compression::None));
        assert!(!supports_compression(&HashMap::new(), Compression::Lz4));
    }
}
