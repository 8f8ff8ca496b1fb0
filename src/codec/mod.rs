//! Codec module: frame framing and body serialization.
//!
//! After the connection preamble, all traffic is a stream of frames. Each
//! frame is two sections, a [`Header`] and a body, and each section is a
//! `u32` big-endian length prefix followed by one codec-encoded value.
//! Framing therefore survives a body that fails to decode: the bytes are
//! already off the stream, and the next header starts cleanly.
//!
//! Two codecs are registered:
//!
//! - [`JobCodec`]: self-describing MessagePack, the default
//! - [`JsonCodec`]: JSON bodies
//!
//! [`CodecType`] is the process-wide factory: the handshake names a codec
//! as a string, [`CodecType::from_name`] resolves it, and
//! [`CodecType::bind`] splits a connection into a [`FrameReader`] and a
//! [`FrameWriter`]. One owner reads; writers are serialized externally by
//! a mutex above the [`FrameWriter`].

mod job;
mod json;

pub use job::JobCodec;
pub use json::JsonCodec;

use std::io;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::error::{Result, RpcError};

/// Length prefix size of a frame section, in bytes.
pub const SECTION_PREFIX_SIZE: usize = 4;

/// Maximum encoded size of a single frame section (16 MiB).
pub const MAX_SECTION_SIZE: u32 = 16 * 1024 * 1024;

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-message metadata, the first section of every frame.
///
/// `error` is empty on success; a response with a non-empty `error`
/// carries the empty-sentinel body instead of a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Qualified method name of form `Service.Method`.
    pub service_method: String,
    /// Caller-assigned correlation number.
    pub sequence: u64,
    /// Error text; empty means success.
    pub error: String,
}

impl Header {
    /// Create a request header with an empty error field.
    pub fn request(service_method: impl Into<String>, sequence: u64) -> Self {
        Self {
            service_method: service_method.into(),
            sequence,
            error: String::new(),
        }
    }

    /// True when the error field is empty.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Codec identifier, resolved from the handshake's codec name.
///
/// This enum is the process-wide codec factory: every supported name maps
/// to a variant, and [`CodecType::bind`] constructs the frame reader and
/// writer for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    /// Self-describing MessagePack ([`JobCodec`]), the default.
    Job,
    /// JSON bodies ([`JsonCodec`]).
    Json,
}

impl CodecType {
    /// Resolve a codec by its registered name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "job" => Some(CodecType::Job),
            "json" => Some(CodecType::Json),
            _ => None,
        }
    }

    /// The registered name of this codec.
    pub fn name(&self) -> &'static str {
        match self {
            CodecType::Job => "job",
            CodecType::Json => "json",
        }
    }

    /// Encode one value with this codec.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::Job => JobCodec::encode(value),
            CodecType::Json => JsonCodec::encode(value),
        }
    }

    /// Decode one value with this codec.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::Job => JobCodec::decode(bytes),
            CodecType::Json => JsonCodec::decode(bytes),
        }
    }

    /// The empty-sentinel body sent in place of a reply when a response
    /// carries an error.
    pub fn empty_body(&self) -> Vec<u8> {
        match self {
            CodecType::Job => vec![0xc0],
            CodecType::Json => b"null".to_vec(),
        }
    }

    /// Split a connection into this codec's frame reader and writer.
    pub fn bind<S>(self, stream: S) -> (FrameReader, FrameWriter)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        (
            FrameReader::new(self, Box::new(r)),
            FrameWriter::new(self, Box::new(w)),
        )
    }
}

impl Default for CodecType {
    fn default() -> Self {
        CodecType::Job
    }
}

/// Reading half of a bound codec.
///
/// Owned by exactly one loop: the server's serve loop or the client's
/// receive loop.
pub struct FrameReader {
    kind: CodecType,
    reader: BoxedReader,
}

impl FrameReader {
    /// Wrap a read half. Bytes already buffered by the caller (e.g. a
    /// `BufReader` that consumed the preamble line) stay with the half.
    pub fn new(kind: CodecType, reader: BoxedReader) -> Self {
        Self { kind, reader }
    }

    /// The codec this reader decodes with.
    #[inline]
    pub fn codec_type(&self) -> CodecType {
        self.kind
    }

    /// Read and decode one header section.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before a new frame.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        let section = match self.read_section().await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let header = self.kind.decode(&section)?;
        Ok(Some(header))
    }

    /// Read the raw body section that follows a header.
    ///
    /// Always consumes exactly one section, so the stream stays framed even
    /// when the caller cannot (or does not want to) decode the value.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        match self.read_section().await? {
            Some(bytes) => Ok(bytes),
            None => Err(RpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended before frame body",
            ))),
        }
    }

    /// Consume and discard the body section that follows a header.
    pub async fn discard_body(&mut self) -> Result<()> {
        self.read_body().await.map(|_| ())
    }

    /// Read one length-prefixed section. `Ok(None)` means the stream ended
    /// before the length prefix, which is the clean end of a connection.
    async fn read_section(&mut self) -> Result<Option<Bytes>> {
        let mut prefix = [0u8; SECTION_PREFIX_SIZE];
        if let Err(e) = self.reader.read_exact(&mut prefix).await {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e.into());
        }
        let len = u32::from_be_bytes(prefix);
        if len > MAX_SECTION_SIZE {
            return Err(RpcError::FrameTooLarge(len));
        }
        let mut buf = BytesMut::zeroed(len as usize);
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf.freeze()))
    }
}

/// Writing half of a bound codec.
///
/// Buffered so a frame's header and body coalesce into one flush. Callers
/// serialize access with a mutex; every `write` is one atomic frame.
pub struct FrameWriter {
    kind: CodecType,
    writer: BufWriter<BoxedWriter>,
    closed: bool,
}

impl FrameWriter {
    /// Wrap a write half.
    pub fn new(kind: CodecType, writer: BoxedWriter) -> Self {
        Self {
            kind,
            writer: BufWriter::new(writer),
            closed: false,
        }
    }

    /// The codec this writer encodes with.
    #[inline]
    pub fn codec_type(&self) -> CodecType {
        self.kind
    }

    /// Encode and write one frame (header, then body), then flush.
    ///
    /// `body` is an already codec-encoded value. On any I/O failure the
    /// connection is closed before the error is returned.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        if header_bytes.len() as u64 > MAX_SECTION_SIZE as u64 {
            return Err(RpcError::FrameTooLarge(header_bytes.len() as u32));
        }
        if body.len() as u64 > MAX_SECTION_SIZE as u64 {
            return Err(RpcError::FrameTooLarge(body.len() as u32));
        }
        if let Err(e) = self.write_frame(&header_bytes, body).await {
            let _ = self.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Shut the connection down. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn write_frame(&mut self, header: &[u8], body: &[u8]) -> io::Result<()> {
        self.write_section(header).await?;
        self.write_section(body).await?;
        self.writer.flush().await
    }

    async fn write_section(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_u32(bytes.len() as u32).await?;
        self.writer.write_all(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn bind_pair(kind: CodecType) -> (FrameReader, FrameWriter, FrameReader, FrameWriter) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = kind.bind(a);
        let (br, bw) = kind.bind(b);
        (ar, aw, br, bw)
    }

    #[test]
    fn test_from_name() {
        assert_eq!(CodecType::from_name("job"), Some(CodecType::Job));
        assert_eq!(CodecType::from_name("json"), Some(CodecType::Json));
        assert_eq!(CodecType::from_name("gob"), None);
        assert_eq!(CodecType::from_name(""), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for kind in [CodecType::Job, CodecType::Json] {
            assert_eq!(CodecType::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn test_header_encode_decode_identity() {
        let header = Header {
            service_method: "Foo.Sum".to_string(),
            sequence: 42,
            error: String::new(),
        };
        for kind in [CodecType::Job, CodecType::Json] {
            let bytes = kind.encode(&header).unwrap();
            let decoded: Header = kind.decode(&bytes).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_header_wire_field_names() {
        let header = Header::request("Foo.Sum", 7);
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["ServiceMethod"], "Foo.Sum");
        assert_eq!(json["Sequence"], 7);
        assert_eq!(json["Error"], "");
    }

    #[test]
    fn test_empty_body_decodes_as_unit() {
        for kind in [CodecType::Job, CodecType::Json] {
            let body = kind.empty_body();
            let _: () = kind.decode(&body).unwrap();
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut reader, _aw, _br, mut writer) = bind_pair(CodecType::Job);

        let header = Header::request("Foo.Sum", 1);
        let body = CodecType::Job.encode(&"hello").unwrap();
        writer.write(&header, &body).await.unwrap();

        let got = reader.read_header().await.unwrap().unwrap();
        assert_eq!(got, header);
        let got_body = reader.read_body().await.unwrap();
        let value: String = CodecType::Job.decode(&got_body).unwrap();
        assert_eq!(value, "hello");
    }

    #[tokio::test]
    async fn test_read_header_clean_eof() {
        let (mut reader, _aw, _br, mut writer) = bind_pair(CodecType::Job);
        writer.close().await.unwrap();
        drop(writer);

        assert!(reader.read_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (client, server) = duplex(64 * 1024);
        let (mut reader, _w) = CodecType::Job.bind(client);

        // A length prefix with no payload behind it.
        let (_, mut raw) = CodecType::Job.bind(server);
        raw.writer.write_u32(8).await.unwrap();
        raw.writer.flush().await.unwrap();
        raw.close().await.unwrap();
        drop(raw);

        assert!(reader.read_header().await.is_err());
    }

    #[tokio::test]
    async fn test_discard_body_keeps_stream_framed() {
        let (mut reader, _aw, _br, mut writer) = bind_pair(CodecType::Json);

        let body1 = CodecType::Json.encode(&"first").unwrap();
        let body2 = CodecType::Json.encode(&"second").unwrap();
        writer.write(&Header::request("Foo.A", 1), &body1).await.unwrap();
        writer.write(&Header::request("Foo.B", 2), &body2).await.unwrap();

        let h1 = reader.read_header().await.unwrap().unwrap();
        assert_eq!(h1.sequence, 1);
        reader.discard_body().await.unwrap();

        let h2 = reader.read_header().await.unwrap().unwrap();
        assert_eq!(h2.sequence, 2);
        let value: String = CodecType::Json
            .decode(&reader.read_body().await.unwrap())
            .unwrap();
        assert_eq!(value, "second");
    }

    #[tokio::test]
    async fn test_oversized_section_rejected() {
        let (client, server) = duplex(64 * 1024);
        let (mut reader, _w) = CodecType::Job.bind(client);

        let (_, mut raw) = CodecType::Job.bind(server);
        raw.writer.write_u32(MAX_SECTION_SIZE + 1).await.unwrap();
        raw.writer.flush().await.unwrap();

        match reader.read_header().await {
            Err(RpcError::FrameTooLarge(len)) => assert_eq!(len, MAX_SECTION_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_oversized_outgoing_sections_rejected() {
        let (_client, server) = duplex(64 * 1024);
        let (_r, mut writer) = CodecType::Job.bind(server);

        // Header text is peer-influenced; an oversized encoded header must
        // be refused locally, not shipped for the far end to reject.
        let mut header = Header::request("Foo.Sum", 1);
        header.error = "e".repeat(MAX_SECTION_SIZE as usize + 1);
        let body = CodecType::Job.encode(&()).unwrap();
        assert!(matches!(
            writer.write(&header, &body).await,
            Err(RpcError::FrameTooLarge(_))
        ));

        let oversized_body = vec![0u8; MAX_SECTION_SIZE as usize + 1];
        assert!(matches!(
            writer.write(&Header::request("Foo.Sum", 2), &oversized_body).await,
            Err(RpcError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_body_leaves_next_frame_intact() {
        let (mut reader, _aw, _br, mut writer) = bind_pair(CodecType::Job);

        // Body bytes that are valid msgpack for a string, not for a map.
        let body = CodecType::Job.encode(&"not a struct").unwrap();
        writer.write(&Header::request("Foo.Sum", 1), &body).await.unwrap();
        let ok_body = CodecType::Job.encode(&3i64).unwrap();
        writer.write(&Header::request("Foo.Sum", 2), &ok_body).await.unwrap();

        let _h1 = reader.read_header().await.unwrap().unwrap();
        let raw = reader.read_body().await.unwrap();
        #[derive(serde::Deserialize, Debug)]
        struct Args {
            #[allow(dead_code)]
            a: i64,
        }
        assert!(CodecType::Job.decode::<Args>(&raw).is_err());

        // The stream is still aligned on the next header.
        let h2 = reader.read_header().await.unwrap().unwrap();
        assert_eq!(h2.sequence, 2);
        let v: i64 = CodecType::Job.decode(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(v, 3);
    }
}
