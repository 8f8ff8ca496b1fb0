//! Server: accept connections, validate the preamble, pump requests.
//!
//! Each connection gets one serve loop that owns the read half. Requests
//! are dispatched concurrently onto worker tasks; every response is
//! written as one atomic frame under the connection's writer mutex, so
//! responses may return in any order while frames never interleave.
//!
//! # Example
//!
//! ```ignore
//! use jobrpc::{Server, Service};
//!
//! #[derive(serde::Deserialize)]
//! struct SumArgs { a: i64, b: i64 }
//!
//! #[tokio::main]
//! async fn main() -> jobrpc::Result<()> {
//!     let server = Server::new();
//!     server.register(Service::new("Arith")?.method(
//!         "Sum",
//!         |args: SumArgs, reply: &mut i64| {
//!             *reply = args.a + args.b;
//!             Ok(())
//!         },
//!     ))?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:7070").await?;
//!     server.accept(listener).await;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{CodecType, FrameReader, FrameWriter, Header};
use crate::error::{Result, RpcError};
use crate::handshake::{self, MAGIC_NUMBER};
use crate::service::{MethodDescriptor, Registry, Service};

/// RPC server hosting registered services.
///
/// Cloning is cheap; clones share one registry, which is how a connection
/// task serves requests against services registered before or after it
/// was accepted.
#[derive(Clone, Default)]
pub struct Server {
    registry: Arc<Registry>,
}

impl Server {
    /// Create a server with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::AlreadyRegistered`] when a service with the
    /// same name is already hosted.
    pub fn register(&self, service: Service) -> Result<()> {
        self.registry.register(service)
    }

    /// Accept connections forever, serving each on its own task.
    ///
    /// Returns when the listener fails.
    pub async fn accept(&self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    return;
                }
            };
            tracing::debug!("accepted connection from {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
            });
        }
    }

    /// Serve a single already-established connection.
    ///
    /// Reads the JSON preamble, validates the magic number, resolves the
    /// codec, and runs the serve loop until the peer goes away. Preamble
    /// failures close the connection without writing anything.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Err(e) = self.handshake_and_serve(stream).await {
            tracing::warn!("connection rejected: {e}");
        }
    }

    async fn handshake_and_serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let mut reader = BufReader::new(r);
        let opt = handshake::read_options(&mut reader).await?;
        if opt.magic_number != MAGIC_NUMBER {
            return Err(RpcError::InvalidMagic(opt.magic_number));
        }
        let kind = CodecType::from_name(&opt.codec_type)
            .ok_or(RpcError::UnknownCodec(opt.codec_type))?;

        // The BufReader may already hold framed bytes that arrived with
        // the preamble; it stays with the read half.
        let frame_reader = FrameReader::new(kind, Box::new(reader));
        let frame_writer = FrameWriter::new(kind, Box::new(w));
        self.serve_codec(frame_reader, frame_writer).await;
        Ok(())
    }

    /// Per-connection request pump: one reader, one writer mutex, one
    /// worker task per dispatched request.
    async fn serve_codec(&self, mut reader: FrameReader, writer: FrameWriter) {
        let kind = reader.codec_type();
        let writer = Arc::new(Mutex::new(writer));
        let mut workers = JoinSet::new();

        loop {
            match self.read_request(&mut reader).await {
                ReadOutcome::Eof => break,
                ReadOutcome::Failed { mut header, error } => {
                    // The request never reached a handler; answer with the
                    // resolution error and keep the connection alive.
                    header.error = error.to_string();
                    send_response(&writer, &header, &kind.empty_body()).await;
                }
                ReadOutcome::Request(request) => {
                    let writer = writer.clone();
                    workers.spawn(async move {
                        handle_request(request, kind, writer).await;
                    });
                }
            }
        }

        // Wait for in-flight handlers before closing the codec.
        while workers.join_next().await.is_some() {}
        let mut writer = writer.lock().await;
        if let Err(e) = writer.close().await {
            tracing::debug!("codec close: {e}");
        }
    }

    /// Read one request: header, resolution, raw body.
    ///
    /// The body section is consumed even when resolution fails, so the
    /// stream stays framed and the failure can be answered under the
    /// request's own sequence number.
    async fn read_request(&self, reader: &mut FrameReader) -> ReadOutcome {
        let header = match reader.read_header().await {
            Ok(Some(h)) => h,
            Ok(None) => return ReadOutcome::Eof,
            Err(e) => {
                // An undecodable header leaves no way to trust the stream.
                tracing::debug!("read header: {e}");
                return ReadOutcome::Eof;
            }
        };
        let resolved = self.registry.resolve(&header.service_method);
        let argv = match reader.read_body().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("read body: {e}");
                return ReadOutcome::Eof;
            }
        };
        match resolved {
            Ok(method) => ReadOutcome::Request(Request {
                header,
                method,
                argv,
            }),
            Err(error) => ReadOutcome::Failed { header, error },
        }
    }
}

/// A request ready for dispatch.
struct Request {
    header: Header,
    method: Arc<MethodDescriptor>,
    argv: Bytes,
}

enum ReadOutcome {
    /// Stream ended (clean EOF or an untrustworthy header).
    Eof,
    /// Header arrived but the method did not resolve.
    Failed { header: Header, error: RpcError },
    /// Fully read request.
    Request(Request),
}

/// Worker body: invoke the handler and write the response frame.
async fn handle_request(request: Request, kind: CodecType, writer: Arc<Mutex<FrameWriter>>) {
    let Request {
        mut header,
        method,
        argv,
    } = request;
    match method.invoke(kind, &argv) {
        Ok(reply) => send_response(&writer, &header, &reply).await,
        Err(text) => {
            header.error = text;
            send_response(&writer, &header, &kind.empty_body()).await;
        }
    }
}

async fn send_response(writer: &Arc<Mutex<FrameWriter>>, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write(header, body).await {
        tracing::error!(sequence = header.sequence, "write response failed: {e}");
    }
}

static DEFAULT_SERVER: OnceLock<Server> = OnceLock::new();

/// The process-wide default server used by [`register`] and [`accept`].
pub fn default_server() -> &'static Server {
    DEFAULT_SERVER.get_or_init(Server::new)
}

/// Register a service on the default server.
pub fn register(service: Service) -> Result<()> {
    default_server().register(service)
}

/// Accept connections on the default server.
pub async fn accept(listener: TcpListener) {
    default_server().accept(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ConnectOptions;
    use serde::{Deserialize, Serialize};
    use tokio::io::duplex;

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        a: i64,
        b: i64,
    }

    fn arith_server() -> Server {
        let server = Server::new();
        server
            .register(
                Service::new("Arith")
                    .unwrap()
                    .method("Sum", |args: SumArgs, reply: &mut i64| {
                        *reply = args.a + args.b;
                        Ok(())
                    }),
            )
            .unwrap();
        server
    }

    /// Spawn a serve task over an in-memory stream and return a raw
    /// client-side codec, preamble already written.
    async fn connect_raw(server: Server, opt: ConnectOptions) -> (FrameReader, FrameWriter) {
        let (client, remote) = duplex(64 * 1024);
        tokio::spawn(async move {
            server.serve_conn(remote).await;
        });
        let (r, mut w) = tokio::io::split(client);
        handshake::write_options(&mut w, &opt).await.unwrap();
        let kind = CodecType::from_name(&opt.codec_type).unwrap_or_default();
        (
            FrameReader::new(kind, Box::new(r)),
            FrameWriter::new(kind, Box::new(w)),
        )
    }

    #[tokio::test]
    async fn test_serve_one_request() {
        let (mut reader, mut writer) =
            connect_raw(arith_server(), ConnectOptions::default()).await;

        let kind = CodecType::Job;
        let body = kind.encode(&SumArgs { a: 3, b: 4 }).unwrap();
        writer
            .write(&Header::request("Arith.Sum", 1), &body)
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(header.sequence, 1);
        assert!(header.is_ok());
        let reply: i64 = kind.decode(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(reply, 7);
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_connection_usable() {
        let (mut reader, mut writer) =
            connect_raw(arith_server(), ConnectOptions::default()).await;

        let kind = CodecType::Job;
        let body = kind.encode(&SumArgs { a: 1, b: 1 }).unwrap();
        writer
            .write(&Header::request("Arith.Mul", 5), &body)
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(header.sequence, 5);
        assert!(header.error.contains("method not found"));
        reader.discard_body().await.unwrap();

        // The same connection still serves a valid request.
        writer
            .write(&Header::request("Arith.Sum", 6), &body)
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(header.sequence, 6);
        assert!(header.is_ok());
        let reply: i64 = kind.decode(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(reply, 2);
    }

    #[tokio::test]
    async fn test_malformed_method_name() {
        let (mut reader, mut writer) =
            connect_raw(arith_server(), ConnectOptions::default()).await;

        let kind = CodecType::Job;
        let body = kind.encode(&()).unwrap();
        writer
            .write(&Header::request("NoDotHere", 9), &body)
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap().unwrap();
        assert!(header.error.contains("invalid service method"));
        reader.discard_body().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_magic_closes_without_response() {
        let opt = ConnectOptions {
            magic_number: 0,
            codec_type: "job".to_string(),
        };
        let (mut reader, _writer) = connect_raw(arith_server(), opt).await;

        // Server drops the connection; nothing was ever written back.
        assert!(reader.read_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_codec_closes_connection() {
        let opt = ConnectOptions {
            magic_number: MAGIC_NUMBER,
            codec_type: "gob".to_string(),
        };
        let (mut reader, _writer) = connect_raw(arith_server(), opt).await;
        assert!(reader.read_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handler_error_response() {
        let server = Server::new();
        server
            .register(Service::new("Faulty").unwrap().method(
                "Fail",
                |_: (), _reply: &mut ()| Err("boom".into()),
            ))
            .unwrap();
        let (mut reader, mut writer) = connect_raw(server, ConnectOptions::default()).await;

        let kind = CodecType::Job;
        writer
            .write(&Header::request("Faulty.Fail", 1), &kind.encode(&()).unwrap())
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(header.error, "boom");
        // Error responses carry the empty sentinel.
        let body = reader.read_body().await.unwrap();
        let _: () = kind.decode(&body).unwrap();
    }

    #[tokio::test]
    async fn test_json_codec_connection() {
        let (mut reader, mut writer) =
            connect_raw(arith_server(), ConnectOptions::new(CodecType::Json)).await;

        let kind = CodecType::Json;
        let body = kind.encode(&SumArgs { a: 20, b: 22 }).unwrap();
        writer
            .write(&Header::request("Arith.Sum", 1), &body)
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap().unwrap();
        assert!(header.is_ok());
        let reply: i64 = kind.decode(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(reply, 42);
    }

    #[test]
    fn test_default_server_register() {
        // The default server is shared process-wide; use a unique name.
        register(Service::new("DefaultServerProbe").unwrap()).unwrap();
        match register(Service::new("DefaultServerProbe").unwrap()) {
            Err(RpcError::AlreadyRegistered(_)) => {}
            other => panic!("expected AlreadyRegistered, got {:?}", other),
        }
    }
}
