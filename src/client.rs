//! Client: call multiplexer over a single connection.
//!
//! The client assigns every outbound request a monotonic sequence number,
//! parks a one-shot completion signal in the pending table, and lets a
//! background receive loop demultiplex responses back to their calls.
//! When the connection dies, every outstanding call is terminated with
//! the transport error exactly once.
//!
//! # Example
//!
//! ```ignore
//! use jobrpc::Client;
//!
//! #[derive(serde::Serialize)]
//! struct SumArgs { a: i64, b: i64 }
//!
//! #[tokio::main]
//! async fn main() -> jobrpc::Result<()> {
//!     let client = Client::dial("127.0.0.1:7070", None).await?;
//!     let reply: i64 = client.call("Arith.Sum", &SumArgs { a: 3, b: 4 }).await?;
//!     assert_eq!(reply, 7);
//!     client.close().await
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Mutex};

use crate::codec::{CodecType, FrameReader, FrameWriter, Header};
use crate::error::{Result, RpcError};
use crate::handshake::{self, ConnectOptions};

type CallResult = std::result::Result<Bytes, RpcError>;

/// An in-flight call returned by [`Client::go`].
///
/// The embedded one-shot receiver is the call's done-signal: it is posted
/// exactly once, by the receive loop, the send path, or termination.
pub struct Call {
    service_method: String,
    sequence: u64,
    kind: CodecType,
    signal: oneshot::Receiver<CallResult>,
}

impl Call {
    /// The `Service.Method` this call targets.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// The sequence number assigned at registration. Zero when the call
    /// was rejected before registration.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Await the done-signal and decode the reply.
    pub async fn done<R: DeserializeOwned>(self) -> Result<R> {
        match self.signal.await {
            Ok(Ok(body)) => self.kind.decode(&body),
            Ok(Err(e)) => Err(e),
            // Sender dropped without posting: the client was torn down.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("service_method", &self.service_method)
            .field("sequence", &self.sequence)
            .finish()
    }
}

struct ClientState {
    /// Next sequence to assign; strictly monotonic per client.
    sequence: u64,
    /// Pending table: sequence -> done-signal sender.
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
    /// User asked to close.
    closing: bool,
    /// The connection failed underneath us.
    shutdown: bool,
}

struct Shared {
    kind: CodecType,
    /// Sending mutex. Holds the writer, and is held across the whole
    /// (register, encode, write) sequence so a call is in the pending
    /// table before its bytes reach the wire.
    sending: Mutex<FrameWriter>,
    /// State mutex. Guards sequence, pending table, and the flags; held
    /// briefly and never across I/O.
    state: StdMutex<ClientState>,
}

impl Shared {
    fn remove_call(&self, sequence: u64) -> Option<oneshot::Sender<CallResult>> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .pending
            .remove(&sequence)
    }
}

/// RPC client bound to one connection.
///
/// Cloning is cheap; clones share the connection, the pending table, and
/// the sequence counter.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connect over TCP, send the preamble, and start the receive loop.
    pub async fn dial(addr: impl ToSocketAddrs, opts: Option<ConnectOptions>) -> Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        Self::connect(stream, opts).await
    }

    /// Perform the preamble exchange on an established byte stream.
    ///
    /// The magic number is forced to the canonical value; the codec name
    /// must resolve in the factory.
    pub async fn connect<S>(mut stream: S, opts: Option<ConnectOptions>) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (opt, kind) = ConnectOptions::resolve(opts)?;
        handshake::write_options(&mut stream, &opt).await?;
        let (reader, writer) = kind.bind(stream);
        Ok(Self::with_codec(reader, writer))
    }

    /// Build a client from an already-bound codec and spawn the receive
    /// loop. The two halves must come from the same connection.
    pub fn with_codec(reader: FrameReader, writer: FrameWriter) -> Client {
        let kind = reader.codec_type();
        let shared = Arc::new(Shared {
            kind,
            sending: Mutex::new(writer),
            state: StdMutex::new(ClientState {
                sequence: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let recv_shared = shared.clone();
        tokio::spawn(async move {
            receive(recv_shared, reader).await;
        });
        Client { shared }
    }

    /// Issue a call asynchronously.
    ///
    /// Returns as soon as the request is on the wire (or has failed);
    /// completion is awaited separately via [`Call::done`]. A failure
    /// anywhere on the send path is posted to the call's done-signal
    /// rather than returned here.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Call {
        let (tx, rx) = oneshot::channel();
        let mut call = Call {
            service_method: service_method.to_string(),
            sequence: 0,
            kind: self.shared.kind,
            signal: rx,
        };

        // Encode outside the sending mutex; a failure here never touches
        // the pending table.
        let body = match self.shared.kind.encode(args) {
            Ok(body) => body,
            Err(e) => {
                let _ = tx.send(Err(e));
                return call;
            }
        };

        let mut writer = self.shared.sending.lock().await;

        let sequence = {
            let mut state = self.shared.state.lock().expect("client state lock poisoned");
            if state.closing || state.shutdown {
                drop(state);
                drop(writer);
                let _ = tx.send(Err(RpcError::Shutdown));
                return call;
            }
            let sequence = state.sequence;
            state.sequence += 1;
            state.pending.insert(sequence, tx);
            sequence
        };
        call.sequence = sequence;

        let header = Header::request(service_method, sequence);
        if let Err(e) = writer.write(&header, &body).await {
            // The receive loop may have claimed the call in the meantime;
            // only post the failure if it is still ours.
            if let Some(tx) = self.shared.remove_call(sequence) {
                let _ = tx.send(Err(e));
            }
        }
        call
    }

    /// Issue a call and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.done().await
    }

    /// Close the connection.
    ///
    /// Returns [`RpcError::Shutdown`] when already closing. Outstanding
    /// calls are terminated by the receive loop once the codec closes.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("client state lock poisoned");
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        let mut writer = self.shared.sending.lock().await;
        writer.close().await
    }

    /// True while the client is neither closing nor shut down.
    pub fn is_available(&self) -> bool {
        let state = self.shared.state.lock().expect("client state lock poisoned");
        !state.closing && !state.shutdown
    }
}

/// Background receive loop: demultiplex responses by sequence until the
/// stream dies, then terminate everything still pending.
async fn receive(shared: Arc<Shared>, mut reader: FrameReader) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break RpcError::ConnectionLost("connection closed by peer".to_string()),
            Err(e) => break e,
        };
        let call = shared.remove_call(header.sequence);
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => {
                let text = e.to_string();
                if let Some(tx) = call {
                    let _ = tx.send(Err(e));
                }
                break RpcError::ConnectionLost(text);
            }
        };
        match call {
            // Orphan response: the request was never registered or its
            // send already failed. The body is already drained.
            None => {}
            Some(tx) if !header.error.is_empty() => {
                let _ = tx.send(Err(RpcError::Remote(header.error)));
            }
            Some(tx) => {
                let _ = tx.send(Ok(body));
            }
        }
    };
    tracing::debug!("receive loop ended: {err}");
    terminate(&shared, err).await;
}

/// Mark the client shut down and post the error to every pending call.
async fn terminate(shared: &Shared, err: RpcError) {
    // Hold the sending mutex so no send interleaves with teardown.
    let _writer = shared.sending.lock().await;
    let mut state = shared.state.lock().expect("client state lock poisoned");
    state.shutdown = true;
    let text = err.to_string();
    for (_, tx) in state.pending.drain() {
        let _ = tx.send(Err(RpcError::ConnectionLost(text.clone())));
    }
}
