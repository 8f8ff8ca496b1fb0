//! # jobrpc
//!
//! A minimal bidirectional RPC runtime: a [`Server`] hosts named
//! [`Service`]s, a [`Client`] invokes their methods over any byte stream,
//! and many in-flight calls share one connection.
//!
//! ## Architecture
//!
//! - **Preamble** (JSON line): magic number + codec name, once per
//!   connection
//! - **Frames**: codec-encoded header/body pairs, length-prefixed per
//!   section, until close
//!
//! Requests are dispatched concurrently on the server; responses come
//! back in whatever order handlers finish, correlated by sequence number.
//!
//! ## Example
//!
//! ```ignore
//! use jobrpc::{Client, Server, Service};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
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
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = Client::dial(addr, None).await?;
//!     let reply: i64 = client.call("Arith.Sum", &SumArgs { a: 3, b: 4 }).await?;
//!     assert_eq!(reply, 7);
//!     client.close().await
//! }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod server;
pub mod service;

pub use client::{Call, Client};
pub use codec::{CodecType, Header};
pub use error::{MethodError, Result, RpcError};
pub use handshake::{ConnectOptions, MAGIC_NUMBER};
pub use server::{accept, default_server, register, Server};
pub use service::{MethodDescriptor, Service};
