//! Minimal round trip: register a service, serve it on loopback, call it.
//!
//! Run with: `cargo run --example echo`

use jobrpc::{Client, Server, Service};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Serialize, Deserialize)]
struct SumArgs {
    a: i64,
    b: i64,
}

#[tokio::main]
async fn main() -> jobrpc::Result<()> {
    let server = Server::new();
    server.register(Service::new("Arith")?.method(
        "Sum",
        |args: SumArgs, reply: &mut i64| {
            *reply = args.a + args.b;
            Ok(())
        },
    ))?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        server.accept(listener).await;
    });

    let client = Client::dial(addr, None).await?;
    let reply: i64 = client.call("Arith.Sum", &SumArgs { a: 3, b: 4 }).await?;
    println!("Arith.Sum(3, 4) = {reply}");

    client.close().await
}
