//! Example: length-field echo server and client in one process
//!
//! Starts a server that echoes every message, connects a client, sends a few
//! pings, prints the replies and the server's counters, then shuts down.
//!
//! Run with: `cargo run --example echo`
//! Set `RUST_LOG=debug` for connection-level logs.

use std::sync::Arc;
use std::time::Duration;

use framelink::config::{ConnectionConfig, LoggingConfig};
use framelink::protocol::{Dispatcher, ProtocolKind};
use framelink::utils::logging::init_logging;
use framelink::{Client, FieldMessage, Message, Server};

const PING: u32 = 1;
const PONG: u32 = 2;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LoggingConfig::default())?;

    let connection = ConnectionConfig {
        protocol: ProtocolKind::LengthField,
        ..ConnectionConfig::default()
    };

    let dispatcher = Dispatcher::new();
    dispatcher.register(PING, |_, msg| {
        let data = msg.payload().cloned().unwrap_or_default();
        Ok(Some(FieldMessage::new(PONG, msg.sequence(), data).into()))
    })?;

    let server = Server::builder("127.0.0.1:0")
        .connection_config(connection.clone())
        .handler(Arc::new(dispatcher))
        .build()?;
    let addr = server.start().await?;
    println!("server listening on {addr}");

    let client = Client::new(addr.to_string()).with_connection_config(connection);
    client.connect_simple().await?;

    for seq in 0..3 {
        let ping: Message = FieldMessage::new(PING, seq, format!("ping #{seq}").into_bytes()).into();
        client.simple_send(&ping).await?;
        let reply = tokio::time::timeout(Duration::from_secs(2), client.simple_receive()).await??;
        let text = reply
            .payload()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        println!("reply type={} seq={} data={text:?}", reply.message_type(), reply.sequence());
    }

    client.close().await?;
    server.stop().await;
    println!("{}", serde_json::to_string_pretty(&server.metrics())?);
    Ok(())
}
