use std::sync::Arc;

use framelink::config::ConnectionConfig;
use framelink::protocol::{FieldMessage, ProtocolKind};
use framelink::{Client, EngineError, Message, Server};

mod common;
use common::{eventually, test_config, Recorder};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_clients_echo_heavy() {
    use tokio::task::JoinSet;

    let server_handler = Arc::new(Recorder::echo());
    let server = Server::builder("127.0.0.1:0")
        .connection_config(test_config(ProtocolKind::LengthField))
        .handler(server_handler.clone())
        .build()
        .unwrap();
    let addr = server.start().await.unwrap();

    let clients = 16usize;
    let per_client = 200u32;
    let mut tasks = JoinSet::new();
    for id in 0..clients {
        tasks.spawn(async move {
            let handler = Arc::new(Recorder::default());
            let client = Client::new(addr.to_string())
                .with_connection_config(test_config(ProtocolKind::LengthField))
                .with_handler(handler.clone());
            client.connect().await.unwrap();
            for seq in 0..per_client {
                let msg: Message = FieldMessage::new(id as u32, seq, vec![id as u8; 64]).into();
                loop {
                    match client.send(&msg) {
                        Ok(()) => break,
                        Err(EngineError::SendBufferFull) => tokio::task::yield_now().await,
                        Err(e) => panic!("send failed: {e}"),
                    }
                }
            }
            eventually("echoes", || handler.message_count() == per_client as usize).await;
            let sequences: Vec<u32> = handler.messages().iter().map(Message::sequence).collect();
            assert_eq!(sequences, (0..per_client).collect::<Vec<_>>());
            assert!(handler.messages().iter().all(|m| m.message_type() == id as u32));
            client.close().await.unwrap();
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    assert_eq!(server_handler.message_count(), clients * per_client as usize);
    assert_eq!(server.metrics().connections_total, clients as u64);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_share_one_connection() {
    let (local, remote) = tokio::io::duplex(1 << 20);
    let config = ConnectionConfig {
        send_queue_size: 4096,
        ..test_config(ProtocolKind::LengthField)
    };
    let protocol = framelink::new_protocol(config.protocol, config.max_message_size);
    let conn = framelink::Connection::new(
        1,
        local,
        protocol.clone(),
        Arc::new(Recorder::default()),
        Arc::new(config),
    );

    let mut senders = Vec::new();
    for t in 0..8u32 {
        let conn = Arc::clone(&conn);
        senders.push(tokio::spawn(async move {
            for seq in 0..250u32 {
                conn.send(&FieldMessage::new(t, seq, &b"x"[..]).into()).unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }
    assert_eq!(conn.queued(), 2000);

    let runner = Arc::clone(&conn);
    tokio::spawn(async move { runner.start().await });
    eventually("queue drained", || conn.metrics().messages_sent == 2000).await;

    // frames from each sender stay in that sender's order
    use tokio::io::AsyncReadExt;
    let mut remote = remote;
    let mut wire = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    let expected = 2000 * 17;
    while wire.len() < expected {
        let n = remote.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        wire.extend_from_slice(&chunk[..n]);
    }
    let mut next = [0u32; 8];
    let mut offset = 0;
    while offset < wire.len() {
        let (msg, used) = protocol.unpack(&wire[offset..]).unwrap();
        assert_eq!(msg.sequence(), next[msg.message_type() as usize]);
        next[msg.message_type() as usize] += 1;
        offset += used;
    }
    assert_eq!(next, [250u32; 8]);
    conn.close();
}
