//! Scripted nsqd for connection and consumer tests.

use super::connection::ConnectionConfig;
use super::protocol::{
    encode_frame, encode_message, Identify, DEFAULT_MAX_FRAME_SIZE, FRAME_TYPE_RESPONSE,
    MAGIC_V2, OK,
};
use crate::queue::{Message, MessageId};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub fn id(n: u8) -> MessageId {
    let mut bytes = [b'0'; 16];
    bytes[15] = b'0' + n;
    MessageId::new(bytes)
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        topic: "events".into(),
        channel: "bq".into(),
        identify: Identify {
            client_id: "test".into(),
            hostname: "test.local".into(),
            user_agent: "nsq_to_bigquery/test".into(),
            feature_negotiation: false,
            heartbeat_interval: 30_000,
            msg_timeout: 60_000,
        },
        max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        connect_timeout: Duration::from_secs(2),
    }
}

/// Accepts one client, completes the handshake, pushes `messages` after
/// the first RDY and reports every command line it receives.
pub async fn fake_nsqd(messages: Vec<(MessageId, &'static str)>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (lines_tx, lines_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut read = BufReader::new(read);

        let mut magic = [0u8; 4];
        read.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);

        let mut line = String::new();
        read.read_line(&mut line).await.unwrap();
        assert_eq!(line, "IDENTIFY\n");
        let len = read.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        read.read_exact(&mut body).await.unwrap();
        write.write_all(&encode_frame(FRAME_TYPE_RESPONSE, OK)).await.unwrap();

        line.clear();
        read.read_line(&mut line).await.unwrap();
        let _ = lines_tx.send(line.trim_end().to_string());
        write.write_all(&encode_frame(FRAME_TYPE_RESPONSE, OK)).await.unwrap();

        line.clear();
        read.read_line(&mut line).await.unwrap();
        let _ = lines_tx.send(line.trim_end().to_string());
        for (id, body) in messages {
            write
                .write_all(&encode_message(0, 1, &id, body.as_bytes()))
                .await
                .unwrap();
        }

        loop {
            line.clear();
            match read.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = lines_tx.send(line.trim_end().to_string());
                }
            }
        }
    });

    (address, lines_rx)
}

pub async fn next_lines(lines: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
    let mut out = Vec::new();
    for _ in 0..n {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("timed out waiting for command")
            .expect("fake nsqd stopped");
        out.push(line);
    }
    out.sort();
    out
}

pub async fn next_message(rx: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("connection stopped delivering")
}
