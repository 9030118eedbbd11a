#![allow(dead_code)]

use snapsort_lib::events::{EventBus, TransferEvent};
use snapsort_lib::server::ImageServer;
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

//===============
// Test Helpers
//===============

/// Two-file batch: a.jpg (5 bytes) then b.jpg (3 bytes).
pub const SCENARIO: &[u8] = b"2\na.jpg\n2024-01-01\n5\nAAAAAb.jpg\n2024-01-01\n3\nBBB";

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

pub async fn start_server(dir: &TempDir) -> (ImageServer, UnboundedReceiver<TransferEvent>) {
    let bus = EventBus::new();
    let (_sub, rx) = bus.channel();
    let server = ImageServer::start(
        "127.0.0.1:0".parse().unwrap(),
        dir.path().to_path_buf(),
        bus,
    )
    .await
    .expect("Failed to start server");
    (server, rx)
}

pub fn drain(rx: &mut UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn url(addr: SocketAddr) -> String {
    format!("http://{}/", addr)
}

/// POST `body` over a raw connection, one write per `chunk_size` bytes.
/// Returns the full raw HTTP response.
pub async fn post_in_chunks(addr: SocketAddr, body: &[u8], chunk_size: usize) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        addr,
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    for chunk in body.chunks(chunk_size) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
    }

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}
