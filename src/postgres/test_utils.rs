//! A scripted stand-in for a PostgreSQL server, for driving the wire code in
//! unit tests.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::PostgresConfig;

pub struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn config(&self) -> PostgresConfig {
        PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: self.listener.local_addr().unwrap().port(),
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            connect_timeout_secs: 5,
            application_name: "pg-logical-stream-test".to_string(),
        }
    }

    /// Accepts one client, reads its startup packet and lets it in without a
    /// password.
    pub async fn accept(&self) -> TcpStream {
        let (mut socket, _) = self.listener.accept().await.unwrap();

        let len = socket.read_u32().await.unwrap() as usize;
        let mut startup = vec![0; len - 4];
        socket.read_exact(&mut startup).await.unwrap();

        socket.write_all(&frame(b'R', &0i32.to_be_bytes())).await.unwrap();
        socket.write_all(&frame(b'Z', b"I")).await.unwrap();
        socket
    }
}

/// Reads one tagged frontend message.
pub async fn read_frontend(socket: &mut TcpStream) -> (u8, Vec<u8>) {
    let tag = socket.read_u8().await.unwrap();
    let len = socket.read_u32().await.unwrap() as usize;
    let mut body = vec![0; len - 4];
    socket.read_exact(&mut body).await.unwrap();
    (tag, body)
}

/// Text of a simple query body, without the trailing NUL.
pub fn query_text(body: &[u8]) -> &str {
    std::str::from_utf8(body.strip_suffix(&[0u8]).unwrap_or(body)).unwrap()
}

pub fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_u32(body.len() as u32 + 4);
    buf.put_slice(body);
    buf.to_vec()
}

/// CopyBothResponse announcing text format and no columns.
pub fn copy_both_response() -> Vec<u8> {
    frame(b'W', &[0, 0, 0])
}

pub fn keepalive(wal_end: u64, reply: bool) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'k');
    buf.put_u64(wal_end);
    buf.put_i64(0);
    buf.put_u8(u8::from(reply));
    frame(b'd', &buf)
}

pub fn xlog_data(start: u64, end: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(b'w');
    buf.put_u64(start);
    buf.put_u64(end);
    buf.put_i64(0);
    buf.put_slice(payload);
    frame(b'd', &buf)
}
