#![allow(dead_code)]
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;

use sluice::config::Config;
use sluice::dns::DNS_MESSAGE_CONTENT_TYPE;

pub const ANSWER_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// UDP upstream on loopback that counts what it receives and optionally
/// answers every query with one A record.
pub struct MockUpstream {
    addr: SocketAddr,
    received: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockUpstream {
    pub async fn answering(ttl: u32) -> Self {
        Self::start(Some(ttl)).await
    }

    pub async fn silent() -> Self {
        Self::start(None).await
    }

    async fn start(ttl: Option<u32>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, peer)) = result else { continue };
                        counter.fetch_add(1, Ordering::SeqCst);
                        let Some(ttl) = ttl else { continue };
                        if let Some(response) = answer(&buf[..len], ttl) {
                            let _ = socket.send_to(&response, peer).await;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn answer(query: &[u8], ttl: u32) -> Option<Vec<u8>> {
    let mut message = Message::from_vec(query).ok()?;
    if message.message_type() == MessageType::Response {
        return None;
    }
    let name = message.queries().first()?.name().clone();
    message.set_message_type(MessageType::Response);
    message.add_answer(Record::from_rdata(name, ttl, RData::A(A(ANSWER_IP))));
    message.to_vec().ok()
}

/// Minimal DoH server answering every POST like [`MockUpstream::answering`].
pub async fn doh_server(ttl: u32) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let body = loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                        continue;
                    };
                    let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                    let len: usize = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break buf[end + 4..end + 4 + len].to_vec();
                    }
                };
                let Some(payload) = answer(&body, ttl) else {
                    return;
                };
                let mut response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: {DNS_MESSAGE_CONTENT_TYPE}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    payload.len()
                )
                .into_bytes();
                response.extend_from_slice(&payload);
                let _ = stream.write_all(&response).await;
            });
        }
    });

    host
}

pub fn query(id: u16, domain: &str) -> Message {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
    message
}

/// Send `message` to the resolver and wait for the reply.
pub async fn exchange(resolver: SocketAddr, message: &Message) -> Option<Message> {
    exchange_raw(resolver, &message.to_vec().unwrap())
        .await
        .map(|bytes| Message::from_vec(&bytes).unwrap())
}

pub async fn exchange_raw(resolver: SocketAddr, bytes: &[u8]) -> Option<Vec<u8>> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(bytes, resolver).await.unwrap();

    let mut buf = [0u8; 4096];
    match tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

/// Loopback config on an ephemeral port.
pub fn config(args: &[&str]) -> Config {
    let base = ["sluice", "--bind", "127.0.0.1", "--port", "0"];
    Config::try_parse_from(base.iter().chain(args.iter()).copied()).unwrap()
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
