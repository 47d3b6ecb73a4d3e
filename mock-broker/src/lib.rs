//! Minimal NATS-protocol broker for tests.
//!
//! Supports `CONNECT`, `PING`/`PONG`, `SUB`, `UNSUB` and `PUB` with exact subject matching. No
//! wildcards, queue groups or reply subjects are routed. Every client gets a single writer task,
//! so a `PONG` is only sent after every `MSG` routed to that client before the `PING`.
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
#[allow(unused)]
use tracing::{debug, error, info, trace, warn, Instrument};

const INFO: &str = concat!(
    "INFO {\"server_id\":\"mock-broker\",\"server_name\":\"mock-broker\",",
    "\"version\":\"2.10.0\",\"go\":\"mock\",\"host\":\"127.0.0.1\",\"port\":4222,",
    "\"headers\":false,\"proto\":1,\"max_payload\":67108864,\"client_id\":1}\r\n"
);

/// Serve on `addr` until the listener fails.
pub async fn run(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Mock broker listening on {}", listener.local_addr()?);
    accept_loop(listener, Arc::default()).await
}

/// Bind `addr` and serve in the background. Returns the bound address, so port `0` can be used.
pub async fn spawn(addr: SocketAddr) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = accept_loop(listener, Arc::default()).await {
            error!("Mock broker stopped: {err}");
        }
    });
    Ok(local)
}

async fn accept_loop(listener: TcpListener, routes: Arc<Routes>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let routes = routes.clone();
        tokio::spawn(async move {
            let client = routes.next_client.fetch_add(1, Ordering::Relaxed);
            debug!("Client {client} connected from {peer}");
            if let Err(err) = serve_client(stream, client, &routes).await {
                warn!("Client {client} dropped: {err}");
            }
            routes.disconnect(client);
        });
    }
}

#[derive(Default)]
struct Routes {
    next_client: AtomicU64,
    subjects: Mutex<HashMap<String, Vec<Route>>>,
}

struct Route {
    client: u64,
    sid: String,
    tx: UnboundedSender<Bytes>,
}

impl Routes {
    fn subscribe(&self, client: u64, subject: String, sid: String, tx: UnboundedSender<Bytes>) {
        if let Ok(mut subjects) = self.subjects.lock() {
            subjects
                .entry(subject)
                .or_default()
                .push(Route { client, sid, tx });
        }
    }

    fn unsubscribe(&self, client: u64, sid: &str) {
        if let Ok(mut subjects) = self.subjects.lock() {
            for routes in subjects.values_mut() {
                routes.retain(|route| !(route.client == client && route.sid == sid));
            }
            subjects.retain(|_, routes| !routes.is_empty());
        }
    }

    fn disconnect(&self, client: u64) {
        if let Ok(mut subjects) = self.subjects.lock() {
            for routes in subjects.values_mut() {
                routes.retain(|route| route.client != client);
            }
            subjects.retain(|_, routes| !routes.is_empty());
        }
    }

    fn publish(&self, subject: &str, payload: &[u8]) -> usize {
        let Ok(mut subjects) = self.subjects.lock() else {
            return 0;
        };
        let Some(routes) = subjects.get_mut(subject) else {
            return 0;
        };
        routes.retain(|route| route.tx.send(msg_frame(subject, &route.sid, payload)).is_ok());
        routes.len()
    }
}

fn msg_frame(subject: &str, sid: &str, payload: &[u8]) -> Bytes {
    let header = format!("MSG {subject} {sid} {}\r\n", payload.len());
    let mut frame = BytesMut::with_capacity(header.len() + payload.len() + 2);
    frame.put_slice(header.as_bytes());
    frame.put_slice(payload);
    frame.put_slice(b"\r\n");
    frame.freeze()
}

async fn serve_client(stream: TcpStream, client: u64, routes: &Routes) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let (tx, rx) = unbounded_channel();
    let writer = tokio::spawn(write_loop(write, rx).in_current_span());
    let _writer = AbortOnDrop(writer);

    let _ = tx.send(Bytes::from_static(INFO.as_bytes()));

    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            debug!("Client {client} disconnected");
            return Ok(());
        }

        let op = match ClientOp::parse(&line) {
            Ok(op) => op,
            Err(err) => {
                warn!("Client {client}: {err}");
                let _ = tx.send(Bytes::from(format!("-ERR '{err}'\r\n")));
                continue;
            }
        };

        match op {
            ClientOp::Connect | ClientOp::Pong => {}
            ClientOp::Ping => {
                let _ = tx.send(Bytes::from_static(b"PONG\r\n"));
            }
            ClientOp::Sub { subject, sid } => {
                trace!("Client {client} subscribed to {subject} as {sid}");
                routes.subscribe(client, subject, sid, tx.clone());
            }
            ClientOp::Unsub { sid } => routes.unsubscribe(client, &sid),
            ClientOp::Pub { subject, size } => {
                let mut payload = vec![0u8; size + 2];
                reader.read_exact(&mut payload).await?;
                if &payload[size..] != b"\r\n" {
                    let _ = tx.send(Bytes::from_static(b"-ERR 'Unterminated Payload'\r\n"));
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "payload not CRLF terminated",
                    ));
                }
                let delivered = routes.publish(&subject, &payload[..size]);
                trace!("{subject}: {size} bytes to {delivered} subscribers");
            }
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write.write_all(&frame).await {
            debug!("Write failed: {err}");
            return;
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Error, PartialEq)]
enum ProtocolError {
    #[error("Unknown Protocol Operation")]
    UnknownOperation,

    #[error("Invalid {0} Arguments")]
    Arguments(&'static str),
}

#[derive(Debug, PartialEq)]
enum ClientOp {
    Connect,
    Ping,
    Pong,
    Sub { subject: String, sid: String },
    Unsub { sid: String },
    Pub { subject: String, size: usize },
}

impl ClientOp {
    fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();

        match op.to_ascii_uppercase().as_str() {
            "CONNECT" => Ok(ClientOp::Connect),
            "PING" => Ok(ClientOp::Ping),
            "PONG" => Ok(ClientOp::Pong),
            // SUB <subject> [queue group] <sid>
            "SUB" => match args.as_slice() {
                [subject, sid] | [subject, _, sid] => Ok(ClientOp::Sub {
                    subject: subject.to_string(),
                    sid: sid.to_string(),
                }),
                _ => Err(ProtocolError::Arguments("SUB")),
            },
            // UNSUB <sid> [max_msgs]
            "UNSUB" => match args.as_slice() {
                [sid] | [sid, _] => Ok(ClientOp::Unsub {
                    sid: sid.to_string(),
                }),
                _ => Err(ProtocolError::Arguments("UNSUB")),
            },
            // PUB <subject> [reply-to] <#bytes>
            "PUB" => match args.as_slice() {
                [subject, size] | [subject, _, size] => Ok(ClientOp::Pub {
                    subject: subject.to_string(),
                    size: size.parse().map_err(|_| ProtocolError::Arguments("PUB"))?,
                }),
                _ => Err(ProtocolError::Arguments("PUB")),
            },
            _ => Err(ProtocolError::UnknownOperation),
        }
    }
}
