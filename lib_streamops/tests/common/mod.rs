//! Shared fixtures: a scripted WebSocket server, a canned-response HTTP
//! server and event helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpListener as StdTcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_streamops::core::Subscription;
use lib_streamops::realtime::{ReconnectPolicy, SyncEvent};
use lib_streamops::retrieve::{ApiClient, StreamOpsApi};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accepts WebSocket connections and hands each one to the test.
pub struct MockWsServer {
    pub url: Url,
    connections: mpsc::UnboundedReceiver<ServerSocket>,
}

impl MockWsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            url: Url::parse(&format!("ws://{}/ws", addr)).unwrap(),
            connections: rx,
        }
    }

    pub async fn accept(&mut self) -> ServerSocket {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("server stopped")
    }

    /// `None` when no client connects within `window`.
    pub async fn accept_within(&mut self, window: Duration) -> Option<ServerSocket> {
        tokio::time::timeout(window, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Next text frame from the client, decoded as JSON.
pub async fn next_json(ws: &mut ServerSocket) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no frame in time")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

pub async fn send_text(ws: &mut ServerSocket, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

pub async fn send_json(ws: &mut ServerSocket, value: Value) {
    send_text(ws, &value.to_string()).await;
}

/// Waits for the first event matching `pred`, skipping others.
pub async fn wait_for<F>(events: &mut Subscription<SyncEvent>, pred: F) -> Arc<SyncEvent>
where
    F: Fn(&SyncEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("dispatcher dropped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

pub fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        growth_factor: 1.5,
        max_delay: Duration::from_millis(100),
        max_attempts,
    }
}

/// A ws:// URL on which nothing listens.
pub fn refused_url() -> Url {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("ws://{}/ws", addr)).unwrap()
}

pub fn api(base: &Url) -> StreamOpsApi {
    StreamOpsApi::new(ApiClient::with_max_retries(base.clone(), None, Duration::from_secs(5), 0).unwrap())
}

struct Route {
    method: String,
    path: String,
    /// Served in order; the last one repeats.
    responses: VecDeque<(u16, String)>,
}

/// Thread-based HTTP/1.1 server answering canned JSON per route.
pub struct MockHttpServer {
    pub base_url: Url,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockHttpServer {
    /// `routes` are `(method, path, [(status, body), ...])`.
    pub fn start(routes: Vec<(&str, &str, Vec<(u16, &str)>)>) -> Self {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let mut routes: Vec<Route> = routes
            .into_iter()
            .map(|(method, path, responses)| Route {
                method: method.to_string(),
                path: path.to_string(),
                responses: responses
                    .into_iter()
                    .map(|(status, body)| (status, body.to_string()))
                    .collect(),
            })
            .collect();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let Some((method, path)) = read_request(&mut stream) else {
                    continue;
                };
                log.lock().unwrap().push(format!("{} {}", method, path));

                let (status, body) = routes
                    .iter_mut()
                    .find(|r| r.method == method && r.path == path)
                    .map(|r| {
                        if r.responses.len() > 1 {
                            r.responses.pop_front().unwrap()
                        } else {
                            r.responses.front().cloned().unwrap()
                        }
                    })
                    .unwrap_or((404, r#"{"detail":"Not Found"}"#.to_string()));

                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        Self {
            base_url: Url::parse(&format!("http://{}/api/", addr)).unwrap(),
            requests,
        }
    }

    /// `"METHOD /path"` of every request so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, request: &str) -> usize {
        self.requests().iter().filter(|r| r.as_str() == request).count()
    }
}

/// Reads one request and returns its method and path without the query.
fn read_request(stream: &mut std::net::TcpStream) -> Option<(String, String)> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }

    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;
    let path = target.split('?').next().unwrap_or(target).to_string();
    Some((method, path))
}
