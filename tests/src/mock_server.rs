//! In-process streaming gateway
//!
//! Speaks just enough HTTP/1.1 to accept subscription POST/DELETE calls and
//! just enough server-side RFC 6455 to upgrade, push unmasked frames and
//! answer the client's close handshake.

use flume::{Receiver, Sender};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use serde_json::{Value, json};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use streamwire_client::streaming::codec::{ParsedMessage, encode};
use streamwire_client::websocket::{Frame, OpCode, accept_key};
use tracing::debug;

/// One request the server saw
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn json_body(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

enum Command {
    Push(Vec<u8>),
    Close(u16),
    Drop,
}

struct ServerState {
    requests: Mutex<Vec<RecordedRequest>>,
    upgrades: AtomicUsize,
    client_closes: AtomicUsize,
    subscribe_status: AtomicU16,
    commands: Receiver<Command>,
}

/// Mock gateway bound to an ephemeral local port
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    commands: Sender<Command>,
}

impl MockServer {
    /// Bind and start accepting on the current monoio runtime
    pub fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (commands, command_rx) = flume::unbounded();
        let state = Arc::new(ServerState {
            requests: Mutex::new(Vec::new()),
            upgrades: AtomicUsize::new(0),
            client_closes: AtomicUsize::new(0),
            subscribe_status: AtomicU16::new(201),
            commands: command_rx,
        });

        monoio::spawn(accept_loop(listener, state.clone()));
        debug!("Mock gateway listening on {}", addr);
        Ok(Self {
            addr,
            state,
            commands,
        })
    }

    pub fn rest_base_url(&self) -> String {
        format!("http://{}/openapi", self.addr)
    }

    pub fn streaming_base_url(&self) -> String {
        format!("http://{}/openapi/streamingws", self.addr)
    }

    /// Encode `message` and push it as one binary frame
    pub fn push(&self, message: &ParsedMessage) {
        let bytes = encode(message).unwrap_or_default();
        self.push_raw(bytes);
    }

    /// Push several messages packed into a single binary frame
    pub fn push_batch(&self, messages: &[ParsedMessage]) {
        let mut bytes = Vec::new();
        for message in messages {
            bytes.extend(encode(message).unwrap_or_default());
        }
        self.push_raw(bytes);
    }

    pub fn push_raw(&self, payload: Vec<u8>) {
        let _ = self.commands.send(Command::Push(payload));
    }

    /// Start a close handshake from the server side
    pub fn close_socket(&self, code: u16) {
        let _ = self.commands.send(Command::Close(code));
    }

    /// Drop the live socket without a close frame
    pub fn drop_socket(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    /// Status returned to subscription POSTs from now on
    pub fn set_subscribe_status(&self, status: u16) {
        self.state.subscribe_status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn requests_with_method(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub fn subscription_posts(&self) -> Vec<RecordedRequest> {
        self.requests_with_method("POST")
    }

    /// Number of completed WebSocket upgrades
    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    /// Number of close frames received from clients
    pub fn client_closes(&self) -> usize {
        self.state.client_closes.load(Ordering::SeqCst)
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                monoio::spawn(serve(stream, state.clone()));
            }
            Err(e) => {
                debug!("Mock gateway accept failed: {}", e);
                return;
            }
        }
    }
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) {
    let Ok(Some((head, rest))) = read_head(&mut stream).await else {
        return;
    };

    let result = if head_value(&head, "upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        serve_websocket(stream, head, rest, &state).await
    } else {
        serve_http(stream, head, rest, &state).await
    };
    if let Err(e) = result {
        debug!("Mock gateway connection ended: {}", e);
    }
}

async fn read_head(stream: &mut TcpStream) -> io::Result<Option<(String, Vec<u8>)>> {
    let mut data = Vec::new();
    loop {
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).into_owned();
            return Ok(Some((head, data[end + 4..].to_vec())));
        }
        let n = read_some(stream, &mut data).await?;
        if n == 0 {
            return Ok(None);
        }
    }
}

async fn read_some(stream: &mut TcpStream, into: &mut Vec<u8>) -> io::Result<usize> {
    let buf = Vec::with_capacity(4096);
    let (res, buf) = stream.read(buf).await;
    let n = res?;
    into.extend_from_slice(&buf[..n]);
    Ok(n)
}

async fn write(stream: &mut TcpStream, bytes: Vec<u8>) -> io::Result<()> {
    let (res, _) = stream.write_all(bytes).await;
    res.map(|_| ())
}

fn head_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn request_line(head: &str) -> (String, String) {
    let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    (method, path)
}

async fn serve_http(
    mut stream: TcpStream,
    head: String,
    mut body: Vec<u8>,
    state: &ServerState,
) -> io::Result<()> {
    let length: usize = head_value(&head, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while body.len() < length {
        if read_some(&mut stream, &mut body).await? == 0 {
            break;
        }
    }

    let (method, path) = request_line(&head);
    let body = String::from_utf8_lossy(&body).into_owned();
    let request = RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        authorization: head_value(&head, "authorization").map(str::to_string),
        body,
    };
    let response = match method.as_str() {
        "POST" => subscription_response(&request, state.subscribe_status.load(Ordering::SeqCst)),
        "DELETE" => http_response(202, "Accepted", &[], ""),
        _ => http_response(405, "Method Not Allowed", &[], ""),
    };
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(request);
    }

    write(&mut stream, response.into_bytes()).await
}

fn subscription_response(request: &RecordedRequest, status: u16) -> String {
    if status >= 300 {
        return http_response(status, "Rejected", &[], r#"{"ErrorCode":"InvalidRequest"}"#);
    }

    let body = request.json_body();
    let context_id = body["ContextId"].as_str().unwrap_or_default();
    let reference_id = body["ReferenceId"].as_str().unwrap_or_default();
    let location = format!("{}/{}/{}", request.path, context_id, reference_id);
    let payload = json!({
        "ContextId": context_id,
        "ReferenceId": reference_id,
        "State": "Active",
        "RefreshRate": body["RefreshRate"],
        "Snapshot": {"Data": []}
    });
    http_response(status, "Created", &[("Location", &location)], &payload.to_string())
}

fn http_response(status: u16, reason: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (key, value) in headers {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

async fn serve_websocket(
    mut stream: TcpStream,
    head: String,
    mut pending: Vec<u8>,
    state: &ServerState,
) -> io::Result<()> {
    let (_, path) = request_line(&head);
    let key = head_value(&head, "sec-websocket-key").unwrap_or_default();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(RecordedRequest {
            method: "GET".to_string(),
            path,
            authorization: head_value(&head, "authorization").map(str::to_string),
            body: String::new(),
        });
    }
    write(&mut stream, response.into_bytes()).await?;
    state.upgrades.fetch_add(1, Ordering::SeqCst);

    loop {
        while let Some((frame, used)) = Frame::parse(&pending).ok().flatten() {
            pending.drain(..used);
            match frame.opcode {
                OpCode::Close => {
                    state.client_closes.fetch_add(1, Ordering::SeqCst);
                    let reply = Frame::unmasked(OpCode::Close, frame.payload);
                    return write(&mut stream, reply.to_bytes()).await;
                }
                OpCode::Ping => {
                    let pong = Frame::unmasked(OpCode::Pong, frame.payload);
                    write(&mut stream, pong.to_bytes()).await?;
                }
                _ => {}
            }
        }

        let buf = Vec::with_capacity(4096);
        monoio::select! {
            command = state.commands.recv_async() => match command {
                Ok(Command::Push(payload)) => {
                    write(&mut stream, Frame::unmasked(OpCode::Binary, payload).to_bytes()).await?;
                }
                Ok(Command::Close(code)) => {
                    let close = Frame::unmasked(OpCode::Close, Frame::close_payload(code, "server closing"));
                    return write(&mut stream, close.to_bytes()).await;
                }
                Ok(Command::Drop) | Err(_) => return Ok(()),
            },
            (res, buf) = stream.read(buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(());
                }
                pending.extend_from_slice(&buf[..n]);
            }
        }
    }
}
