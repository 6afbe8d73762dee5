//! Non-blocking network operations for the guest.
//!
//! Every operation is a background task on the host runtime. It is counted
//! as active from before it is spawned until after its result has been
//! queued (the decrement sits in a scope guard, so it also happens when the
//! task fails or is aborted). Results go to the [`CallbackQueue`] as
//! completions; the guest closure only runs when the dispatcher gets to it.
//!
//! ## Reads
//!
//! "Nothing buffered yet" (`WouldBlock`, read timeout) is reported as
//! [`CallbackResult::NoData`] and leaves the connection alone. Only EOF and
//! genuine socket errors remove a connection from the live set.
//!
//! ## Closing
//!
//! Every handle carries a close signal. Closing a handle fires it, so an
//! accept, read or write still pending on that handle completes with a
//! "handle closed" failure instead of keeping its operation counted forever.

use crate::callback::{CallbackData, CallbackQueue, CallbackResult, PendingCallback};
use crate::config::NetworkConfig;
use crate::error::{NetError, RuntimeResult, is_transient};
use crate::tasks::BackgroundTasks;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Options for `http_request`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: String::new(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// Fired once when a handle is closed.
struct CloseSignal(watch::Sender<bool>);

impl CloseSignal {
    fn new() -> Self {
        Self(watch::channel(false).0)
    }

    fn close(&self) {
        self.0.send_replace(true);
    }

    /// Resolves once the handle is closed, immediately if it already is.
    async fn closed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

struct StreamConnection {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
    closed: CloseSignal,
}

struct ListenerHandle {
    socket: TcpListener,
    closed: CloseSignal,
}

struct DatagramHandle {
    socket: UdpSocket,
    closed: CloseSignal,
}

#[derive(Default)]
struct NetHandles {
    streams: HashMap<u64, Arc<StreamConnection>>,
    listeners: HashMap<u64, Arc<ListenerHandle>>,
    datagrams: HashMap<u64, Arc<DatagramHandle>>,
}

struct NetInner {
    queue: Arc<CallbackQueue>,
    tasks: Arc<BackgroundTasks>,
    handles: Mutex<NetHandles>,
    active_ops: AtomicUsize,
    next_handle_id: AtomicU64,
    http: reqwest::Client,
    config: NetworkConfig,
}

impl NetInner {
    fn next_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::Relaxed)
    }

    fn stream(&self, id: u64) -> Result<Arc<StreamConnection>, NetError> {
        self.handles
            .lock()
            .streams
            .get(&id)
            .cloned()
            .ok_or(NetError::UnknownHandle(id))
    }

    fn listener(&self, id: u64) -> Result<Arc<ListenerHandle>, NetError> {
        self.handles
            .lock()
            .listeners
            .get(&id)
            .cloned()
            .ok_or(NetError::UnknownHandle(id))
    }

    fn datagram(&self, id: u64) -> Result<Arc<DatagramHandle>, NetError> {
        self.handles
            .lock()
            .datagrams
            .get(&id)
            .cloned()
            .ok_or(NetError::UnknownHandle(id))
    }

    fn register_stream(&self, stream: TcpStream) -> Result<(u64, SocketAddr), NetError> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let id = self.next_id();
        self.handles.lock().streams.insert(
            id,
            Arc::new(StreamConnection {
                reader: tokio::sync::Mutex::new(reader),
                writer: tokio::sync::Mutex::new(writer),
                peer,
                closed: CloseSignal::new(),
            }),
        );
        debug!(conn = id, %peer, "Connection opened");
        Ok((id, peer))
    }

    fn remove_stream(&self, id: u64) -> bool {
        let removed = self.handles.lock().streams.remove(&id);
        if let Some(conn) = &removed {
            conn.closed.close();
            debug!(conn = id, peer = %conn.peer, "Connection removed");
        }
        removed.is_some()
    }

    fn remove_listener(&self, id: u64) -> bool {
        let removed = self.handles.lock().listeners.remove(&id);
        if let Some(listener) = &removed {
            listener.closed.close();
            debug!(listener = id, "Listener closed");
        }
        removed.is_some()
    }

    fn remove_datagram(&self, id: u64) -> bool {
        let removed = self.handles.lock().datagrams.remove(&id);
        if let Some(socket) = &removed {
            socket.closed.close();
            debug!(socket = id, "Datagram socket closed");
        }
        removed.is_some()
    }
}

/// Counts and runs guest network operations.
///
/// Cheap to clone; all clones share the same handle tables and counters.
#[derive(Clone)]
pub struct NetworkCoordinator {
    inner: Arc<NetInner>,
}

impl NetworkCoordinator {
    pub fn new(
        queue: Arc<CallbackQueue>,
        tasks: Arc<BackgroundTasks>,
        config: NetworkConfig,
    ) -> RuntimeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(NetError::Http)?;

        Ok(Self {
            inner: Arc::new(NetInner {
                queue,
                tasks,
                handles: Mutex::new(NetHandles::default()),
                active_ops: AtomicUsize::new(0),
                next_handle_id: AtomicU64::new(1),
                http,
                config,
            }),
        })
    }

    /// Run `fut` as a counted background operation whose result is queued
    /// for completion `completion`.
    fn spawn_operation<F, Fut>(&self, op: &'static str, completion: u64, make: F)
    where
        F: FnOnce(Arc<NetInner>) -> Fut,
        Fut: Future<Output = Result<CallbackResult, NetError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let fut = make(inner.clone());
        inner.active_ops.fetch_add(1, Ordering::SeqCst);
        trace!(op, completion, "Network operation started");

        self.inner.tasks.spawn(async move {
            let active = scopeguard::guard(inner, |inner| {
                inner.active_ops.fetch_sub(1, Ordering::SeqCst);
            });

            let result = match fut.await {
                Ok(result) => result,
                Err(e) => {
                    if e.is_connection_loss() {
                        debug!(op, error = %e, "Network operation lost its connection");
                    } else {
                        warn!(op, error = %e, "Network operation failed");
                    }
                    CallbackResult::Failure(e.to_string())
                }
            };

            active
                .queue
                .enqueue(PendingCallback::completion(completion, result));
        });
    }

    /// Open a TCP connection. Completes with the connection id.
    pub fn tcp_connect(&self, host: String, port: u16, completion: u64) {
        self.spawn_operation("tcp_connect", completion, move |inner| async move {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(NetError::Io)?;
            let (id, _) = inner.register_stream(stream)?;
            Ok(CallbackResult::Success(CallbackData::Json(json!(id))))
        });
    }

    /// Bind a TCP listener. Completes with `{ listener, addr }`.
    pub fn tcp_listen(&self, host: String, port: u16, completion: u64) {
        self.spawn_operation("tcp_listen", completion, move |inner| async move {
            let listener = TcpListener::bind((host.as_str(), port)).await?;
            let addr = listener.local_addr()?;
            let id = inner.next_id();
            inner.handles.lock().listeners.insert(
                id,
                Arc::new(ListenerHandle {
                    socket: listener,
                    closed: CloseSignal::new(),
                }),
            );
            debug!(listener = id, %addr, "Listener opened");
            Ok(CallbackResult::Success(CallbackData::Json(
                json!({ "listener": id, "addr": addr.to_string() }),
            )))
        });
    }

    /// Accept one connection. Completes with `{ conn, peer }`.
    pub fn tcp_accept(&self, listener: u64, completion: u64) {
        self.spawn_operation("tcp_accept", completion, move |inner| async move {
            let handle = inner.listener(listener)?;
            let (stream, _) = tokio::select! {
                accepted = handle.socket.accept() => accepted?,
                () = handle.closed.closed() => return Err(NetError::Closed(listener)),
            };
            let (id, peer) = inner.register_stream(stream)?;
            Ok(CallbackResult::Success(CallbackData::Json(
                json!({ "conn": id, "peer": peer.to_string() }),
            )))
        });
    }

    /// Read up to `max_bytes`. Completes with the bytes, or `NoData` when
    /// nothing arrived within the configured read timeout.
    pub fn tcp_read(&self, conn: u64, max_bytes: Option<usize>, completion: u64) {
        let max = self.read_limit(max_bytes);
        self.spawn_operation("tcp_read", completion, move |inner| async move {
            let connection = inner.stream(conn)?;
            let mut buf = vec![0u8; max];
            let timeout = inner.config.read_timeout();

            let read = tokio::select! {
                read = read_once(&connection, &mut buf, timeout) => read,
                () = connection.closed.closed() => return Err(NetError::Closed(conn)),
            };

            match read {
                Ok(0) => {
                    inner.remove_stream(conn);
                    Err(NetError::Connection(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(n) => {
                    buf.truncate(n);
                    Ok(CallbackResult::Success(CallbackData::Bytes(buf)))
                }
                Err(e) if is_transient(&e) => {
                    trace!(conn, "No data available");
                    Ok(CallbackResult::NoData)
                }
                Err(e) => {
                    inner.remove_stream(conn);
                    Err(NetError::Connection(e))
                }
            }
        });
    }

    /// Write all of `data`. Completes with the number of bytes written.
    pub fn tcp_write(&self, conn: u64, data: Vec<u8>, completion: u64) {
        self.spawn_operation("tcp_write", completion, move |inner| async move {
            let connection = inner.stream(conn)?;
            let written = tokio::select! {
                written = async {
                    let mut writer = connection.writer.lock().await;
                    writer.write_all(&data).await
                } => written,
                () = connection.closed.closed() => return Err(NetError::Closed(conn)),
            };
            match written {
                Ok(()) => Ok(CallbackResult::Success(CallbackData::Json(json!(data.len())))),
                Err(e) if is_transient(&e) => Err(NetError::Io(e)),
                Err(e) => {
                    inner.remove_stream(conn);
                    Err(NetError::Connection(e))
                }
            }
        });
    }

    /// Close a connection. False if it was not open.
    pub fn tcp_close(&self, conn: u64) -> bool {
        self.inner.remove_stream(conn)
    }

    /// Close a listener. False if it was not open.
    pub fn tcp_close_listener(&self, listener: u64) -> bool {
        self.inner.remove_listener(listener)
    }

    /// Bind a UDP socket. Completes with `{ socket, addr }`.
    pub fn udp_bind(&self, host: String, port: u16, completion: u64) {
        self.spawn_operation("udp_bind", completion, move |inner| async move {
            let socket = UdpSocket::bind((host.as_str(), port)).await?;
            let addr = socket.local_addr()?;
            let id = inner.next_id();
            inner.handles.lock().datagrams.insert(
                id,
                Arc::new(DatagramHandle {
                    socket,
                    closed: CloseSignal::new(),
                }),
            );
            debug!(socket = id, %addr, "Datagram socket opened");
            Ok(CallbackResult::Success(CallbackData::Json(
                json!({ "socket": id, "addr": addr.to_string() }),
            )))
        });
    }

    /// Send one datagram. Completes with the number of bytes sent.
    pub fn udp_send(&self, socket: u64, host: String, port: u16, data: Vec<u8>, completion: u64) {
        self.spawn_operation("udp_send", completion, move |inner| async move {
            let udp = inner.datagram(socket)?;
            let sent = tokio::select! {
                sent = udp.socket.send_to(&data, (host.as_str(), port)) => sent?,
                () = udp.closed.closed() => return Err(NetError::Closed(socket)),
            };
            Ok(CallbackResult::Success(CallbackData::Json(json!(sent))))
        });
    }

    /// Receive one datagram. Completes with `{ data, peer }` or `NoData`.
    ///
    /// Datagram sockets have no connection to lose, so every failure leaves
    /// the socket open.
    pub fn udp_recv(&self, socket: u64, max_bytes: Option<usize>, completion: u64) {
        let max = self.read_limit(max_bytes);
        self.spawn_operation("udp_recv", completion, move |inner| async move {
            let udp = inner.datagram(socket)?;
            let mut buf = vec![0u8; max];
            let timeout = inner.config.read_timeout();

            let received = if timeout.is_zero() {
                udp.socket.try_recv_from(&mut buf)
            } else {
                tokio::select! {
                    received = tokio::time::timeout(timeout, udp.socket.recv_from(&mut buf)) => {
                        received.unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))
                    }
                    () = udp.closed.closed() => return Err(NetError::Closed(socket)),
                }
            };

            match received {
                Ok((n, peer)) => {
                    buf.truncate(n);
                    Ok(CallbackResult::Success(CallbackData::Json(json!({
                        "data": String::from_utf8_lossy(&buf),
                        "peer": peer.to_string(),
                    }))))
                }
                Err(e) if is_transient(&e) => Ok(CallbackResult::NoData),
                Err(e) => Err(NetError::Io(e)),
            }
        });
    }

    /// Close a datagram socket. False if it was not open.
    pub fn udp_close(&self, socket: u64) -> bool {
        self.inner.remove_datagram(socket)
    }

    /// Perform an HTTP request. Completes with `{ status, headers, body }`.
    pub fn http_request(&self, request: HttpRequest, completion: u64) {
        self.spawn_operation("http_request", completion, move |inner| async move {
            let value = execute_http(&inner.http, request).await?;
            Ok(CallbackResult::Success(CallbackData::Json(value)))
        });
    }

    fn read_limit(&self, requested: Option<usize>) -> usize {
        let limit = self.inner.config.max_read_bytes.max(1);
        requested.unwrap_or(limit).clamp(1, limit)
    }

    /// Operations spawned and not yet completed
    pub fn active_operations(&self) -> usize {
        self.inner.active_ops.load(Ordering::SeqCst)
    }

    /// Open TCP connections plus open datagram sockets
    pub fn open_connections(&self) -> usize {
        let handles = self.inner.handles.lock();
        handles.streams.len() + handles.datagrams.len()
    }

    pub fn open_listeners(&self) -> usize {
        self.inner.handles.lock().listeners.len()
    }

    /// Any in-flight operation, open connection or open listener.
    pub fn has_active_operations(&self) -> bool {
        self.active_operations() > 0 || self.open_connections() > 0 || self.open_listeners() > 0
    }

    /// Close every connection, listener and socket, ending any operation
    /// pending on them. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let NetHandles {
            streams,
            listeners,
            datagrams,
        } = std::mem::take(&mut *self.inner.handles.lock());

        let closed = streams.len() + listeners.len() + datagrams.len();
        streams.values().for_each(|conn| conn.closed.close());
        listeners.values().for_each(|listener| listener.closed.close());
        datagrams.values().for_each(|socket| socket.closed.close());
        closed
    }
}

/// One read attempt: non-blocking when `timeout` is zero.
async fn read_once(
    connection: &StreamConnection,
    buf: &mut [u8],
    timeout: std::time::Duration,
) -> io::Result<usize> {
    let mut reader = connection.reader.lock().await;
    if timeout.is_zero() {
        reader.try_read(buf)
    } else {
        match tokio::time::timeout(timeout, reader.read(buf)).await {
            Ok(read) => read,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }
}

async fn execute_http(
    client: &reqwest::Client,
    request: HttpRequest,
) -> Result<serde_json::Value, NetError> {
    let method = reqwest::Method::from_str(&request.method.to_uppercase())
        .map_err(|_| NetError::Unsupported(format!("HTTP method {}", request.method)))?;

    let mut builder = client.request(method, &request.url);

    if !request.headers.is_empty() {
        let mut header_map = HeaderMap::new();
        for (key, value) in &request.headers {
            let name = HeaderName::from_str(key)
                .map_err(|_| NetError::Unsupported(format!("header name {key}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| NetError::Unsupported(format!("header value for {key}")))?;
            header_map.insert(name, value);
        }
        builder = builder.headers(header_map);
    }

    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();

    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), v.to_string());
        }
    }

    let body = response.text().await?;

    Ok(json!({
        "status": status,
        "headers": headers,
        "body": body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackTarget;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn coordinator(config: NetworkConfig) -> (NetworkCoordinator, Arc<CallbackQueue>) {
        let queue = Arc::new(CallbackQueue::new());
        let tasks = Arc::new(BackgroundTasks::new(Handle::current()));
        let net = NetworkCoordinator::new(queue.clone(), tasks, config).unwrap();
        (net, queue)
    }

    async fn next_completion(queue: &CallbackQueue) -> PendingCallback {
        for _ in 0..400 {
            let mut batch = queue.drain();
            if !batch.is_empty() {
                return batch.remove(0);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no completion arrived");
    }

    async fn wait_idle(net: &NetworkCoordinator) {
        for _ in 0..400 {
            if net.active_operations() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operations never settled");
    }

    async fn connect(
        net: &NetworkCoordinator,
        queue: &CallbackQueue,
        addr: SocketAddr,
    ) -> u64 {
        net.tcp_connect(addr.ip().to_string(), addr.port(), 1);
        let done = next_completion(queue).await;
        match done.result {
            Some(CallbackResult::Success(CallbackData::Json(id))) => id.as_u64().unwrap(),
            other => panic!("unexpected connect result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_counts_connection() {
        let (net, queue) = coordinator(NetworkConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = connect(&net, &queue, addr).await;
        wait_idle(&net).await;

        assert_eq!(net.open_connections(), 1);
        assert!(net.has_active_operations());
        assert!(net.tcp_close(conn));
        assert!(!net.tcp_close(conn));
        assert!(!net.has_active_operations());
    }

    #[tokio::test]
    async fn test_read_without_data_keeps_connection() {
        let (net, queue) = coordinator(NetworkConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = connect(&net, &queue, addr).await;
        let (_peer, _) = listener.accept().await.unwrap();

        net.tcp_read(conn, None, 2);
        let done = next_completion(&queue).await;
        wait_idle(&net).await;

        assert_eq!(done, PendingCallback::completion(2, CallbackResult::NoData));
        assert_eq!(net.open_connections(), 1);
        assert_eq!(net.active_operations(), 0);
        assert!(net.has_active_operations());
    }

    #[tokio::test]
    async fn test_read_with_timeout_gets_data() {
        let config = NetworkConfig {
            read_timeout_ms: 1_000,
            ..NetworkConfig::default()
        };
        let (net, queue) = coordinator(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = connect(&net, &queue, addr).await;
        let (mut peer, _) = listener.accept().await.unwrap();

        net.tcp_read(conn, Some(16), 3);
        peer.write_all(b"hello").await.unwrap();

        let done = next_completion(&queue).await;
        assert_eq!(
            done.result,
            Some(CallbackResult::Success(CallbackData::Bytes(b"hello".to_vec())))
        );
    }

    #[tokio::test]
    async fn test_peer_close_removes_connection() {
        let config = NetworkConfig {
            read_timeout_ms: 1_000,
            ..NetworkConfig::default()
        };
        let (net, queue) = coordinator(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = connect(&net, &queue, addr).await;
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        net.tcp_read(conn, None, 4);
        let done = next_completion(&queue).await;
        wait_idle(&net).await;

        assert!(matches!(done.result, Some(CallbackResult::Failure(_))));
        assert_eq!(net.open_connections(), 0);
        assert!(!net.has_active_operations());
    }

    #[tokio::test]
    async fn test_write_then_peer_reads() {
        let (net, queue) = coordinator(NetworkConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = connect(&net, &queue, addr).await;
        let (mut peer, _) = listener.accept().await.unwrap();

        net.tcp_write(conn, b"ping".to_vec(), 5);
        let done = next_completion(&queue).await;
        assert_eq!(
            done.result,
            Some(CallbackResult::Success(CallbackData::Json(json!(4))))
        );

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unknown_handle_fails_without_side_effects() {
        let (net, queue) = coordinator(NetworkConfig::default());
        net.tcp_read(42, None, 6);

        let done = next_completion(&queue).await;
        wait_idle(&net).await;

        assert_eq!(
            done.result,
            Some(CallbackResult::Failure("Unknown network handle 42".to_string()))
        );
        assert!(!net.has_active_operations());
    }

    #[tokio::test]
    async fn test_listen_accept_and_close_all() {
        let (net, queue) = coordinator(NetworkConfig::default());
        net.tcp_listen("127.0.0.1".to_string(), 0, 7);
        let done = next_completion(&queue).await;
        let Some(CallbackResult::Success(CallbackData::Json(info))) = done.result else {
            panic!("listen failed");
        };
        let listener = info["listener"].as_u64().unwrap();
        let addr: SocketAddr = info["addr"].as_str().unwrap().parse().unwrap();
        assert_eq!(net.open_listeners(), 1);

        net.tcp_accept(listener, 8);
        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = next_completion(&queue).await;
        assert!(matches!(
            accepted.result,
            Some(CallbackResult::Success(CallbackData::Json(_)))
        ));
        wait_idle(&net).await;

        assert_eq!(net.open_connections(), 1);
        assert_eq!(net.close_all(), 2);
        assert!(!net.has_active_operations());
    }

    #[tokio::test]
    async fn test_close_listener_ends_pending_accept() {
        let (net, queue) = coordinator(NetworkConfig::default());
        net.tcp_listen("127.0.0.1".to_string(), 0, 7);
        let done = next_completion(&queue).await;
        let Some(CallbackResult::Success(CallbackData::Json(info))) = done.result else {
            panic!("listen failed");
        };
        let listener = info["listener"].as_u64().unwrap();

        net.tcp_accept(listener, 8);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(net.active_operations(), 1);

        assert!(net.tcp_close_listener(listener));
        let done = next_completion(&queue).await;
        assert_eq!(done.target, CallbackTarget::Completion(8));
        assert_eq!(
            done.result,
            Some(CallbackResult::Failure(format!("Network handle {listener} closed")))
        );
        wait_idle(&net).await;
        assert!(!net.has_active_operations());
    }

    #[tokio::test]
    async fn test_close_all_ends_pending_read() {
        let config = NetworkConfig {
            read_timeout_ms: 60_000,
            ..NetworkConfig::default()
        };
        let (net, queue) = coordinator(config);
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let conn = connect(&net, &queue, addr).await;
        // Peer stays open and silent, so the read can only end by closing
        let (_peer, _) = server.accept().await.unwrap();
        wait_idle(&net).await;

        net.tcp_read(conn, None, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(net.active_operations(), 1);

        assert_eq!(net.close_all(), 1);
        let done = next_completion(&queue).await;
        assert_eq!(
            done.result,
            Some(CallbackResult::Failure(format!("Network handle {conn} closed")))
        );
        wait_idle(&net).await;
        assert_eq!(net.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_udp_recv_without_data() {
        let (net, queue) = coordinator(NetworkConfig::default());
        net.udp_bind("127.0.0.1".to_string(), 0, 9);
        let done = next_completion(&queue).await;
        let Some(CallbackResult::Success(CallbackData::Json(info))) = done.result else {
            panic!("bind failed");
        };
        let socket = info["socket"].as_u64().unwrap();

        net.udp_recv(socket, None, 10);
        let done = next_completion(&queue).await;
        assert_eq!(done.result, Some(CallbackResult::NoData));
        assert_eq!(net.open_connections(), 1);
        assert!(net.udp_close(socket));
    }
}
