use crate::dispatch::Dispatcher;
use portia_core::protocol::{encode_frame, LineFramer, RejectedRequest, Reply};
use serde_json::Value;
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// One slot in a connection's outbound queue.
enum PendingReply {
    Ready(Reply),
    Running {
        reference_cmd: &'static str,
        reference_id: Value,
        task: JoinHandle<Reply>,
    },
}

impl PendingReply {
    fn submit(dispatcher: &Arc<Dispatcher>, line: &[u8]) -> Self {
        let request = match dispatcher.parse(line) {
            Ok(request) => request,
            Err(rejected) => return PendingReply::Ready(rejected.into_reply()),
        };
        let reference_cmd = request.command.name().as_str();
        let reference_id = request.id.clone();
        let dispatcher = dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.handle_request(request).await });
        PendingReply::Running {
            reference_cmd,
            reference_id,
            task,
        }
    }

    async fn into_reply(self, conn_id: u64) -> Reply {
        match self {
            PendingReply::Ready(reply) => reply,
            PendingReply::Running {
                reference_cmd,
                reference_id,
                task,
            } => match task.await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(event = "line_request_panicked", conn_id, cmd = reference_cmd, error = %err);
                    Reply::error(
                        Some(reference_cmd.to_string()),
                        reference_id,
                        "Internal error.".to_string(),
                    )
                }
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct LineServerConfig {
    pub write_timeout: Duration,
    /// Requests in flight per connection before the reader stops pulling lines.
    pub queue_capacity: usize,
}

impl Default for LineServerConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
        }
    }
}

pub async fn run(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: LineServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(event = "line_server_start", addr = %local_addr);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        let dispatcher = dispatcher.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, dispatcher, config).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "line_server_accept_error", error = %err);
                    }
                }
            }
        }
    }

    info!(event = "line_server_stop", addr = %local_addr);
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: LineServerConfig,
) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    debug!(event = "line_conn_open", conn_id, peer = %peer);

    let (mut read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<PendingReply>(config.queue_capacity.max(1));
    let writer_task = tokio::spawn(writer_loop(
        conn_id,
        write_half,
        rx,
        config.write_timeout,
        dispatcher.max_frame_bytes(),
    ));

    let mut framer = LineFramer::new(dispatcher.max_frame_bytes());
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    'read: loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "line_read_error", conn_id, error = %err);
                break;
            }
        };
        if n == 0 {
            if let Some(line) = framer.finish() {
                let _ = tx.send(PendingReply::submit(&dispatcher, &line)).await;
            }
            break;
        }

        for framed in framer.push_chunk(&chunk[..n]) {
            let pending = match framed {
                Ok(line) => PendingReply::submit(&dispatcher, &line),
                Err(err) => {
                    debug!(event = "line_oversized", conn_id, error = %err);
                    PendingReply::Ready(RejectedRequest::from(err).into_reply())
                }
            };
            if tx.send(pending).await.is_err() {
                break 'read;
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
    debug!(event = "line_conn_closed", conn_id);
}

/// Emits replies in request order; each request still runs on its own task.
async fn writer_loop(
    conn_id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<PendingReply>,
    write_timeout: Duration,
    max_frame_bytes: usize,
) {
    while let Some(pending) = rx.recv().await {
        let reply = pending.into_reply(conn_id).await;
        let frame = match encode_frame(&reply, max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "line_encode_error", conn_id, error = %err);
                let fallback = oversized_reply(&reply, err.to_string());
                match encode_frame(&fallback, max_frame_bytes) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                }
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "line_write_error", conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "line_write_timeout", conn_id);
                break;
            }
        }
    }
}

fn oversized_reply(reply: &Reply, message: String) -> Reply {
    match reply {
        Reply::Ok {
            reference_cmd,
            reference_id,
            ..
        } => Reply::error(Some(reference_cmd.clone()), reference_id.clone(), message),
        Reply::Error {
            reference_cmd,
            reference_id,
            ..
        } => Reply::error(reference_cmd.clone(), reference_id.clone(), message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use portia_core::protocol::DEFAULT_MAX_FRAME_BYTES;
    use portia_resolver::{PrefixTable, ResolutionEngine};
    use portia_storage::{AnnotationStore, Backend, BackendError, MemoryBackend, StoreConfig};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;

    /// Stalls on reads and panics when asked to list keys.
    struct FaultyBackend;

    #[async_trait]
    impl Backend for FaultyBackend {
        async fn set_fields(
            &self,
            _key: &str,
            _fields: Vec<(String, String)>,
        ) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("read only".to_string()))
        }

        async fn get_all_fields(
            &self,
            key: &str,
        ) -> Result<BTreeMap<String, String>, BackendError> {
            if key.ends_with("99") {
                panic!("injected failure");
            }
            std::future::pending().await
        }

        async fn get_fields(
            &self,
            _key: &str,
            _fields: &[String],
        ) -> Result<Vec<Option<String>>, BackendError> {
            std::future::pending().await
        }

        async fn delete_fields(
            &self,
            _key: &str,
            _fields: &[String],
        ) -> Result<usize, BackendError> {
            Ok(0)
        }

        async fn delete_key(&self, _key: &str) -> Result<bool, BackendError> {
            Ok(false)
        }

        async fn list_keys(&self, _prefix: &str) -> Result<BTreeSet<String>, BackendError> {
            Ok(BTreeSet::new())
        }
    }

    fn dispatcher_with(backend: Arc<dyn Backend>, backend_timeout: Duration) -> Arc<Dispatcher> {
        dispatcher_sized(backend, backend_timeout, DEFAULT_MAX_FRAME_BYTES)
    }

    fn dispatcher_sized(
        backend: Arc<dyn Backend>,
        backend_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Arc<Dispatcher> {
        let store = AnnotationStore::new(
            backend,
            StoreConfig {
                backend_timeout,
                ..StoreConfig::default()
            },
        );
        let engine = ResolutionEngine::new(store, Arc::new(PrefixTable::empty()));
        Arc::new(Dispatcher::new(engine, max_frame_bytes))
    }

    async fn launch(
        dispatcher: Arc<Dispatcher>,
    ) -> (SocketAddr, watch::Sender<bool>, JoinHandle<io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(listener, dispatcher, LineServerConfig::default(), rx));
        (addr, tx, handle)
    }

    async fn connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    async fn send_raw(writer: &mut OwnedWriteHalf, raw: &[u8]) {
        writer.write_all(raw).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn send(writer: &mut OwnedWriteHalf, value: Value) {
        let frame = encode_frame(&value, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        send_raw(writer, &frame).await;
    }

    async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> Value {
        let mut line = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
                .await
                .expect("read timeout")
                .expect("read error");
        assert!(read > 0, "unexpected EOF");
        serde_json::from_slice(&line).expect("reply json")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn annotate_then_get_round_trip() {
        let dispatcher = dispatcher_with(Arc::new(MemoryBackend::new()), Duration::from_secs(1));
        let (addr, shutdown, handle) = launch(dispatcher).await;
        let (mut reader, mut writer) = connect(addr).await;

        send(
            &mut writer,
            json!({
                "version": "0.1.0",
                "id": "7",
                "cmd": "annotate",
                "request": {"msisdn": "27123456789", "key": "X-foo", "value": "bar"}
            }),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("ok"));
        assert_eq!(reply["cmd"], json!("reply"));
        assert_eq!(reply["reference_id"], json!("7"));
        assert_eq!(reply["reference_cmd"], json!("annotate"));
        assert_eq!(reply["version"], json!("0.1.0"));
        assert_eq!(reply["response"]["X-foo"], json!("bar"));

        send(
            &mut writer,
            json!({"version": "0.1.0", "id": "8", "cmd": "get", "request": {"msisdn": "27123456789"}}),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["reference_id"], json!("8"));
        assert_eq!(reply["response"]["X-foo"], json!("bar"));
        assert!(reply["response"]["X-foo-timestamp"].is_string());

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("server result");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn protocol_errors_reply_without_closing() {
        let dispatcher = dispatcher_with(Arc::new(MemoryBackend::new()), Duration::from_secs(1));
        let (addr, shutdown, handle) = launch(dispatcher).await;
        let (mut reader, mut writer) = connect(addr).await;

        send(
            &mut writer,
            json!({"version": "0.0.1", "id": 1, "cmd": "get", "request": {"msisdn": "27123456789"}}),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(
            reply,
            json!({
                "status": "error",
                "reference_cmd": "get",
                "reference_id": 1,
                "message": "Protocol version mismatch. Expected: 0.1.0, got: 0.0.1.",
                "version": "0.1.0"
            })
        );

        send(&mut writer, json!({"version": "0.1.0", "id": 2, "cmd": "bogus"})).await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["message"], json!("Unsupported command: bogus."));
        assert_eq!(reply["reference_cmd"], json!("bogus"));

        send_raw(&mut writer, b"\r\n   \n{not json}\r\n").await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("error"));
        assert_eq!(reply["reference_cmd"], Value::Null);
        assert_eq!(reply["reference_id"], Value::Null);

        send(
            &mut writer,
            json!({"version": "0.1.0", "id": 3, "cmd": "get", "request": {"msisdn": "27123456789"}}),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("ok"));
        assert_eq!(reply["response"], json!({}));

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("server result");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipelined_replies_follow_request_order() {
        let dispatcher = dispatcher_with(Arc::new(MemoryBackend::new()), Duration::from_secs(1));
        let (addr, shutdown, handle) = launch(dispatcher).await;
        let (mut reader, mut writer) = connect(addr).await;

        let mut batch = Vec::new();
        for id in 0..5 {
            let frame = encode_frame(
                &json!({
                    "version": "0.1.0",
                    "id": id,
                    "cmd": "annotate",
                    "request": {"msisdn": "27123456789", "key": format!("X-k{id}"), "value": "v"}
                }),
                DEFAULT_MAX_FRAME_BYTES,
            )
            .expect("encode");
            batch.extend_from_slice(&frame);
            if id == 2 {
                batch.extend_from_slice(b"[1, 2, 3\n");
            }
        }
        send_raw(&mut writer, &batch).await;

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(read_reply(&mut reader).await["reference_id"].clone());
        }
        assert_eq!(
            seen,
            vec![json!(0), json!(1), json!(2), Value::Null, json!(3), json!(4)]
        );

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("server result");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_and_panicking_requests_leave_connection_usable() {
        let dispatcher = dispatcher_with(Arc::new(FaultyBackend), Duration::from_millis(50));
        let (addr, shutdown, handle) = launch(dispatcher).await;
        let (mut reader, mut writer) = connect(addr).await;

        send(
            &mut writer,
            json!({"version": "0.1.0", "id": "slow", "cmd": "get", "request": {"msisdn": "27123456789"}}),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("error"));
        assert_eq!(reply["reference_id"], json!("slow"));
        assert_eq!(
            reply["message"],
            json!("backend get_all_fields timed out after 50ms")
        );

        send(
            &mut writer,
            json!({"version": "0.1.0", "id": "boom", "cmd": "resolve", "request": {"msisdn": "27123456799"}}),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("error"));
        assert_eq!(reply["reference_id"], json!("boom"));
        assert_eq!(reply["reference_cmd"], json!("resolve"));
        assert_eq!(reply["message"], json!("Internal error."));

        send(
            &mut writer,
            json!({
                "version": "0.1.0",
                "id": "write",
                "cmd": "annotate",
                "request": {"msisdn": "27123456789", "key": "X-foo", "value": "bar"}
            }),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["reference_id"], json!("write"));
        assert_eq!(reply["message"], json!("backend unavailable: read only"));

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("server result");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlong_line_is_rejected_without_buffering() {
        let dispatcher =
            dispatcher_sized(Arc::new(MemoryBackend::new()), Duration::from_secs(1), 1_024);
        let (addr, shutdown, handle) = launch(dispatcher).await;
        let (mut reader, mut writer) = connect(addr).await;

        let mut flood = vec![b'x'; 1024 * 1024];
        flood.push(b'\n');
        send_raw(&mut writer, &flood).await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("error"));
        assert_eq!(reply["reference_cmd"], Value::Null);
        assert_eq!(reply["reference_id"], Value::Null);
        let message = reply["message"].as_str().expect("message");
        assert!(
            message.starts_with("Malformed message: buffer exceeds max size"),
            "{message}"
        );

        send(
            &mut writer,
            json!({"version": "0.1.0", "id": "after", "cmd": "get", "request": {"msisdn": "27123456789"}}),
        )
        .await;
        let reply = read_reply(&mut reader).await;
        assert_eq!(reply["status"], json!("ok"));
        assert_eq!(reply["reference_id"], json!("after"));

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("server result");
    }

    #[test]
    fn oversized_reply_keeps_reference() {
        let reply = Reply::ok("get", json!(9), json!({"k": "v"}));
        let fallback = oversized_reply(&reply, "too big".to_string());
        assert!(matches!(
            fallback,
            Reply::Error { reference_cmd: Some(ref cmd), ref reference_id, .. }
                if cmd == "get" && *reference_id == json!(9)
        ));
    }
}
