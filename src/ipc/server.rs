//! Local binary IPC server.
//!
//! One dedicated OS thread runs a current-thread tokio runtime with a
//! `LocalSet`: the whole socket set is serviced by a single thread, and a
//! handler awaiting the bus yields to the other connections instead of
//! blocking them. Per-connection frames are strictly FIFO; the response to
//! a frame is written before the next frame of that connection is decoded.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer_pool::BufferPool;
use crate::config::IpcConfig;
use crate::metrics::GatewayMetrics;

use super::protocol::{
    self, decode, error_response, IpcError, IpcMessage, HEADER_SIZE, MAX_FRAME_SIZE,
};

/// Fills the response for one fully-decoded request frame.
#[async_trait(?Send)]
pub trait IpcHandler {
    async fn handle(&self, request: IpcMessage) -> IpcMessage;
}

pub struct IpcServerHandle {
    shutdown: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
    socket_path: PathBuf,
}

impl IpcServerHandle {
    /// Stops the accept loop, joins the server thread and removes the
    /// socket file.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }
}

/// Binds the socket and spawns the server thread. The listener is bound
/// before returning so a bind failure is a startup error.
pub fn spawn<H, F>(
    config: IpcConfig,
    metrics: Arc<GatewayMetrics>,
    make_handler: F,
) -> std::io::Result<IpcServerHandle>
where
    H: IpcHandler + 'static,
    F: FnOnce() -> H + Send + 'static,
{
    let socket_path = config.socket_path.clone();

    // A stale socket file from a previous run would fail the bind.
    let _ = std::fs::remove_file(&socket_path);
    let listener = std::os::unix::net::UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;
    set_owner_only(&socket_path)?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let thread_path = socket_path.clone();

    let thread = std::thread::Builder::new()
        .name("ipc-server".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    warn!("ipc runtime build failed: {err}");
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                let listener = match UnixListener::from_std(listener) {
                    Ok(l) => l,
                    Err(err) => {
                        warn!("ipc listener registration failed: {err}");
                        return;
                    }
                };
                run_accept_loop(listener, config, metrics, make_handler(), shutdown_rx)
                    .await;
            });
            let _ = std::fs::remove_file(&thread_path);
        })?;

    Ok(IpcServerHandle {
        shutdown,
        thread: Some(thread),
        socket_path,
    })
}

fn set_owner_only(path: &PathBuf) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

async fn run_accept_loop<H: IpcHandler + 'static>(
    listener: UnixListener,
    config: IpcConfig,
    metrics: Arc<GatewayMetrics>,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(path = %config.socket_path.display(), "ipc server listening");
    let handler = Rc::new(handler);
    let buffers = BufferPool::new(MAX_FRAME_SIZE.min(64 * 1024), config.max_connections);
    let active = Rc::new(std::cell::Cell::new(0usize));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("ipc server stopping");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("ipc accept failed: {err}");
                        continue;
                    }
                };
                if active.get() >= config.max_connections {
                    warn!("ipc connection limit reached, rejecting client");
                    drop(stream);
                    continue;
                }
                active.set(active.get() + 1);
                let handler = handler.clone();
                let metrics = metrics.clone();
                let buffers = buffers.clone();
                let active = active.clone();
                tokio::task::spawn_local(async move {
                    handle_connection(stream, handler, metrics, buffers).await;
                    active.set(active.get() - 1);
                });
            }
        }
    }
}

async fn handle_connection<H: IpcHandler>(
    mut stream: UnixStream,
    handler: Rc<H>,
    metrics: Arc<GatewayMetrics>,
    buffers: BufferPool,
) {
    let mut recv = BytesMut::with_capacity(8 * 1024);

    loop {
        // Drain complete frames in arrival order before reading more.
        while let Some(frame_len) = protocol::peek_frame_len(&recv) {
            if frame_len < HEADER_SIZE || frame_len > MAX_FRAME_SIZE {
                debug!(frame_len, "ipc frame length out of bounds, closing");
                return;
            }
            if recv.len() < frame_len {
                break;
            }
            let frame = recv.split_to(frame_len);
            metrics.ipc_requests_total.inc();

            match decode(&frame) {
                Ok(request) => {
                    let response = handler.handle(request).await;
                    if write_message(&mut stream, &response, &buffers).await.is_err() {
                        return;
                    }
                }
                Err(err @ IpcError::InvalidVersion) => {
                    let response = error_response(err, None);
                    let _ = write_message(&mut stream, &response, &buffers).await;
                    return;
                }
                Err(err @ IpcError::InvalidType) => {
                    let response = error_response(err, None);
                    if write_message(&mut stream, &response, &buffers).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let response = error_response(err, None);
                    let _ = write_message(&mut stream, &response, &buffers).await;
                    return;
                }
            }
        }

        match stream.read_buf(&mut recv).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                debug!("ipc read error: {err}");
                return;
            }
        }
    }
}

async fn write_message(
    stream: &mut UnixStream,
    message: &IpcMessage,
    buffers: &BufferPool,
) -> Result<(), IpcError> {
    let mut scratch = buffers.acquire();
    protocol::encode_into(message, &mut scratch)?;
    stream
        .write_all(&scratch)
        .await
        .map_err(|_| IpcError::ConnectionClosed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::time::Duration;

    use super::super::protocol::MessageType;

    struct PingHandler;

    #[async_trait(?Send)]
    impl IpcHandler for PingHandler {
        async fn handle(&self, request: IpcMessage) -> IpcMessage {
            match request.message_type {
                MessageType::Ping => IpcMessage::empty(MessageType::Pong),
                _ => IpcMessage::new(MessageType::ResponseOk, request.payload),
            }
        }
    }

    fn test_config(path: PathBuf) -> IpcConfig {
        IpcConfig {
            enabled: true,
            socket_path: path,
            max_connections: 4,
            nats_enabled: false,
            request_timeout: Duration::from_secs(1),
        }
    }

    fn read_frame(stream: &mut std::os::unix::net::UnixStream) -> Vec<u8> {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut rest = vec![0u8; len - HEADER_SIZE];
        stream.read_exact(&mut rest).unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        frame
    }

    #[test]
    fn ping_pong_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.sock");
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let handle = spawn(test_config(path.clone()), metrics, || PingHandler).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        // 16-byte ping frame: 10 bytes of zero payload.
        let ping = protocol::encode(&IpcMessage::new(
            MessageType::Ping,
            Bytes::from(vec![0u8; 10]),
        ))
        .unwrap();
        assert_eq!(ping.len(), 16);
        client.write_all(&ping).unwrap();

        let reply = read_frame(&mut client);
        let decoded = decode(&reply).unwrap();
        assert_eq!(decoded.message_type, MessageType::Pong);
        assert!(decoded.payload.is_empty());
        assert_eq!(reply.len(), 6);

        handle.stop();
        assert!(!path.exists());
    }

    #[test]
    fn undersized_length_closes_the_connection_without_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.sock");
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let handle = spawn(test_config(path.clone()), metrics, || PingHandler).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        client.write_all(&[0, 0, 0, 5, 1]).unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0, "server must close without replying");

        handle.stop();
    }

    #[test]
    fn wrong_version_gets_error_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.sock");
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let handle = spawn(test_config(path.clone()), metrics, || PingHandler).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        // Valid length, bad version byte.
        client.write_all(&[0, 0, 0, 6, 2, 0xF0]).unwrap();

        let reply = read_frame(&mut client);
        let decoded = decode(&reply).unwrap();
        assert_eq!(decoded.message_type, MessageType::ResponseError);
        let body: serde_json::Value = serde_json::from_slice(&decoded.payload).unwrap();
        assert_eq!(body["error"]["code"], 1);

        // Connection is closed after the error frame.
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        handle.stop();
    }

    #[test]
    fn frames_are_answered_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.sock");
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let handle = spawn(test_config(path.clone()), metrics, || PingHandler).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        // Two task frames and a ping, pipelined in one write.
        let mut batch = Vec::new();
        for payload in [&b"one"[..], &b"two"[..]] {
            batch.extend_from_slice(
                &protocol::encode(&IpcMessage::new(
                    MessageType::TaskSubmit,
                    Bytes::copy_from_slice(payload),
                ))
                .unwrap(),
            );
        }
        batch.extend_from_slice(&protocol::encode(&IpcMessage::empty(MessageType::Ping)).unwrap());
        client.write_all(&batch).unwrap();

        let first = decode(&read_frame(&mut client)).unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        let second = decode(&read_frame(&mut client)).unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        let third = decode(&read_frame(&mut client)).unwrap();
        assert_eq!(third.message_type, MessageType::Pong);

        handle.stop();
    }
}
