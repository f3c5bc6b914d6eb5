//! Stream publisher.
//!
//! A WebSocket server on a dedicated thread with its own tokio runtime keeps
//! socket I/O off the capture thread. Frames are fanned out through a
//! broadcast channel of capacity one: a viewer that falls behind skips to
//! the newest frame, and a viewer that is not connected misses frames
//! outright.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::processing::frame::ProcessedFrame;
use crate::stream::compress::encode_frame;
use crate::stream::error::{Result, StreamError};
use crate::stream::wire::{frame_message, WireFormat};

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub format: WireFormat,
    pub jpeg_quality: u8,
    pub max_width: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9001,
            format: WireFormat::Binary,
            jpeg_quality: 50,
            max_width: None,
        }
    }
}

/// Result of offering a frame to the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nobody connected; the frame was not encoded.
    NoViewers,
    Sent { bytes: usize, viewers: usize },
}

/// Capture-side handle for pushing frames. Cheap to clone.
#[derive(Clone)]
pub struct FramePublisher {
    tx: broadcast::Sender<Message>,
    format: WireFormat,
    jpeg_quality: u8,
    max_width: Option<u32>,
}

impl FramePublisher {
    /// Connected viewers.
    pub fn viewers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Encode `frame` and push it to every connected viewer.
    pub fn publish(&self, frame: &ProcessedFrame) -> Result<PublishOutcome> {
        if self.viewers() == 0 {
            return Ok(PublishOutcome::NoViewers);
        }
        let encoded = encode_frame(frame, self.jpeg_quality, self.max_width)?;
        let bytes = encoded.jpeg.len();
        match self.tx.send(frame_message(&encoded.jpeg, self.format)) {
            Ok(viewers) => Ok(PublishOutcome::Sent { bytes, viewers }),
            // Last viewer left between the check and the send.
            Err(_) => Ok(PublishOutcome::NoViewers),
        }
    }
}

/// Handle for the stream server thread.
pub struct FrameServer {
    local_addr: SocketAddr,
    publisher: FramePublisher,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FrameServer {
    /// Bind and start serving. Returns once the listener is bound.
    pub fn start(config: ServerConfig) -> Result<Self> {
        let (tx, _) = broadcast::channel::<Message>(1);
        let publisher = FramePublisher {
            tx: tx.clone(),
            format: config.format,
            jpeg_quality: config.jpeg_quality,
            max_width: config.max_width,
        };
        let addr = format!("{}:{}", config.bind, config.port);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr>>();

        let handle = std::thread::Builder::new()
            .name("stream-server".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(StreamError::Runtime(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(serve(addr, tx, shutdown_rx, ready_tx));
            })
            .map_err(|e| {
                StreamError::Runtime(format!("failed to spawn stream server thread: {e}"))
            })?;

        let local_addr = match ready_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(StreamError::Runtime("stream server exited during startup".into()));
            }
        };

        Ok(Self {
            local_addr,
            publisher,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn publisher(&self) -> FramePublisher {
        self.publisher.clone()
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("stream server stopped");
        }
    }
}

impl Drop for FrameServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    addr: String,
    tx: broadcast::Sender<Message>,
    mut shutdown: oneshot::Receiver<()>,
    ready: mpsc::Sender<Result<SocketAddr>>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(StreamError::Bind {
                addr,
                reason: e.to_string(),
            }));
            return;
        }
    };
    let local = match listener.local_addr() {
        Ok(local) => local,
        Err(e) => {
            let _ = ready.send(Err(StreamError::Socket(e.to_string())));
            return;
        }
    };
    info!(%local, "stream server listening");
    let _ = ready.send(Ok(local));

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_viewer(stream, peer, tx.clone()));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            },
        }
    }
}

async fn serve_viewer(stream: TcpStream, peer: SocketAddr, tx: broadcast::Sender<Message>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "websocket handshake failed: {e}");
            return;
        }
    };
    let mut frames = tx.subscribe();
    info!(%peer, viewers = tx.receiver_count(), "viewer connected");

    let (mut sink, mut incoming) = ws.split();
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        debug!(%peer, "send failed: {e}");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%peer, skipped, "viewer lagging; skipping to latest frame");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, "socket error: {e}");
                    break;
                }
            },
        }
    }
    drop(frames);
    let _ = sink.close().await;
    info!(%peer, viewers = tx.receiver_count(), "viewer disconnected");
}
