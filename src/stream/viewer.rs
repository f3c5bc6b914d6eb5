//! Remote viewer client.
//!
//! Connects to a stream server, decodes every frame message into the display
//! slot (last write wins), and reconnects after a fixed delay whenever the
//! socket fails. Retries never stop and the delay never grows.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::camera::types::FrameSize;
use crate::stream::error::{Result, StreamError};
use crate::stream::wire::frame_payload;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ViewerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Counters for a viewer's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerStats {
    pub attempts: u64,
    pub failures: u64,
    pub frames: u64,
    pub decode_errors: u64,
}

/// A decoded frame as shown by the viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub size: FrameSize,
    pub rgba: Vec<u8>,
}

/// Decode one JPEG payload.
pub fn decode_jpeg(jpeg: &[u8]) -> Result<DisplayFrame> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| StreamError::Decode(e.to_string()))?
        .to_rgba8();
    Ok(DisplayFrame {
        size: FrameSize::new(img.width(), img.height()),
        rgba: img.into_raw(),
    })
}

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub url: String,
    pub reconnect_delay: Duration,
}

impl ViewerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Reconnecting viewer. State is observable through [`subscribe`](Self::subscribe).
pub struct RemoteViewer {
    config: ViewerConfig,
    state: watch::Sender<ViewerState>,
    stats: Mutex<ViewerStats>,
    display: ArcSwapOption<DisplayFrame>,
}

impl RemoteViewer {
    pub fn new(config: ViewerConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ViewerState::Disconnected);
        Arc::new(Self {
            config,
            state,
            stats: Mutex::new(ViewerStats::default()),
            display: ArcSwapOption::empty(),
        })
    }

    pub fn state(&self) -> ViewerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ViewerStats {
        *self.stats.lock()
    }

    /// Frame currently on display.
    pub fn display(&self) -> Option<Arc<DisplayFrame>> {
        self.display.load_full()
    }

    fn set_state(&self, next: ViewerState) {
        self.state.send_replace(next);
    }

    /// Run the reconnect loop until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.connect_once() => {}
            }
            self.set_state(ViewerState::Disconnected);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        self.set_state(ViewerState::Disconnected);
        debug!("viewer stopped");
    }

    /// One Connecting → Connected → Disconnected cycle.
    async fn connect_once(&self) {
        self.set_state(ViewerState::Connecting);
        self.stats.lock().attempts += 1;

        let ws = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.stats.lock().failures += 1;
                let err = StreamError::Socket(e.to_string());
                warn!(
                    url = %self.config.url,
                    retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                    "{err}"
                );
                return;
            }
        };
        self.set_state(ViewerState::Connected);
        info!(url = %self.config.url, "connected to stream");

        let (_sink, mut incoming) = ws.split();
        while let Some(msg) = incoming.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{}", StreamError::Socket(e.to_string()));
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            match frame_payload(&msg) {
                Ok(Some(jpeg)) => self.show(&jpeg),
                Ok(None) => {}
                Err(e) => self.drop_frame(e),
            }
        }
        self.stats.lock().failures += 1;
        info!(url = %self.config.url, "stream connection closed");
    }

    fn show(&self, jpeg: &Bytes) {
        match decode_jpeg(jpeg) {
            Ok(frame) => {
                let resized = self
                    .display
                    .load()
                    .as_ref()
                    .is_none_or(|prev| prev.size != frame.size);
                if resized {
                    info!(size = %frame.size, "display resized to frame");
                }
                self.display.store(Some(Arc::new(frame)));
                self.stats.lock().frames += 1;
            }
            Err(e) => self.drop_frame(e),
        }
    }

    fn drop_frame(&self, err: StreamError) {
        self.stats.lock().decode_errors += 1;
        warn!("dropping frame: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::frame::ProcessedFrame;
    use crate::processing::mode::ProcessingMode;
    use crate::stream::server::{FrameServer, ServerConfig};
    use crate::stream::wire::WireFormat;
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_jpeg(&[1, 2, 3]),
            Err(StreamError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn keeps_reconnecting_after_repeated_failures() {
        let viewer = RemoteViewer::new(ViewerConfig {
            url: closed_port_url().await,
            reconnect_delay: Duration::from_millis(5),
        });
        let mut states = viewer.subscribe();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(Arc::clone(&viewer).run(async {
            let _ = stop_rx.await;
        }));

        assert!(wait_until(|| viewer.stats().failures >= 5).await);
        // Still cycling: another attempt follows the fifth failure.
        let seen = viewer.stats().attempts;
        assert!(wait_until(|| viewer.stats().attempts > seen).await);
        assert!(!matches!(*states.borrow_and_update(), ViewerState::Connected));

        let stats = viewer.stats();
        assert!(stats.failures >= 5, "{stats:?}");
        assert!(stats.attempts >= 6, "{stats:?}");

        let _ = stop_tx.send(());
        task.await.unwrap();
        assert_eq!(viewer.state(), ViewerState::Disconnected);
    }

    #[tokio::test]
    async fn displays_latest_frame_and_adopts_its_size() {
        let server = FrameServer::start(ServerConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            format: WireFormat::DataUri,
            ..ServerConfig::default()
        })
        .unwrap();
        let publisher = server.publisher();
        let viewer = RemoteViewer::new(ViewerConfig {
            url: format!("ws://{}", server.local_addr()),
            reconnect_delay: Duration::from_millis(20),
        });
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(Arc::clone(&viewer).run(async {
            let _ = stop_rx.await;
        }));

        assert!(wait_until(|| publisher.viewers() == 1).await);
        assert!(wait_until(|| viewer.state() == ViewerState::Connected).await);

        for (seq, (w, h)) in [(1u64, (32u32, 16u32)), (2, (48, 24))] {
            let size = FrameSize::new(w, h);
            publisher
                .publish(&ProcessedFrame {
                    size,
                    sequence: seq,
                    mode: ProcessingMode::Raw,
                    rgba: vec![128; size.pixel_count() * 4],
                })
                .unwrap();
            assert!(wait_until(|| viewer.display().is_some_and(|d| d.size == size)).await);
        }
        assert!(viewer.stats().frames >= 2);

        let _ = stop_tx.send(());
        task.await.unwrap();
        tokio::task::spawn_blocking(move || drop(server)).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_connection_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("not a frame".into())).await.unwrap();
            ws.send(Message::Binary(Bytes::from_static(&[0, 1, 2]))).await.unwrap();
            // Hold the connection open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let viewer = RemoteViewer::new(ViewerConfig {
            url: format!("ws://{addr}"),
            reconnect_delay: Duration::from_secs(60),
        });
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(Arc::clone(&viewer).run(async {
            let _ = stop_rx.await;
        }));

        assert!(wait_until(|| viewer.stats().decode_errors == 2).await);
        assert_eq!(viewer.state(), ViewerState::Connected);
        assert_eq!(viewer.stats().failures, 0);
        assert!(viewer.display().is_none());

        let _ = stop_tx.send(());
        task.await.unwrap();
        server.abort();
    }
}
