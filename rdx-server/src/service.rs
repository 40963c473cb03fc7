//! rdx server service core logic.
//!
//! Accepts viewer connections and runs one [`ServerSession`] per viewer,
//! fed by its own synthetic capture source.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rdx_core::capture::CaptureSource;
use rdx_core::codecs::CodecRegistry;
use rdx_core::error::RdxError;
use rdx_core::session::ServerSession;

use crate::config::ServerConfig;
use crate::pattern::TestPattern;

/// Capture events buffered between the pattern and a session.
const EVENT_QUEUE: usize = 256;

// ── RdxServerService ─────────────────────────────────────────────

/// The top-level server service.
///
/// Owns the TCP listener and the viewer sessions spawned from it.
pub struct RdxServerService {
    config: ServerConfig,
    running: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
}

impl RdxServerService {
    /// Create a new server service with the given config.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            viewers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Number of viewers currently connected.
    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = self.config.network.listen.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("rdx server listening on {addr}");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept viewers on `listener` until stopped.
    pub async fn serve(&self, listener: TcpListener) {
        self.running.store(true, Ordering::SeqCst);
        let max_viewers = self.config.network.max_viewers.max(1) as usize;

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            if self.viewers.load(Ordering::SeqCst) >= max_viewers {
                warn!("rejecting viewer {peer}: {max_viewers} already connected");
                drop(stream);
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                warn!("set_nodelay on {peer}: {e}");
            }

            info!("viewer connected from {peer}");
            self.viewers.fetch_add(1, Ordering::SeqCst);
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            let viewers = Arc::clone(&self.viewers);
            tokio::spawn(async move {
                match serve_viewer(stream, &config, running).await {
                    Ok(()) | Err(RdxError::TransportDisconnected) => {
                        info!("session with {peer} ended");
                    }
                    Err(e) => error!("session with {peer} failed: {e}"),
                }
                viewers.fetch_sub(1, Ordering::SeqCst);
            });
        }

        self.running.store(false, Ordering::SeqCst);
        info!("rdx server service stopped");
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

/// Run one viewer session to completion.
async fn serve_viewer(stream: TcpStream, config: &ServerConfig, service_running: Arc<AtomicBool>) -> Result<(), RdxError> {
    let pattern = TestPattern::new(config.test_pattern.clone())?;
    let capture: Arc<dyn CaptureSource> = pattern.capture();
    let mut session = ServerSession::new(
        config.to_session_config(),
        CodecRegistry::with_builtins(),
        config.to_policy(),
    )?;

    let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
    let animating = Arc::new(AtomicBool::new(true));
    let animator = tokio::spawn(pattern.animate(events_tx, Arc::clone(&animating)));

    // Service stop tears the session down too.
    let session_running = session.stop_handle();
    let stopper = tokio::spawn(async move {
        RdxServerService::wait_for_stop(&service_running).await;
        session_running.store(false, Ordering::SeqCst);
    });

    let result = session.run(stream, capture, events).await;

    stopper.abort();
    animating.store(false, Ordering::SeqCst);
    match animator.await {
        Ok(Err(e)) => warn!("test pattern stopped: {e}"),
        Err(e) => warn!("test pattern task: {e}"),
        Ok(Ok(())) => {}
    }

    let stats = session.stats();
    info!(
        updates = stats.updates_sent,
        bytes = stats.update_bytes,
        fallbacks = stats.fallbacks,
        dropped = stats.dropped,
        "session summary"
    );
    result
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rdx_core::viewer::{ViewerConfig, ViewerSession};
    use tokio::io::AsyncReadExt;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.network.listen = "127.0.0.1:0".into();
        config.network.max_viewers = 1;
        config.test_pattern.width = 160;
        config.test_pattern.height = 120;
        config
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = RdxServerService::new(ServerConfig::default());
        assert!(!svc.is_running());
        assert_eq!(svc.viewer_count(), 0);
    }

    #[test]
    fn stop_handle_works() {
        let svc = RdxServerService::new(ServerConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn viewer_receives_updates_and_extra_viewers_are_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let svc = RdxServerService::new(test_config());
        let stop = svc.stop_handle();
        let server = tokio::spawn(async move { svc.serve(listener).await });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut viewer = ViewerSession::new(ViewerConfig::default());
        let viewer_stop = viewer.stop_handle();
        let (updates_tx, mut updates) = mpsc::channel(64);
        let (_overrides_tx, overrides) = mpsc::channel(4);
        let viewer_task = tokio::spawn(async move { viewer.run(stream, updates_tx, overrides).await });

        let update = tokio::time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .expect("no update within timeout")
            .expect("viewer ended");
        assert!(update.window_id == 1 || update.window_id == 2);
        assert_eq!((update.window_width, update.window_height), (160, 120));

        // The only slot is taken: a second viewer is closed straight away.
        let mut extra = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), extra.read_to_end(&mut buf))
            .await
            .expect("extra viewer was not closed");
        assert!(buf.is_empty());

        stop.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("service did not stop")
            .unwrap();
        viewer_stop.store(false, Ordering::SeqCst);
        let _ = tokio::time::timeout(Duration::from_secs(5), viewer_task).await;
    }
}
