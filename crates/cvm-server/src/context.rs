//! Application context: owns every long-lived component and tears them down
//! in dependency order.

use crate::config::ServerConfig;
use crate::ip_data::IpRegistry;
use crate::server::Server;
use crate::transport::websocket::{self, Listener};
use crate::vm::VmRegistry;
use crate::work::{WorkQueue, Worker};
use cvm_core::{CvmError, CvmResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct AppContext {
    config: ServerConfig,
    registry: Arc<IpRegistry>,
    queue: Arc<WorkQueue>,
    worker: Option<JoinHandle<()>>,
    vms: Arc<VmRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: tokio::task::JoinHandle<()>,
    listener: Listener,
}

impl AppContext {
    /// Build every component, start the worker, sweeper and listener, then
    /// bring up autostart VMs.
    pub async fn start(config: ServerConfig) -> CvmResult<Self> {
        let registry = Arc::new(IpRegistry::new());
        let queue = Arc::new(WorkQueue::new());
        let vms = Arc::new(VmRegistry::new(&config.vms, &config.display));

        let worker = Worker::new(registry.clone(), vms.clone())
            .spawn(queue.clone())
            .map_err(|e| CvmError::Other(format!("failed to spawn worker: {e}")))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = registry
            .clone()
            .spawn_sweeper(config.ip_sweep_interval, shutdown_tx.subscribe());

        let handler = Arc::new(Server::new(queue.clone(), registry.clone()));
        let listener = match websocket::start_listener(config.listen, handler).await {
            Ok(l) => l,
            Err(e) => {
                queue.stop();
                let _ = worker.join();
                let _ = shutdown_tx.send(());
                return Err(e);
            }
        };

        vms.start_autostart();
        info!(
            addr = %listener.local_addr(),
            vms = vms.len(),
            encoding = ?config.display.encoding,
            "CollabVM relay ready"
        );

        Ok(Self {
            config,
            registry,
            queue,
            worker: Some(worker),
            vms,
            shutdown_tx,
            sweeper,
            listener,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<IpRegistry> {
        &self.registry
    }

    pub fn vms(&self) -> &Arc<VmRegistry> {
        &self.vms
    }

    /// Stop the work queue (joining the worker), then the upstream clients,
    /// then the listener and sweeper.
    pub async fn shutdown(mut self) {
        let dropped = self.queue.stop();
        if let Some(worker) = self.worker.take() {
            if tokio::task::spawn_blocking(move || worker.join()).await.is_err() {
                warn!("worker thread panicked");
            }
        }
        info!(dropped, "work queue stopped");

        let vms = self.vms.clone();
        if tokio::task::spawn_blocking(move || vms.stop_all()).await.is_err() {
            warn!("stopping VMs panicked");
        }
        info!("VMs stopped");

        self.listener.stop();
        let _ = self.shutdown_tx.send(());
        let _ = self.sweeper.await;
        info!("listener and sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile, DisplayConfig};
    use cvm_core::{cbor_decode, Message, RegionEncoding};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn test_config() -> ServerConfig {
        let mut config =
            ServerConfig::resolve(ConfigFile::default(), &CliOverrides::default()).unwrap();
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.display = DisplayConfig {
            encoding: RegionEncoding::Png,
            jpeg_quality: 75,
        };
        config
    }

    #[tokio::test]
    async fn guest_is_named_on_connect() {
        let ctx = AppContext::start(test_config()).await.unwrap();
        assert!(ctx.vms().is_empty());

        let mut req = format!("ws://{}/", ctx.local_addr())
            .into_client_request()
            .unwrap();
        req.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("cvm2"));
        let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        let msg: Message = match frame {
            Some(Ok(WsMessage::Binary(data))) => cbor_decode(&data).unwrap(),
            other => panic!("expected binary frame, got {other:?}"),
        };
        match msg {
            Message::RenameResult(p) => assert!(p.username.starts_with("guest")),
            other => panic!("expected rename_result, got {}", other.kind()),
        }

        let ip = ctx.local_addr().ip();
        assert_eq!(ctx.registry().find(ip).unwrap().connection_count, 1);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.listen = taken.local_addr().unwrap();
        assert!(AppContext::start(config).await.is_err());
    }
}
