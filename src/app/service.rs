use super::config::{Config, ConfigError};
use super::scheduler::{CollectorScheduler, SchedulerConfig, SchedulerError};
use crate::buffer::{QueueError, QueueSet};
use crate::receiver::{OtlpGrpcReceiver, OtlpHttpState, TelemetryIngestor, otlp_routes};
use crate::reliability::{MetricsError, PipelineMetrics};
use crate::sender::{ExportError, OTLP_GRPC_OUTPUT, OtlpGrpcOutput, OutputManager};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Output error: {0}")]
    Output(#[from] ExportError),
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Service already running")]
    AlreadyRunning,
    #[error("Shutdown timeout")]
    ShutdownTimeout,
}

impl From<SchedulerError> for ServiceError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::AlreadyRunning => ServiceError::AlreadyRunning,
        }
    }
}

struct Listeners {
    grpc: Option<TcpListener>,
    http: Option<TcpListener>,
}

/// Owns the queues, receivers, scheduler and outputs, and runs them in
/// order: queues open on construction, listeners bind on `start`, and the
/// scheduler only starts once every bind succeeded.
pub struct ServiceManager {
    config: Config,
    queues: QueueSet,
    outputs: Arc<OutputManager>,
    metrics: PipelineMetrics,
    scheduler: CollectorScheduler,
    shutdown: CancellationToken,
    servers: Vec<JoinHandle<()>>,
    grpc_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    running: bool,
}

impl ServiceManager {
    /// Open both queues and register the configured output.
    pub async fn new(config: Config) -> Result<Self, ServiceError> {
        let metrics = PipelineMetrics::new()?;
        let outputs = Arc::new(OutputManager::new());

        if config.output.enabled {
            match config.output.output_type.as_str() {
                OTLP_GRPC_OUTPUT => {
                    let output = OtlpGrpcOutput::new(config.output.otlp(), metrics.clone());
                    outputs.register(Arc::new(output)).await?;
                }
                other => {
                    return Err(ConfigError::InvalidConfig(format!("Unknown output type: {other}")).into());
                }
            }
        } else {
            warn!("Output disabled, records will accumulate on disk");
        }

        Self::with_outputs(config, outputs, metrics).await
    }

    /// Build the service around an already populated output registry.
    pub async fn with_outputs(
        config: Config,
        outputs: Arc<OutputManager>,
        metrics: PipelineMetrics,
    ) -> Result<Self, ServiceError> {
        let queues = QueueSet::open(&config.buffer.path, config.buffer.roll_cycle).await?;
        let scheduler = CollectorScheduler::new(
            &queues,
            outputs.clone(),
            metrics.clone(),
            SchedulerConfig::from(&config.buffer),
        );

        info!(
            path = %config.buffer.path.display(),
            roll_cycle = %config.buffer.roll_cycle,
            outputs = ?outputs.processor_names(),
            "Service initialized"
        );

        Ok(Self {
            config,
            queues,
            outputs,
            metrics,
            scheduler,
            shutdown: CancellationToken::new(),
            servers: Vec::new(),
            grpc_addr: None,
            http_addr: None,
            running: false,
        })
    }

    /// Bind the receivers, then start the drain loops.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        if self.running {
            return Err(ServiceError::AlreadyRunning);
        }

        let listeners = self.bind().await?;
        let ingestor = TelemetryIngestor::new(self.queues.clone(), self.metrics.clone());

        if let Some(listener) = listeners.grpc {
            self.servers
                .push(spawn_grpc(listener, ingestor.clone(), self.shutdown.clone()));
        }
        if let Some(listener) = listeners.http {
            self.servers
                .push(spawn_http(listener, ingestor, self.shutdown.clone()));
        }

        self.scheduler.start()?;
        self.running = true;
        info!(
            grpc = ?self.grpc_addr,
            http = ?self.http_addr,
            "rask-telemetry-forwarder started"
        );
        Ok(())
    }

    async fn bind(&mut self) -> Result<Listeners, ServiceError> {
        let receiver = &self.config.receiver;
        if !receiver.enabled {
            warn!("Receivers disabled, only draining existing records");
            return Ok(Listeners {
                grpc: None,
                http: None,
            });
        }

        let grpc_addr = receiver.grpc_addr()?;
        let grpc = bind_listener(grpc_addr).await?;
        self.grpc_addr = Some(local_addr(&grpc, grpc_addr)?);

        let http = match receiver.http_addr()? {
            Some(addr) => {
                let listener = bind_listener(addr).await?;
                self.http_addr = Some(local_addr(&listener, addr)?);
                Some(listener)
            }
            None => None,
        };

        Ok(Listeners {
            grpc: Some(grpc),
            http,
        })
    }

    /// Stop accepting, stop draining, wait for in-flight deliveries up to
    /// the shutdown timeout, then close both queues. Every step runs even
    /// when the wait times out.
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Stopping receivers");
        self.shutdown.cancel();
        for server in self.servers.drain(..) {
            if let Err(e) = server.await {
                warn!(error = %e, "Receiver task ended abnormally");
            }
        }

        let finished = self.scheduler.stop(self.config.shutdown_timeout).await;
        self.outputs.shutdown_all().await;
        self.queues.close_all().await?;
        self.running = false;

        if finished {
            info!("Shutdown completed");
            Ok(())
        } else {
            Err(ServiceError::ShutdownTimeout)
        }
    }

    /// Token that ends the run when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn local_grpc_addr(&self) -> Option<SocketAddr> {
        self.grpc_addr
    }

    pub fn local_http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn outputs(&self) -> &Arc<OutputManager> {
        &self.outputs
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &CollectorScheduler {
        &self.scheduler
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServiceError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServiceError::Bind { addr, source })
}

fn local_addr(listener: &TcpListener, addr: SocketAddr) -> Result<SocketAddr, ServiceError> {
    listener
        .local_addr()
        .map_err(|source| ServiceError::Bind { addr, source })
}

fn spawn_grpc(
    listener: TcpListener,
    ingestor: TelemetryIngestor,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let receiver = OtlpGrpcReceiver::new(ingestor);
    let incoming = Box::pin(futures::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(stream, _)| stream);
        Some((accepted, listener))
    }));

    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(receiver.trace_service())
            .add_service(receiver.metrics_service())
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await;
        match result {
            Ok(()) => info!("OTLP gRPC receiver stopped"),
            Err(e) => error!(error = %e, "OTLP gRPC receiver failed"),
        }
    })
}

fn spawn_http(
    listener: TcpListener,
    ingestor: TelemetryIngestor,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let app = otlp_routes(OtlpHttpState { ingestor });
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        match result {
            Ok(()) => info!("OTLP HTTP receiver stopped"),
            Err(e) => error!(error = %e, "OTLP HTTP receiver failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config {
            receiver_host: "127.0.0.1".to_string(),
            receiver_port: 0,
            buffer_path: dir.path().to_path_buf(),
            output_enabled: false,
            shutdown_timeout_secs: 1,
            ..Config::default()
        };
        config.post_process().unwrap();
        config
    }

    #[tokio::test]
    async fn test_start_binds_and_shutdown_closes_queues() {
        let dir = TempDir::new().unwrap();
        let mut service = ServiceManager::new(test_config(&dir)).await.unwrap();
        assert!(service.outputs().processor_names().is_empty());

        service.start().await.unwrap();
        assert!(service.is_running());
        let addr = service.local_grpc_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(service.local_http_addr().is_none());

        assert!(matches!(service.start().await, Err(ServiceError::AlreadyRunning)));

        service.shutdown().await.unwrap();
        assert!(!service.is_running());
        assert!(service.queues().iter().all(|q| q.is_closed()));
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_scheduler_stopped() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(&dir);
        config.receiver_port = taken.local_addr().unwrap().port();
        config.post_process().unwrap();

        let mut service = ServiceManager::new(config).await.unwrap();
        assert!(matches!(service.start().await, Err(ServiceError::Bind { .. })));
        assert_eq!(
            service.scheduler().state(),
            crate::app::SchedulerState::Stopped
        );
    }

    #[tokio::test]
    async fn test_enabled_output_is_registered() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.output_enabled = true;
        config.post_process().unwrap();

        let service = ServiceManager::new(config).await.unwrap();
        assert_eq!(service.outputs().processor_names(), vec![OTLP_GRPC_OUTPUT.to_string()]);
        assert!(service.outputs().has_active());
    }
}
