//! Engine server: wires the broker, queue, workspace, worker and ingest loop

use crate::config::{EngineConfig, QueueConfig};
use crate::error::{EngineError, Result};
use crate::event::read_envelopes;
use crate::ingest::Ingestor;
use crate::workspace::Workspace;
use keel_broker::{MemoryBroker, Producer};
use keel_queue::{MemoryQueue, ReconcileQueue, Worker};
use keel_types::{cancel_pair, CancelToken, SharedClock, SystemClock};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub struct Server {
    config: EngineConfig,
    broker: Arc<MemoryBroker>,
    queue: Arc<dyn ReconcileQueue>,
    workspace: Arc<Workspace>,
}

impl Server {
    /// Build every component from `config`
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let queue = connect_queue(&config.queue, clock.clone()).await?;

        let broker = MemoryBroker::new();
        broker.create_topic(&config.broker.topic, config.broker.partitions.max(1));
        let producer = Arc::new(broker.producer(&config.broker.topic)?);

        let workspace = Workspace::builder(config.workspace.id.clone(), queue.clone())
            .with_clock(clock)
            .with_events(producer)
            .with_default_max_retries(config.eligibility.default_max_retries)
            .with_batch_ttl(Duration::from_secs(config.batch_cache.ttl_secs))
            .build();

        Ok(Self {
            config,
            broker,
            queue,
            workspace,
        })
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Publish newline-delimited events from `path` onto the topic
    pub async fn replay(&self, path: &Path) -> Result<usize> {
        let envelopes = read_envelopes(BufReader::new(File::open(path)?))?;
        let producer = self.broker.producer(&self.config.broker.topic)?;
        for envelope in &envelopes {
            producer
                .publish(envelope.workspace_id.as_bytes(), &envelope.encode()?)
                .await?;
        }
        info!(path = %path.display(), events = envelopes.len(), "Events replayed");
        Ok(envelopes.len())
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let (source, token) = cancel_pair();
        let handles = self.spawn(token);
        info!(
            workspace_id = %self.workspace.id(),
            topic = %self.config.broker.topic,
            "Keel engine running"
        );

        shutdown_signal().await;
        source.cancel();

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Engine task failed"),
                Err(e) => error!(error = %e, "Engine task panicked"),
            }
        }
        info!("Keel engine stopped");
        Ok(())
    }

    fn spawn(&self, shutdown: CancelToken) -> Vec<tokio::task::JoinHandle<Result<()>>> {
        let mut handles = Vec::new();

        let worker = Worker::new(
            self.queue.clone(),
            Arc::new(self.workspace.processor()),
            self.config.worker.clone(),
        );
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker.run(token).await.map_err(EngineError::from)
        }));

        let ingestor = match self
            .broker
            .consumer(&self.config.broker.topic, &self.config.broker.group)
        {
            Ok(consumer) => Ingestor::new(Arc::new(consumer), self.workspace.clone())
                .with_read_timeout(self.config.broker.read_timeout())
                .with_retry_delay(self.config.broker.retry_delay()),
            Err(e) => {
                handles.push(tokio::spawn(async move { Err(EngineError::from(e)) }));
                return handles;
            }
        };
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { ingestor.run(token).await }));

        let workspace = self.workspace.clone();
        let ttl = Duration::from_secs(self.config.batch_cache.ttl_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = workspace.purge_expired_batches();
                        if purged > 0 {
                            info!(purged, "Expired resource batches purged");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            Ok(())
        }));

        handles
    }
}

async fn connect_queue(config: &QueueConfig, clock: SharedClock) -> Result<Arc<dyn ReconcileQueue>> {
    match config {
        QueueConfig::Memory => {
            info!("Using in-memory reconcile queue");
            Ok(Arc::new(MemoryQueue::new(clock)))
        }
        #[cfg(feature = "postgres")]
        QueueConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            info!(max_connections, "Using PostgreSQL reconcile queue");
            let queue =
                keel_queue::PostgresQueue::connect(url, *max_connections, *connect_timeout_secs)
                    .await?;
            queue.initialize_schema().await?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "postgres"))]
        QueueConfig::Postgres { .. } => Err(EngineError::Config(
            "postgres queue requested but keeld was built without the `postgres` feature".into(),
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
