use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::ctl::{GroupCtl, GroupHandle};
use crate::database::Database;
use crate::replay::spawn_replay;
use crate::server::spawn_prom_server;
use crate::service::MemoryGroupService;
use crate::store::NextGroupStore;

/// The application object for when the group controller is running as a daemon.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The simulated group table of the device.
    _service: Arc<MemoryGroupService>,
    /// A handle to the group controller, kept so that its request channel stays open.
    _handle: GroupHandle,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the group controller.
    ctl_handle: JoinHandle<Result<()>>,
    /// The join handle of the objectives replay task, if any.
    replay_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Initialize this device's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let store = NextGroupStore::new(&db).await.context("error opening next group store")?;
        let recovered = store.list().await.context("error listing recovered next group records")?;
        for record in recovered.iter() {
            tracing::debug!(next_id = record.next_id, chains = record.chains.len(), "recovered next group record");
        }
        tracing::info!(count = recovered.len(), "recovered next group records");

        // Spawn various core tasks.
        let service = Arc::new(MemoryGroupService::auto());
        let (ctl, handle) = GroupCtl::new(config.clone(), store, service.clone(), shutdown_tx.clone());
        let ctl_handle = ctl.spawn();

        let replay_handle = match config.objectives_path.as_deref() {
            Some(path) => Some(
                spawn_replay(Path::new(path), handle.clone(), shutdown_tx.subscribe())
                    .await
                    .context("error setting up objectives replay")?,
            ),
            None => None,
        };

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            _service: service,
            _handle: handle,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            ctl_handle,
            replay_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("group controller daemon is shutting down");
        if let Some(replay_handle) = self.replay_handle {
            if let Err(err) = replay_handle.await.context("error joining objectives replay handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down objectives replay");
            }
        }
        if let Err(err) = self.ctl_handle.await.context("error joining group controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down group controller");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("group controller daemon shutdown complete");
        Ok(())
    }
}
