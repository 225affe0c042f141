use std::{error::Error, sync::Arc};

use derive_more::Debug;
use tokio::{sync::watch, task::JoinHandle};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::{
    adb::{AdbServer, watcher::WatcherState},
    error::Result,
    models::Settings,
    registry::DeviceRegistry,
    storage::DeviceStore,
};

/// A running server connection with a device registry kept current in the background.
///
/// Operations started through [`Session::server`] can be tied to [`Session::token`] so
/// [`Session::close`] cancels them too.
#[derive(Debug)]
pub struct Session {
    #[debug(skip)]
    server: AdbServer,
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
    watcher_state: watch::Receiver<WatcherState>,
    kill_server_on_close: bool,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts the server if needed, subscribes to device changes and spawns the registry.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn open(settings: &Settings, store: Arc<dyn DeviceStore>) -> Result<Self> {
        let server = AdbServer::new(settings);
        let cancel = CancellationToken::new();
        let watcher = server.start(cancel.clone()).await?;
        let watcher_state = watcher.subscribe_state();

        let registry = Arc::new(DeviceRegistry::new(server.clone(), store));
        let task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run(watcher).await }
                .instrument(info_span!("task_device_registry"))
        });
        info!(address = server.address(), "Session opened");
        Ok(Self {
            server,
            registry,
            cancel,
            watcher_state,
            kill_server_on_close: settings.kill_server_on_close,
            task: Some(task),
        })
    }

    pub fn server(&self) -> &AdbServer {
        &self.server
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// A child of the session token, cancelled on close.
    pub fn token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn watcher_state(&self) -> WatcherState {
        *self.watcher_state.borrow()
    }

    /// Watcher state changes, starting with the current state.
    pub fn watcher_states(&self) -> WatchStream<WatcherState> {
        WatchStream::new(self.watcher_state.clone())
    }

    /// Cancels everything started under the session and waits for the registry to finish.
    /// Safe to call more than once; only the first call can kill the server.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else { return };
        if let Err(e) = task.await {
            warn!(error = &e as &dyn Error, "Device registry task failed");
        }
        if self.kill_server_on_close {
            self.server.stop().await;
        }
        debug!("Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
