use std::{collections::HashSet, error::Error, io};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use crate::{
    adb::{AdbServer, connection::Connection},
    error::{BridgeError, Result},
    models::{DeviceState, DeviceStateChangedEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Stopped,
}

/// Streams device state changes from one long-lived `host:track-devices` connection.
///
/// Events are delivered in server order through a bounded channel. When the consumer falls
/// behind the reader waits for room, but cancellation still interrupts the wait. The channel
/// closes once the watcher reaches [`WatcherState::Stopped`], whatever the reason.
#[derive(Debug)]
pub struct DeviceWatcher {
    events: mpsc::Receiver<DeviceStateChangedEvent>,
    state: watch::Receiver<WatcherState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Opens the tracking connection and starts the reader task. The watcher stops when
    /// `cancel` (or a token derived from it) is cancelled.
    #[instrument(level = "debug", skip(server, cancel), err)]
    pub(crate) async fn spawn(
        server: AdbServer,
        buffer: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (state_tx, state) = watch::channel(WatcherState::Idle);
        let cancel = cancel.child_token();

        let mut conn = server.connect().await?;
        conn.execute("host:track-devices").await?;
        state_tx.send_replace(WatcherState::Watching);
        info!(address = server.address(), "Watching device state changes");

        let (sender, events) = mpsc::channel(buffer.max(1));
        let task = tokio::spawn(
            track_devices(conn, sender, cancel.clone(), state_tx)
                .instrument(info_span!("task_device_watcher")),
        );
        Ok(Self { events, state, cancel, task: Some(task) })
    }

    /// Next event, or `None` once the watcher has stopped and all events were consumed.
    pub async fn recv(&mut self) -> Option<DeviceStateChangedEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }

    /// Stops reading and waits for the reader task to exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = &e as &dyn Error, "Device watcher task failed");
            }
            debug!("Device watcher stopped");
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns one snapshot into events: one per line, in order, followed by `Disconnected` for
/// serials that were present in the previous snapshot and are missing now.
fn snapshot_events(known: &mut Vec<String>, snapshot: &str) -> Vec<DeviceStateChangedEvent> {
    let mut events = Vec::new();
    let mut present = HashSet::new();
    for line in snapshot.lines() {
        let mut parts = line.split('\t');
        let serial = parts.next().unwrap_or_default().trim();
        if serial.is_empty() {
            continue;
        }
        let state = DeviceState::from_server_name(parts.next().unwrap_or_default().trim());
        present.insert(serial.to_string());
        events.push(DeviceStateChangedEvent::new(serial, state));
    }
    for serial in known.iter().filter(|s| !present.contains(*s)) {
        events.push(DeviceStateChangedEvent::new(serial.clone(), DeviceState::Disconnected));
    }
    known.clear();
    known.extend(events.iter().filter(|e| present.contains(&e.serial)).map(|e| e.serial.clone()));
    known.dedup();
    events
}

async fn track_devices(
    mut conn: Connection,
    sender: mpsc::Sender<DeviceStateChangedEvent>,
    cancel: CancellationToken,
    state: watch::Sender<WatcherState>,
) {
    let mut known = Vec::new();
    'watch: loop {
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Device watcher cancelled");
                break;
            }
            snapshot = conn.read_length_prefixed() => snapshot,
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(BridgeError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("Server closed the device tracking connection");
                break;
            }
            Err(e) => {
                warn!(error = &e as &dyn Error, "Device tracking failed");
                break;
            }
        };

        let snapshot = String::from_utf8_lossy(&snapshot);
        trace!(%snapshot, "Device snapshot");
        for event in snapshot_events(&mut known, &snapshot) {
            debug!(serial = %event.serial, state = %event.state, "Device state changed");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Device watcher cancelled while delivering");
                    break 'watch;
                }
                sent = sender.send(event) => {
                    if sent.is_err() {
                        debug!("Event receiver dropped, stopping watcher");
                        break 'watch;
                    }
                }
            }
        }
    }
    conn.close();
    state.send_replace(WatcherState::Stopped);
    drop(sender);
}
