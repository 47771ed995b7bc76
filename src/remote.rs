//! Per-controller connection worker.
//!
//! Each remote owns at most one live connection to one controller address.
//! Connections are opened lazily by a background task with unbounded,
//! capped exponential backoff; requests use whatever connection is bound at
//! the time. Address changes cancel an in-flight connect but never tear
//! down an established connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::retry::Backoff;
use crate::{ApiInfo, ClientError, Command, Connector, LeaseApplier};

/// First dial retry delay.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dial retry delay cap.
const CONNECT_RETRY_MAX: Duration = Duration::from_secs(5 * 60);

/// Pause between worker passes after an aborted or failed connect.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration for a single [`Remote`].
pub struct RemoteConfig {
    /// Connection info with exactly one target address.
    pub api_info: ApiInfo,
    pub connector: Arc<dyn Connector>,
}

/// A supervised connection worker for one controller.
pub struct Remote {
    inner: Arc<RemoteInner>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct RemoteInner {
    connector: Arc<dyn Connector>,
    state: Mutex<RemoteState>,
    /// Wakes the worker after a lost connection unbinds the applier.
    reconnect: Notify,
}

struct RemoteState {
    info: ApiInfo,
    applier: Option<Arc<dyn LeaseApplier>>,
    cancel_connect: Option<CancellationToken>,
}

impl Remote {
    /// Create the remote and start its connect loop.
    pub fn new(config: RemoteConfig) -> Self {
        let inner = Arc::new(RemoteInner {
            connector: config.connector,
            state: Mutex::new(RemoteState {
                info: config.api_info,
                applier: None,
                cancel_connect: None,
            }),
            reconnect: Notify::new(),
        });
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run(Arc::clone(&inner), shutdown.clone()));

        Self {
            inner,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Current target address; empty if uninitialized.
    pub async fn address(&self) -> String {
        let state = self.inner.state.lock().await;
        state.info.addrs.first().cloned().unwrap_or_default()
    }

    /// Whether a connection is currently bound.
    pub async fn connected(&self) -> bool {
        self.inner.state.lock().await.applier.is_some()
    }

    /// Update the target address.
    ///
    /// A no-op when the address is unchanged. Cancels an in-flight connect
    /// so the worker redials against the new address; an established
    /// connection keeps serving until it fails.
    pub async fn set_address(&self, address: String) {
        let mut state = self.inner.state.lock().await;
        let current = state.info.addrs.first().map(String::as_str).unwrap_or("");
        if current == address {
            return;
        }

        if state.applier.is_none() {
            if let Some(cancel) = state.cancel_connect.take() {
                cancel.cancel();
            }
        }
        state.info.addrs = vec![address];
    }

    /// Apply a command over the bound connection.
    ///
    /// Fails with [`ClientError::Dropped`] when no connection is bound yet,
    /// and with [`ClientError::Cancelled`] when `ctx` is already cancelled.
    /// A transport-classified failure unbinds the connection so the worker
    /// reconnects lazily.
    pub async fn request(
        &self,
        ctx: &CancellationToken,
        command: &Command,
    ) -> Result<(), ClientError> {
        let applier = { self.inner.state.lock().await.applier.clone() };
        let Some(applier) = applier else {
            error!(
                operation = %command.operation(),
                "no attached controller connection, dropping command"
            );
            return Err(ClientError::Dropped);
        };

        let payload = command.encode()?;

        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let result = applier.apply_command(&payload).await;
        if let Err(ClientError::Transport(_)) = &result {
            self.unbind(&applier).await;
        }
        result
    }

    /// Close the live connection (if any) and stop the worker. Idempotent.
    pub async fn kill(&self) {
        let applier = { self.inner.state.lock().await.applier.take() };
        if let Some(applier) = applier {
            applier.close().await;
        }
        self.shutdown.cancel();
    }

    /// Block until the worker has terminated.
    pub async fn wait(&self) -> Result<(), ClientError> {
        let handle = { self.worker.lock().await.take() };
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| ClientError::Transport(format!("remote worker: {e}"))),
            None => Ok(()),
        }
    }

    /// Drop the applier that just failed, unless a newer one is bound.
    async fn unbind(&self, failed: &Arc<dyn LeaseApplier>) {
        let unbound = {
            let mut state = self.inner.state.lock().await;
            match &state.applier {
                Some(current) if Arc::ptr_eq(current, failed) => state.applier.take(),
                _ => None,
            }
        };
        if let Some(applier) = unbound {
            debug!("controller connection lost, scheduling reconnect");
            applier.close().await;
            self.inner.reconnect.notify_one();
        }
    }
}

/// Worker loop: connect lazily, then park until killed, woken for a
/// reconnect, or due for a delayed retry.
async fn run(inner: Arc<RemoteInner>, shutdown: CancellationToken) {
    let mut delay_retry = false;
    loop {
        if shutdown.is_cancelled() {
            debug!("remote worker shutting down");
            return;
        }

        let connected = inner.state.lock().await.applier.is_some();
        if connected {
            delay_retry = false;
        } else {
            delay_retry = !connect(&inner, &shutdown).await;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("remote worker shutting down");
                return;
            }
            _ = inner.reconnect.notified() => {}
            _ = tokio::time::sleep(RECONNECT_DELAY), if delay_retry => {}
        }
    }
}

/// Dial until success, kill, or address-change cancellation. Returns true
/// when an applier was bound.
async fn connect(inner: &Arc<RemoteInner>, shutdown: &CancellationToken) -> bool {
    let cancel = CancellationToken::new();
    let info = {
        let mut state = inner.state.lock().await;
        state.cancel_connect = Some(cancel.clone());
        state.info.clone()
    };
    let address = info.addrs.first().cloned().unwrap_or_default();
    debug!(address = %address, "connecting to controller");

    let mut backoff = Backoff::new(CONNECT_RETRY_DELAY, CONNECT_RETRY_MAX);
    let mut applier = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cancel.cancelled() => break,
            result = inner.connector.connect(&info) => match result {
                Ok(opened) => {
                    applier = Some(opened);
                    break;
                }
                Err(e) => {
                    error!(address = %address, error = %e, "unable to open controller connection");
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    // A kill can race a successful dial; don't bind a connection the
    // worker is about to abandon.
    if shutdown.is_cancelled() {
        if let Some(applier) = applier {
            applier.close().await;
        }
        let mut state = inner.state.lock().await;
        state.cancel_connect = None;
        return false;
    }

    let mut state = inner.state.lock().await;
    state.cancel_connect = None;
    match applier {
        Some(opened) => {
            state.applier = Some(Arc::from(opened));
            true
        }
        None => false,
    }
}
