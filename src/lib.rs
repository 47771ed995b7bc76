//! courier — Leader-aware forwarding client for raft-backed lease controllers.
//!
//! Delivers lease-mutation commands to the current raft leader of a
//! controller cluster: one supervised connection worker per controller,
//! membership kept in sync with snapshots published on an event bus, and a
//! bounded redirect-retry loop that copes with leadership churn.
//!
//! # Quick start
//!
//! 1. Share a [`Hub`] with whatever publishes controller membership.
//! 2. Build a [`Config`] with the bootstrap addresses and a [`Connector`]
//!    (the bundled [`TcpConnector`] or your own transport).
//! 3. Create a [`Client`] and call [`request`](Client::request) with a
//!    [`Command`]; close it with [`close`](Client::close) when done.

pub mod command;
pub mod hub;
pub mod transport;

mod remote;
mod retry;

pub use command::{Command, Operation, COMMAND_VERSION};
pub use hub::{ApiServerDetails, ApiServerInfo, DetailsRequest, Hub};
pub use remote::{Remote, RemoteConfig};
pub use transport::TcpConnector;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::retry::Backoff;

/// Total attempts per request; redirects count against this budget.
const FORWARD_ATTEMPTS: usize = 3;

/// First delay between forwarding attempts.
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Delay cap between forwarding attempts.
const FORWARD_RETRY_MAX: Duration = Duration::from_secs(5);

/// Requester name carried in the bootstrap details replay request.
const DETAILS_REQUESTER: &str = "raft-lease-client";

/// Metric result labels. Every terminal request outcome records exactly one.
const RESULT_SUCCESS: &str = "success";
const RESULT_TIMEOUT: &str = "delivery timeout";
const RESULT_ERROR: &str = "error";

// ============================================================================
// Capability traits
// ============================================================================

/// A live connection capable of applying encoded lease commands.
#[async_trait]
pub trait LeaseApplier: Send + Sync + 'static {
    /// Apply an encoded command on the controller.
    async fn apply_command(&self, payload: &[u8]) -> Result<(), ClientError>;

    /// Release the underlying connection.
    async fn close(&self);
}

/// Opens connections to controllers.
///
/// The seam for swapping transports and for injecting test doubles.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to the controller named by `info`.
    async fn connect(&self, info: &ApiInfo) -> Result<Box<dyn LeaseApplier>, ClientError>;
}

/// Sink for per-request outcome metrics.
pub trait ClientMetrics: Send + Sync + 'static {
    /// Record one terminal request outcome. `result` is one of
    /// `"success"`, `"delivery timeout"`, `"error"`.
    fn record_operation(&self, operation: &str, result: &str, start: Instant);
}

// ============================================================================
// Connection info and configuration
// ============================================================================

/// Bootstrap addresses and credentials handed to the [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct ApiInfo {
    pub addrs: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<String>,
}

impl ApiInfo {
    /// Copy of this info targeting a single address.
    pub(crate) fn with_address(&self, address: String) -> Self {
        Self {
            addrs: vec![address],
            ..self.clone()
        }
    }
}

/// Client configuration.
pub struct Config {
    /// Bootstrap address list and credentials.
    pub api_info: ApiInfo,
    /// Event bus publishing controller membership.
    pub hub: Arc<Hub>,
    /// Per-request upper bound, enforced independently of the caller's
    /// cancellation. Must be non-zero.
    pub forward_timeout: Duration,
    /// Transport factory.
    pub connector: Arc<dyn Connector>,
    /// Metric sink.
    pub metrics: Arc<dyn ClientMetrics>,
    /// Seed for the fallback leader pick; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Config {
    fn validate(&self) -> Result<(), ClientError> {
        if self.forward_timeout.is_zero() {
            return Err(ClientError::Invalid("zero forward timeout".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// ClientError
// ============================================================================

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The caller's cancellation fired before the command touched the wire.
    #[error("request cancelled")]
    Cancelled,
    /// The command cannot be delivered; terminal, never retried.
    #[error("command dropped")]
    Dropped,
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("{0} not found")]
    NotFound(String),
    /// The addressed controller is not the raft leader. An empty
    /// `server_address` means the cluster has no leader at all.
    #[error("not the leader")]
    NotLeader {
        server_id: String,
        server_address: String,
    },
    #[error("client is shutting down")]
    ShuttingDown,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Whether this failure is terminal for the command (never retried).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Dropped)
    }
}

// ============================================================================
// Client
// ============================================================================

/// Leader-aware router delivering commands to the controller cluster.
///
/// Owns one [`Remote`] per known controller, reconciled against membership
/// snapshots from the [`Hub`]; [`request`](Client::request) picks a
/// candidate and redirects towards the leader within a bounded budget.
pub struct Client {
    inner: Arc<ClientInner>,
    reconciler: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct ClientInner {
    api_info: ApiInfo,
    connector: Arc<dyn Connector>,
    forward_timeout: Duration,
    metrics: Arc<dyn ClientMetrics>,
    rng: StdMutex<StdRng>,
    router: Mutex<RouterState>,
    shutdown: CancellationToken,
}

struct RouterState {
    remotes: HashMap<String, Arc<Remote>>,
    last_known_leader: Option<Arc<Remote>>,
}

/// Observability snapshot for a single remote.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub id: String,
    pub address: String,
    pub connected: bool,
}

impl Client {
    /// Create a client and start its reconciler.
    ///
    /// Subscribes to membership snapshots before requesting a replay so the
    /// first snapshot cannot be missed, then seeds one remote per bootstrap
    /// address (keyed by index until the first snapshot displaces them).
    pub async fn new(config: Config) -> Result<Self, ClientError> {
        config.validate()?;

        // Subscribe first, then ask the publisher to replay the current
        // membership so bootstrap addresses get displaced promptly.
        let details_rx = config.hub.subscribe_details();
        config.hub.publish_details_request(DetailsRequest {
            requester: DETAILS_REQUESTER.to_string(),
            local_only: true,
        });

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let inner = Arc::new(ClientInner {
            api_info: config.api_info,
            connector: config.connector,
            forward_timeout: config.forward_timeout,
            metrics: config.metrics,
            rng: StdMutex::new(rng),
            router: Mutex::new(RouterState {
                remotes: HashMap::new(),
                last_known_leader: None,
            }),
            shutdown: CancellationToken::new(),
        });

        init_servers(&inner).await?;

        let reconciler = tokio::spawn(reconcile_loop(Arc::clone(&inner), details_rx));

        Ok(Self {
            inner,
            reconciler: Mutex::new(Some(reconciler)),
        })
    }

    /// Deliver a command to the current raft leader.
    ///
    /// Picks the last known leader (or any remote), then redirects on
    /// not-leader replies for up to three attempts with doubling delays,
    /// bounded by `ctx` and the configured forward timeout.
    pub async fn request(
        &self,
        ctx: &CancellationToken,
        command: &Command,
    ) -> Result<(), ClientError> {
        let start = Instant::now();
        let deadline = tokio::time::sleep(self.inner.forward_timeout);
        tokio::pin!(deadline);

        let mut candidate = self.select_remote().await?;
        let mut backoff = Backoff::new(FORWARD_RETRY_DELAY, FORWARD_RETRY_MAX);
        let mut attempt = 0;

        let failure = loop {
            attempt += 1;

            if ctx.is_cancelled() {
                self.record(command.operation(), RESULT_TIMEOUT, start);
                return Err(ClientError::Timeout);
            }

            let outcome = tokio::select! {
                _ = ctx.cancelled() => {
                    self.record(command.operation(), RESULT_TIMEOUT, start);
                    return Err(ClientError::Timeout);
                }
                _ = &mut deadline => break ClientError::Timeout,
                result = candidate.request(ctx, command) => result,
            };

            match outcome {
                Ok(()) => {
                    let mut router = self.inner.router.lock().await;
                    router.last_known_leader = Some(Arc::clone(&candidate));
                    drop(router);

                    self.record(command.operation(), RESULT_SUCCESS, start);
                    return Ok(());
                }
                Err(ClientError::Cancelled) => {
                    self.record(command.operation(), RESULT_TIMEOUT, start);
                    return Err(ClientError::Timeout);
                }
                Err(ClientError::Dropped) => break ClientError::Dropped,
                Err(ClientError::NotLeader {
                    server_id,
                    server_address,
                }) => {
                    let next = self
                        .select_remote_from_error(
                            &candidate.address().await,
                            &server_id,
                            &server_address,
                        )
                        .await;
                    match next {
                        Some(next) => {
                            debug!(server_id = %server_id, "not the leader, redirecting");
                            candidate = next;
                            if attempt >= FORWARD_ATTEMPTS {
                                break ClientError::NotLeader {
                                    server_id,
                                    server_address,
                                };
                            }
                        }
                        None if server_address.is_empty() => {
                            error!(
                                operation = %command.operation(),
                                "no leader found and no cluster available, dropping command"
                            );
                            break ClientError::Dropped;
                        }
                        None => {
                            break ClientError::NotFound(
                                "no leader found: remote server connection".to_string(),
                            )
                        }
                    }
                }
                Err(other) => {
                    if attempt >= FORWARD_ATTEMPTS {
                        break other;
                    }
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => break ClientError::Timeout,
                _ = &mut deadline => break ClientError::Timeout,
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        };

        self.record(command.operation(), RESULT_ERROR, start);
        Err(failure)
    }

    /// Shut down: stop the reconciler, then kill and await every remote.
    ///
    /// Returns the reconciler's termination cause. Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.shutdown.cancel();

        let result = match self.reconciler.lock().await.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(ClientError::Transport(format!("reconciler: {e}"))),
            },
            None => Ok(()),
        };

        shutdown_remotes(&self.inner).await;
        result
    }

    /// Snapshot of the current remote set.
    pub async fn servers(&self) -> Vec<RemoteInfo> {
        let router = self.inner.router.lock().await;
        let mut infos = Vec::with_capacity(router.remotes.len());
        for (id, remote) in &router.remotes {
            infos.push(RemoteInfo {
                id: id.clone(),
                address: remote.address().await,
                connected: remote.connected().await,
            });
        }
        infos
    }

    fn record(&self, operation: &str, result: &str, start: Instant) {
        self.inner.metrics.record_operation(operation, result, start);
    }

    /// The last known leader when set, otherwise any remote.
    async fn select_remote(&self) -> Result<Arc<Remote>, ClientError> {
        let router = self.inner.router.lock().await;

        if let Some(leader) = &router.last_known_leader {
            return Ok(Arc::clone(leader));
        }

        router
            .remotes
            .values()
            .next()
            .map(Arc::clone)
            .ok_or_else(|| ClientError::NotFound("remote servers".to_string()))
    }

    /// Resolve the next candidate after a not-leader rejection.
    ///
    /// The hinted controller id wins when known. An empty hinted address
    /// means the cluster has no leader, so no fallback can help. Otherwise
    /// prefer the remote whose address matches the hint (the id map can lag
    /// one snapshot behind), then fall back to a random remote that isn't
    /// the one that just rejected us.
    async fn select_remote_from_error(
        &self,
        failed_address: &str,
        server_id: &str,
        server_address: &str,
    ) -> Option<Arc<Remote>> {
        let mut router = self.inner.router.lock().await;

        // The rejection makes the hint unreliable regardless of outcome.
        router.last_known_leader = None;

        if let Some(remote) = router.remotes.get(server_id) {
            return Some(Arc::clone(remote));
        }

        if server_address.is_empty() {
            return None;
        }

        let mut fallbacks = Vec::with_capacity(router.remotes.len());
        for remote in router.remotes.values() {
            let address = remote.address().await;
            if address == failed_address {
                continue;
            }
            if address == server_address {
                return Some(Arc::clone(remote));
            }
            fallbacks.push(Arc::clone(remote));
        }

        if fallbacks.is_empty() {
            return None;
        }
        let index = {
            let mut rng = self.inner.rng.lock().expect("rng mutex poisoned");
            rng.gen_range(0..fallbacks.len())
        };
        Some(fallbacks.swap_remove(index))
    }
}

// ============================================================================
// Bootstrap and reconciliation
// ============================================================================

/// Seed one remote per bootstrap address.
///
/// Keys are the address's index; the first membership snapshot replaces
/// them with real controller ids.
async fn init_servers(inner: &Arc<ClientInner>) -> Result<(), ClientError> {
    if inner.api_info.addrs.is_empty() {
        return Err(ClientError::NotFound("api addresses".to_string()));
    }

    let mut router = inner.router.lock().await;
    for (index, address) in inner.api_info.addrs.iter().enumerate() {
        let remote = Remote::new(RemoteConfig {
            api_info: inner.api_info.with_address(address.clone()),
            connector: Arc::clone(&inner.connector),
        });
        router.remotes.insert(index.to_string(), Arc::new(remote));
    }
    Ok(())
}

/// Apply membership snapshots in arrival order until shutdown.
///
/// A reconciliation failure is fatal to the whole client: remotes are
/// killed and the error becomes the close result.
async fn reconcile_loop(
    inner: Arc<ClientInner>,
    mut details_rx: broadcast::Receiver<ApiServerDetails>,
) -> Result<(), ClientError> {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return Ok(()),
            received = details_rx.recv() => match received {
                Ok(details) => {
                    let addresses = details.preferred_addresses();
                    if addresses.is_empty() {
                        error!("no server addresses found, will continue to use old addresses");
                        continue;
                    }
                    if let Err(e) = ensure_servers(&inner, addresses).await {
                        inner.shutdown.cancel();
                        shutdown_remotes(&inner).await;
                        return Err(e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "membership updates lagged, dropping oldest snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    inner.shutdown.cancel();
                    shutdown_remotes(&inner).await;
                    return Err(ClientError::Transport("membership bus closed".to_string()));
                }
            }
        }
    }
}

/// Reconcile the remote set against one snapshot.
///
/// Holds the router mutex for the whole application so requests observe a
/// consistent set. Witnessed ids get an address update or a new remote;
/// unwitnessed ids are killed, awaited, and always removed.
async fn ensure_servers(
    inner: &Arc<ClientInner>,
    addresses: HashMap<String, String>,
) -> Result<(), ClientError> {
    let mut router = inner.router.lock().await;

    let mut witnessed = HashSet::with_capacity(addresses.len());
    for (id, address) in addresses {
        witnessed.insert(id.clone());

        if let Some(remote) = router.remotes.get(&id) {
            remote.set_address(address).await;
            continue;
        }

        if inner.shutdown.is_cancelled() {
            return Err(ClientError::ShuttingDown);
        }
        debug!(controller = %id, address = %address, "adding remote");
        let remote = Remote::new(RemoteConfig {
            api_info: inner.api_info.with_address(address),
            connector: Arc::clone(&inner.connector),
        });
        router.remotes.insert(id, Arc::new(remote));
    }

    let stale: Vec<String> = router
        .remotes
        .keys()
        .filter(|id| !witnessed.contains(*id))
        .cloned()
        .collect();

    for id in stale {
        if let Some(remote) = router.remotes.remove(&id) {
            debug!(controller = %id, "removing remote");
            let was_leader = router
                .last_known_leader
                .as_ref()
                .map_or(false, |leader| Arc::ptr_eq(leader, &remote));
            if was_leader {
                router.last_known_leader = None;
            }
            remote.kill().await;
            if let Err(e) = remote.wait().await {
                // Already dead to us; the death rattle is only worth a log.
                error!(controller = %id, error = %e, "error waiting for remote shutdown");
            }
        }
    }
    Ok(())
}

/// Kill and await every remote, clearing the router.
async fn shutdown_remotes(inner: &Arc<ClientInner>) {
    let drained: Vec<(String, Arc<Remote>)> = {
        let mut router = inner.router.lock().await;
        router.last_known_leader = None;
        router.remotes.drain().collect()
    };

    for (id, remote) in drained {
        remote.kill().await;
        if let Err(e) = remote.wait().await {
            error!(controller = %id, error = %e, "error waiting for remote shutdown");
        }
    }
}
