//! Shared test helpers for courier integration tests.
//!
//! Provides a scripted connector/applier pair for driving the router
//! without a network, a recording metrics sink, and polling helpers for
//! waiting on reconciliation and connection state.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier::{
    ApiInfo, ApiServerDetails, ApiServerInfo, Client, ClientError, ClientMetrics, Command, Config,
    Connector, Hub, LeaseApplier, Operation, COMMAND_VERSION,
};

// ============================================================================
// Scripted applier / connector
// ============================================================================

/// What a scripted applier does with each apply call.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Apply succeeds.
    Ok,
    /// Reject with a not-leader hint.
    NotLeader {
        server_id: String,
        server_address: String,
    },
    /// Never complete (the caller's timeout must fire).
    Hang,
    /// Fail with a transport-classified error.
    Fail,
}

impl Behavior {
    pub fn not_leader(server_id: &str, server_address: &str) -> Self {
        Behavior::NotLeader {
            server_id: server_id.to_string(),
            server_address: server_address.to_string(),
        }
    }
}

/// An applier that follows its scripted behavior and counts calls.
pub struct MockApplier {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl MockApplier {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

/// Wrapper handing the client an owned applier while the test keeps the
/// shared handle for inspection.
struct SharedApplier(Arc<MockApplier>);

#[async_trait]
impl LeaseApplier for SharedApplier {
    async fn apply_command(&self, _payload: &[u8]) -> Result<(), ClientError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.0.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Ok => Ok(()),
            Behavior::NotLeader {
                server_id,
                server_address,
            } => Err(ClientError::NotLeader {
                server_id,
                server_address,
            }),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::Fail => Err(ClientError::Transport("injected failure".to_string())),
        }
    }

    async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that hands out scripted appliers keyed by target address.
///
/// Reconnecting to an address yields the same applier, so call counts
/// accumulate across connections.
pub struct MockConnector {
    appliers: Mutex<HashMap<String, Arc<MockApplier>>>,
    connects: Mutex<HashMap<String, usize>>,
    refused: Mutex<HashSet<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            appliers: Mutex::new(HashMap::new()),
            connects: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
        })
    }

    /// Script the behavior for connections to `address`, returning the
    /// shared applier for later inspection. Appliers survive reconnects,
    /// so scripting an address a remote already dialed still takes effect.
    pub fn script(&self, address: &str, behavior: Behavior) -> Arc<MockApplier> {
        let mut appliers = self.appliers.lock().unwrap();
        let applier = appliers
            .entry(address.to_string())
            .or_insert_with(|| MockApplier::new(Behavior::Ok));
        applier.set_behavior(behavior);
        Arc::clone(applier)
    }

    /// The applier serving `address`, if one was scripted or dialed.
    pub fn applier(&self, address: &str) -> Option<Arc<MockApplier>> {
        self.appliers.lock().unwrap().get(address).cloned()
    }

    /// How many connections have been opened to `address`.
    pub fn connects_to(&self, address: &str) -> usize {
        self.connects.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    /// Make connection attempts to `address` fail until allowed again.
    pub fn refuse(&self, address: &str) {
        self.refused.lock().unwrap().insert(address.to_string());
    }

    /// Allow connections to a previously refused `address`.
    pub fn allow(&self, address: &str) {
        self.refused.lock().unwrap().remove(address);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, info: &ApiInfo) -> Result<Box<dyn LeaseApplier>, ClientError> {
        let address = info.addrs.first().cloned().unwrap_or_default();

        if self.refused.lock().unwrap().contains(&address) {
            return Err(ClientError::Transport(format!(
                "connection refused: {address}"
            )));
        }

        *self
            .connects
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_insert(0) += 1;

        let applier = {
            let mut appliers = self.appliers.lock().unwrap();
            Arc::clone(
                appliers
                    .entry(address)
                    .or_insert_with(|| MockApplier::new(Behavior::Ok)),
            )
        };
        Ok(Box::new(SharedApplier(applier)))
    }
}

// ============================================================================
// Recording metrics sink
// ============================================================================

/// Metrics sink capturing every recorded (operation, result) pair.
pub struct RecordingMetrics {
    records: Mutex<Vec<(String, String)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn records(&self) -> Vec<(String, String)> {
        self.records.lock().unwrap().clone()
    }

    /// Just the result labels, in record order.
    pub fn labels(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, result)| result.clone())
            .collect()
    }
}

impl ClientMetrics for RecordingMetrics {
    fn record_operation(&self, operation: &str, result: &str, _start: Instant) {
        self.records
            .lock()
            .unwrap()
            .push((operation.to_string(), result.to_string()));
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A client under test plus handles to everything around it.
pub struct TestHarness {
    pub hub: Arc<Hub>,
    pub client: Client,
    pub connector: Arc<MockConnector>,
    pub metrics: Arc<RecordingMetrics>,
}

/// Build a client with the given bootstrap addresses and a 30s forward
/// timeout (far beyond anything the scripted tests wait for).
pub async fn harness(addrs: &[&str]) -> TestHarness {
    harness_with_timeout(addrs, Duration::from_secs(30)).await
}

pub async fn harness_with_timeout(addrs: &[&str], forward_timeout: Duration) -> TestHarness {
    harness_prepared(addrs, forward_timeout, |_| {}).await
}

/// Like [`harness_with_timeout`], but lets the test configure the
/// connector (refusals, scripted appliers) before any worker dials.
pub async fn harness_prepared(
    addrs: &[&str],
    forward_timeout: Duration,
    prepare: impl FnOnce(&MockConnector),
) -> TestHarness {
    harness_with_hub(addrs, forward_timeout, Arc::new(Hub::new()), prepare).await
}

/// Like [`harness_prepared`], but builds the client on the caller's hub so
/// the test can observe bus traffic published during construction.
pub async fn harness_with_hub(
    addrs: &[&str],
    forward_timeout: Duration,
    hub: Arc<Hub>,
    prepare: impl FnOnce(&MockConnector),
) -> TestHarness {
    let connector = MockConnector::new();
    let metrics = RecordingMetrics::new();
    prepare(&connector);

    let client = Client::new(Config {
        api_info: ApiInfo {
            addrs: addrs.iter().map(|a| a.to_string()).collect(),
            ..ApiInfo::default()
        },
        hub: Arc::clone(&hub),
        forward_timeout,
        connector: Arc::clone(&connector) as Arc<dyn Connector>,
        metrics: Arc::clone(&metrics) as Arc<dyn ClientMetrics>,
        seed: Some(42),
    })
    .await
    .expect("client construction should succeed");

    TestHarness {
        hub,
        client,
        connector,
        metrics,
    }
}

/// Membership snapshot from (controller id, internal address) pairs.
pub fn details(servers: &[(&str, &str)]) -> ApiServerDetails {
    ApiServerDetails {
        servers: servers
            .iter()
            .map(|(id, addr)| {
                (
                    id.to_string(),
                    ApiServerInfo {
                        internal_address: Some(addr.to_string()),
                        addresses: Vec::new(),
                    },
                )
            })
            .collect(),
    }
}

/// A valid claim command.
pub fn claim_command() -> Command {
    Command {
        version: COMMAND_VERSION,
        operation: Operation::Claim,
        namespace: "application-leadership".to_string(),
        model_uuid: "6e4e7c14-0f9a-45f3-8b3d-9e1c5a1f9d3b".to_string(),
        lease: Some("postgresql".to_string()),
        holder: Some("postgresql/0".to_string()),
        duration: Some(Duration::from_secs(60)),
        old_time: None,
        new_time: None,
        pin_entity: None,
    }
}

// ============================================================================
// Polling helpers
// ============================================================================

/// Wait until `expected` remotes have a bound connection (up to `timeout`).
pub async fn wait_for_connected(client: &Client, expected: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let connected = client
            .servers()
            .await
            .iter()
            .filter(|s| s.connected)
            .count();
        if connected == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the remote id set is exactly `expected` (up to `timeout`).
pub async fn wait_for_ids(client: &Client, expected: &[&str], timeout: Duration) -> bool {
    let want: HashSet<String> = expected.iter().map(|id| id.to_string()).collect();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let have: HashSet<String> = client
            .servers()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        if have == want {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
