//! In-process event bus carrying controller membership changes.
//!
//! The surrounding agent publishes an [`ApiServerDetails`] snapshot whenever
//! the controller set changes, and replays the current snapshot when it sees
//! a [`DetailsRequest`]. The client subscribes before requesting a replay so
//! the first snapshot cannot be missed.
//!
//! Topics are small bounded broadcast channels: a subscriber that falls
//! behind loses the oldest snapshots, which is fine because only the newest
//! membership view matters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffered snapshots per topic before drop-oldest kicks in.
const TOPIC_CAPACITY: usize = 16;

/// Published addresses for a single controller.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiServerInfo {
    /// Cloud-local address, preferred when routable.
    #[serde(default)]
    pub internal_address: Option<String>,
    /// Public addresses, pre-sorted by the publisher.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl ApiServerInfo {
    /// The address the client should dial: the internal address when
    /// non-empty, otherwise the first published address. The list is
    /// pre-sorted by the publisher, so later entries are never consulted.
    pub fn preferred_address(&self) -> Option<&str> {
        if let Some(internal) = self.internal_address.as_deref() {
            if !internal.is_empty() {
                return Some(internal);
            }
        }
        self.addresses
            .first()
            .map(String::as_str)
            .filter(|a| !a.is_empty())
    }
}

/// A membership snapshot: every known controller and its addresses.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiServerDetails {
    pub servers: HashMap<String, ApiServerInfo>,
}

impl ApiServerDetails {
    /// Map each controller id to its preferred address, dropping servers
    /// with no usable address. An empty result must leave the current
    /// remote set untouched.
    pub fn preferred_addresses(&self) -> HashMap<String, String> {
        self.servers
            .iter()
            .filter_map(|(id, info)| {
                info.preferred_address()
                    .map(|addr| (id.clone(), addr.to_string()))
            })
            .collect()
    }
}

/// Asks the publisher to replay the current membership snapshot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetailsRequest {
    /// Who is asking, for the publisher's logs.
    pub requester: String,
    /// Restrict the reply to locally-routable addresses.
    pub local_only: bool,
}

/// Typed topics connecting the client to its environment.
#[derive(Debug)]
pub struct Hub {
    details: broadcast::Sender<ApiServerDetails>,
    requests: broadcast::Sender<DetailsRequest>,
}

impl Hub {
    pub fn new() -> Self {
        let (details, _) = broadcast::channel(TOPIC_CAPACITY);
        let (requests, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { details, requests }
    }

    /// Subscribe to membership snapshots.
    pub fn subscribe_details(&self) -> broadcast::Receiver<ApiServerDetails> {
        self.details.subscribe()
    }

    /// Publish a membership snapshot. Returns the number of subscribers
    /// that received it.
    pub fn publish_details(&self, details: ApiServerDetails) -> usize {
        self.details.send(details).unwrap_or(0)
    }

    /// Subscribe to replay requests (consumed by the publisher side).
    pub fn subscribe_details_requests(&self) -> broadcast::Receiver<DetailsRequest> {
        self.requests.subscribe()
    }

    /// Ask the publisher to replay the current snapshot.
    pub fn publish_details_request(&self, request: DetailsRequest) -> usize {
        self.requests.send(request).unwrap_or(0)
    }

    /// Number of live membership subscribers.
    pub fn details_subscriber_count(&self) -> usize {
        self.details.receiver_count()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
