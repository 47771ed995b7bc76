//! Bundled TCP transport for applying commands against a controller.
//!
//! Frames are length-delimited MessagePack. Each request carries the encoded
//! command; the reply either confirms the apply or classifies the failure,
//! with `not_leader` replies carrying the current leader's id and address.
//!
//! The [`Connector`]/[`LeaseApplier`] traits are the real seam — consumers
//! with their own wire protocol implement those and never touch this module.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::{ApiInfo, ClientError, Connector, LeaseApplier};

/// Upper bound on a single frame.
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Error kind tag a controller uses to signal a not-leader rejection.
pub const ERROR_KIND_NOT_LEADER: &str = "not_leader";

type ControllerConnection = Framed<TcpStream, LengthDelimitedCodec>;

/// Tagged envelope for the controller wire protocol (MessagePack encoded).
#[derive(Debug, Deserialize, Serialize)]
pub enum LeaseMessage {
    ApplyRequest(ApplyRequest),
    ApplyResponse(ApplyResponse),
}

/// Ask the controller to apply an encoded lease command.
#[derive(Debug, Deserialize, Serialize)]
pub struct ApplyRequest {
    /// Encoded [`Command`](crate::Command) bytes, opaque to the transport.
    pub command: Vec<u8>,
}

/// Controller's reply to an [`ApplyRequest`].
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ApplyResponse {
    pub applied: bool,
    /// Failure tag when `applied` is false: `"not_leader"` or an
    /// implementation-defined kind surfaced verbatim to the caller.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    /// Current leader hint on `not_leader` replies. An empty or absent
    /// address means the cluster has no leader.
    pub leader_id: Option<String>,
    pub leader_address: Option<String>,
}

impl ApplyResponse {
    /// Successful apply.
    pub fn applied() -> Self {
        Self {
            applied: true,
            ..Self::default()
        }
    }

    /// Not-leader rejection with an optional leader hint.
    pub fn not_leader(leader_id: impl Into<String>, leader_address: impl Into<String>) -> Self {
        Self {
            applied: false,
            error_kind: Some(ERROR_KIND_NOT_LEADER.to_string()),
            leader_id: Some(leader_id.into()),
            leader_address: Some(leader_address.into()),
            ..Self::default()
        }
    }
}

/// Default [`Connector`] dialing controllers over plain TCP.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, info: &ApiInfo) -> Result<Box<dyn LeaseApplier>, ClientError> {
        let address = info
            .addrs
            .first()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ClientError::NotFound("controller address".to_string()))?;

        debug!(address = %address, "dialing controller");
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ClientError::Transport(format!("connect {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Transport(format!("nodelay {address}: {e}")))?;

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();

        Ok(Box::new(TcpApplier {
            connection: Mutex::new(Some(Framed::new(stream, codec))),
        }))
    }
}

/// One live framed connection to one controller.
pub struct TcpApplier {
    connection: Mutex<Option<ControllerConnection>>,
}

#[async_trait]
impl LeaseApplier for TcpApplier {
    async fn apply_command(&self, payload: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| ClientError::Transport("connection closed".to_string()))?;

        let request = LeaseMessage::ApplyRequest(ApplyRequest {
            command: payload.to_vec(),
        });
        let bytes =
            rmp_serde::to_vec(&request).map_err(|e| ClientError::Transport(e.to_string()))?;

        connection
            .send(Bytes::from(bytes))
            .await
            .map_err(|_| ClientError::Transport("connection closed by controller".to_string()))?;

        let frame = match connection.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
            None => {
                return Err(ClientError::Transport(
                    "connection closed by controller".to_string(),
                ))
            }
        };

        let message: LeaseMessage =
            rmp_serde::from_slice(&frame).map_err(|e| ClientError::Transport(e.to_string()))?;

        match message {
            LeaseMessage::ApplyResponse(response) => classify_response(response),
            other => Err(ClientError::Transport(format!(
                "unexpected reply: {other:?}"
            ))),
        }
    }

    async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            let _ = connection.close().await;
        }
    }
}

fn classify_response(response: ApplyResponse) -> Result<(), ClientError> {
    if response.applied {
        return Ok(());
    }
    match response.error_kind.as_deref() {
        Some(ERROR_KIND_NOT_LEADER) => Err(ClientError::NotLeader {
            server_id: response.leader_id.unwrap_or_default(),
            server_address: response.leader_address.unwrap_or_default(),
        }),
        _ => Err(ClientError::Transport(
            response
                .error_message
                .unwrap_or_else(|| "apply rejected".to_string()),
        )),
    }
}
