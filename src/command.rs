//! Lease mutation commands applied against the controller cluster.
//!
//! Commands are validated per operation and encoded to MessagePack before
//! they cross the transport boundary. The router never interprets command
//! semantics; it only reads the operation label for metrics.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::ClientError;

/// Command format version understood by current controllers.
pub const COMMAND_VERSION: u16 = 1;

/// The lease mutation an encoded command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Operation {
    #[serde(rename = "claim")]
    Claim,
    #[serde(rename = "extend")]
    Extend,
    #[serde(rename = "revoke")]
    Revoke,
    #[serde(rename = "pin")]
    Pin,
    #[serde(rename = "unpin")]
    Unpin,
    #[serde(rename = "setTime")]
    SetTime,
}

impl Operation {
    /// Stable string label, used for serialization and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Claim => "claim",
            Operation::Extend => "extend",
            Operation::Revoke => "revoke",
            Operation::Pin => "pin",
            Operation::Unpin => "unpin",
            Operation::SetTime => "setTime",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lease mutation command.
///
/// Which optional fields must be set depends on [`Operation`]; see
/// [`Command::validate`]. Commands are immutable once built.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Command {
    pub version: u16,
    pub operation: Operation,
    /// Namespace the lease lives in (e.g. application leadership).
    pub namespace: String,
    /// Model the lease belongs to.
    pub model_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_time: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_time: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_entity: Option<String>,
}

impl Command {
    /// Metric label for this command.
    pub fn operation(&self) -> &'static str {
        self.operation.as_str()
    }

    /// Check that exactly the fields this operation needs are present.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.version != COMMAND_VERSION {
            return Err(invalid(format!("command version {}", self.version)));
        }
        if self.namespace.is_empty() {
            return Err(invalid("empty namespace"));
        }
        if self.model_uuid.is_empty() {
            return Err(invalid("empty model UUID"));
        }

        match self.operation {
            Operation::Claim | Operation::Extend => {
                self.require_lease()?;
                self.require_holder()?;
                match self.duration {
                    Some(d) if !d.is_zero() => {}
                    Some(_) => return Err(invalid("invalid duration")),
                    None => return Err(invalid("missing duration")),
                }
                self.forbid_times()?;
                self.forbid_pin_entity()?;
            }
            Operation::Revoke => {
                self.require_lease()?;
                self.require_holder()?;
                self.forbid_duration()?;
                self.forbid_times()?;
                self.forbid_pin_entity()?;
            }
            Operation::Pin | Operation::Unpin => {
                self.require_lease()?;
                if self.pin_entity.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid("missing pin entity"));
                }
                self.forbid_holder()?;
                self.forbid_duration()?;
                self.forbid_times()?;
            }
            Operation::SetTime => {
                if self.old_time.is_none() {
                    return Err(invalid("missing old time"));
                }
                if self.new_time.is_none() {
                    return Err(invalid("missing new time"));
                }
                if self.lease.is_some() {
                    return Err(invalid("lease not allowed for setTime"));
                }
                self.forbid_holder()?;
                self.forbid_duration()?;
                self.forbid_pin_entity()?;
            }
        }
        Ok(())
    }

    /// Validate and serialize to MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, ClientError> {
        self.validate()?;
        rmp_serde::to_vec_named(self).map_err(|e| ClientError::Encode(e.to_string()))
    }

    /// Deserialize a command previously produced by [`Command::encode`].
    pub fn decode(payload: &[u8]) -> Result<Self, ClientError> {
        rmp_serde::from_slice(payload).map_err(|e| ClientError::Encode(e.to_string()))
    }

    fn require_lease(&self) -> Result<(), ClientError> {
        match self.lease.as_deref() {
            Some(l) if !l.is_empty() => Ok(()),
            _ => Err(invalid("missing lease")),
        }
    }

    fn require_holder(&self) -> Result<(), ClientError> {
        match self.holder.as_deref() {
            Some(h) if !h.is_empty() => Ok(()),
            _ => Err(invalid("missing holder")),
        }
    }

    fn forbid_holder(&self) -> Result<(), ClientError> {
        if self.holder.is_some() {
            return Err(invalid(format!("holder not allowed for {}", self.operation)));
        }
        Ok(())
    }

    fn forbid_duration(&self) -> Result<(), ClientError> {
        if self.duration.is_some() {
            return Err(invalid(format!("duration not allowed for {}", self.operation)));
        }
        Ok(())
    }

    fn forbid_times(&self) -> Result<(), ClientError> {
        if self.old_time.is_some() || self.new_time.is_some() {
            return Err(invalid(format!("time not allowed for {}", self.operation)));
        }
        Ok(())
    }

    fn forbid_pin_entity(&self) -> Result<(), ClientError> {
        if self.pin_entity.is_some() {
            return Err(invalid(format!(
                "pin entity not allowed for {}",
                self.operation
            )));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ClientError {
    ClientError::Invalid(msg.into())
}
