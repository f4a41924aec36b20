use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use presence::PresenceRegistry;
use shared::{
    domain::{InstanceId, UserId},
    protocol::Envelope,
};

const HANDOFF_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("recipient is offline")]
    RecipientOffline,
    #[error("no live local connection for user")]
    NotConnected,
    #[error("owning instance {0} is not registered")]
    UnknownInstance(InstanceId),
    #[error("instance {instance} rejected the handoff with status {status}")]
    PeerRejected { instance: InstanceId, status: u16 },
    #[error("instance {instance} unreachable")]
    PeerUnreachable {
        instance: InstanceId,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Wire shape of an instance-to-instance handoff (`POST /internal/relay`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHandoff {
    pub user_id: UserId,
    pub envelope: Envelope,
}

/// Opaque identity of one registration; guards unregistration so a slow
/// disconnect cannot tear down the channel of a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken(u64);

struct LocalChannel {
    token: ConnectionToken,
    sender: mpsc::UnboundedSender<Envelope>,
}

/// Per-instance map of live connections: one unbounded channel per user.
/// Registering a user again replaces the previous channel (newest
/// connection wins, mirroring presence takeover).
#[derive(Default)]
pub struct LocalRegistry {
    channels: DashMap<i64, LocalChannel>,
    next_token: AtomicU64,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: UserId) -> (mpsc::UnboundedReceiver<Envelope>, ConnectionToken) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.channels.insert(user_id.0, LocalChannel { token, sender });
        (receiver, token)
    }

    /// Removes the registration only if it still belongs to `token`.
    pub fn unregister(&self, user_id: UserId, token: ConnectionToken) -> bool {
        self.channels
            .remove_if(&user_id.0, |_, channel| channel.token == token)
            .is_some()
    }

    /// Hands the envelope to the user's live channel; false when there is
    /// no channel or its receiver is gone.
    pub fn dispatch(&self, user_id: UserId, envelope: Envelope) -> bool {
        match self.channels.get(&user_id.0) {
            Some(channel) => channel.sender.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.channels.contains_key(&user_id.0)
    }

    pub fn connected_count(&self) -> usize {
        self.channels.len()
    }
}

/// Cross-instance publish fabric. Resolves the owning instance from the
/// presence registry and forwards the envelope there: straight into the
/// local registry when this instance owns the socket, over HTTP to the
/// peer's internal endpoint otherwise. Fire-and-forget past the handoff —
/// it never waits for the client socket. Falling back to the offline queue
/// on failure is the caller's decision, not the relay's.
#[derive(Clone)]
pub struct Relay {
    instance_id: InstanceId,
    presence: PresenceRegistry,
    local: Arc<LocalRegistry>,
    http: reqwest::Client,
}

impl Relay {
    pub fn new(instance_id: InstanceId, presence: PresenceRegistry, local: Arc<LocalRegistry>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HANDOFF_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            instance_id,
            presence,
            local,
            http,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn local(&self) -> &Arc<LocalRegistry> {
        &self.local
    }

    pub async fn publish(&self, user_id: UserId, envelope: &Envelope) -> Result<(), RelayError> {
        let owner = self
            .presence
            .owner_of(user_id)
            .await?
            .ok_or(RelayError::RecipientOffline)?;

        if owner == self.instance_id {
            if self.local.dispatch(user_id, envelope.clone()) {
                Ok(())
            } else {
                Err(RelayError::NotConnected)
            }
        } else {
            self.forward(user_id, envelope, owner).await
        }
    }

    async fn forward(
        &self,
        user_id: UserId,
        envelope: &Envelope,
        owner: InstanceId,
    ) -> Result<(), RelayError> {
        let base_url = self
            .presence
            .instance_url(&owner)
            .await?
            .ok_or_else(|| RelayError::UnknownInstance(owner.clone()))?;
        let url = format!("{}/internal/relay", base_url.trim_end_matches('/'));
        let handoff = RelayHandoff {
            user_id,
            envelope: envelope.clone(),
        };
        let response = self
            .http
            .post(&url)
            .json(&handoff)
            .send()
            .await
            .map_err(|source| RelayError::PeerUnreachable {
                instance: owner.clone(),
                source,
            })?;
        if response.status().is_success() {
            debug!(user_id = user_id.0, instance = %owner, "envelope handed off to peer");
            Ok(())
        } else {
            Err(RelayError::PeerRejected {
                instance: owner,
                status: response.status().as_u16(),
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
