use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use presence::PresenceRegistry;
use relay::{ConnectionToken, Relay};
use shared::{
    domain::{ChatId, MessageId, MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{Envelope, MessagePayload},
};
use storage::{OfflineQueue, Storage, StoredMessage};

/// Everything one send request touches: the message store, the presence
/// registry, the offline fallback and the relay fabric.
#[derive(Clone)]
pub struct DeliveryContext {
    pub storage: Storage,
    pub offline: OfflineQueue,
    pub presence: PresenceRegistry,
    pub relay: Relay,
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub client_msg_id: Option<String>,
}

/// Runs one send request through RECEIVED → PERSISTED → FANNED_OUT → ACKED.
///
/// Validation failures abort before any side effect. Once the append
/// commits the message is durable: fan-out errors are isolated per
/// recipient and never roll persistence back. A resubmission carrying a
/// known idempotency token returns the stored message and skips fan-out,
/// so retries cannot duplicate envelopes anywhere.
pub async fn send_message(
    ctx: &DeliveryContext,
    request: SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    let content = request.content.trim();
    if content.is_empty() && request.file_url.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message content cannot be empty",
        ));
    }
    let client_msg_id = request
        .client_msg_id
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty());

    if !ctx
        .storage
        .chat_exists(request.chat_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::NotFound, "chat not found"));
    }
    if !ctx
        .storage
        .is_member(request.chat_id, request.sender_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "sender is not a member of the chat",
        ));
    }

    let (stored, deduplicated) = ctx
        .storage
        .append_message(
            request.chat_id,
            request.sender_id,
            content,
            request.kind,
            request.file_url.as_deref(),
            client_msg_id,
        )
        .await
        .map_err(internal)?;
    let payload = payload_from(&stored);

    if deduplicated {
        debug!(
            chat_id = payload.chat_id.0,
            sender_id = payload.sender_id.0,
            sequence_number = payload.sequence_number,
            "resubmission matched a stored message, skipping fan-out"
        );
    } else {
        fan_out(ctx, &payload).await;
    }

    // The sender just spoke over a live connection, so the ack goes out as
    // if they were online; the HTTP response below carries the same
    // authoritative representation either way.
    let ack = Envelope::MessageAck {
        client_msg_id: payload.client_msg_id.clone().unwrap_or_default(),
        server_msg_id: payload.message_id,
        chat_id: payload.chat_id,
        sequence_number: payload.sequence_number,
    };
    if let Err(relay_error) = ctx.relay.publish(payload.sender_id, &ack).await {
        debug!(
            sender_id = payload.sender_id.0,
            error = %relay_error,
            "could not push MESSAGE_ACK to the sender channel"
        );
    }

    Ok(payload)
}

/// Per-recipient branch of the PERSISTED → FANNED_OUT step. Errors are
/// logged per recipient and never abort the remaining fan-out.
async fn fan_out(ctx: &DeliveryContext, payload: &MessagePayload) {
    let members = match ctx.storage.members_of_chat(payload.chat_id).await {
        Ok(members) => members,
        Err(lookup_error) => {
            error!(
                chat_id = payload.chat_id.0,
                error = %lookup_error,
                "membership lookup failed, message persisted but not fanned out"
            );
            return;
        }
    };

    let envelope = Envelope::ChatMessage {
        message: payload.clone(),
    };
    for member in members {
        if member == payload.sender_id {
            continue;
        }
        deliver_to(ctx, member, &envelope).await;
    }
}

/// Presence branch for a single recipient: live publish when the registry
/// reports them online, offline queue otherwise. A failed publish (stale
/// presence, unreachable peer) reroutes to the offline queue rather than
/// accepting the loss window.
async fn deliver_to(ctx: &DeliveryContext, recipient: UserId, envelope: &Envelope) {
    let online = match ctx.presence.is_online(recipient).await {
        Ok(online) => online,
        Err(presence_error) => {
            warn!(
                recipient = recipient.0,
                error = %presence_error,
                "presence lookup failed, treating recipient as offline"
            );
            false
        }
    };

    if online {
        match ctx.relay.publish(recipient, envelope).await {
            Ok(()) => return,
            Err(relay_error) => {
                warn!(
                    recipient = recipient.0,
                    error = %relay_error,
                    "live publish failed, rerouting to the offline queue"
                );
            }
        }
    }

    if !envelope.survives_offline() {
        return;
    }
    if let Err(queue_error) = ctx.offline.enqueue(recipient, envelope).await {
        error!(
            recipient = recipient.0,
            error = %queue_error,
            "failed to queue envelope for offline delivery"
        );
    }
}

pub async fn list_messages(
    ctx: &DeliveryContext,
    chat_id: ChatId,
    user_id: UserId,
    limit: u32,
    before: Option<i64>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_membership(ctx, chat_id, user_id).await?;
    let messages = ctx
        .storage
        .list_chat_messages(chat_id, limit, before)
        .await
        .map_err(internal)?;
    Ok(messages.iter().map(payload_from).collect())
}

pub async fn unread_count(
    ctx: &DeliveryContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<i64, ApiError> {
    ensure_membership(ctx, chat_id, user_id).await?;
    ctx.storage
        .unread_count(chat_id, user_id)
        .await
        .map_err(internal)
}

/// Records the read at most once and pushes a READ_RECEIPT to the message
/// sender. Safe to call redundantly.
pub async fn mark_read(
    ctx: &DeliveryContext,
    message_id: MessageId,
    user_id: UserId,
) -> Result<bool, ApiError> {
    let message = ctx
        .storage
        .find_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    ensure_membership(ctx, message.chat_id, user_id).await?;

    let newly_read = ctx
        .storage
        .mark_read(message_id, user_id)
        .await
        .map_err(internal)?;
    if newly_read && message.sender_id != user_id {
        let receipt = Envelope::ReadReceipt {
            chat_id: message.chat_id,
            message_id,
            reader_id: user_id,
            read_at: Utc::now(),
        };
        deliver_to(ctx, message.sender_id, &receipt).await;
    }
    Ok(newly_read)
}

/// Marks everything in the chat the reader has not read yet; idempotent.
/// Returns how many messages this call newly marked.
pub async fn mark_chat_read(
    ctx: &DeliveryContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<usize, ApiError> {
    ensure_membership(ctx, chat_id, user_id).await?;
    let newly_read = ctx
        .storage
        .mark_chat_read(chat_id, user_id)
        .await
        .map_err(internal)?;

    let read_at = Utc::now();
    for item in &newly_read {
        let receipt = Envelope::ReadReceipt {
            chat_id: item.chat_id,
            message_id: item.message_id,
            reader_id: user_id,
            read_at,
        };
        deliver_to(ctx, item.sender_id, &receipt).await;
    }
    Ok(newly_read.len())
}

/// Typing indicators are transient: relayed to online members only, never
/// queued offline.
pub async fn notify_typing(
    ctx: &DeliveryContext,
    chat_id: ChatId,
    user_id: UserId,
    typing: bool,
) -> Result<(), ApiError> {
    ensure_membership(ctx, chat_id, user_id).await?;
    let members = ctx
        .storage
        .members_of_chat(chat_id)
        .await
        .map_err(internal)?;
    let envelope = Envelope::Typing {
        chat_id,
        user_id,
        typing,
    };
    for member in members {
        if member == user_id {
            continue;
        }
        if let Err(relay_error) = ctx.relay.publish(member, &envelope).await {
            debug!(recipient = member.0, error = %relay_error, "typing indicator dropped");
        }
    }
    Ok(())
}

/// Reconnect flow: register the local channel, record presence on this
/// instance and drain the offline backlog into the fresh channel, oldest
/// first. An entry that cannot be handed to the channel goes back to the
/// queue for the next reconnect.
pub async fn connect_user(
    ctx: &DeliveryContext,
    user_id: UserId,
) -> Result<(mpsc::UnboundedReceiver<Envelope>, ConnectionToken), ApiError> {
    let (receiver, token) = ctx.relay.local().register(user_id);
    ctx.presence
        .set_online(user_id, ctx.relay.instance_id())
        .await
        .map_err(internal)?;

    let pending = ctx.offline.drain(user_id).await.map_err(internal)?;
    let drained = pending.len();
    for envelope in pending {
        if !ctx.relay.local().dispatch(user_id, envelope.clone()) {
            if let Err(queue_error) = ctx.offline.enqueue(user_id, &envelope).await {
                error!(
                    user_id = user_id.0,
                    error = %queue_error,
                    "lost offline envelope during reconnect handoff"
                );
            }
        }
    }
    if drained > 0 {
        info!(user_id = user_id.0, drained, "delivered offline backlog on reconnect");
    }
    Ok((receiver, token))
}

/// Disconnect flow, guarded by the connection token so a slow teardown
/// cannot clear the presence of a newer connection.
pub async fn disconnect_user(
    ctx: &DeliveryContext,
    user_id: UserId,
    token: ConnectionToken,
) -> Result<(), ApiError> {
    if ctx.relay.local().unregister(user_id, token) {
        ctx.presence
            .set_offline(user_id, ctx.relay.instance_id())
            .await
            .map_err(internal)?;
    }
    Ok(())
}

async fn ensure_membership(
    ctx: &DeliveryContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<(), ApiError> {
    if !ctx.storage.chat_exists(chat_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "chat not found"));
    }
    if !ctx
        .storage
        .is_member(chat_id, user_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a member of the chat",
        ));
    }
    Ok(())
}

fn payload_from(stored: &StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: stored.message_id,
        chat_id: stored.chat_id,
        sender_id: stored.sender_id,
        content: stored.content.clone(),
        kind: stored.kind,
        file_url: stored.file_url.clone(),
        sequence_number: stored.sequence_number,
        client_msg_id: stored.client_msg_id.clone(),
        created_at: stored.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
