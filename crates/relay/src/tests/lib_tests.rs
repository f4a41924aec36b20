use super::*;
use shared::domain::{ChatId, MessageId};
use storage::Storage;

fn ack() -> Envelope {
    Envelope::MessageAck {
        client_msg_id: "c1".into(),
        server_msg_id: MessageId(1),
        chat_id: ChatId(7),
        sequence_number: 1,
    }
}

async fn relay_fixture(instance: &str) -> (Relay, PresenceRegistry) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let presence = PresenceRegistry::new(storage.pool().clone(), Duration::from_secs(30));
    let relay = Relay::new(
        InstanceId::new(instance),
        presence.clone(),
        Arc::new(LocalRegistry::new()),
    );
    (relay, presence)
}

#[tokio::test]
async fn local_publish_reaches_registered_channel() {
    let (relay, presence) = relay_fixture("node-a").await;
    let user = UserId(1);
    let (mut receiver, _token) = relay.local().register(user);
    presence.set_online(user, relay.instance_id()).await.expect("online");

    relay.publish(user, &ack()).await.expect("publish");

    let delivered = receiver.recv().await.expect("envelope");
    assert!(matches!(delivered, Envelope::MessageAck { sequence_number: 1, .. }));
}

#[tokio::test]
async fn publish_to_offline_user_reports_offline() {
    let (relay, _presence) = relay_fixture("node-a").await;
    let result = relay.publish(UserId(2), &ack()).await;
    assert!(matches!(result, Err(RelayError::RecipientOffline)));
}

#[tokio::test]
async fn stale_presence_without_local_channel_reports_not_connected() {
    let (relay, presence) = relay_fixture("node-a").await;
    let user = UserId(3);
    presence.set_online(user, relay.instance_id()).await.expect("online");

    let result = relay.publish(user, &ack()).await;
    assert!(matches!(result, Err(RelayError::NotConnected)));
}

#[tokio::test]
async fn unknown_owner_instance_is_reported() {
    let (relay, presence) = relay_fixture("node-a").await;
    let user = UserId(4);
    presence
        .set_online(user, &InstanceId::new("node-ghost"))
        .await
        .expect("online");

    let result = relay.publish(user, &ack()).await;
    assert!(matches!(result, Err(RelayError::UnknownInstance(_))));
}

#[tokio::test]
async fn newest_registration_wins() {
    let registry = LocalRegistry::new();
    let user = UserId(5);

    let (mut first_rx, first_token) = registry.register(user);
    let (mut second_rx, _second_token) = registry.register(user);

    assert!(registry.dispatch(user, ack()));
    assert!(second_rx.recv().await.is_some());
    // The first channel was replaced; its sender is gone.
    assert!(first_rx.try_recv().is_err());

    // A slow teardown of the replaced connection must not evict the new one.
    assert!(!registry.unregister(user, first_token));
    assert!(registry.is_connected(user));
}

#[tokio::test]
async fn unregister_removes_own_registration() {
    let registry = LocalRegistry::new();
    let user = UserId(6);
    let (_rx, token) = registry.register(user);

    assert!(registry.unregister(user, token));
    assert!(!registry.is_connected(user));
    assert!(!registry.dispatch(user, ack()));
}
