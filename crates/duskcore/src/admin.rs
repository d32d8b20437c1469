//! Admin command surface (spec.md §6): `resetaxodb`, `removeAxoConversation`,
//! `rescanUserDevices` — host-triggered maintenance operations layered over
//! `Store` and the provisioning client, kept as free functions taking an
//! `&AppInterface`-shaped bundle rather than growing `AppInterface` itself,
//! since none of these run on the hot send/receive path.

use std::collections::HashSet;

use duskcore_store::Store;

use crate::dispatch::{AppInterface, NotifyAction};
use crate::error::CoreError;
use crate::provisioning::ProvisioningClient;

/// `resetaxodb`: wipes every conversation, staged key, and one-time pre-key.
/// The long-term identity and signed pre-key survive (`Store::reset_store`).
pub async fn reset_axo_db(store: &Store) -> Result<(), CoreError> {
    store.reset_store().await?;
    tracing::warn!("admin: resetaxodb executed");
    Ok(())
}

/// `removeAxoConversation <user>`: drops every locally held session with
/// `remote_user`, across however many of their devices we have state for.
/// The next message to or from any of those devices re-runs C6 from
/// scratch.
pub async fn remove_axo_conversation(
    store: &Store,
    local_user: &str,
    remote_user: &str,
    remote_devices: &[String],
) -> Result<u32, CoreError> {
    let mut removed = 0u32;
    for device in remote_devices {
        if store.has_conversation(local_user, remote_user, device).await? {
            store.delete_conversation(local_user, remote_user, device).await?;
            removed += 1;
        }
    }
    tracing::info!(remote_user, removed, "admin: removeAxoConversation executed");
    Ok(removed)
}

/// `rescanUserDevices <user>`: re-queries C8 for `user`'s current device
/// list, diffs it against the devices we already hold sessions for, and
/// fires `DeviceScan` for every device id seen for the first time (mirrors
/// the passive detection `AppInterface::receive_message` already does on
/// first contact, for hosts that want to force a proactive check instead of
/// waiting for an inbound message).
pub async fn rescan_user_devices(
    app: &AppInterface,
    provisioning: &ProvisioningClient,
    local_user: &str,
    remote_user: &str,
) -> Result<Vec<String>, CoreError> {
    let known: HashSet<String> = app
        .store_ref()
        .list_conversations_of(local_user)
        .await?
        .into_iter()
        .filter(|c| c.remote_user == remote_user)
        .map(|c| c.remote_device)
        .collect();

    let current = provisioning.get_user_devices(remote_user).await?;
    let mut newly_seen = Vec::new();
    for device in current.devices {
        if !known.contains(&device.device_id) {
            app.notify(NotifyAction::DeviceScan, remote_user.to_string(), Some(device.device_id.clone()))
                .await;
            newly_seen.push(device.device_id);
        }
    }
    tracing::info!(remote_user, new_devices = newly_seen.len(), "admin: rescanUserDevices executed");
    Ok(newly_seen)
}

/// Forced, whole-account sweep of staged (skipped) message keys older than
/// `max_age_secs` (spec.md §3: "purged by absolute age, default ≥3 days").
/// `AppInterface::receive_message` already runs this per session inline on
/// every delivery; this is for hosts that run their own maintenance schedule
/// instead of waiting on traffic to age sessions out.
pub async fn purge_stale_staged_keys(
    store: &Store,
    local_user: &str,
    max_age_secs: u64,
) -> Result<u32, CoreError> {
    let cutoff = duskcore_crypto::ratchet::unix_now().saturating_sub(max_age_secs);
    let mut purged = 0u32;
    for mut conv in store.list_conversations_of(local_user).await? {
        let before = conv.staged_key_count();
        conv.purge_staged_older_than(cutoff);
        let after = conv.staged_key_count();
        if after != before {
            store.store_conversation(&conv).await?;
            purged += (before - after) as u32;
        }
    }
    tracing::info!(local_user, purged, "admin: purge_stale_staged_keys executed");
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duskcore_crypto::ratchet::{Conversation, EstablishmentHeader};
    use std::path::PathBuf;
    use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

    async fn fresh_store() -> (Store, PathBuf) {
        let path = PathBuf::from(format!("/tmp/duskcore-admin-test-{}.db", uuid::Uuid::new_v4()));
        let mut key = [4u8; 32];
        let store = Store::init(&mut key, &path).await.unwrap();
        (store, path)
    }

    fn sample_conversation(local: &str, remote: &str, device: &str) -> Conversation {
        let spk = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let spk_pub = X25519Public::from(&spk);
        Conversation::new_as_initiator(
            local.into(),
            remote.into(),
            device.into(),
            [1u8; 32],
            spk_pub,
            [2u8; 32],
            EstablishmentHeader {
                pre_key_id: 1,
                signed_pre_key_id: 2,
                sender_identity_pub: [3u8; 32],
                sender_ephemeral_base_pub: [4u8; 32],
            },
        )
    }

    #[tokio::test]
    async fn remove_axo_conversation_drops_only_named_devices() {
        let (store, path) = fresh_store().await;
        store.store_conversation(&sample_conversation("alice", "bob", "D1")).await.unwrap();
        store.store_conversation(&sample_conversation("alice", "bob", "D2")).await.unwrap();
        store.store_conversation(&sample_conversation("alice", "carol", "D1")).await.unwrap();

        let removed = remove_axo_conversation(&store, "alice", "bob", &["D1".to_string(), "D2".to_string()])
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert!(!store.has_conversation("alice", "bob", "D1").await.unwrap());
        assert!(!store.has_conversation("alice", "bob", "D2").await.unwrap());
        assert!(store.has_conversation("alice", "carol", "D1").await.unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn purge_stale_staged_keys_sweeps_every_session_for_the_user() {
        let (store, path) = fresh_store().await;

        let root_key = [7u8; 32];
        let bob_spk = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);
        let mut alice = Conversation::new_as_initiator(
            "alice".into(),
            "bob".into(),
            "D1".into(),
            root_key,
            bob_spk_pub,
            [9u8; 32],
            EstablishmentHeader {
                pre_key_id: 1,
                signed_pre_key_id: 2,
                sender_identity_pub: [3u8; 32],
                sender_ephemeral_base_pub: [4u8; 32],
            },
        );
        let mut bob = Conversation::new_as_responder(
            "bob".into(),
            "alice".into(),
            "D1".into(),
            root_key,
            bob_spk.to_bytes(),
            bob_spk_pub,
            [1u8; 32],
        );

        let _m0 = alice.encrypt(b"m1", None).unwrap();
        let m1 = alice.encrypt(b"m2", None).unwrap();
        // m1 arrives first: bob stages a key for the skipped m0.
        let pending = bob.begin_decrypt(&m1.header, m1.establishment.as_ref()).unwrap();
        bob.commit_decrypt(pending);
        assert_eq!(bob.staged_key_count(), 1);
        store.store_conversation(&bob).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let purged = purge_stale_staged_keys(&store, "bob", 0).await.unwrap();
        assert_eq!(purged, 1);

        let reloaded = store.load_conversation("bob", "alice", "D1").await.unwrap().unwrap();
        assert_eq!(reloaded.staged_key_count(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reset_axo_db_wipes_conversations_but_not_identity() {
        let (store, path) = fresh_store().await;
        store.store_identity("alice", b"secret").await.unwrap();
        store.store_conversation(&sample_conversation("alice", "bob", "D1")).await.unwrap();

        reset_axo_db(&store).await.unwrap();

        assert!(!store.has_conversation("alice", "bob", "D1").await.unwrap());
        assert!(store.load_identity("alice").await.unwrap().is_some());

        let _ = std::fs::remove_file(&path);
    }
}
