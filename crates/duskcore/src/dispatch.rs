//! App interface / fan-out dispatcher (C7, spec.md §4.7).
//!
//! `AppInterface` is the component host bindings actually call:
//! `send_message`, `send_message_to_siblings`, `receive_message`. Two
//! injected trait objects stand in for the source's callback-driven
//! transport and HTTP design (spec.md §9), generalized from function-object
//! style to Rust trait objects: `TransportSink` (batched send) and
//! `NotifyCallback` (`DEVICE_SCAN`, `IDENTITY_CHANGED`, state reports).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use duskcore_crypto::ratchet::Conversation;
use duskcore_proto::envelope::{TransportWrapper, WireEnvelope};
use duskcore_proto::message::{MessageContent, MessageDescriptor};
use duskcore_store::Store;

use crate::error::CoreError;
use crate::establish::SessionEstablisher;
use crate::identity::IdentityManager;
use crate::provisioning::ProvisioningClient;

/// One device's outbound envelope, batched with its siblings before the
/// sink call (spec.md §6's `names[]/deviceIds[]/envelopes[]/sizes[]` made
/// into an owned `Vec`, replacing the source's NULL-terminated C arrays).
pub struct OutboundEnvelope {
    pub recipient_user: String,
    pub recipient_device: String,
    pub bytes: Vec<u8>,
    pub message_id: u64,
}

/// Batched send. Returns one id per input envelope, same order; `0` means
/// that slot was rejected (spec.md §6). Partial acceptance is normal.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn send_batch(&self, envelopes: &[OutboundEnvelope]) -> Vec<u64>;
}

#[derive(Debug, Clone)]
pub enum NotifyAction {
    DeviceScan,
    IdentityChanged,
    StateReport { code: i32 },
}

#[async_trait]
pub trait NotifyCallback: Send + Sync {
    async fn notify(&self, action: NotifyAction, info: String, device_id: Option<String>);
}

/// Handed the decrypted plaintext of an inbound message.
#[async_trait]
pub trait MessageReceivedCallback: Send + Sync {
    async fn on_message(
        &self,
        sender_user: &str,
        sender_device: &str,
        content: MessageContent,
        attributes: serde_json::Value,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Delivered,
    AuthFailed,
}

type SessionKey = (String, String, String);

pub struct AppInterface {
    store: Store,
    identity: Arc<IdentityManager>,
    /// This process's own device id, stamped into every outbound
    /// `TransportWrapper` so the recipient can key its conversation table
    /// by the triple `(localUser, remoteUser, remoteDevice)`.
    local_device_id: String,
    provisioning: Arc<ProvisioningClient>,
    transport: Arc<dyn TransportSink>,
    notify: Arc<dyn NotifyCallback>,
    on_message: Arc<dyn MessageReceivedCallback>,
    /// Per-(localUser, remoteUser, remoteDevice) advisory lock (spec.md §5):
    /// the only correctness-critical ordering. Sessions not yet seen share
    /// no lock contention with sessions already tracked here.
    session_locks: DashMap<SessionKey, Arc<AsyncMutex<()>>>,
    /// Device triples already seen at least once, to fire `DeviceScan`
    /// exactly on first contact (spec.md §4.7: "establishment with a
    /// never-seen device triggers DEVICE_SCAN notify first").
    seen_devices: DashMap<(String, String), HashSet<String>>,
}

impl AppInterface {
    pub fn new(
        store: Store,
        identity: Arc<IdentityManager>,
        local_device_id: impl Into<String>,
        provisioning: Arc<ProvisioningClient>,
        transport: Arc<dyn TransportSink>,
        notify: Arc<dyn NotifyCallback>,
        on_message: Arc<dyn MessageReceivedCallback>,
    ) -> Self {
        Self {
            store,
            identity,
            local_device_id: local_device_id.into(),
            provisioning,
            transport,
            notify,
            on_message,
            session_locks: DashMap::new(),
            seen_devices: DashMap::new(),
        }
    }

    /// Exposes the underlying store for admin-surface operations
    /// (`admin::rescan_user_devices`) that need to enumerate sessions
    /// directly rather than through the send/receive path.
    pub fn store_ref(&self) -> &Store {
        &self.store
    }

    fn session_lock(&self, local_user: &str, remote_user: &str, remote_device: &str) -> Arc<AsyncMutex<()>> {
        let key = (local_user.to_string(), remote_user.to_string(), remote_device.to_string());
        self.session_locks
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn mark_seen(&self, remote_user: &str, remote_device: &str) -> bool {
        let mut entry = self
            .seen_devices
            .entry(remote_user.to_string())
            .or_insert_with(HashSet::new);
        entry.insert(remote_device.to_string())
    }

    /// `sendMessage(message, attachment, attributes) -> [messageId]`.
    pub async fn send_message(
        &self,
        message_json: &str,
        attributes: serde_json::Value,
    ) -> Result<Vec<u64>, CoreError> {
        let descriptor: MessageDescriptor =
            serde_json::from_str(message_json).map_err(|e| CoreError::BadParams(e.to_string()))?;
        let devices = self.provisioning.get_user_devices(&descriptor.recipient).await?;
        let device_ids: Vec<String> = devices.devices.into_iter().map(|d| d.device_id).collect();
        self.fan_out(&descriptor.recipient, &device_ids, &descriptor.content, attributes)
            .await
    }

    /// `sendMessageToSiblings(...)`: identical fan-out targeting the local
    /// user's own other devices.
    pub async fn send_message_to_siblings(
        &self,
        message_json: &str,
        attributes: serde_json::Value,
    ) -> Result<Vec<u64>, CoreError> {
        let descriptor: MessageDescriptor =
            serde_json::from_str(message_json).map_err(|e| CoreError::BadParams(e.to_string()))?;
        let devices = self.provisioning.get_user_devices(self.identity.user_name()).await?;
        let sibling_ids: Vec<String> = devices
            .devices
            .into_iter()
            .map(|d| d.device_id)
            .filter(|id| id != &self.local_device_id)
            .collect();
        self.fan_out(self.identity.user_name(), &sibling_ids, &descriptor.content, attributes)
            .await
    }

    async fn fan_out(
        &self,
        recipient_user: &str,
        device_ids: &[String],
        content: &MessageContent,
        attributes: serde_json::Value,
    ) -> Result<Vec<u64>, CoreError> {
        // An attachment's key BLOB is carried in the envelope's encrypted
        // supplement block rather than the main plaintext (message.rs's
        // `MessageContent::Attachment::key_blob_b64` doc comment; spec.md
        // §4's C5 `encrypt(conv, plaintext, supplements)`), so it never sits
        // in the same AES-CBC block as the locator/mime/size fields.
        let (main_content, supplements) = match content {
            MessageContent::Attachment { locator, key_blob_b64, mime_type, size_bytes } => {
                use base64::{engine::general_purpose::STANDARD, Engine};
                let key_blob = STANDARD
                    .decode(key_blob_b64)
                    .map_err(|e| CoreError::BadParams(format!("key_blob_b64: {e}")))?;
                let sanitized = MessageContent::Attachment {
                    locator: locator.clone(),
                    key_blob_b64: String::new(),
                    mime_type: mime_type.clone(),
                    size_bytes: *size_bytes,
                };
                (sanitized, Some(key_blob))
            }
            MessageContent::Text { .. } => (content.clone(), None),
        };

        let plaintext = serde_json::to_vec(&MessageDescriptor {
            recipient: recipient_user.to_string(),
            content: main_content,
            attributes,
        })
        .map_err(|e| CoreError::BadParams(e.to_string()))?;

        let mut batch = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            match self
                .encrypt_for_device(recipient_user, device_id, &plaintext, supplements.as_deref())
                .await
            {
                Ok(out) => batch.push(out),
                Err(CoreError::IdentityMismatch { user, device }) => {
                    self.notify
                        .notify(NotifyAction::IdentityChanged, user.clone(), Some(device))
                        .await;
                    tracing::warn!(user, "refusing send: identity changed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, device_id, "fan-out: failed to prepare envelope for device");
                }
            }
        }

        let accepted_ids = self.transport.send_batch(&batch).await;
        Ok(accepted_ids
            .into_iter()
            .zip(batch.iter().map(|o| o.message_id))
            .filter_map(|(accepted, sent_id)| if accepted != 0 { Some(sent_id) } else { None })
            .collect())
    }

    async fn encrypt_for_device(
        &self,
        remote_user: &str,
        remote_device: &str,
        plaintext: &[u8],
        supplements: Option<&[u8]>,
    ) -> Result<OutboundEnvelope, CoreError> {
        let lock = self.session_lock(self.identity.user_name(), remote_user, remote_device);
        let _guard = lock.lock().await;

        let existing = self
            .store
            .load_conversation(self.identity.user_name(), remote_user, remote_device)
            .await?;

        // Always re-fetch the bundle: establishing a brand-new session needs
        // it outright, and an already-live session still needs it to detect
        // a rotated identity key before reusing pinned ratchet state (spec.md
        // §4.6: "IdentityMismatch ... do NOT silently replace").
        let bundle = self.provisioning.get_prekey_bundle(remote_user, remote_device).await?;

        let mut conv = match existing {
            Some(conv) => {
                let remote_identity = SessionEstablisher::decode_identity_pub(&bundle)?;
                if conv.identity_remote != Some(remote_identity) {
                    return Err(CoreError::IdentityMismatch {
                        user: remote_user.to_string(),
                        device: remote_device.to_string(),
                    });
                }
                conv
            }
            None => SessionEstablisher::establish_as_initiator(&self.identity, remote_user, remote_device, &bundle)?,
        };

        let out = conv.encrypt(plaintext, supplements)?;
        let mac_key = out.message_keys.mac_key;
        let wire = WireEnvelope {
            header: out.header,
            establishment: out.establishment,
            iv: out.message_keys.iv,
            ciphertext: out.ciphertext,
            supplement_iv: out.supplement_ciphertext.as_ref().map(|_| out.supplement_keys.iv),
            supplement_ciphertext: out.supplement_ciphertext,
        };
        let envelope_bytes = wire.encode(&mac_key)?;

        self.store.store_conversation(&conv).await?;

        let wrapper = TransportWrapper {
            sender_user: self.identity.user_name().to_string(),
            sender_device: self.local_device_id.clone(),
            inner: envelope_bytes,
        };
        let wrapper_bytes = serde_json::to_vec(&wrapper).map_err(|e| CoreError::BadParams(e.to_string()))?;

        Ok(OutboundEnvelope {
            recipient_user: remote_user.to_string(),
            recipient_device: remote_device.to_string(),
            bytes: wrapper_bytes,
            message_id: out.message_id,
        })
    }

    /// `receiveMessage(envelope) -> status`.
    pub async fn receive_message(&self, wrapper_bytes: &[u8]) -> Result<ReceiveStatus, CoreError> {
        let wrapper: TransportWrapper =
            serde_json::from_slice(wrapper_bytes).map_err(|e| CoreError::BadParams(e.to_string()))?;

        let first_contact = self.mark_seen(&wrapper.sender_user, &wrapper.sender_device);
        if first_contact {
            self.notify
                .notify(NotifyAction::DeviceScan, wrapper.sender_user.clone(), Some(wrapper.sender_device.clone()))
                .await;
        }

        let lock = self.session_lock(self.identity.user_name(), &wrapper.sender_user, &wrapper.sender_device);
        let _guard = lock.lock().await;

        let (header, establishment) = match WireEnvelope::peek_header(&wrapper.inner) {
            Ok(h) => h,
            Err(_) => return Ok(ReceiveStatus::AuthFailed),
        };

        let existing = self
            .store
            .load_conversation(self.identity.user_name(), &wrapper.sender_user, &wrapper.sender_device)
            .await?;

        let conv = match (&existing, &establishment) {
            (None, Some(est)) => {
                let opk_secret = self.identity.load_prekey_secret(est.pre_key_id).await?;
                let new_conv = SessionEstablisher::establish_as_responder(
                    &self.identity,
                    &wrapper.sender_user,
                    &wrapper.sender_device,
                    est,
                    opk_secret.as_ref(),
                )?;
                new_conv
            }
            (Some(conv), _) => conv.clone(),
            (None, None) => return Ok(ReceiveStatus::AuthFailed),
        };

        let status = self
            .decrypt_and_deliver(conv, existing.is_none(), &header, establishment.as_ref(), &wrapper)
            .await?;
        Ok(status)
    }

    async fn decrypt_and_deliver(
        &self,
        conv: Conversation,
        is_new_session: bool,
        header: &duskcore_crypto::ratchet::RatchetHeader,
        establishment: Option<&duskcore_crypto::ratchet::EstablishmentHeader>,
        wrapper: &TransportWrapper,
    ) -> Result<ReceiveStatus, CoreError> {
        let pending = match conv.begin_decrypt(header, establishment) {
            Ok(p) => p,
            Err(duskcore_crypto::CryptoError::ChainGapTooLarge { skip, bound }) => {
                self.notify
                    .notify(
                        NotifyAction::StateReport { code: CoreError::ChainGapTooLarge { skip, bound }.code() },
                        "chain gap too large".to_string(),
                        Some(wrapper.sender_device.clone()),
                    )
                    .await;
                return Ok(ReceiveStatus::AuthFailed);
            }
            Err(duskcore_crypto::CryptoError::IdentityMismatch) => {
                self.notify
                    .notify(
                        NotifyAction::IdentityChanged,
                        wrapper.sender_user.clone(),
                        Some(wrapper.sender_device.clone()),
                    )
                    .await;
                return Ok(ReceiveStatus::AuthFailed);
            }
            Err(_) => return Ok(ReceiveStatus::AuthFailed),
        };

        let mac_key = pending.keys.message.mac_key;
        let verified = match WireEnvelope::decode_and_verify(&wrapper.inner, &mac_key) {
            Ok(v) => v,
            Err(_) => return Ok(ReceiveStatus::AuthFailed),
        };

        let plaintext = match duskcore_crypto::primitives::aes_cbc_decrypt(
            &pending.keys.message.enc_key,
            &pending.keys.message.iv,
            &verified.ciphertext,
        ) {
            Ok(p) => p,
            Err(_) => return Ok(ReceiveStatus::AuthFailed),
        };

        let mut descriptor: MessageDescriptor = match serde_json::from_slice(&plaintext) {
            Ok(d) => d,
            Err(_) => return Ok(ReceiveStatus::AuthFailed),
        };

        if let Some(supp_ct) = &verified.supplement_ciphertext {
            let supp_pt = match duskcore_crypto::primitives::aes_cbc_decrypt(
                &pending.keys.supplement.enc_key,
                &pending.keys.supplement.iv,
                supp_ct,
            ) {
                Ok(p) => p,
                Err(_) => return Ok(ReceiveStatus::AuthFailed),
            };
            if let MessageContent::Attachment { key_blob_b64, .. } = &mut descriptor.content {
                use base64::{engine::general_purpose::STANDARD, Engine};
                *key_blob_b64 = STANDARD.encode(&supp_pt);
            }
        }

        let mut conv = conv;
        conv.commit_decrypt(pending);
        conv.purge_staged_older_than(
            duskcore_crypto::ratchet::unix_now()
                .saturating_sub(duskcore_crypto::ratchet::DEFAULT_STAGED_KEY_MAX_AGE_SECS),
        );

        if is_new_session {
            if let Some(est) = establishment {
                self.store
                    .consume_pre_key_and_store_conversation(est.pre_key_id, &conv)
                    .await?;
            } else {
                self.store.store_conversation(&conv).await?;
            }
        } else {
            self.store.store_conversation(&conv).await?;
        }

        self.on_message
            .on_message(&wrapper.sender_user, &wrapper.sender_device, descriptor.content, descriptor.attributes)
            .await;

        Ok(ReceiveStatus::Delivered)
    }

    /// `notifyCallback(action, info, deviceId)` pass-through, for host code
    /// that wants to surface transport-layer state reports directly.
    pub async fn notify(&self, action: NotifyAction, info: String, device_id: Option<String>) {
        self.notify.notify(action, info, device_id).await;
    }

    /// Entry point for the legacy `SipTransport::notifyAxo` device-scan
    /// notification: parses `raw_name`/`raw_device_ids` and fires
    /// `DeviceScan` for every device id this process has no local session
    /// for yet, skipping the "all zero" sentinel.
    pub async fn handle_device_scan_notify(
        &self,
        raw_name: &str,
        raw_device_ids: &[String],
    ) -> Result<(), CoreError> {
        let (remote_user, device_ids) = parse_device_scan_notify(raw_name, raw_device_ids);
        for device_id in device_ids {
            if !self
                .store
                .has_conversation(self.identity.user_name(), &remote_user, &device_id)
                .await?
            {
                self.notify
                    .notify(NotifyAction::DeviceScan, remote_user.clone(), Some(device_id))
                    .await;
            }
        }
        Ok(())
    }
}

/// Parses the legacy `SipTransport::notifyAxo` device-scan notification:
/// `name@domain` is stripped to the bare name, and device ids consisting
/// entirely of ASCII `'0'` ("all-zero ASCII") are treated as a sentinel and
/// skipped rather than reported (spec.md §9, "SipTransport 'Zeros'
/// sentinel").
pub fn parse_device_scan_notify(raw_name: &str, raw_device_ids: &[String]) -> (String, Vec<String>) {
    let bare_name = raw_name.split('@').next().unwrap_or(raw_name).to_string();
    let device_ids = raw_device_ids
        .iter()
        .filter(|id| !is_all_zero_sentinel(id))
        .cloned()
        .collect();
    (bare_name, device_ids)
}

fn is_all_zero_sentinel(device_id: &str) -> bool {
    !device_id.is_empty() && device_id.chars().all(|c| c == '0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityManager;
    use crate::provisioning::{HttpClient, HttpMethod, ProvisioningClient};
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use duskcore_proto::message::MessageContent;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncStdMutex;

    #[test]
    fn strips_domain_and_skips_zero_sentinel_device_ids() {
        let (name, ids) = parse_device_scan_notify(
            "alice@example.com",
            &["D1".to_string(), "000".to_string(), "D2".to_string()],
        );
        assert_eq!(name, "alice");
        assert_eq!(ids, vec!["D1".to_string(), "D2".to_string()]);
    }

    #[test]
    fn bare_name_without_domain_is_unchanged() {
        let (name, _) = parse_device_scan_notify("bob", &[]);
        assert_eq!(name, "bob");
    }

    async fn fresh_manager(user: &str, key_byte: u8) -> IdentityManager {
        let path = PathBuf::from(format!("/tmp/duskcore-dispatch-test-{}.db", uuid::Uuid::new_v4()));
        let mut key = [key_byte; 32];
        let store = Store::init(&mut key, &path).await.unwrap();
        let (mgr, _) = IdentityManager::init(store, user.to_string()).await.unwrap();
        mgr
    }

    /// Serves a single device's published bundle for `GET /user/<name>/devices`
    /// and `GET /user/<name>/prekey`; swappable mid-test via `set_bundle` so a
    /// "rotated identity key" scenario can be modeled without a second server.
    struct FakeDirectory {
        device_id: String,
        bundle: StdMutex<(IdentityManager, u32, x25519_dalek::PublicKey)>,
    }

    impl FakeDirectory {
        fn bundle_json(&self) -> String {
            let guard = self.bundle.lock().unwrap();
            let (identity, opk_id, opk_pub) = &*guard;
            format!(
                r#"{{"identity_pub":"{}","signed_pre_key_id":{},"signed_pre_key_pub":"{}","signed_pre_key_sig":"{}","one_time_pre_key_id":{},"one_time_pre_key_pub":"{}"}}"#,
                identity.identity().public.to_b64(),
                identity.signed_pre_key_id(),
                URL_SAFE_NO_PAD.encode(identity.signed_pre_key_pub().as_bytes()),
                URL_SAFE_NO_PAD.encode(identity.signed_pre_key_sig()),
                opk_id,
                URL_SAFE_NO_PAD.encode(opk_pub.as_bytes()),
            )
        }
    }

    #[async_trait]
    impl HttpClient for FakeDirectory {
        async fn call(&self, _method: HttpMethod, uri: &str, _body: Option<Vec<u8>>) -> Result<(u16, Vec<u8>), String> {
            if uri.contains("/devices") {
                let body = format!(r#"{{"user":"ignored","devices":[{{"device_id":"{}"}}]}}"#, self.device_id);
                return Ok((200, body.into_bytes()));
            }
            Ok((200, self.bundle_json().into_bytes()))
        }
    }

    struct RecordingTransport {
        delivered: AsyncStdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl TransportSink for RecordingTransport {
        async fn send_batch(&self, envelopes: &[OutboundEnvelope]) -> Vec<u64> {
            let mut guard = self.delivered.lock().await;
            let mut ids = Vec::with_capacity(envelopes.len());
            for e in envelopes {
                guard.push(e.bytes.clone());
                ids.push(e.message_id);
            }
            ids
        }
    }

    struct NullNotify {
        events: AsyncStdMutex<Vec<NotifyAction>>,
    }

    #[async_trait]
    impl NotifyCallback for NullNotify {
        async fn notify(&self, action: NotifyAction, _info: String, _device_id: Option<String>) {
            self.events.lock().await.push(action);
        }
    }

    struct CapturingReceiver {
        received: AsyncStdMutex<Vec<MessageContent>>,
    }

    #[async_trait]
    impl MessageReceivedCallback for CapturingReceiver {
        async fn on_message(
            &self,
            _sender_user: &str,
            _sender_device: &str,
            content: MessageContent,
            _attributes: serde_json::Value,
        ) {
            self.received.lock().await.push(content);
        }
    }

    fn new_app(
        store: Store,
        identity: IdentityManager,
        local_device_id: &str,
        http: Arc<dyn HttpClient>,
        transport: Arc<RecordingTransport>,
        notify: Arc<NullNotify>,
        receiver: Arc<CapturingReceiver>,
    ) -> AppInterface {
        let provisioning = Arc::new(ProvisioningClient::new(http, "https://dir.example"));
        AppInterface::new(store, Arc::new(identity), local_device_id, provisioning, transport, notify, receiver)
    }

    /// `HttpClient` that always errors — for the responder side of a test,
    /// which never needs to fetch a bundle (`establish_as_responder` derives
    /// everything from the inbound establishment header and the local
    /// identity store).
    struct UnusedHttp;

    #[async_trait]
    impl HttpClient for UnusedHttp {
        async fn call(&self, _method: HttpMethod, _uri: &str, _body: Option<Vec<u8>>) -> Result<(u16, Vec<u8>), String> {
            Err("responder-side test harness never calls the directory".to_string())
        }
    }

    #[tokio::test]
    async fn attachment_key_blob_round_trips_through_encrypted_supplement() {
        use base64::engine::general_purpose::STANDARD;

        let alice = fresh_manager("alice", 10).await;
        let bob = fresh_manager("bob", 11).await;
        let bob_store = bob.store().clone();

        let opks = bob.new_prekeys(1).await.unwrap();
        let directory: Arc<dyn HttpClient> = Arc::new(FakeDirectory {
            device_id: "bob-d1".to_string(),
            bundle: StdMutex::new((bob, opks[0].0, opks[0].1)),
        });

        let alice_store_path = PathBuf::from(format!("/tmp/duskcore-dispatch-alice-{}.db", uuid::Uuid::new_v4()));
        let mut alice_key = [12u8; 32];
        let alice_store = Store::init(&mut alice_key, &alice_store_path).await.unwrap();

        let transport = Arc::new(RecordingTransport { delivered: AsyncStdMutex::new(Vec::new()) });
        let notify = Arc::new(NullNotify { events: AsyncStdMutex::new(Vec::new()) });
        let receiver = Arc::new(CapturingReceiver { received: AsyncStdMutex::new(Vec::new()) });

        let alice_app = new_app(alice_store, alice, "alice-d1", directory, transport.clone(), notify, receiver);

        let content = MessageContent::Attachment {
            locator: "sha256:deadbeef".to_string(),
            key_blob_b64: STANDARD.encode([0x42u8; 64]),
            mime_type: "image/png".to_string(),
            size_bytes: 4096,
        };

        let message_json = serde_json::to_string(&MessageDescriptor {
            recipient: "bob".to_string(),
            content,
            attributes: serde_json::Value::Null,
        })
        .unwrap();

        let ids = alice_app.send_message(&message_json, serde_json::Value::Null).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], 0);

        let envelope_bytes = transport.delivered.lock().await[0].clone();

        let bob_mgr = IdentityManager::init(bob_store, "bob".to_string()).await.unwrap().0;
        let bob_transport = Arc::new(RecordingTransport { delivered: AsyncStdMutex::new(Vec::new()) });
        let bob_notify = Arc::new(NullNotify { events: AsyncStdMutex::new(Vec::new()) });
        let bob_receiver = Arc::new(CapturingReceiver { received: AsyncStdMutex::new(Vec::new()) });
        let bob_app = new_app(
            bob_mgr.store().clone(),
            bob_mgr,
            "bob-d1",
            Arc::new(UnusedHttp),
            bob_transport,
            bob_notify,
            bob_receiver.clone(),
        );

        let status = bob_app.receive_message(&envelope_bytes).await.unwrap();
        assert_eq!(status, ReceiveStatus::Delivered);

        let received = bob_receiver.received.lock().await;
        assert_eq!(received.len(), 1);
        match &received[0] {
            MessageContent::Attachment { key_blob_b64, locator, .. } => {
                assert_eq!(locator, "sha256:deadbeef");
                assert_eq!(STANDARD.decode(key_blob_b64).unwrap(), vec![0x42u8; 64]);
            }
            other => panic!("expected attachment content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rotated_identity_blocks_send_and_fires_identity_changed() {
        let alice = fresh_manager("alice", 20).await;
        let bob = fresh_manager("bob", 21).await;

        let opks = bob.new_prekeys(1).await.unwrap();
        let directory = Arc::new(FakeDirectory {
            device_id: "bob-d1".to_string(),
            bundle: StdMutex::new((bob, opks[0].0, opks[0].1)),
        });

        let alice_store_path = PathBuf::from(format!("/tmp/duskcore-dispatch-alice2-{}.db", uuid::Uuid::new_v4()));
        let mut alice_key = [22u8; 32];
        let alice_store = Store::init(&mut alice_key, &alice_store_path).await.unwrap();

        let transport = Arc::new(RecordingTransport { delivered: AsyncStdMutex::new(Vec::new()) });
        let notify = Arc::new(NullNotify { events: AsyncStdMutex::new(Vec::new()) });
        let receiver = Arc::new(CapturingReceiver { received: AsyncStdMutex::new(Vec::new()) });

        let alice_app = new_app(
            alice_store,
            alice,
            "alice-d1",
            directory.clone(),
            transport.clone(),
            notify.clone(),
            receiver,
        );

        let message_json = serde_json::to_string(&MessageDescriptor {
            recipient: "bob".to_string(),
            content: MessageContent::Text { body: "hello".to_string() },
            attributes: serde_json::Value::Null,
        })
        .unwrap();

        let first = alice_app.send_message(&message_json, serde_json::Value::Null).await.unwrap();
        assert_eq!(first.len(), 1);

        // Bob's identity key rotates (fresh keypair published under the same
        // device id) without the conversation being torn down locally.
        let rotated_bob = fresh_manager("bob-rotated", 23).await;
        let rotated_opks = rotated_bob.new_prekeys(1).await.unwrap();
        *directory.bundle.lock().unwrap() = (rotated_bob, rotated_opks[0].0, rotated_opks[0].1);

        let second = alice_app.send_message(&message_json, serde_json::Value::Null).await.unwrap();
        assert!(second.is_empty(), "send must be refused once the recipient's identity key changes");
        assert_eq!(transport.delivered.lock().await.len(), 1, "no new envelope should reach the transport");
        assert!(matches!(notify.events.lock().await.as_slice(), [NotifyAction::IdentityChanged]));
    }
}
