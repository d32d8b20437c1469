//! Plaintext message descriptor passed to/from the app interface (C7).
//!
//! Replaces the teacher's `PlaintextPayload` (hash-chain links, padding
//! buckets, group invites) — this core has no local tamper-evidence chain
//! and no traffic-analysis padding (both explicit spec Non-goals), and
//! group messaging is out of scope entirely.

use serde::{Deserialize, Serialize};

/// `sendMessage(message, attachment, attributes)`'s first argument: a small
/// JSON descriptor naming the recipient, parsed by the dispatcher before it
/// queries the device list and fans out per-device envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDescriptor {
    pub recipient: String,
    pub content: MessageContent,
    /// Opaque host-defined key/value attributes carried alongside the
    /// message and handed back verbatim to the "message received" callback.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Attachment {
        /// `getLocatorREST` of the attachment ciphertext.
        locator: String,
        /// `getKeyBLOB` output, to be carried wrapped inside the envelope's
        /// encrypted supplement block.
        key_blob_b64: String,
        mime_type: String,
        size_bytes: u64,
    },
}
