//! Provisioning-client JSON schema (C8), spec.md §4.8.
//!
//! Five semantic endpoints, all tolerant of unknown response fields (hence
//! `#[serde(default)]` scattered through the response types rather than
//! strict field lists): `GET /user/<name>/devices`, `GET /user/<name>/prekey`,
//! `POST /me/prekeys`, `POST /me/device`, `DELETE /me/device/<id>`. Replaces
//! the teacher's relay-account schema (register/login/poll/ack/refresh
//! tokens) — this core has no account system or message relay of its own,
//! only pre-key distribution and device discovery.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub user: String,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    #[serde(default)]
    pub registered_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundleResponse {
    pub identity_pub: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_pub: String,
    pub signed_pre_key_sig: String,
    #[serde(default)]
    pub one_time_pre_key_id: Option<u32>,
    #[serde(default)]
    pub one_time_pre_key_pub: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishPrekeysRequest {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPrekeyUpload>,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePrekeyUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyUpload {
    pub id: u32,
    pub public: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyUpload {
    pub id: u32,
    pub public: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublishPrekeysResponse {
    #[serde(default)]
    pub accepted: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub identity_pub: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegisterDeviceResponse {
    #[serde(default)]
    pub registered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemoveDeviceResponse {
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub code: Option<String>,
}
