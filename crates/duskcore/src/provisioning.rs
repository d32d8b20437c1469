//! Provisioning client (C8, spec.md §4.8).
//!
//! Wraps an injected `HttpClient` trait object — the teacher's
//! `apps/dl-secure-channel` binding layer calls `reqwest` directly from Tauri
//! commands, but that host-application binding is out of scope here (§1 Non-
//! goals); the core only needs *a* blocking/async HTTP callback, narrowed to
//! a trait object per spec.md §9's "callback-driven transport and HTTP"
//! design note, generalized from the source's function-object style to an
//! idiomatic Rust trait so tests can substitute in-memory fakes.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use duskcore_proto::api::{
    DeviceListResponse, PrekeyBundleResponse, PublishPrekeysRequest, PublishPrekeysResponse,
    RegisterDeviceRequest, RegisterDeviceResponse, RemoveDeviceResponse,
};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

/// `(uri, method, requestBody) -> (httpStatus, responseBody)`. Implementors
/// own connection pooling, TLS, retries and timeouts — the core never times
/// out on its own (spec.md §5).
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, method: HttpMethod, uri: &str, body: Option<Vec<u8>>) -> Result<(u16, Vec<u8>), String>;
}

pub struct ProvisioningClient {
    http: std::sync::Arc<dyn HttpClient>,
    base_url: String,
}

impl ProvisioningClient {
    pub fn new(http: std::sync::Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    async fn request_json<Resp: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<Resp, CoreError> {
        let uri = format!("{}{}", self.base_url, path);
        let body_bytes = match body {
            Some(b) => Some(serde_json::to_vec(b).map_err(|e| CoreError::BadParams(e.to_string()))?),
            None => None,
        };
        let (status, resp_bytes) = self
            .http
            .call(method, &uri, body_bytes)
            .await
            .map_err(CoreError::Transport)?;

        if !(200..300).contains(&status) {
            let msg = String::from_utf8_lossy(&resp_bytes).to_string();
            tracing::warn!(uri, status, "provisioning request failed");
            return Err(CoreError::Http(format!("HTTP {status}: {msg}")));
        }

        // Tolerant of unknown fields — response schema types already carry
        // `#[serde(default)]` on optional fields (duskcore_proto::api).
        serde_json::from_slice(&resp_bytes).map_err(|e| CoreError::Http(e.to_string()))
    }

    /// `GET /user/<name>/devices`.
    pub async fn get_user_devices(&self, user: &str) -> Result<DeviceListResponse, CoreError> {
        self.request_json(HttpMethod::Get, &format!("/user/{user}/devices"), None::<&()>)
            .await
    }

    /// `GET /user/<name>/prekey`.
    pub async fn get_prekey_bundle(&self, user: &str, device_id: &str) -> Result<PrekeyBundleResponse, CoreError> {
        self.request_json(
            HttpMethod::Get,
            &format!("/user/{user}/prekey?device={device_id}"),
            None::<&()>,
        )
        .await
    }

    /// `POST /me/prekeys`.
    pub async fn publish_prekeys(
        &self,
        req: &PublishPrekeysRequest,
    ) -> Result<PublishPrekeysResponse, CoreError> {
        self.request_json(HttpMethod::Post, "/me/prekeys", Some(req)).await
    }

    /// `POST /me/device`.
    pub async fn register_device(&self, req: &RegisterDeviceRequest) -> Result<RegisterDeviceResponse, CoreError> {
        self.request_json(HttpMethod::Post, "/me/device", Some(req)).await
    }

    /// `DELETE /me/device/<id>`.
    pub async fn remove_device(&self, device_id: &str) -> Result<RemoveDeviceResponse, CoreError> {
        self.request_json(
            HttpMethod::Delete,
            &format!("/me/device/{device_id}"),
            None::<&()>,
        )
        .await
    }
}
