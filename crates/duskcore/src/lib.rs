//! duskcore — end-to-end encrypted multi-device messaging core.
//!
//! # Module layout
//! - `error`        — unified `CoreError` taxonomy for the public boundary
//! - `identity`      — identity & one-time pre-key manager (C3)
//! - `establish`     — X3DH-style session establishment (C6)
//! - `dispatch`      — app interface: fan-out send, receive, notify (C7)
//! - `provisioning`  — device-list / pre-key-bundle HTTP client (C8)
//! - `admin`         — `resetaxodb` / `removeAxoConversation` / `rescanUserDevices`
//!
//! Cryptographic primitives and the Double Ratchet itself live in
//! `duskcore_crypto`; the wire envelope codec lives in `duskcore_proto`;
//! encrypted local persistence lives in `duskcore_store`. This crate wires
//! the three together into the operations a host application actually
//! calls.

pub mod admin;
pub mod dispatch;
pub mod error;
pub mod establish;
pub mod identity;
pub mod provisioning;

pub use dispatch::{
    AppInterface, MessageReceivedCallback, NotifyAction, NotifyCallback, OutboundEnvelope,
    ReceiveStatus, TransportSink,
};
pub use error::CoreError;
pub use establish::SessionEstablisher;
pub use identity::{IdentityInitResult, IdentityManager};
pub use provisioning::{HttpClient, HttpMethod, ProvisioningClient};
