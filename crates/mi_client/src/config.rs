//! Client configuration.
//!
//! Parsing files or flags is the embedder's job; the core consumes this
//! struct as-is. Defaults match a fresh single-device install talking TCP.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use mi_transport::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// OPAQUE-style aPAKE. Preferred.
    Opaque,
    /// Argon2id + transcript-proof handshake. Discouraged; kept for
    /// migration of pre-OPAQUE deployments only.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportChoice {
    Tcp,
    /// TLS with pinned certificate. Mutually exclusive with Kcp.
    Tls,
    /// Reliable UDP. No proxy support, mutually exclusive with Tls.
    Kcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverTrafficMode {
    Off,
    On,
    /// On, except on low-end hardware (≤ 4 threads or ≤ 4 GiB RAM).
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub endpoint_host: String,
    pub endpoint_port: u16,
    pub transport: TransportChoice,
    /// TLS required: refuse to proceed on a plaintext transport when the
    /// trust-store entry demands TLS.
    pub tls_required: bool,
    pub auth_mode: AuthMode,

    /// SOCKS5 proxy (TCP only).
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,

    /// Directory for `e2ee_state` (device id, KT snapshot, sessions, …).
    pub data_dir: PathBuf,

    pub cover_traffic: CoverTrafficMode,
    pub cover_traffic_interval_secs: u64,

    /// Signed prekey rotation cadence and old-key grace period.
    pub prekey_rotation_secs: u64,
    pub prekey_grace_secs: u64,

    /// KT policy.
    pub kt_require_sth_signature: bool,
    pub kt_mismatch_alert_threshold: u32,
    /// STH log signing key (raw Ed25519 public), required when signatures
    /// are enforced.
    pub kt_sth_public: Option<[u8; 32]>,

    /// This device is the user's primary device for multi-device sync.
    pub device_sync_primary: bool,
    pub device_sync_enabled: bool,
}

impl ClientConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.endpoint_host.clone(), self.endpoint_port)
    }

    pub fn proxy(&self) -> Option<mi_transport::socks5::SocksProxy> {
        match (&self.proxy_host, self.proxy_port) {
            (Some(host), Some(port)) => Some(mi_transport::socks5::SocksProxy {
                endpoint: Endpoint::new(host.clone(), port),
                username: self.proxy_username.clone(),
                password: self.proxy_password.clone(),
            }),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint_host.is_empty() {
            return Err("endpoint host empty".into());
        }
        if self.transport == TransportChoice::Kcp && self.proxy_host.is_some() {
            return Err("KCP cannot run through a proxy".into());
        }
        if self.kt_require_sth_signature && self.kt_sth_public.is_none() {
            return Err("kt_require_sth_signature set but no STH public key".into());
        }
        if self.tls_required && self.transport != TransportChoice::Tls {
            return Err("tls required but a non-TLS transport is selected".into());
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_host: String::new(),
            endpoint_port: 4470,
            transport: TransportChoice::Tcp,
            tls_required: false,
            auth_mode: AuthMode::Opaque,
            proxy_host: None,
            proxy_port: None,
            proxy_username: None,
            proxy_password: None,
            data_dir: PathBuf::from("."),
            cover_traffic: CoverTrafficMode::Auto,
            cover_traffic_interval_secs: 30,
            prekey_rotation_secs: 7 * 24 * 3600,
            prekey_grace_secs: 2 * 24 * 3600,
            kt_require_sth_signature: false,
            kt_mismatch_alert_threshold: 3,
            kt_sth_public: None,
            device_sync_primary: true,
            device_sync_enabled: true,
        }
    }
}
