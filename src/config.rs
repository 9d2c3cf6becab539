//! Configuration surface consumed from the host.
//! Every struct deserializes from JSON with defaults for omitted fields.

use crate::error::Result;
use crate::liveness::LivenessTiming;
use crate::protocol::LAN_PORT;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Origin tag written into LAN requests.
pub const REQUEST_FROM: &str = "miot-rs";

/// LAN transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanConfig {
    /// Network interfaces to bind, one socket each
    pub interfaces: Vec<String>,
    /// UDP port devices listen on
    pub device_port: u16,
    /// Local address sockets bind to
    pub bind_addr: Ipv4Addr,
    /// Destination of discovery probes
    pub broadcast_addr: Ipv4Addr,
    /// Negotiate wildcard push subscriptions with devices
    pub enable_subscribe: bool,
    /// Controller id announced in probes and subscriptions; random when zero
    pub virtual_did: u64,
    pub request_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub scan_interval_min_ms: u64,
    pub scan_interval_max_ms: u64,
    /// Upper bound of the random delay before the first scan
    pub scan_initial_delay_ms: u64,
    pub dedup_window_ms: u64,
    /// Keep-alive interval bounds; the interval doubles while the device answers
    pub keep_alive_min_ms: u64,
    pub keep_alive_max_ms: u64,
    pub fast_ping_ms: u64,
    /// Online/offline flips within `unstable_window_ms` before online is held back
    pub unstable_count: usize,
    pub unstable_window_ms: u64,
    pub unstable_resume_ms: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            device_port: LAN_PORT,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            broadcast_addr: Ipv4Addr::BROADCAST,
            enable_subscribe: false,
            virtual_did: 0,
            request_timeout_ms: 10_000,
            subscribe_timeout_ms: 5_000,
            scan_interval_min_ms: 5_000,
            scan_interval_max_ms: 45_000,
            scan_initial_delay_ms: 3_000,
            dedup_window_ms: 5_000,
            keep_alive_min_ms: 10_000,
            keep_alive_max_ms: 50_000,
            fast_ping_ms: 5_000,
            unstable_count: 10,
            unstable_window_ms: 120_000,
            unstable_resume_ms: 300_000,
        }
    }
}

impl LanConfig {
    pub fn new<I, S>(interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interfaces: interfaces.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    pub fn with_bind_addr(mut self, addr: Ipv4Addr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_subscribe(mut self, enable: bool) -> Self {
        self.enable_subscribe = enable;
        self
    }

    pub fn with_virtual_did(mut self, did: u64) -> Self {
        self.virtual_did = did;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_scan_interval(mut self, min: Duration, max: Duration) -> Self {
        self.scan_interval_min_ms = min.as_millis() as u64;
        self.scan_interval_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_scan_initial_delay(mut self, delay: Duration) -> Self {
        self.scan_initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_keep_alive(mut self, min: Duration, max: Duration, fast_ping: Duration) -> Self {
        self.keep_alive_min_ms = min.as_millis() as u64;
        self.keep_alive_max_ms = max.as_millis() as u64;
        self.fast_ping_ms = fast_ping.as_millis() as u64;
        self
    }

    pub fn with_flap_damping(mut self, count: usize, window: Duration, resume: Duration) -> Self {
        self.unstable_count = count;
        self.unstable_window_ms = window.as_millis() as u64;
        self.unstable_resume_ms = resume.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn scan_interval_min(&self) -> Duration {
        Duration::from_millis(self.scan_interval_min_ms)
    }

    pub fn scan_interval_max(&self) -> Duration {
        Duration::from_millis(self.scan_interval_max_ms)
    }

    pub fn scan_initial_delay(&self) -> Duration {
        Duration::from_millis(self.scan_initial_delay_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn liveness_timing(&self) -> LivenessTiming {
        LivenessTiming {
            interval_min: Duration::from_millis(self.keep_alive_min_ms),
            interval_max: Duration::from_millis(self.keep_alive_max_ms),
            fast_ping: Duration::from_millis(self.fast_ping_ms),
            unstable_count: self.unstable_count.max(1),
            unstable_window: Duration::from_millis(self.unstable_window_ms),
            unstable_resume: Duration::from_millis(self.unstable_resume_ms),
        }
    }
}

/// Which broker deployment a pub/sub client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Cloud,
    Local,
}

/// Pub/sub broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MipsConfig {
    pub kind: BrokerKind,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Connect over TLS, verifying with `ca_pem` or the system roots
    pub use_tls: bool,
    /// PEM encoded CA certificate
    pub ca_pem: Option<String>,
    pub client_cert_pem: Option<String>,
    pub client_key_pem: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub sub_batch: usize,
    pub sub_interval_ms: u64,
    pub sub_max_retries: u32,
    pub request_timeout_ms: u64,
}

impl Default for MipsConfig {
    fn default() -> Self {
        Self::cloud("cn", "", "")
    }
}

impl MipsConfig {
    /// Cloud broker for a region, authenticated with the app id and access token.
    pub fn cloud(server: &str, app_id: &str, token: &str) -> Self {
        Self {
            kind: BrokerKind::Cloud,
            host: format!("{}-ha.mqtt.io.mi.com", server),
            port: 8883,
            client_id: String::new(),
            username: Some(app_id.to_string()),
            password: Some(token.to_string()),
            use_tls: true,
            ca_pem: None,
            client_cert_pem: None,
            client_key_pem: None,
            keep_alive_secs: 60,
            reconnect_min_ms: 10_000,
            reconnect_max_ms: 600_000,
            sub_batch: 300,
            sub_interval_ms: 1_000,
            sub_max_retries: 3,
            request_timeout_ms: 10_000,
        }
    }

    /// Local hub broker reached at `host:port`.
    pub fn local(host: &str, port: u16) -> Self {
        Self {
            kind: BrokerKind::Local,
            host: host.to_string(),
            port,
            username: None,
            password: None,
            reconnect_min_ms: 6_000,
            reconnect_max_ms: 60_000,
            sub_batch: 1_000,
            sub_interval_ms: 100,
            ..Self::cloud("", "", "")
        }
    }

    pub fn with_client_id<S: Into<String>>(mut self, id: S) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn with_tls(mut self, ca: String, cert: Option<String>, key: Option<String>) -> Self {
        self.use_tls = true;
        self.ca_pem = Some(ca);
        self.client_cert_pem = cert;
        self.client_key_pem = key;
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self.ca_pem = None;
        self.client_cert_pem = None;
        self.client_key_pem = None;
        self
    }

    pub fn with_reconnect(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min_ms = min.as_millis() as u64;
        self.reconnect_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn sub_interval(&self) -> Duration {
        Duration::from_millis(self.sub_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Which transports the orchestrator may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtrlMode {
    #[default]
    Auto,
    Cloud,
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub ctrl_mode: CtrlMode,
    /// Prefer a reachable hub gateway over direct LAN control
    pub hub_control: bool,
    pub request_timeout_ms: u64,
    pub refresh_delay_ms: u64,
    pub refresh_retry_delay_ms: u64,
    pub refresh_max_retries: u32,
    pub refresh_cloud_batch: usize,
    pub refresh_local_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ctrl_mode: CtrlMode::Auto,
            hub_control: true,
            request_timeout_ms: 10_000,
            refresh_delay_ms: 200,
            refresh_retry_delay_ms: 3_000,
            refresh_max_retries: 3,
            refresh_cloud_batch: 150,
            refresh_local_timeout_ms: 6_000,
        }
    }
}

impl ClientConfig {
    /// Parse from JSON, filling omitted fields with defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_ctrl_mode(mut self, mode: CtrlMode) -> Self {
        self.ctrl_mode = mode;
        self
    }

    pub fn with_hub_control(mut self, enable: bool) -> Self {
        self.hub_control = enable;
        self
    }

    pub fn with_refresh_timing(mut self, delay: Duration, retry_delay: Duration) -> Self {
        self.refresh_delay_ms = delay.as_millis() as u64;
        self.refresh_retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_delay_ms)
    }

    pub fn refresh_local_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_local_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_fills_defaults() {
        let cfg = ClientConfig::from_json(r#"{"ctrl_mode": "cloud", "refresh_max_retries": 5}"#).unwrap();
        assert_eq!(cfg.ctrl_mode, CtrlMode::Cloud);
        assert_eq!(cfg.refresh_max_retries, 5);
        assert_eq!(cfg.refresh_cloud_batch, 150);
        assert_eq!(cfg.refresh_delay(), Duration::from_millis(200));
        assert!(ClientConfig::from_json("{\"ctrl_mode\": 3}").is_err());
    }

    #[test]
    fn broker_presets_differ_per_deployment() {
        let cloud = MipsConfig::cloud("de", "app", "tok");
        assert_eq!(cloud.host, "de-ha.mqtt.io.mi.com");
        assert_eq!(cloud.reconnect_min(), Duration::from_secs(10));
        assert_eq!(cloud.sub_batch, 300);

        let local = MipsConfig::local("192.168.1.2", 8883);
        assert_eq!(local.kind, BrokerKind::Local);
        assert_eq!(local.reconnect_max(), Duration::from_secs(60));
        assert_eq!(local.sub_interval(), Duration::from_millis(100));
        assert_eq!(local.username, None);
    }

    #[test]
    fn lan_config_from_json() {
        let cfg: LanConfig =
            serde_json::from_str(r#"{"interfaces": ["eth0"], "enable_subscribe": true}"#).unwrap();
        assert_eq!(cfg.interfaces, vec!["eth0"]);
        assert_eq!(cfg.device_port, 54321);
        assert_eq!(cfg.broadcast_addr, Ipv4Addr::BROADCAST);
        assert!(cfg.enable_subscribe);
        assert_eq!(cfg.liveness_timing(), crate::liveness::LivenessTiming::default());
    }
}
