use plcmux_sdk::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};

pub(crate) const PLC_HEARTBEAT_INTERVAL_MS: i64 = 200;
pub(crate) const DEFAULT_IDLE_TIMEOUT_MS: u32 = 5_000;
pub(crate) const MAX_IDLE_TIMEOUT_MS: u32 = 5_000;
pub(crate) const MIN_RETRY_INTERVAL_MS: i64 = 1_000;
pub(crate) const MAX_RETRY_INTERVAL_MS: i64 = 16_000;
pub(crate) const DESTROY_DISCONNECT_TIMEOUT_MS: i64 = 500;
pub(crate) const DESTROY_POLL_INTERVAL_MS: u64 = 10;
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 1_024;

/// Attributes used to locate and configure a PLC connection.
///
/// `family`, `gateway` and `path` together form the interning key, so two
/// tags addressing the same controller through the same route share one
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcOptions {
    /// Network front-end of the PLC, `host[:port]`. The port defaults to the
    /// family constructor's choice.
    pub gateway: String,
    /// Routing path behind the gateway; only the interning key reads it.
    #[serde(default)]
    pub path: String,
    /// Idle disconnect timeout in milliseconds, `0..=5000`.
    #[serde(default)]
    pub idle_timeout_ms: Option<u32>,
}

impl PlcOptions {
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            path: String::new(),
            idle_timeout_ms: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_idle_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.idle_timeout_ms = Some(timeout_ms);
        self
    }
}

/// Split `host[:port]`, falling back to the family default port.
pub(crate) fn parse_gateway(gateway: &str, default_port: u16) -> DriverResult<(String, u16)> {
    let gateway = gateway.trim();
    if gateway.is_empty() {
        return Err(DriverError::BadGateway(
            "gateway host missing or zero length".into(),
        ));
    }

    let Some((host, port)) = gateway.split_once(':') else {
        return Ok((gateway.to_string(), default_port));
    };

    if host.is_empty() {
        return Err(DriverError::BadGateway(format!(
            "gateway {gateway:?} has no host part"
        )));
    }

    let port: u32 = port
        .parse()
        .map_err(|_| DriverError::BadGateway(format!("unparseable port in gateway {gateway:?}")))?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(DriverError::BadGateway(format!(
            "port {port} must be between 1 and 65535"
        )));
    }

    Ok((host.to_string(), port as u16))
}
