//! Health check configuration for load-balanced services

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_HEALTH_CHECK_PORT};

/// Protocol the load balancer probes with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckProtocol {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTPS
    Https,
}

impl fmt::Display for HealthCheckProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Https => write!(f, "HTTPS"),
        }
    }
}

/// Liveness probe bound to a service's target group
///
/// The probe port is decoupled from the traffic port so the workload can
/// signal liveness independently of serving traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Port the probe connects to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path requested by the probe
    #[serde(default = "default_path")]
    pub path: String,
    /// Probe protocol
    #[serde(default)]
    pub protocol: HealthCheckProtocol,
    /// Accepted status codes, e.g. `200` or `200-299`
    #[serde(default = "default_codes")]
    pub healthy_http_codes: String,
}

fn default_port() -> u16 {
    DEFAULT_HEALTH_CHECK_PORT
}

fn default_path() -> String {
    "/actuator/health/liveness".to_string()
}

fn default_codes() -> String {
    "200".to_string()
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            port: default_port(),
            path: default_path(),
            protocol: HealthCheckProtocol::default(),
            healthy_http_codes: default_codes(),
        }
    }
}

impl HealthCheck {
    /// Check the probe against the public listener port
    ///
    /// The probe port must differ from the listener, the path must be
    /// absolute, and every status code must be a number or a `lo-hi` range
    /// inside 200..=499.
    pub fn validate(&self, listener_port: u16) -> Result<()> {
        if self.port == 0 {
            return Err(Error::validation("health check port must be non-zero"));
        }
        if self.port == listener_port {
            return Err(Error::validation(format!(
                "health check port {} must differ from listener port {}",
                self.port, listener_port
            )));
        }
        if !self.path.starts_with('/') {
            return Err(Error::validation(format!(
                "health check path '{}' must start with '/'",
                self.path
            )));
        }
        if self.healthy_http_codes.trim().is_empty() {
            return Err(Error::validation("health check needs at least one status code"));
        }
        for code in self.healthy_http_codes.split(',') {
            let code = code.trim();
            let (lo, hi) = code.split_once('-').unwrap_or((code, code));
            let parse = |s: &str| {
                s.trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|c| (200..=499).contains(c))
            };
            match (parse(lo), parse(hi)) {
                (Some(lo), Some(hi)) if lo <= hi => {}
                _ => {
                    return Err(Error::validation(format!(
                        "invalid healthy status code '{}'",
                        code
                    )))
                }
            }
        }
        Ok(())
    }
}
