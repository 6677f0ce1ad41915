//! Configuration structures.
//!
//! The connection file is supplied by the notebook front-end; everything else
//! has defaults that can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Signature scheme accepted in the connection file.
pub const SIGNATURE_SCHEME_HMAC_SHA256: &str = "hmac-sha256";

/// Contents of the kernel connection file created by Jupyter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub signature_scheme: String,
    pub transport: String,
    pub ip: String,
    pub shell_port: u16,
    pub control_port: u16,
    pub stdin_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
}

impl ConnectionInfo {
    /// Read and validate a connection file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read connection file {}: {}", path.display(), e))
        })?;
        let info: ConnectionInfo = serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("invalid connection file {}: {}", path.display(), e))
        })?;
        info.validate()?;
        Ok(info)
    }

    /// Reject signature schemes the codec cannot honour.
    pub fn validate(&self) -> Result<()> {
        match self.signature_scheme.as_str() {
            SIGNATURE_SCHEME_HMAC_SHA256 => Ok(()),
            "" if self.key.is_empty() => Ok(()),
            other => Err(Error::config(format!(
                "unsupported signature scheme: {:?}",
                other
            ))),
        }
    }

    /// Endpoint string for one of the five ports, e.g. `tcp://127.0.0.1:5555`.
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }
}

/// Ambient kernel tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// How long the heartbeat loop waits for a ping before resetting. Absence
    /// of pings is never fatal.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Capacity of each listener → dispatch loop queue.
    pub queue_capacity: usize,

    /// Log every decoded inbound message at `info`.
    pub trace_messages: bool,

    /// Redirect the process's stdout and stderr into `stream` messages while
    /// code runs. Embedders that share the descriptors turn this off.
    pub capture_process_output: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(500),
            queue_capacity: 64,
            trace_messages: false,
            capture_process_output: true,
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `KERNELKIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("KERNELKIT_HEARTBEAT_TIMEOUT") {
            config.heartbeat_timeout = humantime::parse_duration(&raw).map_err(|e| {
                Error::config(format!("KERNELKIT_HEARTBEAT_TIMEOUT={:?}: {}", raw, e))
            })?;
        }
        if let Some(raw) = lookup("KERNELKIT_QUEUE_CAPACITY") {
            config.queue_capacity = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::config(format!("KERNELKIT_QUEUE_CAPACITY={:?}", raw)))?;
        }
        if let Some(raw) = lookup("KERNELKIT_TRACE_MESSAGES") {
            config.trace_messages = parse_flag(&raw);
        }
        if let Some(raw) = lookup("KERNELKIT_CAPTURE_PROCESS_OUTPUT") {
            config.capture_process_output = parse_flag(&raw);
        }

        Ok(config)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "signature_scheme": "hmac-sha256",
            "transport": "tcp",
            "ip": "127.0.0.1",
            "shell_port": 50001,
            "control_port": 50002,
            "stdin_port": 50003,
            "iopub_port": 50004,
            "hb_port": 50005,
            "key": "abc",
            "kernel_name": "calc"
        }"#
    }

    #[test]
    fn test_connection_file_parses_and_ignores_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();

        let info = ConnectionInfo::from_file(file.path()).unwrap();
        assert_eq!(info.key, "abc");
        assert_eq!(info.shell_port, 50001);
        assert_eq!(info.endpoint(info.hb_port), "tcp://127.0.0.1:50005");
    }

    #[test]
    fn test_missing_connection_file_is_config_error() {
        let err = ConnectionInfo::from_file("/nonexistent/kernel-1.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let mut info: ConnectionInfo = serde_json::from_str(sample_json()).unwrap();
        info.signature_scheme = "hmac-md5".to_string();
        assert!(info.validate().is_err());

        // Unsigned mode: no scheme, no key.
        info.signature_scheme = String::new();
        info.key = String::new();
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_kernel_config_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KERNELKIT_HEARTBEAT_TIMEOUT", "2s"),
            ("KERNELKIT_QUEUE_CAPACITY", "8"),
            ("KERNELKIT_TRACE_MESSAGES", "true"),
            ("KERNELKIT_CAPTURE_PROCESS_OUTPUT", "off"),
        ]
        .into_iter()
        .collect();

        let config =
            KernelConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(2));
        assert_eq!(config.queue_capacity, 8);
        assert!(config.trace_messages);
        assert!(!config.capture_process_output);
    }

    #[test]
    fn test_kernel_config_rejects_zero_capacity() {
        let result = KernelConfig::from_lookup(|key| {
            (key == "KERNELKIT_QUEUE_CAPACITY").then(|| "0".to_string())
        });
        assert!(result.is_err());
    }
}
