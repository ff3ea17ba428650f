//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::DEFAULT_DIMSE_PORT;

/// Configuration for the inbound storage service (SCP)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScpConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for the SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Per-PDU read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Storage SOP class UIDs accepted for C-STORE
    #[serde(default = "default_storage_sop_classes")]
    pub storage_sop_classes: Vec<String>,

    /// Transfer syntaxes accepted, in order of preference
    #[serde(default = "default_transfer_syntaxes")]
    pub transfer_syntaxes: Vec<String>,

    /// Reject associations whose called AE title does not match `local_aet`
    #[serde(default = "default_true")]
    pub enforce_called_aet: bool,

    /// TLS listener configuration (optional)
    pub tls: Option<TlsOptions>,
}

/// Configuration for a remote DICOM node (a forwarding destination)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// TLS policy for this node
    #[serde(default)]
    pub tls: Option<RemoteTlsPolicy>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-PDU read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Maximum PDU size proposed to this node
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,
}

/// TLS listener material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Path to the certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Path to the private key (PEM)
    pub key_path: PathBuf,

    /// CA bundle for client certificate verification (optional)
    pub ca_bundle_path: Option<PathBuf>,

    /// Require client certificates
    #[serde(default)]
    pub require_client_cert: bool,
}

/// TLS policy for outbound connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTlsPolicy {
    /// CA bundle used to verify the peer (system roots are not consulted)
    pub ca_bundle_path: Option<PathBuf>,

    /// Skip certificate verification entirely
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            local_aet: "GANTRY_SCP".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            max_associations: default_max_associations(),
            storage_sop_classes: default_storage_sop_classes(),
            transfer_syntaxes: default_transfer_syntaxes(),
            enforce_called_aet: true,
            tls: None,
        }
    }
}

impl ScpConfig {
    /// Get per-PDU read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Get write timeout as Duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate the configuration. Port 0 is allowed and binds an
    /// ephemeral port.
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_aet(&self.local_aet)?;

        if self.max_pdu < 16384 || self.max_pdu > 1_048_576 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 1048576 bytes",
            ));
        }

        if self.storage_sop_classes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one storage SOP class must be configured",
            ));
        }

        if self.transfer_syntaxes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one transfer syntax must be configured",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            tls: None,
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            max_pdu: default_max_pdu(),
        }
    }

    /// Set the TLS policy for this node
    pub fn with_tls(mut self, policy: RemoteTlsPolicy) -> Self {
        self.tls = Some(policy);
        self
    }

    /// Set the connection timeout for this node
    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Get the connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the per-PDU read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_aet(&self.ae_title)?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config(
                "Remote host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// AE titles are 1-16 characters from the default character repertoire,
/// not all spaces.
pub fn validate_aet(aet: &str) -> crate::error::Result<()> {
    let trimmed = aet.trim();
    if trimmed.is_empty() || aet.len() > 16 {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "AE title must be 1-16 characters: {aet:?}"
        )));
    }
    if !aet.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "AE title contains non-printable characters: {aet:?}"
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_read_timeout() -> u64 {
    30_000
}

fn default_write_timeout() -> u64 {
    30_000
}

fn default_max_associations() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        crate::types::IMPLICIT_VR_LE.to_string(),
        crate::types::EXPLICIT_VR_LE.to_string(),
    ]
}

fn default_storage_sop_classes() -> Vec<String> {
    crate::types::DEFAULT_STORAGE_SOP_CLASSES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScpConfig::default();
        assert_eq!(config.local_aet, "GANTRY_SCP");
        assert_eq!(config.port, DEFAULT_DIMSE_PORT);
        assert!(config.enforce_called_aet);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("TEST_AET", "localhost", 11112).with_connect_timeout(5_000);

        assert_eq!(node.ae_title, "TEST_AET");
        assert_eq!(node.host, "localhost");
        assert_eq!(node.port, 11112);
        assert_eq!(node.connect_timeout_ms, 5_000);
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ScpConfig::default();
        assert!(config.validate().is_ok());

        config.local_aet = "".to_string();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());

        config.local_aet = "OK".to_string();
        config.max_pdu = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_aet_validation() {
        assert!(validate_aet("STORESCP").is_ok());
        assert!(validate_aet("A B").is_ok());
        assert!(validate_aet("").is_err());
        assert!(validate_aet("                ").is_err());
        assert!(validate_aet("WAY_TOO_LONG_AE_TITLE").is_err());
    }
}
