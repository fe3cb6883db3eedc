use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::TunnelSettings;
use crate::tunnel::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address of the control listener tunnel clients connect to
    pub client_addr: String,
    pub client_port: u16,

    /// Bind address of the public HTTP listener
    pub server_addr: String,
    pub server_port: u16,

    /// Hostname suffix, clients are served at `{id}.{host}`
    pub host: String,

    /// Allow clients to request their own identifier
    pub custom_ids: bool,

    /// Shared password required on registration, empty disables it
    pub password: String,

    /// Port advertised to clients, defaults to the public listener port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,

    /// Seconds to wait for a tunnel response, 0 waits forever
    pub response_timeout: u64,

    pub max_frame_size: usize,

    /// Bind address of the admin API, disabled when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_addr: Option<SocketAddr>,

    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Config {
    /// Load a config file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", path))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }
}

impl HttpConfig {
    pub fn client_bind(&self) -> (&str, u16) {
        (self.client_addr.as_str(), self.client_port)
    }

    pub fn server_bind(&self) -> (&str, u16) {
        (self.server_addr.as_str(), self.server_port)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout > 0).then(|| Duration::from_secs(self.response_timeout))
    }

    /// Settings handed to every tunnel client. `bound_port` is the port
    /// the public listener actually bound.
    pub fn tunnel_settings(&self, bound_port: u16) -> TunnelSettings {
        TunnelSettings {
            host: self.host.clone(),
            custom_ids: self.custom_ids,
            password: self.password.clone(),
            tls: self.tls.enabled,
            public_port: self.public_port.unwrap_or(bound_port),
            max_frame_size: self.max_frame_size,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            client_addr: "0.0.0.0".to_string(),
            client_port: 30303,
            server_addr: "0.0.0.0".to_string(),
            server_port: 4444,
            host: "test.loc".to_string(),
            custom_ids: false,
            password: String::new(),
            public_port: None,
            response_timeout: 60,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            admin_addr: None,
            tls: TlsConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
        }
    }
}
