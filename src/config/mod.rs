//! Configuration management
//!
//! Loads the server configuration from a TOML file and merges CLI
//! overrides on top. Every section has working defaults; a missing file
//! falls back to them entirely.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS material
    #[serde(default)]
    pub security: SecurityConfig,
    /// Capture and encoding
    #[serde(default)]
    pub video: VideoConfig,
    /// Hardware acceleration
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Credential storage
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Camera redirection
    #[serde(default)]
    pub camera: CameraConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the RDP listener binds to
    pub listen_addr: String,
    /// Port the RDP listener binds to
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 3389,
        }
    }
}

/// TLS material
///
/// An absent or non-regular certificate/key file is ignored silently;
/// the session layer decides the fallback (typically a generated
/// self-signed pair).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// PEM certificate path
    pub cert_path: Option<PathBuf>,
    /// PEM private key path
    pub key_path: Option<PathBuf>,
}

/// Damage detection backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DamageBackend {
    /// CPU tile comparison
    Memcmp,
    /// CUDA kernels (requires the `nvenc` feature and an NVIDIA GPU)
    Cuda,
}

/// Capture and encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Capture frame rate in Hz
    pub refresh_rate: u32,
    /// Damage detection implementation
    pub damage_backend: DamageBackend,
    /// Minimum framebuffer pool size
    pub buffer_pool_min_size: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            refresh_rate: 60,
            damage_backend: DamageBackend::Memcmp,
            buffer_pool_min_size: 3,
        }
    }
}

/// Hardware acceleration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Attempt NVENC sessions for new surfaces
    pub enable_nvenc: bool,
    /// Offline-compiled CUDA kernel module
    pub kernel_module_path: PathBuf,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enable_nvenc: true,
            kernel_module_path: PathBuf::from("/usr/share/boreal-rdp-server/kernels.ptx"),
        }
    }
}

/// Credential storage backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsBackend {
    /// Per-user credentials file
    File,
    /// Platform secret service
    SecretService,
    /// TPM-2.0-sealed files
    Tpm,
    /// Random single-session pair
    OneTime,
}

/// Credential storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Selected backend
    pub backend: CredentialsBackend,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend: CredentialsBackend::File,
        }
    }
}

/// Camera redirection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Offer the camera redirection channel
    pub enabled: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from `path`
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides
    pub fn with_overrides(mut self, listen: Option<String>, port: Option<u16>) -> Self {
        if let Some(listen) = listen {
            self.server.listen_addr = listen;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.video.refresh_rate > 0, "video.refresh_rate must be positive");
        anyhow::ensure!(
            self.video.buffer_pool_min_size > 0,
            "video.buffer_pool_min_size must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, 3389);
        assert_eq!(parsed.video.damage_backend, DamageBackend::Memcmp);
    }

    #[test]
    fn partial_file_uses_section_defaults() {
        let parsed: Config = toml::from_str("[server]\nlisten_addr = \"127.0.0.1\"\nport = 4000\n").unwrap();
        assert_eq!(parsed.server.port, 4000);
        assert_eq!(parsed.video.refresh_rate, 60);
        assert_eq!(parsed.credentials.backend, CredentialsBackend::File);
    }

    #[test]
    fn overrides_take_precedence() {
        let config = Config::default().with_overrides(Some("::1".into()), Some(3390));
        assert_eq!(config.server.listen_addr, "::1");
        assert_eq!(config.server.port, 3390);
    }

    #[test]
    fn invalid_refresh_rate_is_rejected() {
        let mut config = Config::default();
        config.video.refresh_rate = 0;
        assert!(config.validate().is_err());
    }
}
