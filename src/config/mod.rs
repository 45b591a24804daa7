//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::signaling::{IceServer, UaConfig};

/// Public STUN server used when no `[sip.stun]` block is configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.xsdhy.com:3478";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub task: TaskConfig,
}

/// SIP extension and transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// WebSocket gateway host
    pub host: String,
    pub port: u16,
    /// SIP domain; falls back to `host` when empty
    pub domain: Option<String>,
    /// Use `wss://` instead of `ws://`
    pub tls: bool,
    /// Extension number (also the local agent id)
    pub ext_no: String,
    /// Extension password
    pub ext_pwd: String,
    /// Register as soon as the transport connects
    pub auto_register: bool,
    /// Check the microphone at startup and before each outbound call
    pub check_mic: bool,
    /// Verbose signaling logs
    pub debug: bool,
    /// Registration expiry in seconds
    pub register_expires: u32,
    pub stun: Option<StunConfig>,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5066,
            domain: None,
            tls: true,
            ext_no: String::new(),
            ext_pwd: String::new(),
            auto_register: true,
            check_mic: false,
            debug: false,
            register_expires: 15,
            stun: None,
        }
    }
}

/// NAT traversal server kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StunKind {
    Stun,
    Turn,
}

impl StunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StunKind::Stun => "stun",
            StunKind::Turn => "turn",
        }
    }
}

/// STUN/TURN server settings. Credentials are only used for TURN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StunConfig {
    pub kind: StunKind,
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Auto-dial task behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// When set, an answered call that ends leaves the task waiting for an
    /// explicit `next` instead of dialing immediately.
    pub auto_after_call_work: bool,
}

impl SipConfig {
    /// Effective SIP domain.
    pub fn domain(&self) -> &str {
        match self.domain.as_deref() {
            Some(d) if !d.is_empty() => d,
            _ => &self.host,
        }
    }

    /// WebSocket URL of the signaling gateway.
    pub fn websocket_url(&self) -> String {
        let proto = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}", proto, self.host, self.port)
    }

    /// Address-of-record for the extension.
    pub fn sip_uri(&self) -> String {
        format!("sip:{}@{}", self.ext_no, self.domain())
    }

    /// Parameters the user agent connects and registers with.
    pub fn ua_config(&self) -> UaConfig {
        UaConfig {
            websocket_url: self.websocket_url(),
            uri: self.sip_uri(),
            authorization_user: self.ext_no.clone(),
            password: self.ext_pwd.clone(),
            register_expires: self.register_expires,
        }
    }

    /// ICE servers handed to every call and answer.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        match &self.stun {
            Some(stun) if !stun.host.is_empty() => {
                let url = format!("{}:{}", stun.kind.as_str(), stun.host);
                let server = match stun.kind {
                    StunKind::Turn => IceServer {
                        urls: vec![url],
                        username: Some(stun.username.clone()),
                        credential: Some(stun.password.clone()),
                    },
                    StunKind::Stun => IceServer {
                        urls: vec![url],
                        username: None,
                        credential: None,
                    },
                };
                vec![server]
            }
            _ => vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "cti-bar", "cti-bar")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Extension password lives in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_falls_back_to_host() {
        let mut sip = SipConfig {
            host: "pbx.example.com".into(),
            ..Default::default()
        };
        assert_eq!(sip.domain(), "pbx.example.com");

        sip.domain = Some(String::new());
        assert_eq!(sip.domain(), "pbx.example.com");

        sip.domain = Some("example.com".into());
        assert_eq!(sip.domain(), "example.com");
    }

    #[test]
    fn test_websocket_url_and_uri() {
        let sip = SipConfig {
            host: "pbx.example.com".into(),
            port: 443,
            tls: false,
            ext_no: "1001".into(),
            ..Default::default()
        };
        assert_eq!(sip.websocket_url(), "ws://pbx.example.com:443");
        assert_eq!(sip.sip_uri(), "sip:1001@pbx.example.com");
    }

    #[test]
    fn test_ua_config_carries_credentials() {
        let sip = SipConfig {
            host: "pbx.example.com".into(),
            ext_no: "1001".into(),
            ext_pwd: "secret".into(),
            register_expires: 60,
            ..Default::default()
        };
        let ua = sip.ua_config();
        assert_eq!(ua.websocket_url, "wss://pbx.example.com:5066");
        assert_eq!(ua.uri, "sip:1001@pbx.example.com");
        assert_eq!(ua.authorization_user, "1001");
        assert_eq!(ua.password, "secret");
        assert_eq!(ua.register_expires, 60);
        assert!(!format!("{:?}", ua).contains("secret"));
    }

    #[test]
    fn test_ice_servers_default_stun() {
        let servers = SipConfig::default().ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(servers[0].credential.is_none());
    }

    #[test]
    fn test_ice_servers_turn_credentials() {
        let sip = SipConfig {
            stun: Some(StunConfig {
                kind: StunKind::Turn,
                host: "turn.example.com:3478".into(),
                username: "alice".into(),
                password: "pw".into(),
            }),
            ..Default::default()
        };
        let servers = sip.ice_servers();
        assert_eq!(servers[0].urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(servers[0].username.as_deref(), Some("alice"));
        assert_eq!(servers[0].credential.as_deref(), Some("pw"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [sip]
            host = "pbx.example.com"
            ext_no = "1001"

            [task]
            auto_after_call_work = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sip.host, "pbx.example.com");
        assert_eq!(cfg.sip.port, 5066);
        assert!(cfg.sip.auto_register);
        assert!(cfg.task.auto_after_call_work);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("cti-bar-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut cfg = Config::default();
        cfg.sip.ext_no = "2002".into();
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("cti-bar-does-not-exist/config.toml");
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
