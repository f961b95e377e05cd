//! Config Surface (C11): the read-only projection of user settings the
//! engine consumes, plus the ambient process-level configuration (cache
//! directory, log file, listener defaults) a standalone binary needs that
//! a desktop UI would otherwise leave to its own settings store.
//!
//! One `Config` struct loaded once from YAML at startup, validated eagerly
//! via `serde` + `serde_yaml` + `validator`, then handed to the engine as
//! an immutable `Arc` snapshot. Config mutations take effect on new flows
//! only — each flow clones the `Arc<EngineConfig>` at entry rather than
//! re-reading a shared mutable reference mid-flight.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::{OrProxyErr, ProxyResult};

/// One `(url_rule, body_rule, template)` extraction rule (C6/C7 input).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ExtractRule {
    #[validate(length(min = 1))]
    pub url_rule: String,
    #[validate(length(min = 1))]
    pub body_rule: String,
    #[validate(length(min = 1))]
    pub template: String,
}

/// Upstream proxy credentials for one instance. Any field left unset means
/// "direct" for that slot; `Instance::is_direct` checks `proxy_host`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UpstreamCredentials {
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_pass: Option<String>,
}

impl UpstreamCredentials {
    pub fn is_direct(&self) -> bool {
        self.proxy_host.is_none()
    }

    /// Builds `{scheme}://[user:pass@]host:port`, rewriting `socks5` to
    /// `socks5h` to force remote DNS resolution.
    pub fn proxy_url(&self) -> Option<String> {
        let host = self.proxy_host.as_ref()?;
        let port = self.proxy_port.unwrap_or(1080);
        let mut scheme = self.scheme.clone().unwrap_or_else(|| "http".to_string());
        if scheme.eq_ignore_ascii_case("socks5") {
            scheme = "socks5h".to_string();
        }
        let auth = match (&self.proxy_user, &self.proxy_pass) {
            (Some(u), Some(p)) if !u.is_empty() => format!("{u}:{p}@"),
            _ => String::new(),
        };
        Some(format!("{scheme}://{auth}{host}:{port}"))
    }
}

/// One configured proxy instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "InstanceConfig::validate_port_range"))]
pub struct InstanceConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default = "InstanceConfig::default_listen_host")]
    pub listen_host: String,
    /// `None` triggers auto-scan of [30000, 40000).
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    #[validate(nested)]
    pub upstream: UpstreamCredentials,
}

impl InstanceConfig {
    fn default_listen_host() -> String {
        "127.0.0.1".to_string()
    }

    fn validate_port_range(&self) -> Result<(), ValidationError> {
        if let Some(port) = self.listen_port {
            if !(5000..=60000).contains(&port) {
                return Err(ValidationError::new("listen_port_out_of_range"));
            }
        }
        Ok(())
    }
}

/// Cache knobs (C1/C11).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "CacheConfig::default_ttl")]
    pub cache_ttl_seconds: u64,
}

impl CacheConfig {
    fn default_cache_dir() -> PathBuf {
        PathBuf::from("./data/cache")
    }

    fn default_ttl() -> u64 {
        86_400
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_dir: Self::default_cache_dir(),
            cache_ttl_seconds: Self::default_ttl(),
        }
    }
}

/// TLS/CA knobs: where the root CA and minted leaf certs live on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TlsConfig {
    #[serde(default = "TlsConfig::default_certs_dir")]
    pub certs_dir: PathBuf,
}

impl TlsConfig {
    fn default_certs_dir() -> PathBuf {
        PathBuf::from("./data/certs")
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            certs_dir: Self::default_certs_dir(),
        }
    }
}

/// Ambient logging knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LogConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
}

impl LogConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: None,
            level: Self::default_level(),
        }
    }
}

/// Root configuration, loaded once at startup and never mutated in place.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "EngineConfig::validate_unique_instance_ids"))]
pub struct EngineConfig {
    #[serde(default)]
    #[validate(nested)]
    pub instances: Vec<InstanceConfig>,

    /// Plain-substring rules, or `re:`-prefixed regex, matched against the
    /// normalized URL to veto cache admission.
    #[serde(default)]
    pub ignore_rules: Vec<String>,

    #[serde(default)]
    #[validate(nested)]
    pub extract_rules: Vec<ExtractRule>,

    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    #[serde(default)]
    #[validate(nested)]
    pub tls: TlsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub log: LogConfig,
}

impl EngineConfig {
    /// Loads and validates configuration from a YAML file on disk.
    pub fn load_from_yaml<P: AsRef<std::path::Path>>(path: P) -> ProxyResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .or_proxy_err(|| format!("unable to read conf file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates a YAML configuration string.
    pub fn from_yaml(raw: &str) -> ProxyResult<Self> {
        let conf: EngineConfig = serde_yaml::from_str(raw)
            .or_proxy_err(|| "unable to parse yaml configuration".to_string())?;
        conf.validate()
            .or_proxy_err(|| "configuration validation failed".to_string())?;
        Ok(conf)
    }

    fn validate_unique_instance_ids(&self) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for inst in &self.instances {
            if !seen.insert(inst.id.as_str()) {
                return Err(ValidationError::new("duplicate_instance_id"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let conf = EngineConfig::default();
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_instance_ids() {
        let yaml = r#"
instances:
  - id: a
    listen_port: 5001
  - id: a
    listen_port: 5002
"#;
        assert!(EngineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let yaml = r#"
instances:
  - id: a
    listen_port: 80
"#;
        assert!(EngineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn socks5_rewritten_to_socks5h() {
        let creds = UpstreamCredentials {
            scheme: Some("socks5".to_string()),
            proxy_host: Some("127.0.0.1".to_string()),
            proxy_port: Some(1080),
            proxy_user: None,
            proxy_pass: None,
        };
        assert_eq!(creds.proxy_url().unwrap(), "socks5h://127.0.0.1:1080");
    }

    #[test]
    fn direct_when_no_proxy_host() {
        let creds = UpstreamCredentials::default();
        assert!(creds.is_direct());
        assert!(creds.proxy_url().is_none());
    }
}
