//! Gateway configuration: TOML file + CLI overrides.

use crate::auth::AdmissionPolicy;
use eca_core::{EcaError, EcaResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_payload: default_max_payload(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// `[store]` section: where the node registry lives.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_mongo_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            uri: default_mongo_uri(),
            database: default_database(),
            collection: default_collection(),
            timeout_secs: default_store_timeout(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_auth_header")]
    pub header: String,
    #[serde(default)]
    pub admission: AdmissionPolicy,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            admission: AdmissionPolicy::default(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8000
}
fn default_path() -> String {
    "/socket.io/".to_string()
}
fn default_max_payload() -> usize {
    1_000_000
}
fn default_ping_interval_ms() -> u64 {
    25_000
}
fn default_ping_timeout_ms() -> u64 {
    20_000
}
fn default_shutdown_grace_ms() -> u64 {
    2_000
}
fn default_mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}
fn default_database() -> String {
    "cdnv3".to_string()
}
fn default_collection() -> String {
    "nodes".to_string()
}
fn default_store_timeout() -> u64 {
    10
}
fn default_auth_header() -> String {
    "X-Packetframe-Eca-Auth".to_string()
}

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
    /// Budget for connect, ping, and each lookup.
    pub timeout: Duration,
}

/// Per-connection settings shared by every connection handler.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub auth_header: String,
    pub admission: AdmissionPolicy,
    pub lookup_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_payload: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auth_header: default_auth_header(),
            admission: AdmissionPolicy::default(),
            lookup_timeout: Duration::from_secs(default_store_timeout()),
            ping_interval: Duration::from_millis(default_ping_interval_ms()),
            ping_timeout: Duration::from_millis(default_ping_timeout_ms()),
            max_payload: default_max_payload(),
        }
    }
}

/// Resolved gateway configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub path: String,
    pub shutdown_grace: Duration,
    pub store: StoreConfig,
    pub connection: ConnectionConfig,
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<IpAddr>,
        cli_port: Option<u16>,
        cli_mongo_uri: Option<&str>,
        cli_admission: Option<AdmissionPolicy>,
    ) -> EcaResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, cli_bind, cli_port, cli_mongo_uri, cli_admission)
    }

    fn from_file(
        file: ConfigFile,
        cli_bind: Option<IpAddr>,
        cli_port: Option<u16>,
        cli_mongo_uri: Option<&str>,
        cli_admission: Option<AdmissionPolicy>,
    ) -> EcaResult<Self> {
        validate(&file)?;

        let bind = cli_bind.unwrap_or(file.server.bind);
        let port = cli_port.unwrap_or(file.server.port);
        let uri = cli_mongo_uri
            .map(|s| s.to_string())
            .unwrap_or(file.store.uri);
        let admission = cli_admission.unwrap_or(file.auth.admission);
        let store_timeout = Duration::from_secs(file.store.timeout_secs);

        Ok(Self {
            bind_addr: SocketAddr::new(bind, port),
            path: normalize_path(&file.server.path),
            shutdown_grace: Duration::from_millis(file.server.shutdown_grace_ms),
            store: StoreConfig {
                uri,
                database: file.store.database,
                collection: file.store.collection,
                timeout: store_timeout,
            },
            connection: ConnectionConfig {
                auth_header: file.auth.header,
                admission,
                lookup_timeout: store_timeout,
                ping_interval: Duration::from_millis(file.server.ping_interval_ms),
                ping_timeout: Duration::from_millis(file.server.ping_timeout_ms),
                max_payload: file.server.max_payload,
            },
        })
    }
}

/// Reject durations that would stall or break every connection.
fn validate(file: &ConfigFile) -> EcaResult<()> {
    let nonzero = [
        ("server.ping_interval_ms", file.server.ping_interval_ms),
        ("server.ping_timeout_ms", file.server.ping_timeout_ms),
        ("store.timeout_secs", file.store.timeout_secs),
    ];
    for (key, value) in nonzero {
        if value == 0 {
            return Err(EcaError::Other(format!("config error: {key} must be non-zero")));
        }
    }
    Ok(())
}

fn parse_config(content: &str) -> EcaResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| EcaError::Other(format!("config parse error: {e}")))
}

/// Ensure the handshake path has a leading and trailing slash.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_deployment() {
        let cfg = GatewayConfig::from_file(ConfigFile::default(), None, None, None, None).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8000);
        assert_eq!(cfg.path, "/socket.io/");
        assert_eq!(cfg.store.uri, "mongodb://localhost:27017");
        assert_eq!(cfg.store.database, "cdnv3");
        assert_eq!(cfg.store.collection, "nodes");
        assert_eq!(cfg.store.timeout, Duration::from_secs(10));
        assert_eq!(cfg.connection.auth_header, "X-Packetframe-Eca-Auth");
        assert_eq!(cfg.connection.admission, AdmissionPolicy::Advisory);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = parse_config(
            r#"
            [server]
            port = 9000
            path = "realtime"
            ping_interval_ms = 5000

            [store]
            uri = "mongodb://db.internal:27017"
            timeout_secs = 3

            [auth]
            admission = "require-authorized"
            "#,
        )
        .unwrap();

        let cfg = GatewayConfig::from_file(
            file,
            None,
            Some(9100),
            None,
            Some(AdmissionPolicy::RequireResolved),
        )
        .unwrap();
        assert_eq!(cfg.bind_addr.port(), 9100);
        assert_eq!(cfg.path, "/realtime/");
        assert_eq!(cfg.store.uri, "mongodb://db.internal:27017");
        assert_eq!(cfg.connection.lookup_timeout, Duration::from_secs(3));
        assert_eq!(cfg.connection.ping_interval, Duration::from_millis(5000));
        assert_eq!(cfg.connection.admission, AdmissionPolicy::RequireResolved);
    }

    #[test]
    fn unknown_admission_value_is_an_error() {
        let err = parse_config("[auth]\nadmission = \"sometimes\"\n").unwrap_err();
        assert!(err.to_string().contains("config parse error"));
    }

    #[test]
    fn missing_file_means_defaults() {
        let cfg = GatewayConfig::load(
            Some(Path::new("/nonexistent/eca-gateway.toml")),
            None,
            None,
            Some("mongodb://other:27017"),
            None,
        )
        .unwrap();
        assert_eq!(cfg.store.uri, "mongodb://other:27017");
        assert_eq!(cfg.bind_addr.port(), 8000);
    }

    #[test]
    fn zero_durations_are_rejected() {
        for content in [
            "[server]\nping_interval_ms = 0\n",
            "[server]\nping_timeout_ms = 0\n",
            "[store]\ntimeout_secs = 0\n",
        ] {
            let file = parse_config(content).unwrap();
            let err = GatewayConfig::from_file(file, None, None, None, None).unwrap_err();
            assert!(err.to_string().contains("must be non-zero"), "{content}: {err}");
        }
    }

    #[test]
    fn zero_ping_interval_in_file_fails_load() {
        let path = std::env::temp_dir().join(format!(
            "eca-gateway-zero-ping-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[server]\nping_interval_ms = 0\n").unwrap();
        let result = GatewayConfig::load(Some(&path), None, None, None, None);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
