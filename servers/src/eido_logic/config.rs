//! Configuration of both binaries.
//!
//! Layered the same way for each: built-in defaults, then a JSON config file,
//! then environment variables and command-line flags. A value set in a later
//! layer replaces the earlier one.

use anyhow::{Context, Result};
use clap::Parser;
use eido_common::configs::settings::{LoggingSettings, ServerSettings, SupervisorConfig};
use eido_common::core::AuthPolicy;
use eido_common::ingestors::WsConnector;
use eido_common::protocol::RequestSubType;
use eido_common::transport::tls::{self, ClientAuth};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "EIDO notifier: serves subscriptions over WebSockets", version)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[clap(long, env = "EIDO_BIND_ADDRESS", help = "Address to listen on.")]
    pub bind_address: Option<IpAddr>,

    #[clap(long, env = "EIDO_PORT", help = "Port to listen on for subscribers.")]
    pub port: Option<u16>,

    #[clap(long, env = "EIDO_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "EIDO_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "EIDO_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "EIDO_WS_PATH", help = "Path subscribers open their WebSocket on.")]
    pub ws_path: Option<String>,

    #[clap(long, env = "EIDO_RETRIEVAL_PATH", help = "Path prefix of the EIDO retrieval route.")]
    pub eido_path: Option<String>,

    #[clap(long, env = "EIDO_STORE_DIR", help = "Directory of <referenceId>.json files served by the retrieval route.")]
    pub eido_dir: Option<PathBuf>,

    #[clap(long, env = "EIDO_AUDIT_DIR", help = "Directory for the audit log; auditing is off when unset.")]
    pub audit_dir: Option<PathBuf>,

    #[clap(long, env = "EIDO_ELEMENT_ID", help = "Element id stamped on audit records.")]
    pub element_id: Option<String>,

    #[clap(long, env = "EIDO_AGENCY_ID", help = "Agency id stamped on audit records.")]
    pub agency_id: Option<String>,

    #[clap(long, env = "EIDO_SHUTDOWN_TIMEOUT_MS", help = "Upper bound on closing subscriptions at shutdown.")]
    pub shutdown_timeout_ms: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,

    #[clap(long, env = "TLS_CLIENT_CA_PATH", help = "CA file client certificates are verified against.")]
    pub client_ca_path: Option<PathBuf>,

    #[clap(long, env = "EIDO_REQUIRE_CLIENT_CERT", help = "Refuse subscribers without a verified client certificate.")]
    pub require_client_cert: Option<bool>,

    #[clap(
        long,
        env = "EIDO_ALLOWED_CLIENTS",
        value_delimiter = ',',
        help = "SHA-256 fingerprints of the client certificates allowed in; implies --require-client-cert."
    )]
    pub allowed_clients: Option<Vec<String>>,
}

impl ServerConfig {
    fn defaults() -> Self {
        let settings = ServerSettings::default();
        ServerConfig {
            bind_address: Some(IpAddr::from([0, 0, 0, 0])),
            port: Some(9443),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ws_path: Some(settings.ws_path),
            eido_path: Some(settings.eido_path),
            shutdown_timeout_ms: Some(settings.shutdown_timeout_ms),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: ServerConfig) -> ServerConfig {
        ServerConfig {
            bind_address: other.bind_address.or(self.bind_address),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            ws_path: other.ws_path.or(self.ws_path),
            eido_path: other.eido_path.or(self.eido_path),
            eido_dir: other.eido_dir.or(self.eido_dir),
            audit_dir: other.audit_dir.or(self.audit_dir),
            element_id: other.element_id.or(self.element_id),
            agency_id: other.agency_id.or(self.agency_id),
            shutdown_timeout_ms: other.shutdown_timeout_ms.or(self.shutdown_timeout_ms),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
            client_ca_path: other.client_ca_path.or(self.client_ca_path),
            require_client_cert: other.require_client_cert.or(self.require_client_cert),
            allowed_clients: other.allowed_clients.or(self.allowed_clients),
        }
    }

    /// Library settings for the dispatcher.
    pub fn server_settings(&self) -> ServerSettings {
        let mut settings = ServerSettings::default();
        if let Some(path) = &self.ws_path {
            settings.ws_path = path.clone();
        }
        if let Some(path) = &self.eido_path {
            settings.eido_path = path.clone();
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            settings.shutdown_timeout_ms = ms;
        }
        settings
    }

    /// Identity stamped on audit records.
    pub fn logging_settings(&self) -> LoggingSettings {
        LoggingSettings {
            element_id: self.element_id.clone().unwrap_or_default(),
            agency_id: self.agency_id.clone().unwrap_or_default(),
            agency_agent_id: None,
            agency_position_id: None,
        }
    }

    /// Certificate and key, when both are configured.
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        Some((self.tls_cert_path.clone()?, self.tls_key_path.clone()?))
    }

    fn requires_client_cert(&self) -> bool {
        self.require_client_cert.unwrap_or(false) || self.allowed_clients.as_ref().is_some_and(|ids| !ids.is_empty())
    }

    /// Client certificate verification for the TLS listener. Requiring a
    /// certificate needs both TLS and a client CA.
    pub fn client_auth(&self) -> Result<Option<ClientAuth>> {
        let required = self.requires_client_cert();
        match (&self.client_ca_path, self.tls_paths()) {
            (Some(ca_path), Some(_)) => Ok(Some(ClientAuth { ca_path: ca_path.clone(), required })),
            (Some(_), None) => anyhow::bail!("A client CA needs TLS_CERT_PATH and TLS_KEY_PATH"),
            (None, _) if required => anyhow::bail!("Requiring client certificates needs TLS and a client CA"),
            (None, _) => Ok(None),
        }
    }

    /// Who may subscribe: anyone, or only peers with a listed certificate.
    pub fn auth_policy(&self) -> AuthPolicy {
        if self.requires_client_cert() {
            AuthPolicy::require_listed(self.allowed_clients.clone().unwrap_or_default())
        } else {
            AuthPolicy::AllowAnonymous
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "EIDO subscriber: keeps a subscription to a notifier", version)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[clap(long, env = "EIDO_SERVER_URI", help = "ws:// or wss:// URI of the notifier.")]
    pub server_uri: Option<String>,

    #[clap(long, env = "EIDO_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "EIDO_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "EIDO_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "EIDO_EXPIRES", help = "Requested subscription lifetime in seconds; 0 never expires.")]
    pub expires_seconds: Option<u32>,

    #[clap(long, env = "EIDO_MIN_RATE", help = "Requested keep-alive interval in seconds; 0 disables it.")]
    pub min_rate_seconds: Option<u32>,

    #[clap(long, env = "EIDO_INCIDENT_ID", help = "Follow only this incident (a `single` subscription).")]
    pub incident_id: Option<String>,

    #[clap(long, env = "EIDO_SAVE_DIR", help = "Directory received EIDOs are written to.")]
    pub save_dir: Option<PathBuf>,

    #[clap(long, env = "EIDO_TLS_CA_PATH", help = "CA file the notifier's certificate is validated against.")]
    pub tls_ca_path: Option<PathBuf>,

    #[clap(long, env = "EIDO_CLIENT_CERT_PATH", help = "Client certificate presented to the notifier.")]
    pub client_cert_path: Option<PathBuf>,

    #[clap(long, env = "EIDO_CLIENT_KEY_PATH", help = "Private key of the client certificate.")]
    pub client_key_path: Option<PathBuf>,
}

impl ClientConfig {
    fn defaults() -> Self {
        let supervisor = SupervisorConfig::default();
        ClientConfig {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            expires_seconds: Some(supervisor.expires_seconds),
            min_rate_seconds: Some(supervisor.min_rate_seconds),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: ClientConfig) -> ClientConfig {
        ClientConfig {
            server_uri: other.server_uri.or(self.server_uri),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            expires_seconds: other.expires_seconds.or(self.expires_seconds),
            min_rate_seconds: other.min_rate_seconds.or(self.min_rate_seconds),
            incident_id: other.incident_id.or(self.incident_id),
            save_dir: other.save_dir.or(self.save_dir),
            tls_ca_path: other.tls_ca_path.or(self.tls_ca_path),
            client_cert_path: other.client_cert_path.or(self.client_cert_path),
            client_key_path: other.client_key_path.or(self.client_key_path),
        }
    }

    /// The WebSocket connector, with its own TLS setup when a CA or a client
    /// certificate is configured.
    pub fn connector(&self) -> Result<WsConnector> {
        let identity = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            (None, None) => None,
            _ => anyhow::bail!("A client certificate needs both EIDO_CLIENT_CERT_PATH and EIDO_CLIENT_KEY_PATH"),
        };
        if identity.is_none() && self.tls_ca_path.is_none() {
            return Ok(WsConnector::new());
        }
        let tls_config = tls::client_config(self.tls_ca_path.as_deref(), identity).context("building client TLS")?;
        Ok(WsConnector::with_tls(Arc::new(tls_config)))
    }

    /// Library configuration for the supervisor. An incident id turns the
    /// subscription into a `single` one.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(self.server_uri.clone().unwrap_or_default());
        if let Some(expires) = self.expires_seconds {
            config.expires_seconds = expires;
        }
        if let Some(min_rate) = self.min_rate_seconds {
            config.min_rate_seconds = min_rate;
        }
        if let Some(incident) = &self.incident_id {
            config.request_sub_type = RequestSubType::Single;
            config.incident_id = Some(incident.clone());
        }
        config
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Defaults, then `server_eido.conf` (or `--config-path`), then env and CLI.
pub fn load_server_config() -> Result<ServerConfig> {
    let cli = ServerConfig::parse();
    let mut config = layer(ServerConfig::defaults(), cli, "server_eido.conf", ServerConfig::merge)?;

    // Fall back to a Let's Encrypt layout in the home directory when it exists.
    if config.tls_cert_path.is_none() && config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            let cert = letsencrypt_dir.join("fullchain.pem");
            let key = letsencrypt_dir.join("privkey.pem");
            if cert.exists() && key.exists() {
                config.tls_cert_path = Some(cert);
                config.tls_key_path = Some(key);
            }
        }
    }
    Ok(config)
}

/// Defaults, then `client_eido.conf` (or `--config-path`), then env and CLI.
pub fn load_client_config() -> Result<ClientConfig> {
    let cli = ClientConfig::parse();
    layer(ClientConfig::defaults(), cli, "client_eido.conf", ClientConfig::merge)
}

trait ConfigFile {
    fn config_path(&self) -> Option<&Path>;
}

impl ConfigFile for ServerConfig {
    fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

impl ConfigFile for ClientConfig {
    fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

fn layer<T>(defaults: T, cli: T, default_file: &str, merge: fn(T, T) -> T) -> Result<T>
where
    T: ConfigFile + for<'de> Deserialize<'de>,
{
    let explicit = cli.config_path().is_some();
    let path = cli
        .config_path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(default_file));

    let mut config = defaults;
    if path.exists() {
        let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: T = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config = merge(config, file);
    } else if explicit {
        anyhow::bail!("Config file {} does not exist", path.display());
    }
    Ok(merge(config, cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_then_cli_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.conf");
        fs::write(&path, r#"{"port": 8443, "wsPath": "/ent", "elementId": "notifier.example"}"#).unwrap();

        let cli = ServerConfig::parse_from(["server_eido", "--config-path", path.to_str().unwrap(), "--port", "9000"]);
        let config = layer(ServerConfig::defaults(), cli, "unused.conf", ServerConfig::merge).unwrap();
        assert_eq!(config.port, Some(9000));
        assert_eq!(config.ws_path.as_deref(), Some("/ent"));
        assert_eq!(config.eido_path.as_deref(), Some("/incidents/eidos"));
        assert_eq!(config.logging_settings().element_id, "notifier.example");

        let settings = config.server_settings();
        assert_eq!(settings.ws_path, "/ent");
        assert!(settings.validate().is_ok());
    }

    fn fixture(name: &str) -> String {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../eido_common/testdata/tls")
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn client_certificates_require_tls_and_a_ca() {
        let open = ServerConfig::parse_from(["server_eido"]);
        assert_eq!(open.client_auth().unwrap(), None);
        assert!(matches!(open.auth_policy(), AuthPolicy::AllowAnonymous));

        let no_ca = ServerConfig::parse_from(["server_eido", "--require-client-cert", "true"]);
        assert!(no_ca.client_auth().is_err());

        let no_tls = ServerConfig::parse_from(["server_eido", "--client-ca-path", "ca.pem"]);
        assert!(no_tls.client_auth().is_err());

        let listed = ServerConfig::parse_from([
            "server_eido",
            "--tls-cert-path",
            "server.pem",
            "--tls-key-path",
            "server.key",
            "--client-ca-path",
            "ca.pem",
            "--allowed-clients",
            "aa11,bb22",
        ]);
        let auth = listed.client_auth().unwrap().unwrap();
        assert!(auth.required);
        assert_eq!(auth.ca_path, PathBuf::from("ca.pem"));
        assert_eq!(listed.allowed_clients.as_deref(), Some(&["aa11".to_string(), "bb22".to_string()][..]));
        assert!(matches!(listed.auth_policy(), AuthPolicy::RequireCredential(_)));

        let optional = ServerConfig::parse_from([
            "server_eido",
            "--tls-cert-path",
            "server.pem",
            "--tls-key-path",
            "server.key",
            "--client-ca-path",
            "ca.pem",
        ]);
        assert!(!optional.client_auth().unwrap().unwrap().required);
        assert!(matches!(optional.auth_policy(), AuthPolicy::AllowAnonymous));
    }

    #[test]
    fn client_connector_follows_tls_options() {
        let plain = ClientConfig::parse_from(["client_eido"]);
        assert!(!plain.connector().unwrap().has_tls_config());

        let half = ClientConfig::parse_from(["client_eido", "--client-cert-path", "client.pem"]);
        assert!(half.connector().is_err());

        let full = ClientConfig::parse_from([
            "client_eido",
            "--tls-ca-path",
            fixture("ca.pem").as_str(),
            "--client-cert-path",
            fixture("client.pem").as_str(),
            "--client-key-path",
            fixture("client.key").as_str(),
        ]);
        assert!(full.connector().unwrap().has_tls_config());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let cli = ClientConfig::parse_from(["client_eido", "--config-path", "/nonexistent/client.conf"]);
        assert!(layer(ClientConfig::defaults(), cli, "unused.conf", ClientConfig::merge).is_err());
    }

    #[test]
    fn incident_id_makes_a_single_subscription() {
        let cli = ClientConfig::parse_from([
            "client_eido",
            "--server-uri",
            "wss://notifier.example/IncidentData/ent",
            "--incident-id",
            "inc-7",
        ]);
        let config = layer(ClientConfig::defaults(), cli, "unused.conf", ClientConfig::merge).unwrap();
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.request_sub_type, RequestSubType::Single);
        assert_eq!(supervisor.incident_id.as_deref(), Some("inc-7"));
        assert_eq!(supervisor.expires_seconds, 60);
        assert!(supervisor.validate().is_ok());
    }
}
