/*
[INPUT]:  YAML configuration file (optional) and CLI overrides
[OUTPUT]: Validated consumer configuration and the adapter settings built from it
[POS]:    Configuration layer - auth, discovery, session and HTTP settings
[UPDATE]: When adding new configuration options
*/

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pricestream_adapter::auth::{AssertionSigner, DEFAULT_SCOPE};
use pricestream_adapter::ws::PostingSettings;
use pricestream_adapter::ws::session::{CONNECT_TIMEOUT, DEFAULT_POSITION, RECONNECT_DELAY};
use pricestream_adapter::{ClientConfig, Endpoint, Grant, ItemRequest, SessionSettings, WsScheme};

pub const DEFAULT_AUTH_URL: &str = "https://api.refinitiv.com:443/auth/oauth2/v1/token";
/// `aud` claim of JWT client assertions
pub const DEFAULT_AUDIENCE: &str = "https://login.ciam.refinitiv.com/as/token.oauth2";
pub const DEFAULT_DISCOVERY_URL: &str = "https://api.refinitiv.com/streaming/pricing/v1/";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_APP_ID: &str = "256";
pub const DEFAULT_RIC: &str = "/TRI.N";
pub const DEFAULT_PORT: u16 = 443;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// What to do when the server closes a login stream
    #[serde(default)]
    pub login_closed_policy: LoginClosedPolicy,
    #[serde(default)]
    pub http: HttpConfig,
}

/// How credentials are obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Password,
    ClientCredentials,
    Jwt,
    /// No token; log in with a user name
    None,
}

/// Reaction to a login stream closed by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LoginClosedPolicy {
    /// Cancel every session and exit with an error
    #[default]
    Exit,
    /// Keep the remaining sessions running
    Continue,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default = "default_auth_url")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Changed to before the first login when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk_file: Option<PathBuf>,
    /// JWT `aud` claim; defaults to [`DEFAULT_AUDIENCE`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_true")]
    pub take_exclusive_sign_on_control: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            url: default_auth_url(),
            username: None,
            password: None,
            new_password: None,
            client_id: None,
            client_secret: None,
            jwk_file: None,
            audience: None,
            scope: default_scope(),
            take_exclusive_sign_on_control: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_url")]
    pub url: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub hot_standby: bool,
    /// Explicit gateway host; skips discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby_host: Option<String>,
    #[serde(default = "default_port")]
    pub standby_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: default_discovery_url(),
            region: default_region(),
            hot_standby: false,
            host: None,
            port: DEFAULT_PORT,
            standby_host: None,
            standby_port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default = "default_rics")]
    pub rics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub view: Vec<String>,
    /// Post an update on the item stream every `post_interval_secs`
    #[serde(default)]
    pub post: bool,
    #[serde(default = "default_post_interval_secs")]
    pub post_interval_secs: u64,
    #[serde(default)]
    pub scheme: WsScheme,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            position: default_position(),
            rics: default_rics(),
            service: None,
            view: Vec::new(),
            post: false,
            post_interval_secs: default_post_interval_secs(),
            scheme: WsScheme::default(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// HTTP client settings for auth and discovery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_http_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_refresh_retry_secs")]
    pub refresh_retry_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_http_connect_timeout_secs(),
            max_redirects: default_max_redirects(),
            retry_backoff_secs: default_retry_backoff_secs(),
            refresh_retry_secs: default_refresh_retry_secs(),
        }
    }
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_discovery_url() -> String {
    DEFAULT_DISCOVERY_URL.to_string()
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_app_id() -> String {
    DEFAULT_APP_ID.to_string()
}

fn default_position() -> String {
    DEFAULT_POSITION.to_string()
}

fn default_rics() -> Vec<String> {
    vec![DEFAULT_RIC.to_string()]
}

fn default_post_interval_secs() -> u64 {
    3
}

fn default_reconnect_delay_secs() -> u64 {
    RECONNECT_DELAY.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    CONNECT_TIMEOUT.as_secs()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_http_connect_timeout_secs() -> u64 {
    10
}

fn default_max_redirects() -> usize {
    pricestream_adapter::http::client::DEFAULT_MAX_REDIRECTS
}

fn default_retry_backoff_secs() -> u64 {
    pricestream_adapter::http::client::DEFAULT_RETRY_BACKOFF.as_secs()
}

fn default_refresh_retry_secs() -> u64 {
    30
}

impl ConsumerConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Check that the selected auth mode has what it needs.
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;
        match auth.mode {
            AuthMode::Password => {
                require(&auth.username, "auth.username (--user) is required for password auth")?;
                require(&auth.password, "auth.password (--password) is required for password auth")?;
                require(&auth.client_id, "auth.client_id (--client-id) is required for password auth")?;
            }
            AuthMode::ClientCredentials => {
                require(&auth.client_id, "auth.client_id (--client-id) is required for client credentials")?;
                require(
                    &auth.client_secret,
                    "auth.client_secret (--client-secret) is required for client credentials",
                )?;
            }
            AuthMode::Jwt => {
                require(&auth.client_id, "auth.client_id (--client-id) is required for JWT auth")?;
                if auth.jwk_file.is_none() {
                    bail!("auth.jwk_file (--jwk-file) is required for JWT auth");
                }
            }
            AuthMode::None => {
                if self.discovery.host.is_none() {
                    bail!("discovery.host (--hostname) is required without token authentication");
                }
            }
        }

        if auth.new_password.is_some() && auth.mode != AuthMode::Password {
            bail!("a new password can only be set with password auth");
        }
        if self.discovery.standby_host.is_some() && self.discovery.host.is_none() {
            bail!("discovery.standby_host requires discovery.host");
        }
        if self.session.rics.is_empty() {
            bail!("session.rics must name at least one item");
        }
        if self.session.post && self.session.rics.len() > 1 {
            bail!("posting needs a single item, {} configured", self.session.rics.len());
        }
        Ok(())
    }

    /// Explicitly configured gateway hosts, primary first
    pub fn explicit_endpoints(&self) -> Vec<Endpoint> {
        let discovery = &self.discovery;
        let mut endpoints = Vec::new();
        if let Some(host) = &discovery.host {
            endpoints.push(Endpoint::explicit(host.clone(), discovery.port));
            if let Some(standby) = &discovery.standby_host {
                endpoints.push(Endpoint::explicit(standby.clone(), discovery.standby_port));
            }
        }
        endpoints
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            connect_timeout: Duration::from_secs(self.http.connect_timeout_secs),
            max_redirects: self.http.max_redirects,
            retry_backoff: Duration::from_secs(self.http.retry_backoff_secs),
        }
    }

    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_secs(self.http.refresh_retry_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        let session = &self.session;
        let item = ItemRequest {
            names: session.rics.clone(),
            service: session.service.clone(),
            view: session.view.clone(),
        };
        let mut settings = SessionSettings::new(session.app_id.clone(), item);
        settings.position = session.position.clone();
        settings.scheme = session.scheme;
        settings.reconnect_delay = Duration::from_secs(session.reconnect_delay_secs);
        settings.connect_timeout = Duration::from_secs(session.connect_timeout_secs);
        if session.post {
            settings.posting = Some(PostingSettings {
                interval: Duration::from_secs(session.post_interval_secs),
                ..PostingSettings::default()
            });
        }
        settings
    }

    /// Grant for the configured auth mode; `None` for user-name login.
    pub fn grant(&self) -> Result<Option<Grant>> {
        let auth = &self.auth;
        let grant = match auth.mode {
            AuthMode::None => return Ok(None),
            AuthMode::Password => Grant::Password {
                username: required(&auth.username, "auth.username")?,
                password: required(&auth.password, "auth.password")?,
                client_id: required(&auth.client_id, "auth.client_id")?,
                scope: auth.scope.clone(),
                take_exclusive_sign_on_control: auth.take_exclusive_sign_on_control,
            },
            AuthMode::ClientCredentials => Grant::client_credentials(
                required(&auth.client_id, "auth.client_id")?,
                required(&auth.client_secret, "auth.client_secret")?,
            )
            .with_scope(auth.scope.clone()),
            AuthMode::Jwt => {
                let path = auth.jwk_file.as_ref().context("auth.jwk_file is required")?;
                let signer = AssertionSigner::from_jwk_file(path)
                    .with_context(|| format!("load JWK {}", path.display()))?;
                let audience = auth.audience.as_deref().unwrap_or(DEFAULT_AUDIENCE);
                Grant::jwt_bearer(required(&auth.client_id, "auth.client_id")?, signer, audience)
                    .with_scope(auth.scope.clone())
            }
        };
        Ok(Some(grant))
    }

    /// Name sent in user-name logins
    pub fn login_user(&self) -> String {
        self.auth
            .username
            .clone()
            .unwrap_or_else(|| "user".to_string())
    }
}

fn require(value: &Option<String>, message: &str) -> Result<()> {
    match value {
        Some(value) if !value.is_empty() => Ok(()),
        _ => bail!("{message}"),
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{name} is required"))
}
