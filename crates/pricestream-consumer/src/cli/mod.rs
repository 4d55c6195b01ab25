/*
[INPUT]:  Command-line arguments
[OUTPUT]: Parsed CLI and configuration overrides
[POS]:    CLI layer - flags, subcommands, override merge
[UPDATE]: When adding flags or configuration options
*/

pub mod init;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use pricestream_adapter::WsScheme;
use pricestream_consumer::config::{AuthMode, ConsumerConfig, LoginClosedPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "pricestream",
    version,
    about = "Keeps authenticated streaming sessions open against a market data gateway"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a configuration file
    Init {
        #[arg(long, short, value_name = "PATH", default_value = "pricestream.yaml")]
        output: PathBuf,
        /// Write the defaults without prompting
        #[arg(long)]
        defaults: bool,
    },
}

/// Flags for a streaming run. Every flag given overrides the config file.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,
    /// Also write daily rolling log files into this directory
    #[arg(long = "log-dir", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
    /// Validate configuration and exit
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    #[arg(long = "auth-mode", value_enum)]
    pub auth_mode: Option<AuthMode>,
    #[arg(long = "auth-url", value_name = "URL")]
    pub auth_url: Option<String>,
    #[arg(long = "user")]
    pub user: Option<String>,
    #[arg(long = "password")]
    pub password: Option<String>,
    #[arg(long = "new-password")]
    pub new_password: Option<String>,
    #[arg(long = "client-id", alias = "app-key")]
    pub client_id: Option<String>,
    #[arg(long = "client-secret")]
    pub client_secret: Option<String>,
    #[arg(long = "jwk-file", value_name = "PATH")]
    pub jwk_file: Option<PathBuf>,
    #[arg(long = "audience")]
    pub audience: Option<String>,
    #[arg(long = "scope")]
    pub scope: Option<String>,

    #[arg(long = "discovery-url", value_name = "URL")]
    pub discovery_url: Option<String>,
    #[arg(long = "region")]
    pub region: Option<String>,
    #[arg(long = "hot-standby")]
    pub hot_standby: bool,
    #[arg(long = "hostname")]
    pub hostname: Option<String>,
    #[arg(long = "port")]
    pub port: Option<u16>,
    #[arg(long = "standby-hostname")]
    pub standby_hostname: Option<String>,
    #[arg(long = "standby-port")]
    pub standby_port: Option<u16>,

    #[arg(long = "app-id")]
    pub app_id: Option<String>,
    /// Login position sent to the gateway [default: 127.0.0.1/net, not this host's address]
    #[arg(long = "position")]
    pub position: Option<String>,
    /// Item to request; repeat for a batch request
    #[arg(long = "ric")]
    pub rics: Vec<String>,
    #[arg(long = "service")]
    pub service: Option<String>,
    /// Comma-separated field names
    #[arg(long = "view", value_delimiter = ',')]
    pub view: Vec<String>,
    /// Post an update on the item stream every few seconds
    #[arg(long = "post")]
    pub post: bool,
    #[arg(long = "ws-scheme", value_parser = parse_scheme)]
    pub ws_scheme: Option<WsScheme>,
    #[arg(long = "on-login-closed", value_enum)]
    pub login_closed_policy: Option<LoginClosedPolicy>,
}

fn parse_scheme(value: &str) -> Result<WsScheme, String> {
    match value {
        "wss" => Ok(WsScheme::Wss),
        "ws" => Ok(WsScheme::Ws),
        other => Err(format!("unknown scheme '{other}', expected ws or wss")),
    }
}

impl RunArgs {
    /// Merge flags over `config`.
    pub fn apply(&self, config: &mut ConsumerConfig) {
        let auth = &mut config.auth;
        set(&mut auth.url, &self.auth_url);
        set_opt(&mut auth.username, &self.user);
        set_opt(&mut auth.password, &self.password);
        set_opt(&mut auth.new_password, &self.new_password);
        set_opt(&mut auth.client_id, &self.client_id);
        set_opt(&mut auth.client_secret, &self.client_secret);
        set_opt(&mut auth.audience, &self.audience);
        set(&mut auth.scope, &self.scope);
        if let Some(path) = &self.jwk_file {
            auth.jwk_file = Some(path.clone());
        }
        if let Some(mode) = self.auth_mode.or_else(|| self.inferred_auth_mode()) {
            auth.mode = mode;
        }

        let discovery = &mut config.discovery;
        set(&mut discovery.url, &self.discovery_url);
        set(&mut discovery.region, &self.region);
        discovery.hot_standby |= self.hot_standby;
        set_opt(&mut discovery.host, &self.hostname);
        set_opt(&mut discovery.standby_host, &self.standby_hostname);
        if let Some(port) = self.port {
            discovery.port = port;
        }
        if let Some(port) = self.standby_port {
            discovery.standby_port = port;
        }

        let session = &mut config.session;
        set(&mut session.app_id, &self.app_id);
        set(&mut session.position, &self.position);
        set_opt(&mut session.service, &self.service);
        if !self.rics.is_empty() {
            session.rics = self.rics.clone();
        }
        if !self.view.is_empty() {
            session.view = self.view.clone();
        }
        session.post |= self.post;
        if let Some(scheme) = self.ws_scheme {
            session.scheme = scheme;
        }

        if let Some(policy) = self.login_closed_policy {
            config.login_closed_policy = policy;
        }
    }

    /// Auth mode implied by the credential flags given
    fn inferred_auth_mode(&self) -> Option<AuthMode> {
        if self.jwk_file.is_some() {
            Some(AuthMode::Jwt)
        } else if self.client_secret.is_some() {
            Some(AuthMode::ClientCredentials)
        } else if self.password.is_some() {
            Some(AuthMode::Password)
        } else {
            None
        }
    }
}

fn set(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

fn set_opt(target: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        target.clone_from(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pricestream").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "--user", "alice", "--password", "pw", "--client-id", "key", "--hostname", "gw.example",
            "--port", "8443", "--ric", "IBM.N", "--ric", "MSFT.O", "--view", "BID,ASK",
        ]);
        let mut config = ConsumerConfig::default();
        cli.run.apply(&mut config);

        assert_eq!(config.auth.mode, AuthMode::Password);
        assert_eq!(config.auth.username.as_deref(), Some("alice"));
        assert_eq!(config.discovery.host.as_deref(), Some("gw.example"));
        assert_eq!(config.discovery.port, 8443);
        assert_eq!(config.session.rics, vec!["IBM.N", "MSFT.O"]);
        assert_eq!(config.session.view, vec!["BID", "ASK"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_auth_mode_inferred_from_credentials() {
        let cli = parse(&["--client-id", "svc", "--jwk-file", "key.jwk"]);
        let mut config = ConsumerConfig::default();
        cli.run.apply(&mut config);
        assert_eq!(config.auth.mode, AuthMode::Jwt);

        let cli = parse(&["--client-id", "svc", "--client-secret", "s"]);
        let mut config = ConsumerConfig::default();
        cli.run.apply(&mut config);
        assert_eq!(config.auth.mode, AuthMode::ClientCredentials);
    }

    #[test]
    fn test_explicit_auth_mode_wins() {
        let cli = parse(&["--auth-mode", "none", "--password", "pw", "--hostname", "gw"]);
        let mut config = ConsumerConfig::default();
        cli.run.apply(&mut config);
        assert_eq!(config.auth.mode, AuthMode::None);
    }

    #[test]
    fn test_flags_absent_keep_file_values() {
        let cli = parse(&[]);
        let mut config = ConsumerConfig::default();
        config.discovery.region = "eu-west-1".into();
        config.discovery.hot_standby = true;
        cli.run.apply(&mut config);
        assert_eq!(config.discovery.region, "eu-west-1");
        assert!(config.discovery.hot_standby);
    }

    #[test]
    fn test_login_closed_policy_and_scheme() {
        let cli = parse(&["--on-login-closed", "continue", "--ws-scheme", "ws"]);
        let mut config = ConsumerConfig::default();
        cli.run.apply(&mut config);
        assert_eq!(config.login_closed_policy, LoginClosedPolicy::Continue);
        assert_eq!(config.session.scheme, WsScheme::Ws);
    }

    #[test]
    fn test_unknown_scheme_is_usage_error() {
        let err = Cli::try_parse_from(["pricestream", "--ws-scheme", "http"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_init_subcommand() {
        let cli = parse(&["init", "--output", "out.yaml", "--defaults"]);
        match cli.command {
            Some(Command::Init { output, defaults }) => {
                assert_eq!(output, PathBuf::from("out.yaml"));
                assert!(defaults);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
