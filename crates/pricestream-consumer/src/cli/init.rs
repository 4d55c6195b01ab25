/*
[INPUT]:  Interactive user input via CLI, or none with --defaults
[OUTPUT]: Generated YAML configuration file
[POS]:    CLI initialization layer
[UPDATE]: When ConsumerConfig schema changes
*/

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use std::path::Path;

use pricestream_consumer::config::{AuthMode, ConsumerConfig};

const AUTH_MODES: [(&str, AuthMode); 4] = [
    ("password", AuthMode::Password),
    ("client credentials", AuthMode::ClientCredentials),
    ("JWT client assertion", AuthMode::Jwt),
    ("none (user name login)", AuthMode::None),
];

pub fn run_init(output: &Path, defaults: bool) -> Result<()> {
    let config = if defaults {
        ConsumerConfig::default()
    } else {
        prompt_config()?
    };
    write_config(&config, output)?;

    println!("\n{}", style("SUCCESS!").bold().green());
    println!("Configuration written to: {}", style(output.display()).cyan());
    Ok(())
}

pub fn write_config(config: &ConsumerConfig, output: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("failed to serialize config to YAML")?;
    std::fs::write(output, yaml)
        .with_context(|| format!("failed to write config to {}", output.display()))
}

fn prompt_config() -> Result<ConsumerConfig> {
    println!("{}", style("pricestream configuration").bold().cyan());
    println!(
        "{}",
        style("Secrets can be left empty here and passed as flags at run time.").dim()
    );

    let theme = ColorfulTheme::default();
    let mut config = ConsumerConfig::default();

    println!("\n{}", style("--- Authentication ---").bold());
    let labels: Vec<&str> = AUTH_MODES.iter().map(|(label, _)| *label).collect();
    let selection = Select::with_theme(&theme)
        .with_prompt("Auth mode")
        .items(&labels)
        .default(0)
        .interact()?;
    config.auth.mode = AUTH_MODES[selection].1;

    match config.auth.mode {
        AuthMode::Password => {
            config.auth.username = optional(prompt(&theme, "User name", "")?);
            config.auth.client_id = optional(prompt(&theme, "Client id (app key)", "")?);
        }
        AuthMode::ClientCredentials => {
            config.auth.client_id = optional(prompt(&theme, "Client id", "")?);
        }
        AuthMode::Jwt => {
            config.auth.client_id = optional(prompt(&theme, "Client id", "")?);
            config.auth.jwk_file = optional(prompt(&theme, "JWK file", "")?).map(Into::into);
        }
        AuthMode::None => {
            config.auth.username = optional(prompt(&theme, "Login user name", "")?);
        }
    }

    println!("\n{}", style("--- Endpoints ---").bold());
    let host = prompt(&theme, "Gateway host (empty to use service discovery)", "")?;
    if host.is_empty() {
        config.discovery.region = prompt(&theme, "Region", &config.discovery.region)?;
        config.discovery.hot_standby = Confirm::with_theme(&theme)
            .with_prompt("Hot standby (two sessions)")
            .default(false)
            .interact()?;
    } else {
        config.discovery.host = Some(host);
    }

    println!("\n{}", style("--- Session ---").bold());
    let ric = prompt(&theme, "Item (RIC)", &config.session.rics[0])?;
    config.session.rics = vec![ric];
    config.session.app_id = prompt(&theme, "Application id", &config.session.app_id)?;

    Ok(config)
}

fn prompt(theme: &ColorfulTheme, label: &str, default: &str) -> Result<String> {
    let value = Input::with_theme(theme)
        .with_prompt(label)
        .default(default.to_string())
        .allow_empty(true)
        .interact_text()?;
    Ok(value)
}

fn optional(value: String) -> Option<String> {
    Some(value).filter(|value| !value.is_empty())
}
